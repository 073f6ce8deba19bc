//! Durable per-task run state.
//!
//! All tasks share one JSON document under the state root, keyed by task
//! id, holding a bounded list of `{user, assistant}` turns. Reads take a
//! shared OS advisory lock and writes an exclusive one, so concurrent
//! runs (including other processes) serialize their read-modify-write
//! cycles instead of clobbering each other. A turn unreadable as JSON is
//! treated as an empty document rather than wedging every later append.

use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One completed exchange of an agent run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryTurn {
    pub user: String,
    pub assistant: String,
}

impl HistoryTurn {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
        }
    }
}

type HistoryDocument = BTreeMap<String, Vec<HistoryTurn>>;

#[derive(Debug)]
pub enum HistoryError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize(serde_json::Error),
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryError::Io { path, source } => {
                write!(f, "History I/O error at {}: {}", path.display(), source)
            }
            HistoryError::Serialize(source) => {
                write!(f, "Failed to serialize history: {}", source)
            }
        }
    }
}

impl StdError for HistoryError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            HistoryError::Io { source, .. } => Some(source),
            HistoryError::Serialize(source) => Some(source),
        }
    }
}

pub struct HistoryStore {
    path: PathBuf,
    max_turns: usize,
    cache: Mutex<HashMap<String, Vec<HistoryTurn>>>,
}

impl HistoryStore {
    pub fn new(state_root: &Path, max_turns: usize) -> Self {
        Self {
            path: state_root.join("history.json"),
            max_turns,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prior turns for the task, newest last. Reads through an in-memory
    /// entry when one exists; otherwise loads from disk under a shared
    /// lock and caches what it found.
    pub async fn load(&self, task_id: &str) -> Result<Vec<HistoryTurn>, HistoryError> {
        if let Some(turns) = self.lock_cache().get(task_id) {
            return Ok(turns.clone());
        }

        let path = self.path.clone();
        let task = task_id.to_string();
        let turns = tokio::task::spawn_blocking(move || load_task_turns(&path, &task))
            .await
            .map_err(|err| HistoryError::Io {
                path: self.path.clone(),
                source: std::io::Error::other(err),
            })??;
        self.lock_cache().insert(task_id.to_string(), turns.clone());
        Ok(turns)
    }

    /// Appends one turn under an exclusive lock, evicting the oldest
    /// turns past the per-task bound, and drops the task's in-memory
    /// entry so the next load re-reads what actually landed on disk.
    pub async fn append(&self, task_id: &str, turn: HistoryTurn) -> Result<(), HistoryError> {
        let path = self.path.clone();
        let task = task_id.to_string();
        let max_turns = self.max_turns;
        tokio::task::spawn_blocking(move || append_task_turn(&path, &task, turn, max_turns))
            .await
            .map_err(|err| HistoryError::Io {
                path: self.path.clone(),
                source: std::io::Error::other(err),
            })??;
        self.lock_cache().remove(task_id);
        Ok(())
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<HistoryTurn>>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Convenience constructor shared by the runner and tests.
pub fn shared_store(state_root: &Path, max_turns: usize) -> Arc<HistoryStore> {
    Arc::new(HistoryStore::new(state_root, max_turns))
}

fn load_task_turns(path: &Path, task_id: &str) -> Result<Vec<HistoryTurn>, HistoryError> {
    let io_err = |source| HistoryError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(err)),
    };
    fs4::fs_std::FileExt::lock_shared(&file).map_err(io_err)?;
    let result = read_document(&mut file, path);
    let _ = fs4::fs_std::FileExt::unlock(&file);
    let mut document = result?;
    Ok(document.remove(task_id).unwrap_or_default())
}

fn append_task_turn(
    path: &Path,
    task_id: &str,
    turn: HistoryTurn,
    max_turns: usize,
) -> Result<(), HistoryError> {
    let io_err = |source| HistoryError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(io_err)?;
    fs4::fs_std::FileExt::lock_exclusive(&file).map_err(io_err)?;

    // Unlock runs on every exit path, success or not.
    let result = (|| {
        let mut document = read_document(&mut file, path)?;
        let turns = document.entry(task_id.to_string()).or_default();
        turns.push(turn);
        if turns.len() > max_turns {
            let excess = turns.len() - max_turns;
            turns.drain(..excess);
        }
        let contents = serde_json::to_string_pretty(&document).map_err(HistoryError::Serialize)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        file.set_len(0).map_err(io_err)?;
        file.write_all(contents.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)
    })();
    let _ = fs4::fs_std::FileExt::unlock(&file);
    result
}

fn read_document(file: &mut File, path: &Path) -> Result<HistoryDocument, HistoryError> {
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|source| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if contents.trim().is_empty() {
        return Ok(HistoryDocument::new());
    }
    match serde_json::from_str(&contents) {
        Ok(document) => Ok(document),
        Err(err) => {
            warn!("Resetting unreadable history at {}: {}", path.display(), err);
            Ok(HistoryDocument::new())
        }
    }
}
