//! Disk cache of remote tool discovery results.
//!
//! The cache keeps the last successful `tools/list` snapshot per server so
//! adapters can be registered before any server answers. It is advisory:
//! a missing or corrupt file loads as empty rather than failing startup.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::mcp::protocol::RemoteToolInfo;

pub type ToolSnapshot = BTreeMap<String, Vec<RemoteToolInfo>>;

pub struct ToolCache {
    path: PathBuf,
}

impl ToolCache {
    pub fn new(state_root: &Path) -> Self {
        Self {
            path: state_root.join("mcp_tools.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> ToolSnapshot {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(_) => return ToolSnapshot::new(),
        };
        match serde_json::from_str(&contents) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                debug!("Ignoring corrupt tool cache at {}: {}", self.path.display(), err);
                ToolSnapshot::new()
            }
        }
    }

    /// Replaces the cache atomically; a crash mid-write leaves the
    /// previous snapshot intact.
    pub fn store(&self, snapshot: &ToolSnapshot) -> Result<(), String> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| "Cache path has no parent directory.".to_string())?;
        fs::create_dir_all(parent).map_err(|err| err.to_string())?;

        let mut temp = NamedTempFile::new_in(parent).map_err(|err| err.to_string())?;
        let contents =
            serde_json::to_string_pretty(snapshot).map_err(|err| err.to_string())?;
        temp.write_all(contents.as_bytes())
            .map_err(|err| err.to_string())?;
        temp.persist(&self.path).map_err(|err| err.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_tool(name: &str) -> RemoteToolInfo {
        RemoteToolInfo {
            name: name.to_string(),
            description: format!("The {} tool", name),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = TempDir::new().expect("temp dir");
        let cache = ToolCache::new(dir.path());
        assert!(cache.load().is_empty());
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let dir = TempDir::new().expect("temp dir");
        let cache = ToolCache::new(dir.path());
        fs::write(cache.path(), "][ not json").expect("write");
        assert!(cache.load().is_empty());
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = TempDir::new().expect("temp dir");
        let cache = ToolCache::new(dir.path());

        let mut snapshot = ToolSnapshot::new();
        snapshot.insert("alpha".to_string(), vec![sample_tool("search")]);
        snapshot.insert(
            "beta".to_string(),
            vec![sample_tool("read"), sample_tool("write")],
        );
        cache.store(&snapshot).expect("store");

        let loaded = cache.load();
        assert_eq!(loaded, snapshot);
    }
}
