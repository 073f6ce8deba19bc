//! Process-wide mutable state shared by capability providers.
//!
//! These maps are touched by every provider and every concurrently running
//! agent task. All access is synchronous: a guard is never held across an
//! await point, so the single ordinary mutex per map is enough.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::core::constants::RECENT_MESSAGES_PER_CHAT;

/// One deferred job a provider has asked the host scheduler to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub id: String,
    pub task_id: String,
    pub run_at: DateTime<Utc>,
    pub payload: String,
}

/// Shared services injected into providers at registration time.
///
/// Explicitly owned, passed by reference, never ambient global state; the
/// registry stays testable by handing each test its own instance.
#[derive(Default)]
pub struct SharedServices {
    pending_questions: Mutex<HashMap<String, String>>,
    recent_messages: Mutex<HashMap<String, Vec<i64>>>,
    task_notes: Mutex<HashMap<String, String>>,
    scheduled_jobs: Mutex<Vec<ScheduledJob>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SharedServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ask_question(&self, task_id: &str, question: &str) {
        lock(&self.pending_questions).insert(task_id.to_string(), question.to_string());
    }

    /// Removes and returns the pending question for a task, if any.
    pub fn take_question(&self, task_id: &str) -> Option<String> {
        lock(&self.pending_questions).remove(task_id)
    }

    pub fn has_pending_question(&self, task_id: &str) -> bool {
        lock(&self.pending_questions).contains_key(task_id)
    }

    /// Records a delivered message id for a conversation, bounded per chat.
    pub fn push_recent_message(&self, chat_id: &str, message_id: i64) {
        let mut recent = lock(&self.recent_messages);
        let entries = recent.entry(chat_id.to_string()).or_default();
        entries.push(message_id);
        if entries.len() > RECENT_MESSAGES_PER_CHAT {
            let overflow = entries.len() - RECENT_MESSAGES_PER_CHAT;
            entries.drain(..overflow);
        }
    }

    pub fn recent_messages(&self, chat_id: &str) -> Vec<i64> {
        lock(&self.recent_messages)
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_task_note(&self, task_id: &str, note: &str) {
        lock(&self.task_notes).insert(task_id.to_string(), note.to_string());
    }

    pub fn task_note(&self, task_id: &str) -> Option<String> {
        lock(&self.task_notes).get(task_id).cloned()
    }

    pub fn schedule_job(&self, job: ScheduledJob) {
        lock(&self.scheduled_jobs).push(job);
    }

    /// Removes and returns every job due at or before `now`.
    pub fn take_due_jobs(&self, now: DateTime<Utc>) -> Vec<ScheduledJob> {
        let mut jobs = lock(&self.scheduled_jobs);
        let (due, remaining) = jobs.drain(..).partition(|job| job.run_at <= now);
        *jobs = remaining;
        due
    }

    pub fn scheduled_job_count(&self) -> usize {
        lock(&self.scheduled_jobs).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn pending_question_is_consumed_on_take() {
        let services = SharedServices::default();
        services.ask_question("task-1", "Which account?");

        assert!(services.has_pending_question("task-1"));
        assert_eq!(
            services.take_question("task-1"),
            Some("Which account?".to_string())
        );
        assert!(!services.has_pending_question("task-1"));
    }

    #[test]
    fn recent_messages_are_bounded() {
        let services = SharedServices::default();
        for id in 0..(RECENT_MESSAGES_PER_CHAT as i64 + 5) {
            services.push_recent_message("chat", id);
        }

        let recent = services.recent_messages("chat");
        assert_eq!(recent.len(), RECENT_MESSAGES_PER_CHAT);
        assert_eq!(recent[0], 5);
    }

    #[test]
    fn due_jobs_are_split_from_future_jobs() {
        let services = SharedServices::default();
        let now = Utc::now();
        services.schedule_job(ScheduledJob {
            id: "a".to_string(),
            task_id: "task-1".to_string(),
            run_at: now - Duration::minutes(1),
            payload: "ping".to_string(),
        });
        services.schedule_job(ScheduledJob {
            id: "b".to_string(),
            task_id: "task-1".to_string(),
            run_at: now + Duration::minutes(5),
            payload: "pong".to_string(),
        });

        let due = services.take_due_jobs(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "a");
        assert_eq!(services.scheduled_job_count(), 1);
    }
}
