//! Task Monitor
//!
//! Tracks long-running node activities (startup, close, recovery) so their
//! progress can be logged and dumped. Each activity is held through a
//! [`MonitoredTask`] guard; a guard dropped while its task is still running
//! marks the task aborted and logs it as leaked.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::identity::now_ms;

pub const MAX_TASKS: usize = 1000;
pub const EXPIRATION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Running,
    Waiting,
    Complete,
    Aborted,
}

impl TaskState {
    fn is_finished(&self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Aborted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusSnapshot {
    pub id: u64,
    pub description: String,
    pub status: String,
    pub state: TaskState,
    pub start_time: u64,
    pub status_time: u64,
    pub state_time: u64,
}

#[derive(Debug)]
struct Entry {
    snapshot: TaskStatusSnapshot,
    finished_at: Option<Instant>,
}

#[derive(Debug)]
struct MonitorInner {
    tasks: VecDeque<Entry>,
    next_id: u64,
    capacity: usize,
    expiration: Duration,
}

impl MonitorInner {
    fn purge_expired(&mut self) {
        let expiration = self.expiration;
        self.tasks.retain(|entry| match entry.finished_at {
            Some(at) => at.elapsed() < expiration,
            None => true,
        });
    }

    fn entry_mut(&mut self, id: u64) -> Option<&mut TaskStatusSnapshot> {
        self.tasks
            .iter_mut()
            .find(|entry| entry.snapshot.id == id)
            .map(|entry| &mut entry.snapshot)
    }

    fn set_state(&mut self, id: u64, state: TaskState, status: Option<&str>) -> Option<TaskStatusSnapshot> {
        let now = now_ms();
        let entry = self.tasks.iter_mut().find(|entry| entry.snapshot.id == id)?;
        entry.snapshot.state = state;
        entry.snapshot.state_time = now;
        if let Some(status) = status {
            entry.snapshot.status = status.to_string();
            entry.snapshot.status_time = now;
        }
        entry.finished_at = if state.is_finished() {
            Some(Instant::now())
        } else {
            None
        };
        Some(entry.snapshot.clone())
    }
}

#[derive(Debug, Clone)]
pub struct TaskMonitor {
    inner: Arc<Mutex<MonitorInner>>,
}

impl Default for TaskMonitor {
    fn default() -> Self {
        Self::with_limits(MAX_TASKS, EXPIRATION)
    }
}

impl TaskMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(capacity: usize, expiration: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MonitorInner {
                tasks: VecDeque::new(),
                next_id: 1,
                capacity: capacity.max(1),
                expiration,
            })),
        }
    }

    /// Starts tracking a new running task.
    pub fn create_status(&self, description: impl Into<String>) -> MonitoredTask {
        let description = description.into();
        let now = now_ms();
        let mut inner = self.inner.lock();

        if inner.tasks.len() >= inner.capacity {
            inner.purge_expired();
        }
        if inner.tasks.len() >= inner.capacity {
            if let Some(evicted) = inner.tasks.pop_front() {
                tracing::warn!(
                    "Task monitor full, dropping oldest entry: {}",
                    evicted.snapshot.description
                );
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.tasks.push_back(Entry {
            snapshot: TaskStatusSnapshot {
                id,
                description: description.clone(),
                status: String::new(),
                state: TaskState::Running,
                start_time: now,
                status_time: now,
                state_time: now,
            },
            finished_at: None,
        });

        MonitoredTask {
            id,
            description,
            monitor: self.inner.clone(),
        }
    }

    /// Every tracked task, oldest first, after purging expired ones.
    pub fn snapshot(&self) -> Vec<TaskStatusSnapshot> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        inner.tasks.iter().map(|entry| entry.snapshot.clone()).collect()
    }

    pub fn snapshot_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.snapshot())
    }

    pub fn dump_as_text(&self) -> String {
        let mut out = String::new();
        for task in self.snapshot() {
            let _ = writeln!(
                out,
                "Task: {}\n  Status: {:?}: {}\n  Running for {} ms",
                task.description,
                task.state,
                task.status,
                now_ms().saturating_sub(task.start_time)
            );
        }
        out
    }
}

/// Guard for one monitored task.
#[derive(Debug)]
pub struct MonitoredTask {
    id: u64,
    description: String,
    monitor: Arc<Mutex<MonitorInner>>,
}

impl MonitoredTask {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn state(&self) -> Option<TaskState> {
        let mut inner = self.monitor.lock();
        inner.entry_mut(self.id).map(|task| task.state)
    }

    pub fn status(&self) -> Option<String> {
        let mut inner = self.monitor.lock();
        inner.entry_mut(self.id).map(|task| task.status.clone())
    }

    pub fn set_status(&self, status: &str) {
        let mut inner = self.monitor.lock();
        if let Some(task) = inner.entry_mut(self.id) {
            task.status = status.to_string();
            task.status_time = now_ms();
        }
        tracing::info!("## {}: {}", self.description, status);
    }

    pub fn set_description(&mut self, description: &str) {
        let mut inner = self.monitor.lock();
        if let Some(task) = inner.entry_mut(self.id) {
            task.description = description.to_string();
        }
        self.description = description.to_string();
    }

    pub fn mark_complete(&self, status: &str) {
        self.transition(TaskState::Complete, status);
        tracing::info!("## {} complete: {}", self.description, status);
    }

    pub fn pause(&self, status: &str) {
        self.transition(TaskState::Waiting, status);
    }

    pub fn resume(&self, status: &str) {
        self.transition(TaskState::Running, status);
    }

    pub fn abort(&self, status: &str) {
        self.transition(TaskState::Aborted, status);
        tracing::warn!("## {} aborted: {}", self.description, status);
    }

    fn transition(&self, state: TaskState, status: &str) {
        self.monitor.lock().set_state(self.id, state, Some(status));
    }
}

impl Drop for MonitoredTask {
    fn drop(&mut self) {
        let mut inner = self.monitor.lock();
        let unfinished = inner
            .entry_mut(self.id)
            .map(|task| !task.state.is_finished())
            .unwrap_or(false);
        if unfinished {
            inner.set_state(self.id, TaskState::Aborted, None);
            tracing::warn!("Monitored task leaked while still running: {}", self.description);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_of_a_task() {
        let monitor = TaskMonitor::new();
        let task = monitor.create_status("Starting slave");

        task.set_status("building pools");
        assert_eq!(task.state(), Some(TaskState::Running));
        assert_eq!(task.status().as_deref(), Some("building pools"));

        task.pause("waiting for master");
        assert_eq!(task.state(), Some(TaskState::Waiting));
        task.resume("master found");
        task.mark_complete("started");

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state, TaskState::Complete);
        assert_eq!(snapshot[0].status, "started");
    }

    #[test]
    fn test_dropped_running_task_is_aborted() {
        let monitor = TaskMonitor::new();
        {
            let _task = monitor.create_status("Close node");
        }

        assert_eq!(monitor.snapshot()[0].state, TaskState::Aborted);
    }

    #[test]
    fn test_completed_task_survives_drop() {
        let monitor = TaskMonitor::new();
        let task = monitor.create_status("Recover");
        task.mark_complete("done");
        drop(task);

        assert_eq!(monitor.snapshot()[0].state, TaskState::Complete);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let monitor = TaskMonitor::with_limits(2, Duration::from_secs(60));
        let first = monitor.create_status("first");
        let _second = monitor.create_status("second");
        let _third = monitor.create_status("third");

        let descriptions: Vec<_> = monitor.snapshot().into_iter().map(|t| t.description).collect();
        assert_eq!(descriptions, vec!["second", "third"]);
        assert_eq!(first.state(), None);
    }

    #[test]
    fn test_finished_tasks_expire() {
        let monitor = TaskMonitor::with_limits(10, Duration::ZERO);
        let done = monitor.create_status("done");
        done.mark_complete("ok");
        let _running = monitor.create_status("running");

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].description, "running");
    }

    #[test]
    fn test_dump_formats() {
        let monitor = TaskMonitor::new();
        let task = monitor.create_status("Starting master");
        task.set_status("binding rpc");

        let text = monitor.dump_as_text();
        let json = monitor.snapshot_json().unwrap();

        assert!(text.contains("Starting master"));
        assert!(text.contains("binding rpc"));
        assert!(json.contains("\"state\": \"RUNNING\""));
    }
}
