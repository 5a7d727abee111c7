//! Read-only views over the job manager.
//!
//! The batch worker publishes a [`BatchSnapshot`] whenever an entry changes
//! state. Readers take the latest snapshot from a `watch` channel and combine
//! it with the live, lock-free progress of the running entry.

use std::fmt::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::runner::{RunnerHandle, RunnerState};

/// Text returned for entries that have not been started yet.
pub const NO_JOB_INFO: &str = "No job information available.";

/// Lifecycle of one queued input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Created,
    Running,
    Done,
    Error,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<RunnerState> for EntryState {
    fn from(state: RunnerState) -> Self {
        match state {
            RunnerState::Pending | RunnerState::Running => Self::Running,
            RunnerState::Done => Self::Done,
            RunnerState::Error => Self::Error,
        }
    }
}

/// Status of one entry as shown to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryStatus {
    pub progress: f64,
    pub state: EntryState,
    pub path: PathBuf,
}

/// One queued input file and what happened to it.
#[derive(Debug, Clone)]
pub struct EntryRecord {
    pub path: PathBuf,
    /// Resolved output path, set when a run starts.
    pub output: Option<PathBuf>,
    pub state: EntryState,
    /// Runner of the most recent execution of this entry.
    pub runner: Option<RunnerHandle>,
}

impl EntryRecord {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            output: None,
            state: EntryState::Created,
            runner: None,
        }
    }

    pub fn status(&self) -> EntryStatus {
        let progress = match self.state {
            EntryState::Created => 0.0,
            EntryState::Done => 1.0,
            EntryState::Running | EntryState::Error => {
                self.runner.as_ref().map(RunnerHandle::progress).unwrap_or(0.0)
            }
        };
        EntryStatus {
            progress,
            state: self.state,
            path: self.path.clone(),
        }
    }

    /// Human-readable summary of the job behind this entry.
    pub fn info(&self) -> String {
        let Some(runner) = &self.runner else {
            return NO_JOB_INFO.to_string();
        };
        let job = runner.job();
        let mut out = String::new();
        let _ = writeln!(out, "Input: {}", job.path_in.display());
        let _ = writeln!(out, "Output: {}", job.path_out.display());
        match runner.pipeline_id() {
            Some(id) => {
                let _ = writeln!(out, "Pipeline ID: {id}");
            }
            None => {
                let _ = writeln!(out, "Pipeline ID: <invalid>");
            }
        }
        let _ = writeln!(out, "State: {}", self.state);
        let _ = writeln!(out, "Started: {}", runner.started_at().to_rfc3339());
        if let Some(finished) = runner.finished_at() {
            let secs = (finished - runner.started_at()).num_milliseconds() as f64 / 1000.0;
            let _ = writeln!(out, "Duration: {secs:.1}s");
        }
        if let Some(detail) = runner.error_detail() {
            let _ = writeln!(out, "Error:\n{detail}");
        }
        out
    }
}

/// Everything a caller can see about the queue at one point in time.
#[derive(Debug, Clone, Default)]
pub struct BatchSnapshot {
    pub entries: Vec<EntryRecord>,
    pub output_root: Option<PathBuf>,
    /// Entry currently executing, or the last one touched.
    pub current_index: Option<usize>,
    pub busy: bool,
}

impl BatchSnapshot {
    pub fn entry_status(&self, index: usize) -> Option<EntryStatus> {
        self.entries.get(index).map(EntryRecord::status)
    }

    pub fn statuses(&self) -> Vec<EntryStatus> {
        self.entries.iter().map(EntryRecord::status).collect()
    }

    /// Mean progress over all entries, in `[0, 1]`.
    pub fn overall_progress(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.entries.iter().map(|e| e.status().progress).sum();
        sum / self.entries.len() as f64
    }

    pub fn count(&self, state: EntryState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }
}

/// Polling view handed to callers (CLI loop, GUI timer).
///
/// Cloning is cheap; every clone sees the same manager.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    rx: watch::Receiver<BatchSnapshot>,
}

impl StatusReporter {
    pub(crate) fn new(rx: watch::Receiver<BatchSnapshot>) -> Self {
        Self { rx }
    }

    pub fn len(&self) -> usize {
        self.rx.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_busy(&self) -> bool {
        self.rx.borrow().busy
    }

    pub fn current_index(&self) -> Option<usize> {
        self.rx.borrow().current_index
    }

    pub fn entry(&self, index: usize) -> Option<EntryStatus> {
        self.rx.borrow().entry_status(index)
    }

    pub fn entries(&self) -> Vec<EntryStatus> {
        self.rx.borrow().statuses()
    }

    pub fn overall_progress(&self) -> f64 {
        self.rx.borrow().overall_progress()
    }

    /// Copy of the latest published snapshot.
    pub fn snapshot(&self) -> BatchSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next published change. Returns `false` once the manager
    /// is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_entry_status() {
        let entry = EntryRecord::new(PathBuf::from("/m/a.rtdc"));
        let status = entry.status();
        assert_eq!(status.progress, 0.0);
        assert_eq!(status.state, EntryState::Created);
        assert_eq!(status.path, PathBuf::from("/m/a.rtdc"));
        assert_eq!(entry.info(), NO_JOB_INFO);
    }

    #[test]
    fn test_done_entry_without_runner_is_complete() {
        let mut entry = EntryRecord::new(PathBuf::from("/m/a.rtdc"));
        entry.state = EntryState::Done;
        assert_eq!(entry.status().progress, 1.0);
        entry.state = EntryState::Error;
        assert_eq!(entry.status().progress, 0.0);
    }

    #[test]
    fn test_snapshot_overall_progress() {
        let mut snapshot = BatchSnapshot::default();
        assert_eq!(snapshot.overall_progress(), 0.0);

        let mut done = EntryRecord::new(PathBuf::from("/a.rtdc"));
        done.state = EntryState::Done;
        snapshot.entries.push(done);
        snapshot.entries.push(EntryRecord::new(PathBuf::from("/b.rtdc")));

        assert_eq!(snapshot.overall_progress(), 0.5);
        assert_eq!(snapshot.count(EntryState::Done), 1);
        assert_eq!(snapshot.count(EntryState::Created), 1);
    }

    #[test]
    fn test_entry_status_serialize() {
        let status = EntryRecord::new(PathBuf::from("/m/a.rtdc")).status();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "created");
        assert_eq!(json["path"], "/m/a.rtdc");
        assert_eq!(json["progress"], 0.0);
    }

    #[test]
    fn test_entry_state_from_runner_state() {
        assert_eq!(EntryState::from(RunnerState::Pending), EntryState::Running);
        assert_eq!(EntryState::from(RunnerState::Done), EntryState::Done);
        assert_eq!(EntryState::from(RunnerState::Error), EntryState::Error);
    }
}
