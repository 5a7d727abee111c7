//! Sequential batch job manager.
//!
//! The manager owns an ordered queue of input files. A run snapshots the
//! queue, resolves every output path up front and then processes the entries
//! one after another on a single background task. While a run is active the
//! queue is read-only: `add_path`, `set_output_root` and `clear` are ignored
//! and a second run is rejected.
//!
//! Readers never take the control lock. They look at the last [`BatchSnapshot`]
//! published by the worker and at the lock-free status of the running entry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::job::PipelineSettings;
use crate::paths;
use crate::runner::{JobRunner, PipelineEngine, RunnerHandle, RunnerState};
use crate::status::{
    BatchSnapshot, EntryRecord, EntryState, EntryStatus, NO_JOB_INFO, StatusReporter,
};
use crate::{Error, Result};

/// Behaviour knobs of a [`JobManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Remove intermediate artifacts of jobs that finished successfully.
    /// Artifacts of failed jobs are always kept.
    pub cleanup_on_success: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cleanup_on_success: true,
        }
    }
}

impl ManagerConfig {
    pub fn with_cleanup_on_success(mut self, cleanup: bool) -> Self {
        self.cleanup_on_success = cleanup;
        self
    }
}

/// Outcome of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Entries executed during this run.
    pub processed: usize,
    pub done: usize,
    /// Queue indices of the entries that ended in `error`.
    pub failed: Vec<usize>,
    /// Entries skipped because they had already been processed.
    pub skipped: usize,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Queue snapshot, resolved outputs and settings a run starts from.
type PreparedRun = (Vec<(PathBuf, EntryState)>, Vec<PathBuf>, PipelineSettings);

struct ManagerInner {
    engine: Arc<dyn PipelineEngine>,
    config: ManagerConfig,
    settings: Mutex<PipelineSettings>,
    /// Serializes queue mutations against the start of a run.
    control: Mutex<()>,
    busy: AtomicBool,
    snapshot: watch::Sender<BatchSnapshot>,
    worker: Mutex<Option<JoinHandle<BatchSummary>>>,
}

/// Clears the busy state when the batch worker exits, even by panic.
struct BusyGuard {
    inner: Arc<ManagerInner>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        // Release the flag first: a reader that sees an idle snapshot must be
        // able to mutate the queue right away.
        self.inner.busy.store(false, Ordering::Release);
        self.inner.snapshot.send_modify(|s| s.busy = false);
    }
}

/// Ordered queue of input files processed one at a time.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

impl JobManager {
    pub fn new(engine: Arc<dyn PipelineEngine>, settings: PipelineSettings) -> Self {
        Self::with_config(engine, settings, ManagerConfig::default())
    }

    pub fn with_config(
        engine: Arc<dyn PipelineEngine>,
        settings: PipelineSettings,
        config: ManagerConfig,
    ) -> Self {
        let (snapshot, _) = watch::channel(BatchSnapshot::default());
        Self {
            inner: Arc::new(ManagerInner {
                engine,
                config,
                settings: Mutex::new(settings),
                control: Mutex::new(()),
                busy: AtomicBool::new(false),
                snapshot,
                worker: Mutex::new(None),
            }),
        }
    }

    /// Run `mutate` on the published state unless a run is active.
    fn mutate_idle(&self, what: &'static str, mutate: impl FnOnce(&mut BatchSnapshot)) -> bool {
        let _guard = self.inner.control.lock();
        if self.inner.busy.load(Ordering::Acquire) {
            debug!("Ignoring {what} while a batch run is active");
            return false;
        }
        self.inner.snapshot.send_modify(mutate);
        true
    }

    /// Append `path` to the queue. Ignored while busy.
    pub fn add_path(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        self.mutate_idle("add_path", |s| s.entries.push(EntryRecord::new(path)))
    }

    /// Set or unset the directory that receives all outputs. Ignored while
    /// busy.
    pub fn set_output_root(&self, root: Option<PathBuf>) -> bool {
        let root = root.map(|r| std::path::absolute(&r).unwrap_or(r));
        self.mutate_idle("set_output_root", |s| s.output_root = root)
    }

    /// Replace the pipeline parameters used for subsequent runs. Ignored
    /// while busy.
    pub fn set_settings(&self, settings: PipelineSettings) -> bool {
        let _guard = self.inner.control.lock();
        if self.inner.busy.load(Ordering::Acquire) {
            debug!("Ignoring set_settings while a batch run is active");
            return false;
        }
        *self.inner.settings.lock() = settings;
        true
    }

    pub fn settings(&self) -> PipelineSettings {
        self.inner.settings.lock().clone()
    }

    /// Empty the queue and forget all runners. Ignored while busy.
    pub fn clear(&self) -> bool {
        self.mutate_idle("clear", |s| {
            s.entries.clear();
            s.current_index = None;
        })
    }

    pub fn len(&self) -> usize {
        self.inner.snapshot.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    pub fn output_root(&self) -> Option<PathBuf> {
        self.inner.snapshot.borrow().output_root.clone()
    }

    /// Entry currently executing, or the last one touched.
    pub fn current_index(&self) -> Option<usize> {
        self.inner.snapshot.borrow().current_index
    }

    pub fn paths_in(&self) -> Vec<PathBuf> {
        self.inner
            .snapshot
            .borrow()
            .entries
            .iter()
            .map(|e| e.path.clone())
            .collect()
    }

    /// Output paths the current queue would be written to. Nothing is
    /// created on disk.
    pub fn paths_out(&self) -> Result<Vec<PathBuf>> {
        let (inputs, root) = {
            let snapshot = self.inner.snapshot.borrow();
            let inputs = snapshot.entries.iter().map(|e| e.path.clone()).collect::<Vec<_>>();
            (inputs, snapshot.output_root.clone())
        };
        paths::map_outputs(&inputs, root.as_deref())
    }

    /// Runner of entry `index`, absent until the entry has been started.
    pub fn get_runner(&self, index: usize) -> Option<RunnerHandle> {
        self.inner
            .snapshot
            .borrow()
            .entries
            .get(index)
            .and_then(|e| e.runner.clone())
    }

    pub fn get_entry_status(&self, index: usize) -> Result<EntryStatus> {
        let snapshot = self.inner.snapshot.borrow();
        snapshot.entry_status(index).ok_or(Error::IndexOutOfRange {
            index,
            len: snapshot.entries.len(),
        })
    }

    /// Human-readable information about the job of entry `index`.
    pub fn entry_info(&self, index: usize) -> String {
        self.inner
            .snapshot
            .borrow()
            .entries
            .get(index)
            .map(EntryRecord::info)
            .unwrap_or_else(|| NO_JOB_INFO.to_string())
    }

    /// Receiver of every snapshot the manager publishes.
    pub fn subscribe(&self) -> watch::Receiver<BatchSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn reporter(&self) -> StatusReporter {
        StatusReporter::new(self.subscribe())
    }

    /// Start processing all `created` entries on a background task.
    ///
    /// Returns once the run owns the busy state. Output paths are resolved
    /// and their directories created before anything runs; a resolution
    /// failure is returned here and leaves the manager idle.
    pub fn run_all_async(&self) -> Result<()> {
        let task = self.start_run()?;
        *self.inner.worker.lock() = Some(task);
        Ok(())
    }

    fn start_run(&self) -> Result<JoinHandle<BatchSummary>> {
        let _guard = self.inner.control.lock();
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Refusing to start a batch run while another one is active");
            return Err(Error::Busy("a batch run is already active"));
        }

        let prepared = self.prepare_run();
        let (entries, outputs, settings) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.inner.busy.store(false, Ordering::Release);
                error!(error = %e, "Batch run not started");
                return Err(e);
            }
        };

        self.inner.snapshot.send_modify(|s| {
            s.busy = true;
            for (entry, output) in s.entries.iter_mut().zip(&outputs) {
                entry.output = Some(output.clone());
            }
        });

        info!(entries = entries.len(), engine = self.inner.engine.name(), "Starting batch run");
        let guard = BusyGuard {
            inner: self.inner.clone(),
        };
        Ok(tokio::spawn(run_batch(guard, entries, outputs, settings)))
    }

    fn prepare_run(&self) -> Result<PreparedRun> {
        let settings = self.inner.settings.lock().clone();
        settings.pipeline_id()?;

        let (entries, root) = {
            let snapshot = self.inner.snapshot.borrow();
            let entries = snapshot
                .entries
                .iter()
                .map(|e| (e.path.clone(), e.state))
                .collect::<Vec<_>>();
            (entries, snapshot.output_root.clone())
        };
        let inputs = entries.iter().map(|(p, _)| p.as_path()).collect::<Vec<_>>();
        let outputs = paths::resolve_outputs(&inputs, root.as_deref())?;
        Ok((entries, outputs, settings))
    }

    /// Run all `created` entries and wait for the batch to finish.
    ///
    /// The run is awaited by this call only; [`join`](Self::join) does not
    /// see it.
    pub async fn run_all(&self) -> Result<BatchSummary> {
        let task = self.start_run()?;
        await_worker(task).await
    }

    /// Wait for the run started by [`run_all_async`](Self::run_all_async).
    ///
    /// Returns `Ok(None)` when no run is pending, and `Error::Worker` when
    /// the batch task was cancelled or panicked.
    pub async fn join(&self) -> Result<Option<BatchSummary>> {
        let task = self.inner.worker.lock().take();
        match task {
            Some(task) => await_worker(task).await.map(Some),
            None => Ok(None),
        }
    }
}

async fn await_worker(task: JoinHandle<BatchSummary>) -> Result<BatchSummary> {
    task.await.map_err(|e| {
        error!(error = %e, "Batch worker terminated abnormally");
        Error::Worker(e.to_string())
    })
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("engine", &self.inner.engine.name())
            .field("entries", &self.len())
            .field("busy", &self.is_busy())
            .finish()
    }
}

async fn run_batch(
    guard: BusyGuard,
    entries: Vec<(PathBuf, EntryState)>,
    outputs: Vec<PathBuf>,
    settings: PipelineSettings,
) -> BatchSummary {
    let inner = guard.inner.clone();
    let mut summary = BatchSummary::default();

    for (index, ((path, state), output)) in entries.iter().zip(&outputs).enumerate() {
        if *state != EntryState::Created {
            debug!(index, path = %path.display(), state = %state, "Skipping processed entry");
            summary.skipped += 1;
            continue;
        }

        let job = settings.job_for(path, output);
        let mut runner = JobRunner::start(inner.engine.clone(), job);
        let handle = runner.handle();
        inner.snapshot.send_modify(|s| {
            s.current_index = Some(index);
            if let Some(entry) = s.entries.get_mut(index) {
                entry.state = EntryState::Running;
                entry.runner = Some(handle.clone());
            }
        });

        let outcome = runner.finished().await;
        let cleanup = outcome == RunnerState::Done && inner.config.cleanup_on_success;
        let outcome = runner.join(cleanup).await;

        let entry_state = EntryState::from(outcome);
        if entry_state == EntryState::Done {
            summary.done += 1;
            info!(index, path = %path.display(), "Entry done");
        } else {
            summary.failed.push(index);
            warn!(
                index,
                path = %path.display(),
                state = %entry_state,
                error = handle.error_detail().unwrap_or("unknown error"),
                "Entry failed"
            );
        }
        summary.processed += 1;
        inner.snapshot.send_modify(|s| {
            if let Some(entry) = s.entries.get_mut(index) {
                entry.state = entry_state;
            }
        });
    }

    info!(
        done = summary.done,
        failed = summary.failed.len(),
        skipped = summary.skipped,
        "Batch run finished"
    );
    drop(guard);
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobConfig;
    use crate::runner::ProgressReporter;
    use async_trait::async_trait;

    struct InstantEngine;

    #[async_trait]
    impl PipelineEngine for InstantEngine {
        fn name(&self) -> &'static str {
            "instant"
        }

        async fn execute(&self, job: &JobConfig, progress: ProgressReporter) -> Result<()> {
            progress.report(0.5);
            if job.path_in.to_string_lossy().contains("hang") {
                std::future::pending::<()>().await;
            }
            if job.path_in.to_string_lossy().contains("broken") {
                return Err(Error::engine("no events found"));
            }
            Ok(())
        }
    }

    fn manager() -> JobManager {
        JobManager::new(Arc::new(InstantEngine), PipelineSettings::default())
    }

    #[tokio::test]
    async fn test_add_path_and_preview_outputs() {
        let manager = manager();
        assert!(manager.is_empty());
        assert!(manager.add_path("/m/one.rtdc"));
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.paths_out().unwrap(), vec![PathBuf::from("/m/one_dcn.rtdc")]);
        assert_eq!(manager.current_index(), None);
        assert!(manager.get_runner(0).is_none());
        assert_eq!(manager.entry_info(0), NO_JOB_INFO);
    }

    #[tokio::test]
    async fn test_entry_status_out_of_range() {
        let err = manager().get_entry_status(3).unwrap_err();
        assert!(matches!(err, Error::IndexOutOfRange { index: 3, len: 0 }));
    }

    #[tokio::test]
    async fn test_run_all_records_outcomes() {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager();
        manager.add_path(temp.path().join("broken.rtdc"));
        manager.add_path(temp.path().join("fine.rtdc"));

        let summary = manager.run_all().await.unwrap();

        assert_eq!(summary.done, 1);
        assert_eq!(summary.failed, vec![0]);
        assert!(!manager.is_busy());
        assert_eq!(manager.current_index(), Some(1));
        let failed = manager.get_entry_status(0).unwrap();
        assert_eq!(failed.state, EntryState::Error);
        assert_eq!(failed.progress, 0.5);
        assert_eq!(manager.get_entry_status(1).unwrap().progress, 1.0);
        assert!(manager.entry_info(0).contains("no events found"));
    }

    #[tokio::test]
    async fn test_processed_entries_are_not_rerun() {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager();
        manager.add_path(temp.path().join("a.rtdc"));
        manager.run_all().await.unwrap();
        let first = manager.get_runner(0).unwrap();

        manager.add_path(temp.path().join("b.rtdc"));
        let summary = manager.run_all().await.unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.processed, 1);
        assert_eq!(manager.get_runner(0).unwrap().started_at(), first.started_at());
    }

    #[tokio::test]
    async fn test_clear_resets_history() {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager();
        manager.add_path(temp.path().join("a.rtdc"));
        manager.run_all().await.unwrap();

        assert!(manager.clear());
        assert!(manager.is_empty());
        assert_eq!(manager.current_index(), None);
    }

    #[tokio::test]
    async fn test_collision_leaves_manager_idle() {
        let manager = manager();
        manager.add_path("/r/a/x.rtdc");
        manager.add_path("/r/a/x.RTDC");

        let err = manager.run_all().await.unwrap_err();
        assert!(err.is_configuration());
        assert!(!manager.is_busy());
        assert_eq!(manager.get_entry_status(0).unwrap().state, EntryState::Created);
    }

    #[tokio::test]
    async fn test_empty_queue_run_is_trivial() {
        let summary = manager().run_all().await.unwrap();
        assert_eq!(summary, BatchSummary::default());
        assert!(summary.is_success());
    }

    #[tokio::test]
    async fn test_join_without_run() {
        assert!(manager().join().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_all_is_not_visible_to_join() {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager();
        let other = manager.clone();
        manager.add_path(temp.path().join("a.rtdc"));

        let summary = manager.run_all().await.unwrap();
        assert_eq!(summary.done, 1);
        assert!(other.join().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_join_reports_aborted_worker() {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager();
        manager.add_path(temp.path().join("hang.rtdc"));
        manager.run_all_async().unwrap();

        if let Some(task) = manager.inner.worker.lock().as_ref() {
            task.abort();
        }
        let err = manager.join().await.unwrap_err();

        assert!(matches!(err, Error::Worker(_)));
        assert!(!manager.is_busy());
        assert!(manager.add_path(temp.path().join("next.rtdc")));
    }

    #[tokio::test]
    async fn test_idle_snapshot_implies_mutable_queue() {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager();
        manager.add_path(temp.path().join("a.rtdc"));
        let mut rx = manager.subscribe();

        manager.run_all_async().unwrap();
        rx.wait_for(|s| !s.busy).await.unwrap();

        assert!(!manager.is_busy());
        assert!(manager.add_path(temp.path().join("b.rtdc")));
        assert_eq!(manager.len(), 2);
        manager.join().await.unwrap();
    }
}
