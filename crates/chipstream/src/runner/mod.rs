//! Job runner adapter.
//!
//! A [`JobRunner`] drives exactly one [`JobConfig`] through a
//! [`PipelineEngine`] on its own tokio task. Callers observe it through a
//! cheap, cloneable [`RunnerHandle`] whose status reads never block.

mod command;

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Result;
use crate::job::JobConfig;
use crate::ppid::PipelineId;
use crate::utils::fs;

pub use command::{CommandEngine, JOB_FILE_NAME};

/// State of one pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Pending = 0,
    Running = 1,
    Done = 2,
    Error = 3,
}

impl RunnerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Done,
            _ => Self::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time status of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub progress: f64,
    pub state: RunnerState,
}

/// Trait for pipeline execution engines.
///
/// An engine runs one job to completion. It may use as many processes as
/// `job.num_procs` allows, but it is only ever asked to run one job at a time.
#[async_trait]
pub trait PipelineEngine: Send + Sync + 'static {
    /// Get the engine name.
    fn name(&self) -> &'static str;

    /// Cheap checks run before anything is spawned (e.g. the engine binary
    /// exists). A failure here puts the runner straight into `error`.
    fn validate(&self, _job: &JobConfig) -> Result<()> {
        Ok(())
    }

    /// Run the job, reporting progress through `progress`.
    async fn execute(&self, job: &JobConfig, progress: ProgressReporter) -> Result<()>;

    /// Remove intermediate artifacts left behind by `execute`.
    async fn remove_intermediates(&self, job: &JobConfig) -> Result<()> {
        fs::remove_dir_all_if_exists(&job.intermediate_dir()).await
    }
}

struct RunnerShared {
    job: JobConfig,
    pipeline_id: Option<PipelineId>,
    state: AtomicU8,
    progress: AtomicU64,
    error_detail: OnceLock<String>,
    started_at: DateTime<Utc>,
    finished_at: OnceLock<DateTime<Utc>>,
}

impl RunnerShared {
    fn set_running(&self) {
        let _ = self.state.compare_exchange(
            RunnerState::Pending as u8,
            RunnerState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn set_progress(&self, progress: f64) {
        let clamped = if progress.is_finite() {
            progress.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.progress.store(clamped.to_bits(), Ordering::Release);
    }

    fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Acquire))
    }

    fn state(&self) -> RunnerState {
        RunnerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn complete(&self) {
        self.set_progress(1.0);
        let _ = self.finished_at.set(Utc::now());
        self.state.store(RunnerState::Done as u8, Ordering::Release);
    }

    fn fail(&self, detail: String) {
        let _ = self.error_detail.set(detail);
        let _ = self.finished_at.set(Utc::now());
        self.state.store(RunnerState::Error as u8, Ordering::Release);
    }
}

/// Progress sink handed to an engine.
#[derive(Clone)]
pub struct ProgressReporter {
    shared: Arc<RunnerShared>,
}

impl ProgressReporter {
    /// Report progress as a fraction in `[0, 1]`. Out-of-range values are
    /// clamped.
    pub fn report(&self, progress: f64) {
        self.shared.set_progress(progress);
    }

    pub fn current(&self) -> f64 {
        self.shared.progress()
    }
}

/// Cloneable, read-only view of one runner.
#[derive(Clone)]
pub struct RunnerHandle {
    shared: Arc<RunnerShared>,
}

impl RunnerHandle {
    pub fn status(&self) -> RunnerStatus {
        // State first: a terminal state implies the final progress is stored.
        let state = self.shared.state();
        RunnerStatus {
            progress: self.shared.progress(),
            state,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.shared.state()
    }

    pub fn progress(&self) -> f64 {
        self.shared.progress()
    }

    /// Full diagnostic trace; only present in the `error` state.
    pub fn error_detail(&self) -> Option<&str> {
        if self.state() == RunnerState::Error {
            self.shared.error_detail.get().map(String::as_str)
        } else {
            None
        }
    }

    pub fn job(&self) -> &JobConfig {
        &self.shared.job
    }

    pub fn pipeline_id(&self) -> Option<&PipelineId> {
        self.shared.pipeline_id.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.shared.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.shared.finished_at.get().copied()
    }
}

impl std::fmt::Debug for RunnerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerHandle")
            .field("path_in", &self.shared.job.path_in)
            .field("status", &self.status())
            .finish()
    }
}

/// One running pipeline job.
pub struct JobRunner {
    shared: Arc<RunnerShared>,
    engine: Arc<dyn PipelineEngine>,
    task: Option<JoinHandle<()>>,
}

impl JobRunner {
    /// Start `job` on `engine`.
    ///
    /// Returns once the job is observable; the work itself happens on a
    /// separate task. Must be called from within a tokio runtime.
    pub fn start(engine: Arc<dyn PipelineEngine>, job: JobConfig) -> Self {
        let pipeline_id = job.pipeline_id().ok();
        let shared = Arc::new(RunnerShared {
            job,
            pipeline_id,
            state: AtomicU8::new(RunnerState::Pending as u8),
            progress: AtomicU64::new(0f64.to_bits()),
            error_detail: OnceLock::new(),
            started_at: Utc::now(),
            finished_at: OnceLock::new(),
        });

        let precheck = shared
            .job
            .validate()
            .and_then(|()| engine.validate(&shared.job));
        if let Err(e) = precheck {
            warn!(
                engine = engine.name(),
                path = %shared.job.path_in.display(),
                error = %e,
                "Job rejected before start"
            );
            shared.fail(e.trace());
            return Self {
                shared,
                engine,
                task: None,
            };
        }

        info!(
            engine = engine.name(),
            path_in = %shared.job.path_in.display(),
            path_out = %shared.job.path_out.display(),
            "Starting pipeline job"
        );

        let task_shared = shared.clone();
        let task_engine = engine.clone();
        let task = tokio::spawn(async move {
            task_shared.set_running();
            let exec_shared = task_shared.clone();
            let execution = tokio::spawn(async move {
                let reporter = ProgressReporter {
                    shared: exec_shared.clone(),
                };
                task_engine.execute(&exec_shared.job, reporter).await
            });

            match execution.await {
                Ok(Ok(())) => {
                    debug!(path = %task_shared.job.path_in.display(), "Pipeline job finished");
                    task_shared.complete();
                }
                Ok(Err(e)) => {
                    warn!(path = %task_shared.job.path_in.display(), error = %e, "Pipeline job failed");
                    task_shared.fail(e.trace());
                }
                Err(join_error) => {
                    let detail = if join_error.is_panic() {
                        format!("Pipeline engine panicked: {}", panic_message(join_error))
                    } else {
                        format!("Pipeline engine task aborted: {join_error}")
                    };
                    warn!(path = %task_shared.job.path_in.display(), "{detail}");
                    task_shared.fail(detail);
                }
            }
        });

        Self {
            shared,
            engine,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn status(&self) -> RunnerStatus {
        self.handle().status()
    }

    /// Wait until the job reached a terminal state.
    pub async fn finished(&mut self) -> RunnerState {
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            // The supervising task only records state; if it died the job
            // outcome is unknown.
            self.shared.fail(format!("Runner supervisor task failed: {e}"));
        }
        self.shared.state()
    }

    /// Wait for the job to terminate and release it.
    ///
    /// With `cleanup` intermediate artifacts are removed; without, they are
    /// kept for post-mortem inspection.
    pub async fn join(mut self, cleanup: bool) -> RunnerState {
        let state = self.finished().await;
        if cleanup {
            if let Err(e) = self.engine.remove_intermediates(&self.shared.job).await {
                warn!(
                    path = %self.shared.job.path_in.display(),
                    error = %e,
                    "Failed to remove intermediate files"
                );
            }
        } else {
            debug!(
                dir = %self.shared.job.intermediate_dir().display(),
                "Keeping intermediate files"
            );
        }
        state
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    let payload = join_error.into_panic();
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "<non-string panic payload>".to_string()
}
