//! # chipstream
//!
//! Batch processing of deformability cytometry measurements.
//!
//! Input files are queued in a [`JobManager`], which resolves their output
//! paths and runs them strictly one after another through a
//! [`PipelineEngine`]. Each execution is driven by a [`JobRunner`] whose
//! progress can be polled without blocking.
//!
//! ## Features
//!
//! - Canonical pipeline identifiers ([`PipelineId`])
//! - Output path mapping that mirrors the input layout under an output root
//! - Sequential job manager with busy/idle state and pull-based status
//! - External-process engine ([`CommandEngine`]) speaking a JSON line protocol
//! - Persistent list of recently used output directories

pub mod error;
pub mod job;
pub mod manager;
pub mod paths;
pub mod ppid;
pub mod recent;
pub mod runner;
pub mod status;
mod utils;

pub use error::{Error, Result};
pub use job::{ComponentConfig, JobConfig, KwargValue, Kwargs, PipelineSettings};
pub use manager::{BatchSummary, JobManager, ManagerConfig};
pub use paths::{discover_inputs, map_outputs, resolve_outputs};
pub use ppid::{PipelineId, compute_pipeline_id};
pub use recent::RecentDirs;
pub use runner::{
    CommandEngine, JobRunner, PipelineEngine, ProgressReporter, RunnerHandle, RunnerState,
    RunnerStatus,
};
pub use status::{BatchSnapshot, EntryState, EntryStatus, StatusReporter};
