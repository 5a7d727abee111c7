//! Engine that runs the pipeline as an external program.
//!
//! The job configuration is written as JSON into the job's intermediate
//! directory and its path is passed as the last argument. The program reports
//! progress by printing JSON lines such as `{"progress": 0.42}` on stdout;
//! anything else on stdout is logged. On a non-zero exit the tail of stderr
//! becomes the error detail.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, trace};

use super::{PipelineEngine, ProgressReporter};
use crate::job::JobConfig;
use crate::{Error, Result};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Thread pools of numeric libraries inside the engine must not compete with
/// its own process-level parallelism.
const SINGLE_THREAD_ENV: [&str; 4] = [
    "OMP_NUM_THREADS",
    "MKL_NUM_THREADS",
    "NUMEXPR_NUM_THREADS",
    "NUMBA_NUM_THREADS",
];

/// Name of the job file written into the intermediate directory.
pub const JOB_FILE_NAME: &str = "job.json";

#[derive(Debug, Deserialize)]
struct ProgressLine {
    progress: f64,
    #[serde(default)]
    message: Option<String>,
}

/// Pipeline engine backed by an external executable.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<OsString>,
    stderr_tail_lines: usize,
}

impl CommandEngine {
    /// Create an engine that runs `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stderr_tail_lines: 50,
        }
    }

    /// Add an argument placed before the job file.
    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Number of trailing stderr lines kept for the error detail.
    pub fn with_stderr_tail(mut self, lines: usize) -> Self {
        self.stderr_tail_lines = lines.max(1);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Resolve the program against `PATH` unless it already contains a
    /// directory component.
    pub fn locate_program(&self) -> Option<PathBuf> {
        if self.program.components().count() > 1 {
            return is_executable_file(&self.program).then(|| self.program.clone());
        }
        let path_var = std::env::var_os("PATH")?;
        std::env::split_paths(&path_var).find_map(|dir| {
            let candidate = dir.join(&self.program);
            if is_executable_file(&candidate) {
                return Some(candidate);
            }
            #[cfg(windows)]
            {
                let exe = candidate.with_extension("exe");
                if is_executable_file(&exe) {
                    return Some(exe);
                }
            }
            None
        })
    }

    fn command(&self, program: &Path, job_file: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(&self.args)
            .arg(job_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in SINGLE_THREAD_ENV {
            if std::env::var_os(key).is_none() {
                cmd.env(key, "1");
            }
        }
        #[cfg(windows)]
        {
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd
    }
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

async fn collect_tail<R: AsyncRead + Unpin>(reader: R, max_lines: usize) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(max_lines);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == max_lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect()
}

#[async_trait]
impl PipelineEngine for CommandEngine {
    fn name(&self) -> &'static str {
        "command"
    }

    fn validate(&self, _job: &JobConfig) -> Result<()> {
        if self.locate_program().is_none() {
            return Err(Error::engine(format!(
                "pipeline program not found or not executable: {}",
                self.program.display()
            )));
        }
        Ok(())
    }

    async fn execute(&self, job: &JobConfig, progress: ProgressReporter) -> Result<()> {
        let program = self.locate_program().ok_or_else(|| {
            Error::engine(format!("pipeline program not found: {}", self.program.display()))
        })?;

        let scratch = job.intermediate_dir();
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| Error::io_path("creating intermediate directory", &scratch, e))?;
        let job_file = scratch.join(JOB_FILE_NAME);
        let payload = serde_json::to_vec_pretty(job)?;
        tokio::fs::write(&job_file, payload)
            .await
            .map_err(|e| Error::io_path("writing job file", &job_file, e))?;

        info!(program = %program.display(), job = %job_file.display(), "Spawning pipeline process");

        let mut child = self
            .command(&program, &job_file)
            .spawn()
            .map_err(|e| Error::io_path("spawning", &program, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::engine("pipeline process has no stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::engine("pipeline process has no stderr"))?;

        let stderr_task = tokio::spawn(collect_tail(stderr, self.stderr_tail_lines));

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| Error::io_path("reading output of", &program, e))?
        {
            match serde_json::from_str::<ProgressLine>(&line) {
                Ok(update) => {
                    trace!(progress = update.progress, "Pipeline progress");
                    progress.report(update.progress);
                    if let Some(message) = update.message {
                        debug!(path = %job.path_in.display(), "{message}");
                    }
                }
                Err(_) => debug!(path = %job.path_in.display(), "{line}"),
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::io_path("waiting for", &program, e))?;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if status.success() {
            return Ok(());
        }

        let mut detail = format!("{} exited with {status}", program.display());
        if !stderr_tail.is_empty() {
            detail.push('\n');
            detail.push_str(&stderr_tail.join("\n"));
        }
        Err(Error::Engine(detail))
    }
}
