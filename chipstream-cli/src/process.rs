//! Processing of a single file or a whole directory tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chipstream::job::{parse_kwargs, split_mask_kwargs};
use chipstream::paths::output_file_name;
use chipstream::{
    CommandEngine, ComponentConfig, JobManager, JobRunner, ManagerConfig, PipelineEngine,
    PipelineSettings, RunnerState, discover_inputs,
};
use tracing::{debug, info, warn};

use crate::cli::Args;
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::output::{OutputManager, POLL_INTERVAL};

/// Number of CPUs usable by the pipeline.
fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Worker count from the command line or the config, clamped to the CPUs.
pub fn resolve_num_procs(requested: Option<usize>, debug: bool) -> usize {
    if debug {
        return 1;
    }
    let cpus = cpu_count();
    requested.unwrap_or(cpus).clamp(1, cpus)
}

/// Replace `base` by a fresh component if another method was chosen, then
/// apply the user's keyword arguments. The mask group survives a change of
/// method.
fn component(base: ComponentConfig, method: &str, kwargs: &[String]) -> Result<ComponentConfig> {
    let component = if base.code.eq_ignore_ascii_case(method) {
        base
    } else {
        ComponentConfig::new(method.to_ascii_lowercase()).with_mask_kwargs(base.mask_kwargs)
    };
    Ok(component.with_kwargs(parse_kwargs(kwargs)?))
}

/// Like [`component`], with mask keys of `-ks` routed to the mask group.
fn segmenter(base: ComponentConfig, method: &str, kwargs: &[String]) -> Result<ComponentConfig> {
    let (kwargs, mask_kwargs) = split_mask_kwargs(parse_kwargs(kwargs)?);
    Ok(component(base, method, &[])?
        .with_kwargs(kwargs)
        .with_mask_kwargs(mask_kwargs))
}

/// Pipeline settings described by the command line.
pub fn build_settings(args: &Args, config: &AppConfig) -> Result<PipelineSettings> {
    let defaults = PipelineSettings::default();
    if !(args.pixel_size >= 0.0 && args.pixel_size.is_finite()) {
        return Err(AppError::InvalidInput(format!(
            "pixel size must be a non-negative number, got {}",
            args.pixel_size
        )));
    }
    let settings = PipelineSettings {
        background: component(
            defaults.background.clone(),
            &args.background_method,
            &args.background_kwargs,
        )?,
        segmenter: segmenter(
            defaults.segmenter.clone(),
            &args.segmentation_method,
            &args.segmentation_kwargs,
        )?,
        feature: defaults
            .feature
            .clone()
            .with_kwargs(parse_kwargs(&args.feature_kwargs)?),
        gate: defaults
            .gate
            .clone()
            .with_kwargs(parse_kwargs(&args.gate_kwargs)?),
        ..defaults
    };
    Ok(settings
        .with_pixel_size(args.pixel_size)
        .with_num_procs(resolve_num_procs(args.num_cpus.or(config.num_cpus), args.debug))
        .with_debug(args.debug))
}

pub fn build_engine(args: &Args, config: &AppConfig) -> CommandEngine {
    let program = args.engine.clone().unwrap_or_else(|| config.engine.clone());
    config
        .engine_args
        .iter()
        .fold(CommandEngine::new(program), |engine, arg| engine.with_arg(arg))
}

pub struct Processor {
    engine: Arc<dyn PipelineEngine>,
    settings: PipelineSettings,
    manager_config: ManagerConfig,
    output: OutputManager,
}

impl Processor {
    pub fn new(
        engine: Arc<dyn PipelineEngine>,
        settings: PipelineSettings,
        manager_config: ManagerConfig,
        output: OutputManager,
    ) -> Self {
        Self {
            engine,
            settings,
            manager_config,
            output,
        }
    }

    /// Process one measurement. Returns whether it failed.
    pub async fn process_dataset(
        &self,
        path_in: &Path,
        path_out: Option<&Path>,
        dry_run: bool,
    ) -> Result<bool> {
        let path_out = match path_out {
            Some(path) => path.to_path_buf(),
            None => path_in.with_file_name(output_file_name(path_in)?),
        };

        self.output.print_pipeline_ids(&self.settings)?;
        if dry_run {
            self.output.success("Dry run complete");
            return Ok(false);
        }

        if let Some(parent) = path_out.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let job = self.settings.job_for(path_in, &path_out);
        let mut runner = JobRunner::start(self.engine.clone(), job);
        let handle = runner.handle();

        let bar = self.output.progress_bar();
        loop {
            let status = handle.status();
            self.output.show_runner(&bar, &status);
            if status.state.is_terminal() {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        bar.finish();

        let state = runner.finished().await;
        let state = runner.join(state == RunnerState::Done).await;
        if state == RunnerState::Error {
            self.output
                .error_trace(handle.error_detail().unwrap_or("unknown error"));
            return Ok(true);
        }
        info!(path = %path_out.display(), "Wrote output");
        Ok(false)
    }

    /// Process every measurement below `dir`. Returns the number of failed
    /// files.
    pub async fn process_directory(
        &self,
        dir: &Path,
        output_root: Option<&Path>,
        dry_run: bool,
    ) -> Result<usize> {
        let inputs = discover_inputs(dir)?;
        if inputs.is_empty() {
            warn!(dir = %dir.display(), "No measurement files found");
            return Ok(0);
        }

        if dry_run {
            self.output.heading(&format!("Processing {}", inputs[0].display()));
            self.output.print_pipeline_ids(&self.settings)?;
            self.output.notice("Stopping dry run after one iteration");
            return Ok(0);
        }

        let manager = JobManager::with_config(
            self.engine.clone(),
            self.settings.clone(),
            self.manager_config.clone(),
        );
        for input in &inputs {
            manager.add_path(input);
        }
        manager.set_output_root(output_root.map(Path::to_path_buf));
        self.output.print_pipeline_ids(&self.settings)?;
        manager.run_all_async()?;

        let reporter = manager.reporter();
        let total = reporter.len();
        let bar = self.output.progress_bar();
        let mut announced: Option<usize> = None;
        loop {
            let busy = reporter.is_busy();
            if let Some(index) = reporter.current_index() {
                if announced != Some(index) {
                    announced = Some(index);
                    bar.println(format!("Processing {}", inputs[index].display()));
                }
                if let Some(status) = reporter.entry(index) {
                    self.output.show_entry(&bar, index, total, &status);
                }
            }
            if !busy {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        bar.finish();

        let summary = manager
            .join()
            .await?
            .ok_or_else(|| chipstream::Error::Worker("no batch run to join".to_string()))?;
        for &index in &summary.failed {
            self.output
                .failure(&format!("\nFailed to process {}", inputs[index].display()));
            if let Some(runner) = manager.get_runner(index) {
                self.output
                    .error_trace(runner.error_detail().unwrap_or("unknown error"));
            }
        }
        debug!(done = summary.done, failed = summary.failed.len(), "Directory processed");
        if !summary.is_success() {
            self.output
                .failure(&format!("Could not process {} files", summary.failed.len()));
        }
        Ok(summary.failed.len())
    }
}

/// Check the path arguments before anything is processed.
pub fn validate_paths(args: &Args) -> Result<()> {
    if !args.path_in.exists() {
        return Err(AppError::InvalidInput(format!(
            "PATH_IN '{}' does not exist",
            args.path_in.display()
        )));
    }
    if args.recursive {
        if !args.path_in.is_dir() {
            return Err(AppError::InvalidInput(format!(
                "PATH_IN must be a directory in recursive mode, but '{}' is not",
                args.path_in.display()
            )));
        }
        return Ok(());
    }
    if args.path_in.is_dir() {
        return Err(AppError::InvalidInput(format!(
            "PATH_IN must be a file, but '{}' is a directory. Did you forget to specify the `--recursive` flag?",
            args.path_in.display()
        )));
    }
    if let Some(path_out) = &args.path_out
        && path_out.is_dir()
    {
        return Err(AppError::InvalidInput(format!(
            "PATH_OUT must be a path to a file, but '{}' is a directory",
            path_out.display()
        )));
    }
    Ok(())
}

/// Directory worth remembering after a run: the output root in recursive
/// mode, the parent of an explicit output file otherwise.
pub fn output_dir_to_remember(args: &Args) -> Option<PathBuf> {
    let path_out = args.path_out.as_ref()?;
    let dir = if args.recursive {
        path_out.clone()
    } else {
        path_out.parent()?.to_path_buf()
    };
    if dir.as_os_str().is_empty() {
        return None;
    }
    Some(std::path::absolute(&dir).unwrap_or(dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(list: &[&str]) -> Args {
        let argv = std::iter::once("chipstream-cli")
            .chain(list.iter().copied())
            .map(std::ffi::OsString::from);
        Args::try_parse_from(crate::cli::normalize_kwarg_flags(argv)).unwrap()
    }

    #[test]
    fn test_default_settings_identifier() {
        let settings = build_settings(&args(&["in.rtdc"]), &AppConfig::default()).unwrap();
        assert_eq!(
            settings.pipeline_id().unwrap().to_string(),
            "7|hdf|sparsemed:f=0.8^k=200^s=1^t=0|thresh:t=-6:cle=1^clo=2^f=1|legacy:b=1^h=1|norm:o=0^s=10"
        );
    }

    #[test]
    fn test_kwargs_and_pixel_size_enter_identifier() {
        let settings = build_settings(
            &args(&["-p", "0.2645", "-ks", "thresh=-4", "-kf", "haralick=false", "in.rtdc"]),
            &AppConfig::default(),
        )
        .unwrap();
        let id = settings.pipeline_id().unwrap();
        assert_eq!(id.data, "hdf:p=0.2645");
        assert_eq!(id.segmenter, "thresh:t=-4:cle=1^clo=2^f=1");
        assert_eq!(id.feature, "legacy:b=1^h=0");
    }

    #[test]
    fn test_other_segmenter_drops_threshold_default() {
        let settings = build_settings(
            &args(&["-s", "Watershed", "in.rtdc"]),
            &AppConfig::default(),
        )
        .unwrap();
        assert_eq!(settings.segmenter.code, "watershed");
        assert!(settings.segmenter.kwargs.is_empty());
        assert_eq!(settings.segmenter.ppid(), "watershed::cle=1^clo=2^f=1");
    }

    #[test]
    fn test_mask_kwargs_go_to_mask_group() {
        let settings = build_settings(
            &args(&["-ks", "clear_border=false", "-ks", "thresh=-3", "in.rtdc"]),
            &AppConfig::default(),
        )
        .unwrap();
        assert!(!settings.segmenter.kwargs.contains_key("clear_border"));
        assert_eq!(settings.segmenter.ppid(), "thresh:t=-3:cle=0^clo=2^f=1");
    }

    #[test]
    fn test_malformed_kwarg_is_rejected() {
        assert!(build_settings(&args(&["-kg", "no_equals", "in.rtdc"]), &AppConfig::default()).is_err());
        assert!(build_settings(&args(&["-p", "NaN", "in.rtdc"]), &AppConfig::default()).is_err());
    }

    #[test]
    fn test_debug_forces_single_process() {
        assert_eq!(resolve_num_procs(Some(8), true), 1);
        assert_eq!(resolve_num_procs(Some(0), false), 1);
        assert!(resolve_num_procs(Some(usize::MAX), false) <= cpu_count());
    }

    #[test]
    fn test_validate_paths() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("m.rtdc");
        std::fs::write(&file, b"").unwrap();
        let dir = temp.path().to_str().unwrap();
        let file = file.to_str().unwrap();

        assert!(validate_paths(&args(&[file])).is_ok());
        assert!(validate_paths(&args(&[dir])).is_err());
        assert!(validate_paths(&args(&[file, dir])).is_err());
        assert!(validate_paths(&args(&["-r", dir])).is_ok());
        assert!(validate_paths(&args(&["-r", file])).is_err());
    }

    #[test]
    fn test_output_dir_to_remember() {
        assert_eq!(output_dir_to_remember(&args(&["in.rtdc"])), None);
        assert_eq!(
            output_dir_to_remember(&args(&["-r", "/data/in", "/data/out"])),
            Some(PathBuf::from("/data/out"))
        );
        assert_eq!(
            output_dir_to_remember(&args(&["/data/in.rtdc", "/data/out/x.rtdc"])),
            Some(PathBuf::from("/data/out"))
        );
    }

    #[test]
    fn test_build_engine_prefers_command_line() {
        let config = AppConfig {
            engine: PathBuf::from("/opt/from-config"),
            ..AppConfig::default()
        };
        let engine = build_engine(&args(&["--engine", "/opt/from-cli", "in.rtdc"]), &config);
        assert_eq!(engine.program(), Path::new("/opt/from-cli"));
        let engine = build_engine(&args(&["in.rtdc"]), &config);
        assert_eq!(engine.program(), Path::new("/opt/from-config"));
    }
}
