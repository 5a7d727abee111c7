mod cli;
mod config;
mod error;
mod output;
mod process;

use std::process::ExitCode;
use std::sync::Arc;

use chipstream::{ManagerConfig, RecentDirs};
use tracing::{Level, debug, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{
    cli::Args,
    config::AppConfig,
    error::Result,
    output::OutputManager,
    process::{Processor, build_engine, build_settings, output_dir_to_remember, validate_paths},
};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse_env();
    let output = OutputManager::new(true);
    match run(args).await {
        Ok(false) => ExitCode::SUCCESS,
        Ok(true) => {
            output.failure("Encountered problems during processing");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Application error: {}", e);
            output.failure(&format!("Error: {}", e.trace()));
            ExitCode::FAILURE
        }
    }
}

/// Returns whether any file failed.
async fn run(args: Args) -> Result<bool> {
    let output = OutputManager::new(true);
    if args.debug {
        output.notice("Running in debug mode (this will be slow)");
    }
    init_logging(args.is_verbose())?;

    let config = AppConfig::load(args.config.as_deref())?;
    debug!(?config, "Loaded configuration");
    validate_paths(&args)?;

    let settings = build_settings(&args, &config)?;
    let engine = build_engine(&args, &config);
    let manager_config =
        ManagerConfig::default().with_cleanup_on_success(!config.keep_intermediates);
    let processor = Processor::new(Arc::new(engine), settings, manager_config, output);

    let failed = if args.recursive {
        processor
            .process_directory(&args.path_in, args.path_out.as_deref(), args.dry_run)
            .await?
            > 0
    } else {
        processor
            .process_dataset(&args.path_in, args.path_out.as_deref(), args.dry_run)
            .await?
    };

    if !args.dry_run
        && let (Some(dir), Some(file)) = (output_dir_to_remember(&args), AppConfig::recent_dirs_path())
    {
        RecentDirs::load(file, config.recent_capacity).remember(dir);
    }

    Ok(failed)
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::WARN.into())
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    subscriber
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(verbose),
        )
        .init();
    Ok(())
}
