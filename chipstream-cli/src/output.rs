use std::time::Duration;

use chipstream::{EntryStatus, PipelineId, PipelineSettings, RunnerStatus};
#[cfg(feature = "colored-output")]
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::Result;

/// How often runner status is polled while a job is running.
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);

const BAR_TEMPLATE: &str = "{msg:<28} [{bar:32.cyan/blue}] {percent:>3}%";

pub struct OutputManager {
    colored: bool,
}

impl OutputManager {
    pub fn new(colored: bool) -> Self {
        Self { colored }
    }

    pub fn notice(&self, text: &str) {
        println!("{}", self.colorize(text, &Color::Yellow, false));
    }

    pub fn success(&self, text: &str) {
        println!("{}", self.colorize(text, &Color::Green, false));
    }

    pub fn failure(&self, text: &str) {
        eprintln!("{}", self.colorize(text, &Color::Red, false));
    }

    pub fn heading(&self, text: &str) {
        println!("\n{}", self.colorize(text, &Color::Cyan, true));
    }

    /// Print the sub-identifiers and the pipeline identifier of `settings`.
    pub fn print_pipeline_ids(&self, settings: &PipelineSettings) -> Result<PipelineId> {
        let id = settings.pipeline_id()?;
        for (label, value) in [
            ("Data ID", &id.data),
            ("Background ID", &id.background),
            ("Segmenter ID", &id.segmenter),
            ("Feature ID", &id.feature),
            ("Gate ID", &id.gate),
        ] {
            println!("{}:\t{value}", self.colorize(label, &Color::Yellow, false));
        }
        println!(
            "{}:\t{}",
            self.colorize("Pipeline ID", &Color::Yellow, true),
            self.colorize(&id.to_string(), &Color::Cyan, false)
        );
        Ok(id)
    }

    pub fn progress_bar(&self) -> ProgressBar {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar
    }

    /// Update a job bar from a runner status.
    pub fn show_runner(&self, bar: &ProgressBar, status: &RunnerStatus) {
        bar.set_position(percent(status.progress));
        bar.set_message(format!("Processing ({})", status.state));
    }

    /// Update the batch bar from the status of the current entry.
    pub fn show_entry(&self, bar: &ProgressBar, index: usize, total: usize, status: &EntryStatus) {
        bar.set_position(percent(status.progress));
        bar.set_message(format!("File {}/{} ({})", index + 1, total, status.state));
    }

    /// Print the diagnostic trace of a failed job.
    pub fn error_trace(&self, detail: &str) {
        for line in detail.lines() {
            eprintln!("{}", self.colorize(line, &Color::Red, false));
        }
    }

    fn colorize(&self, text: &str, color: &Color, bold: bool) -> String {
        #[cfg(feature = "colored-output")]
        {
            if self.colored {
                let colored_text = match color {
                    Color::Green => text.green(),
                    Color::Yellow => text.yellow(),
                    Color::Red => text.red(),
                    Color::Cyan => text.cyan(),
                };
                if bold {
                    colored_text.bold().to_string()
                } else {
                    colored_text.to_string()
                }
            } else {
                text.to_string()
            }
        }

        #[cfg(not(feature = "colored-output"))]
        {
            let _ = (color, bold, self.colored);
            text.to_string()
        }
    }
}

fn percent(progress: f64) -> u64 {
    (progress.clamp(0.0, 1.0) * 100.0).round() as u64
}

#[cfg_attr(not(feature = "colored-output"), allow(dead_code))]
enum Color {
    Green,
    Yellow,
    Red,
    Cyan,
}
