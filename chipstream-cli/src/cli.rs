use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// Two-letter keyword flags accepted with a single dash (`-ks thresh=-4`).
const KWARG_FLAGS: [&str; 4] = ["ks", "kf", "kg", "kb"];

#[derive(Parser, Debug)]
#[command(
    name = "chipstream-cli",
    author,
    version,
    about = "Segmentation and feature extraction for deformability cytometry data",
    long_about = "Segmentation and feature extraction for deformability cytometry data.\n\n\
Read the image data from an input file, perform segmentation, feature \
extraction and gating. If PATH_OUT is not given, the data are written to a new \
file with the suffix \"_dcn.rtdc\". In recursive mode (-r) PATH_OUT is a target \
directory that mirrors the layout of the input directory.\n\n\
Additional keyword arguments can be passed to the segmenter (-ks), feature \
extractor (-kf), gate (-kg) and background computation (-kb).\n\n\
Examples:\n  \
chipstream-cli -kf haralick=false M001_data.rtdc\n  \
chipstream-cli --recursive directory_name"
)]
pub struct Args {
    /// Input measurement file, or a directory with --recursive
    pub path_in: PathBuf,

    /// Output file, or output directory with --recursive
    pub path_out: Option<PathBuf>,

    /// Segmentation method to use
    #[arg(short = 's', long, default_value = "thresh")]
    pub segmentation_method: String,

    /// Optional KEY=VALUE argument for the segmenter
    #[arg(long = "ks", value_name = "KEY=VALUE", action = ArgAction::Append)]
    pub segmentation_kwargs: Vec<String>,

    /// Optional KEY=VALUE argument for the feature extractor
    #[arg(long = "kf", value_name = "KEY=VALUE", action = ArgAction::Append)]
    pub feature_kwargs: Vec<String>,

    /// Optional KEY=VALUE argument for event gating
    #[arg(long = "kg", value_name = "KEY=VALUE", action = ArgAction::Append)]
    pub gate_kwargs: Vec<String>,

    /// Background computation method
    #[arg(short = 'b', long, default_value = "sparsemed")]
    pub background_method: String,

    /// Optional KEY=VALUE argument for the background computation
    #[arg(long = "kb", value_name = "KEY=VALUE", action = ArgAction::Append)]
    pub background_kwargs: Vec<String>,

    /// Set or override the pixel size for feature extraction [µm]
    #[arg(short = 'p', long, default_value_t = 0.0)]
    pub pixel_size: f64,

    /// Recurse into subdirectories
    #[arg(short = 'r', long)]
    pub recursive: bool,

    /// Number of processes to create (clamped to the available CPUs)
    #[arg(long)]
    pub num_cpus: Option<usize>,

    /// Only print the pipeline identifiers and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Yield a more verbose output
    #[arg(long)]
    pub verbose: bool,

    /// Run in debugging mode (single process, verbose output)
    #[arg(long)]
    pub debug: bool,

    /// Pipeline executable to run
    #[arg(long, value_name = "PROGRAM")]
    pub engine: Option<PathBuf>,

    /// Configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl Args {
    /// Parse the process arguments, accepting the single-dash keyword flags.
    pub fn parse_env() -> Self {
        Self::parse_from(normalize_kwarg_flags(std::env::args_os()))
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose || self.debug
    }
}

/// Rewrite `-ks`-style flags into the `--ks` form clap understands.
pub fn normalize_kwarg_flags<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut passthrough = false;
    args.into_iter()
        .map(|arg| {
            if passthrough {
                return arg;
            }
            let Some(text) = arg.to_str() else {
                return arg;
            };
            if text == "--" {
                passthrough = true;
                return arg;
            }
            let Some(flag) = text.strip_prefix('-').filter(|t| !t.starts_with('-')) else {
                return arg;
            };
            let name = flag.split_once('=').map_or(flag, |(name, _)| name);
            if KWARG_FLAGS.contains(&name) {
                OsString::from(format!("-{text}"))
            } else {
                arg
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let args = std::iter::once("chipstream-cli")
            .chain(args.iter().copied())
            .map(OsString::from);
        Args::try_parse_from(normalize_kwarg_flags(args)).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["M001_data.rtdc"]);
        assert_eq!(args.path_in, PathBuf::from("M001_data.rtdc"));
        assert!(args.path_out.is_none());
        assert_eq!(args.segmentation_method, "thresh");
        assert_eq!(args.background_method, "sparsemed");
        assert_eq!(args.pixel_size, 0.0);
        assert!(!args.recursive);
        assert!(!args.is_verbose());
    }

    #[test]
    fn test_single_dash_kwarg_flags() {
        let args = parse(&[
            "-ks", "thresh=-4", "-kf", "haralick=false", "-kf=brightness=true", "-kg",
            "size_thresh_mask=5", "-kb", "kernel_size=150", "in.rtdc", "out.rtdc",
        ]);
        assert_eq!(args.segmentation_kwargs, vec!["thresh=-4"]);
        assert_eq!(args.feature_kwargs, vec!["haralick=false", "brightness=true"]);
        assert_eq!(args.gate_kwargs, vec!["size_thresh_mask=5"]);
        assert_eq!(args.background_kwargs, vec!["kernel_size=150"]);
        assert_eq!(args.path_out, Some(PathBuf::from("out.rtdc")));
    }

    #[test]
    fn test_debug_implies_verbose() {
        let args = parse(&["--debug", "-r", "--num-cpus", "3", "dir"]);
        assert!(args.is_verbose());
        assert!(args.recursive);
        assert_eq!(args.num_cpus, Some(3));
    }

    #[test]
    fn test_normalize_leaves_other_args_alone() {
        let args = ["prog", "-s", "-ksx", "--", "-ks"].map(OsString::from);
        let out = normalize_kwarg_flags(args);
        assert_eq!(out, ["prog", "-s", "-ksx", "--", "-ks"].map(OsString::from));
    }
}
