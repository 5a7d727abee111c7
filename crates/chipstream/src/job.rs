//! Job configuration handed to the pipeline engine.
//!
//! [`PipelineSettings`] holds everything that is shared by all files of a
//! batch (component codes and keyword arguments, worker count). A
//! [`JobConfig`] is the per-file instance of those settings, with the input
//! and output paths filled in.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ppid::{self, PipelineId};
use crate::{Error, Result};

/// Keyword arguments of one pipeline component, keyed by argument name.
pub type Kwargs = BTreeMap<String, KwargValue>;

/// A single keyword argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KwargValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl KwargValue {
    /// Parse a textual value, preferring the most specific type.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>()
            && f.is_finite()
        {
            return Self::Float(f);
        }
        Self::Str(trimmed.to_string())
    }
}

impl fmt::Display for KwargValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => write!(f, "1"),
            Self::Bool(false) => write!(f, "0"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for KwargValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for KwargValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for KwargValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for KwargValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// Parse a single `KEY=VALUE` argument.
pub fn parse_kwarg(arg: &str) -> Result<(String, KwargValue)> {
    let Some((key, value)) = arg.split_once('=') else {
        return Err(Error::config(format!(
            "expected KEY=VALUE, got '{arg}'"
        )));
    };
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::config(format!("invalid keyword argument name '{key}'")));
    }
    if value.trim().is_empty() {
        return Err(Error::config(format!("missing value for keyword argument '{key}'")));
    }
    Ok((key.to_string(), KwargValue::parse(value)))
}

/// Parse a list of `KEY=VALUE` arguments. Later duplicates win.
pub fn parse_kwargs<S: AsRef<str>>(args: &[S]) -> Result<Kwargs> {
    args.iter()
        .map(|a| parse_kwarg(a.as_ref()))
        .collect::<Result<Kwargs>>()
}

/// Segmenter keyword arguments that configure mask post-processing rather
/// than the segmentation itself.
pub const MASK_KWARG_KEYS: [&str; 3] = ["clear_border", "closing_disk", "fill_holes"];

/// Split segmenter keyword arguments into `(segmenter, mask)` groups.
pub fn split_mask_kwargs(kwargs: Kwargs) -> (Kwargs, Kwargs) {
    kwargs
        .into_iter()
        .partition(|(key, _)| !MASK_KWARG_KEYS.contains(&key.as_str()))
}

fn encode_groups(code: &str, kwargs: &Kwargs, mask_kwargs: &Kwargs) -> String {
    if mask_kwargs.is_empty() {
        ppid::encode_component(code, &[kwargs])
    } else {
        ppid::encode_component(code, &[kwargs, mask_kwargs])
    }
}

/// Code plus keyword arguments of one pipeline component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub code: String,
    #[serde(default)]
    pub kwargs: Kwargs,
    /// Second argument group; only mask-based segmenters use it.
    #[serde(default, skip_serializing_if = "Kwargs::is_empty")]
    pub mask_kwargs: Kwargs,
}

impl ComponentConfig {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            kwargs: Kwargs::new(),
            mask_kwargs: Kwargs::new(),
        }
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<KwargValue>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Merge user supplied keyword arguments over the current ones.
    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs.extend(kwargs);
        self
    }

    pub fn with_mask_kwarg(mut self, key: impl Into<String>, value: impl Into<KwargValue>) -> Self {
        self.mask_kwargs.insert(key.into(), value.into());
        self
    }

    pub fn with_mask_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.mask_kwargs.extend(kwargs);
        self
    }

    /// Canonical sub-identifier of this component.
    pub fn ppid(&self) -> String {
        encode_groups(&self.code, &self.kwargs, &self.mask_kwargs)
    }
}

/// Pipeline parameters shared by every job of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub data: ComponentConfig,
    pub background: ComponentConfig,
    pub segmenter: ComponentConfig,
    pub feature: ComponentConfig,
    pub gate: ComponentConfig,
    /// Worker processes the engine may use for one job.
    pub num_procs: usize,
    pub debug: bool,
    pub no_basins_in_output: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            data: ComponentConfig::new("hdf"),
            background: ComponentConfig::new("sparsemed")
                .with_kwarg("kernel_size", 200i64)
                .with_kwarg("split_time", 1i64)
                .with_kwarg("thresh_cleansing", 0i64)
                .with_kwarg("frac_cleansing", 0.8),
            segmenter: ComponentConfig::new("thresh")
                .with_kwarg("thresh", -6i64)
                .with_mask_kwarg("clear_border", true)
                .with_mask_kwarg("closing_disk", 2i64)
                .with_mask_kwarg("fill_holes", true),
            feature: ComponentConfig::new("legacy")
                .with_kwarg("brightness", true)
                .with_kwarg("haralick", true),
            gate: ComponentConfig::new("norm")
                .with_kwarg("online_gates", false)
                .with_kwarg("size_thresh_mask", 10i64),
            num_procs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            debug: false,
            no_basins_in_output: true,
        }
    }
}

impl PipelineSettings {
    /// Set the pixel size of the data reader; `0` leaves it to the data file.
    pub fn with_pixel_size(mut self, pixel_size: f64) -> Self {
        if pixel_size > 0.0 {
            self.data.kwargs.insert("pixel_size".into(), KwargValue::Float(pixel_size));
        } else {
            self.data.kwargs.remove("pixel_size");
        }
        self
    }

    pub fn with_num_procs(mut self, num_procs: usize) -> Self {
        self.num_procs = num_procs.max(1);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Pipeline identifier of these settings. Worker count and debug mode do
    /// not take part in it.
    pub fn pipeline_id(&self) -> Result<PipelineId> {
        PipelineId::new(
            ppid::PPID_GENERATION,
            self.data.ppid(),
            self.background.ppid(),
            self.segmenter.ppid(),
            self.feature.ppid(),
            self.gate.ppid(),
        )
    }

    /// Instantiate the settings for one input/output pair.
    pub fn job_for(&self, path_in: &Path, path_out: &Path) -> JobConfig {
        JobConfig {
            path_in: path_in.to_path_buf(),
            path_out: path_out.to_path_buf(),
            data_code: self.data.code.clone(),
            data_kwargs: self.data.kwargs.clone(),
            background_code: self.background.code.clone(),
            background_kwargs: self.background.kwargs.clone(),
            segmenter_code: self.segmenter.code.clone(),
            segmenter_kwargs: self.segmenter.kwargs.clone(),
            segmenter_mask_kwargs: self.segmenter.mask_kwargs.clone(),
            feature_code: self.feature.code.clone(),
            feature_kwargs: self.feature.kwargs.clone(),
            gate_code: self.gate.code.clone(),
            gate_kwargs: self.gate.kwargs.clone(),
            num_procs: self.num_procs,
            debug: self.debug,
            no_basins_in_output: self.no_basins_in_output,
        }
    }
}

/// Configuration of one pipeline job, passed opaquely to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub path_in: PathBuf,
    pub path_out: PathBuf,
    pub data_code: String,
    pub data_kwargs: Kwargs,
    pub background_code: String,
    pub background_kwargs: Kwargs,
    pub segmenter_code: String,
    pub segmenter_kwargs: Kwargs,
    #[serde(default)]
    pub segmenter_mask_kwargs: Kwargs,
    pub feature_code: String,
    pub feature_kwargs: Kwargs,
    pub gate_code: String,
    pub gate_kwargs: Kwargs,
    pub num_procs: usize,
    pub debug: bool,
    pub no_basins_in_output: bool,
}

impl JobConfig {
    /// Directory for intermediate artifacts of this job, next to the output.
    pub fn intermediate_dir(&self) -> PathBuf {
        let name = self
            .path_out
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".to_string());
        let dir = format!(".{name}.cs-tmp");
        match self.path_out.parent() {
            Some(parent) => parent.join(dir),
            None => PathBuf::from(dir),
        }
    }

    pub fn pipeline_id(&self) -> Result<PipelineId> {
        PipelineId::new(
            ppid::PPID_GENERATION,
            ppid::encode_component(&self.data_code, &[&self.data_kwargs]),
            ppid::encode_component(&self.background_code, &[&self.background_kwargs]),
            encode_groups(
                &self.segmenter_code,
                &self.segmenter_kwargs,
                &self.segmenter_mask_kwargs,
            ),
            ppid::encode_component(&self.feature_code, &[&self.feature_kwargs]),
            ppid::encode_component(&self.gate_code, &[&self.gate_kwargs]),
        )
    }

    /// Reject configurations the engine could never run.
    pub fn validate(&self) -> Result<()> {
        if self.path_in == self.path_out {
            return Err(Error::config(format!(
                "output path equals input path: {}",
                self.path_in.display()
            )));
        }
        if self.num_procs == 0 {
            return Err(Error::config("num_procs must be at least 1"));
        }
        for (name, code) in [
            ("data", &self.data_code),
            ("background", &self.background_code),
            ("segmenter", &self.segmenter_code),
            ("feature", &self.feature_code),
            ("gate", &self.gate_code),
        ] {
            if code.trim().is_empty() {
                return Err(Error::config(format!("missing {name} code")));
            }
        }
        Ok(())
    }
}
