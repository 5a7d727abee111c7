//! Pipeline identifiers.
//!
//! A pipeline identifier encodes every parameter that influences the result
//! of processing a file, so two outputs can be compared across runs and
//! machines. It is made of one sub-identifier per component, prefixed by the
//! generation tag:
//!
//! ```text
//! 7|hdf:p=0.2645|sparsemed:f=0.8^k=200^s=1^t=0|thresh:t=-6:cle=1^clo=2^f=1|legacy:b=1^h=1|norm:o=0^s=10
//! ```
//!
//! Component sub-identifiers are `code:k=v^k=v`, with one `:` group per
//! argument group. Keys are sorted and
//! abbreviated to their shortest unique prefix, so the encoding does not
//! depend on the order in which arguments were given.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::job::Kwargs;
use crate::{Error, Result};

/// Current generation of the identifier format.
pub const PPID_GENERATION: &str = "7";

/// Separator between the sub-identifiers of a pipeline identifier.
pub const PPID_SEPARATOR: char = '|';

const GROUP_SEPARATOR: char = ':';
const PAIR_SEPARATOR: char = '^';

/// Shortest prefix of `key` that no other key in `keys` starts with.
///
/// Falls back to the full key when it is itself a prefix of another key.
fn abbreviate<'a>(key: &'a str, keys: &[&str]) -> &'a str {
    let boundaries = key
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .collect::<Vec<_>>();
    for end in boundaries {
        let prefix = &key[..end];
        if keys.iter().all(|other| *other == key || !other.starts_with(prefix)) {
            return prefix;
        }
    }
    key
}

/// Encode one keyword argument group as `k=v^k=v`.
pub fn encode_kwargs(kwargs: &Kwargs) -> String {
    let keys = kwargs.keys().map(String::as_str).collect::<Vec<_>>();
    kwargs
        .iter()
        .map(|(key, value)| format!("{}={}", abbreviate(key, &keys), value))
        .collect::<Vec<_>>()
        .join(&PAIR_SEPARATOR.to_string())
}

/// Encode a component code plus its keyword argument groups.
pub fn encode_component(code: &str, groups: &[&Kwargs]) -> String {
    if groups.iter().all(|g| g.is_empty()) {
        return code.to_string();
    }
    let mut out = code.to_string();
    for group in groups {
        out.push(GROUP_SEPARATOR);
        out.push_str(&encode_kwargs(group));
    }
    out
}

fn check_part(name: &'static str, part: &str) -> Result<()> {
    if part.trim().is_empty() {
        return Err(Error::InvalidPipelineId(format!("{name} identifier is empty")));
    }
    if part.contains(PPID_SEPARATOR) {
        return Err(Error::InvalidPipelineId(format!(
            "{name} identifier '{part}' contains '{PPID_SEPARATOR}'"
        )));
    }
    Ok(())
}

/// Join the generation tag and the component sub-identifiers.
pub fn compute_pipeline_id(
    generation_id: &str,
    data_id: &str,
    background_id: &str,
    segmenter_id: &str,
    feature_id: &str,
    gate_id: &str,
) -> Result<String> {
    PipelineId::new(
        generation_id,
        data_id,
        background_id,
        segmenter_id,
        feature_id,
        gate_id,
    )
    .map(|id| id.to_string())
}

/// A pipeline identifier split into its parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineId {
    pub generation: String,
    pub data: String,
    pub background: String,
    pub segmenter: String,
    pub feature: String,
    pub gate: String,
}

impl PipelineId {
    pub fn new(
        generation: impl Into<String>,
        data: impl Into<String>,
        background: impl Into<String>,
        segmenter: impl Into<String>,
        feature: impl Into<String>,
        gate: impl Into<String>,
    ) -> Result<Self> {
        let id = Self {
            generation: generation.into(),
            data: data.into(),
            background: background.into(),
            segmenter: segmenter.into(),
            feature: feature.into(),
            gate: gate.into(),
        };
        check_part("generation", &id.generation)?;
        check_part("data", &id.data)?;
        check_part("background", &id.background)?;
        check_part("segmenter", &id.segmenter)?;
        check_part("feature", &id.feature)?;
        check_part("gate", &id.gate)?;
        Ok(id)
    }

    /// Parse a pipeline identifier string.
    pub fn parse(s: &str) -> Result<Self> {
        let parts = s.split(PPID_SEPARATOR).collect::<Vec<_>>();
        let [generation, data, background, segmenter, feature, gate] = parts[..] else {
            return Err(Error::InvalidPipelineId(format!(
                "expected 6 parts, got {} in '{s}'",
                parts.len()
            )));
        };
        Self::new(generation, data, background, segmenter, feature, gate)
    }

    /// Names of the components that differ between two identifiers.
    pub fn diff(&self, other: &Self) -> Vec<&'static str> {
        [
            ("generation", &self.generation, &other.generation),
            ("data", &self.data, &other.data),
            ("background", &self.background, &other.background),
            ("segmenter", &self.segmenter, &other.segmenter),
            ("feature", &self.feature, &other.feature),
            ("gate", &self.gate, &other.gate),
        ]
        .into_iter()
        .filter(|(_, a, b)| a != b)
        .map(|(name, _, _)| name)
        .collect()
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = PPID_SEPARATOR;
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}",
            self.generation, self.data, self.background, self.segmenter, self.feature, self.gate
        )
    }
}

impl FromStr for PipelineId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::KwargValue;

    fn kwargs(pairs: &[(&str, KwargValue)]) -> Kwargs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_abbreviate_shortest_unique_prefix() {
        let keys = ["clear_border", "closing_disk", "fill_holes"];
        assert_eq!(abbreviate("clear_border", &keys), "cle");
        assert_eq!(abbreviate("closing_disk", &keys), "clo");
        assert_eq!(abbreviate("fill_holes", &keys), "f");
    }

    #[test]
    fn test_abbreviate_key_that_prefixes_another() {
        let keys = ["thresh", "thresh_mask"];
        assert_eq!(abbreviate("thresh", &keys), "thresh");
        assert_eq!(abbreviate("thresh_mask", &keys), "thresh_");
    }

    #[test]
    fn test_encode_is_order_independent() {
        let mut a = Kwargs::new();
        a.insert("kernel_size".into(), KwargValue::Int(200));
        a.insert("frac_cleansing".into(), KwargValue::Float(0.8));
        let mut b = Kwargs::new();
        b.insert("frac_cleansing".into(), KwargValue::Float(0.8));
        b.insert("kernel_size".into(), KwargValue::Int(200));
        assert_eq!(encode_kwargs(&a), encode_kwargs(&b));
        assert_eq!(encode_kwargs(&a), "f=0.8^k=200");
    }

    #[test]
    fn test_encode_component_groups() {
        let seg = kwargs(&[("thresh", KwargValue::Int(-6))]);
        let mask = kwargs(&[
            ("clear_border", KwargValue::Bool(true)),
            ("fill_holes", KwargValue::Bool(true)),
            ("closing_disk", KwargValue::Int(2)),
        ]);
        assert_eq!(
            encode_component("thresh", &[&seg, &mask]),
            "thresh:t=-6:cle=1^clo=2^f=1"
        );
        assert_eq!(encode_component("sparsemed", &[&Kwargs::new()]), "sparsemed");
    }

    #[test]
    fn test_compute_pipeline_id() {
        let id = compute_pipeline_id(
            PPID_GENERATION,
            "hdf:p=0.2645",
            "sparsemed:f=0.8^k=200",
            "thresh:t=-6",
            "legacy:b=1^h=1",
            "norm:o=0^s=10",
        )
        .unwrap();
        assert_eq!(
            id,
            "7|hdf:p=0.2645|sparsemed:f=0.8^k=200|thresh:t=-6|legacy:b=1^h=1|norm:o=0^s=10"
        );
        assert_eq!(PipelineId::parse(&id).unwrap().to_string(), id);
    }

    #[test]
    fn test_malformed_sub_identifier_rejected() {
        assert!(compute_pipeline_id("7", "", "bg", "seg", "feat", "gate").is_err());
        assert!(compute_pipeline_id("7", "a|b", "bg", "seg", "feat", "gate").is_err());
        assert!(PipelineId::parse("7|only|four|parts").is_err());
    }

    #[test]
    fn test_diff_names_changed_components() {
        let a: PipelineId = "7|hdf|sparsemed|thresh:t=-6|legacy|norm".parse().unwrap();
        let b: PipelineId = "7|hdf|rollmed|thresh:t=-4|legacy|norm".parse().unwrap();
        assert_eq!(a.diff(&b), vec!["background", "segmenter"]);
        assert!(a.diff(&a).is_empty());
    }
}
