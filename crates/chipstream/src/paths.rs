//! Output path resolution.
//!
//! Without an output root every output lands next to its input. With a root,
//! the directory layout below the deepest common parent of all inputs is
//! mirrored under the root; the common parent itself is not reproduced.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::utils::fs;
use crate::{Error, Result};

/// Suffix appended to the file stem of every output.
pub const OUTPUT_SUFFIX: &str = "_dcn";

/// Extension of input and output measurement files.
pub const MEASUREMENT_EXTENSION: &str = "rtdc";

/// File name of the output for `input`: `stem_dcn.rtdc`.
pub fn output_file_name(input: &Path) -> Result<OsString> {
    let stem = input.file_stem().ok_or_else(|| {
        Error::config(format!("input path has no file name: {}", input.display()))
    })?;
    let mut name = stem.to_os_string();
    name.push(OUTPUT_SUFFIX);
    name.push(".");
    name.push(MEASUREMENT_EXTENSION);
    Ok(name)
}

/// Whether `path` looks like a file produced by this tool.
pub fn is_output_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(&format!("{OUTPUT_SUFFIX}.{MEASUREMENT_EXTENSION}")))
}

/// Deepest directory that contains all of `dirs`.
///
/// Returns `None` for an empty slice or when the directories share no
/// component at all (e.g. different drive prefixes).
pub fn common_parent<P: AsRef<Path>>(dirs: &[P]) -> Option<PathBuf> {
    let (first, rest) = dirs.split_first()?;
    let mut common = first.as_ref().components().collect::<Vec<Component<'_>>>();
    for dir in rest {
        let shared = common
            .iter()
            .zip(dir.as_ref().components())
            .take_while(|(a, b)| **a == *b)
            .count();
        common.truncate(shared);
    }
    if common.is_empty() {
        return None;
    }
    Some(common.iter().collect())
}

fn parent_of(input: &Path) -> PathBuf {
    input
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// Compute one output path per input without touching the filesystem.
pub fn map_outputs<P: AsRef<Path>>(inputs: &[P], output_root: Option<&Path>) -> Result<Vec<PathBuf>> {
    let outputs = match output_root {
        None => inputs
            .iter()
            .map(|input| {
                let input = input.as_ref();
                Ok(parent_of(input).join(output_file_name(input)?))
            })
            .collect::<Result<Vec<_>>>()?,
        Some(root) => {
            let parents = inputs
                .iter()
                .map(|p| parent_of(p.as_ref()))
                .collect::<Vec<_>>();
            let Some(common) = common_parent(&parents) else {
                if inputs.is_empty() {
                    return Ok(Vec::new());
                }
                return Err(Error::config(
                    "input paths do not share a common parent directory",
                ));
            };
            debug!(common = %common.display(), root = %root.display(), "Mirroring input layout");

            inputs
                .iter()
                .zip(&parents)
                .map(|(input, parent)| {
                    let relative = parent.strip_prefix(&common).map_err(|_| {
                        Error::config(format!(
                            "{} is not below {}",
                            parent.display(),
                            common.display()
                        ))
                    })?;
                    Ok(root.join(relative).join(output_file_name(input.as_ref())?))
                })
                .collect::<Result<Vec<_>>>()?
        }
    };

    check_collisions(inputs, &outputs)?;
    Ok(outputs)
}

fn check_collisions<P: AsRef<Path>>(inputs: &[P], outputs: &[PathBuf]) -> Result<()> {
    let mut seen: HashMap<&Path, usize> = HashMap::with_capacity(outputs.len());
    for (i, output) in outputs.iter().enumerate() {
        if let Some(&j) = seen.get(output.as_path()) {
            return Err(Error::OutputCollision {
                first: inputs[j].as_ref().to_path_buf(),
                second: inputs[i].as_ref().to_path_buf(),
                output: output.clone(),
            });
        }
        seen.insert(output.as_path(), i);
    }
    for (i, input) in inputs.iter().enumerate() {
        if let Some(&j) = seen.get(input.as_ref()) {
            return Err(Error::config(format!(
                "output of {} would overwrite input {}",
                inputs[j].as_ref().display(),
                inputs[i].as_ref().display()
            )));
        }
    }
    Ok(())
}

/// Compute the output paths and create their parent directories.
///
/// Safe to call repeatedly; existing directories are left alone.
pub fn resolve_outputs<P: AsRef<Path>>(
    inputs: &[P],
    output_root: Option<&Path>,
) -> Result<Vec<PathBuf>> {
    let outputs = map_outputs(inputs, output_root)?;
    for output in &outputs {
        fs::ensure_parent_dir(output)?;
    }
    Ok(outputs)
}

/// Recursively collect measurement files below `dir`, sorted, skipping
/// previously produced outputs.
pub fn discover_inputs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| walk_error(dir, e))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let path = entry.into_path();
        if path.extension().is_some_and(|ext| ext == MEASUREMENT_EXTENSION) && !is_output_file(&path)
        {
            found.push(path);
        }
    }
    found.sort();
    debug!(dir = %dir.display(), count = found.len(), "Discovered measurement files");
    Ok(found)
}

fn walk_error(dir: &Path, err: walkdir::Error) -> Error {
    let path = err.path().unwrap_or(dir).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
    Error::io_path("reading directory", &path, source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_file_name_normalizes_extension() {
        assert_eq!(output_file_name(Path::new("/a/one.rtdc")).unwrap(), "one_dcn.rtdc");
        assert_eq!(output_file_name(Path::new("/a/one.RTDC")).unwrap(), "one_dcn.rtdc");
        assert_eq!(output_file_name(Path::new("/a/one")).unwrap(), "one_dcn.rtdc");
        assert!(output_file_name(Path::new("/")).is_err());
    }

    #[test]
    fn test_common_parent() {
        let dirs = [
            PathBuf::from("/tmp/foo/bar"),
            PathBuf::from("/tmp/foo/baz"),
            PathBuf::from("/tmp/foo/baz/deeper"),
        ];
        assert_eq!(common_parent(&dirs), Some(PathBuf::from("/tmp/foo")));
        assert_eq!(
            common_parent(&[PathBuf::from("/tmp/foo")]),
            Some(PathBuf::from("/tmp/foo"))
        );
        assert_eq!(common_parent::<PathBuf>(&[]), None);
    }

    #[test]
    fn test_common_parent_does_not_split_names() {
        let dirs = [PathBuf::from("/data/run1"), PathBuf::from("/data/run10")];
        assert_eq!(common_parent(&dirs), Some(PathBuf::from("/data")));
    }

    #[test]
    fn test_map_outputs_without_root() {
        let inputs = [PathBuf::from("/m/one.rtdc")];
        let outputs = map_outputs(&inputs, None).unwrap();
        assert_eq!(outputs, vec![PathBuf::from("/m/one_dcn.rtdc")]);
    }

    #[test]
    fn test_map_outputs_with_root_drops_common_parent() {
        let inputs = [
            PathBuf::from("/tmp/foo/bar/data.rtdc"),
            PathBuf::from("/tmp/foo/baz/data.rtdc"),
        ];
        let outputs = map_outputs(&inputs, Some(Path::new("/far"))).unwrap();
        assert_eq!(
            outputs,
            vec![
                PathBuf::from("/far/bar/data_dcn.rtdc"),
                PathBuf::from("/far/baz/data_dcn.rtdc"),
            ]
        );
    }

    #[test]
    fn test_map_outputs_single_input_with_root() {
        let inputs = [PathBuf::from("/tmp/foo/bar/data.rtdc")];
        let outputs = map_outputs(&inputs, Some(Path::new("/far"))).unwrap();
        assert_eq!(outputs, vec![PathBuf::from("/far/data_dcn.rtdc")]);
    }

    #[test]
    fn test_map_outputs_preserves_order_and_length() {
        let inputs = [
            PathBuf::from("/r/z/c.rtdc"),
            PathBuf::from("/r/a.rtdc"),
            PathBuf::from("/r/m/n/b.rtdc"),
        ];
        let outputs = map_outputs(&inputs, Some(Path::new("/o"))).unwrap();
        assert_eq!(outputs.len(), inputs.len());
        assert_eq!(
            outputs,
            vec![
                PathBuf::from("/o/z/c_dcn.rtdc"),
                PathBuf::from("/o/a_dcn.rtdc"),
                PathBuf::from("/o/m/n/b_dcn.rtdc"),
            ]
        );
    }

    #[test]
    fn test_map_outputs_reports_collision() {
        let inputs = [PathBuf::from("/r/a/x.rtdc"), PathBuf::from("/r/a/x.RTDC")];
        let err = map_outputs(&inputs, None).unwrap_err();
        assert!(matches!(err, Error::OutputCollision { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_map_outputs_refuses_to_overwrite_input() {
        let inputs = [PathBuf::from("/r/x.rtdc"), PathBuf::from("/r/x_dcn.rtdc")];
        let err = map_outputs(&inputs, None).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_resolve_outputs_creates_dirs_and_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let inputs = [
            temp.path().join("foo/bar/data.rtdc"),
            temp.path().join("foo/baz/data.rtdc"),
        ];
        let root = temp.path().join("far");

        let first = resolve_outputs(&inputs, Some(&root)).unwrap();
        let second = resolve_outputs(&inputs, Some(&root)).unwrap();

        assert_eq!(first, second);
        assert!(root.join("bar").is_dir());
        assert!(root.join("baz").is_dir());
    }

    #[test]
    fn test_discover_inputs_skips_outputs() {
        let temp = tempfile::tempdir().unwrap();
        let base = temp.path();
        std::fs::create_dir_all(base.join("b/c")).unwrap();
        for rel in ["a.rtdc", "a_dcn.rtdc", "b/c/d.rtdc", "b/notes.txt"] {
            std::fs::write(base.join(rel), b"").unwrap();
        }

        let found = discover_inputs(base).unwrap();
        assert_eq!(found, vec![base.join("a.rtdc"), base.join("b/c/d.rtdc")]);
    }

    #[test]
    fn test_discover_inputs_missing_dir_names_path() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("nope");

        let err = discover_inputs(&missing).unwrap_err();
        match err {
            Error::IoPath { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
