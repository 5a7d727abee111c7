//! Filesystem helpers shared across modules.
//!
//! Every helper attaches the failed operation and path to the error so the
//! caller can report something more useful than a bare `os error 13`.

use std::path::Path;

use crate::{Error, Result};

/// Ensure the parent directory of a file path exists.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent)
        .map_err(|e| Error::io_path("creating output directory", parent, e))
}

/// Remove a directory tree, treating "already gone" as success.
pub async fn remove_dir_all_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io_path("removing directory", path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_parent_dir_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("a").join("b").join("out.rtdc");

        ensure_parent_dir(&file).unwrap();
        ensure_parent_dir(&file).unwrap();

        assert!(temp.path().join("a").join("b").is_dir());
        assert!(!file.exists());
    }

    #[test]
    fn test_ensure_parent_dir_relative_file_name() {
        ensure_parent_dir(Path::new("plain.rtdc")).unwrap();
    }

    #[test]
    fn test_ensure_parent_dir_blocked_by_file() {
        let temp = tempfile::tempdir().unwrap();
        let blocker = temp.path().join("taken");
        std::fs::write(&blocker, b"").unwrap();

        let err = ensure_parent_dir(&blocker.join("out.rtdc")).unwrap_err();
        assert!(matches!(err, Error::IoPath { ref path, .. } if *path == blocker));
    }

    #[tokio::test]
    async fn test_remove_missing_dir_is_ok() {
        let temp = tempfile::tempdir().unwrap();
        remove_dir_all_if_exists(&temp.path().join("missing"))
            .await
            .unwrap();
    }
}
