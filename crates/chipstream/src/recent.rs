//! List of recently used output directories.
//!
//! Stored as newline-delimited text, most recent entry last. A missing or
//! unreadable file is treated as an empty list.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::utils::fs;
use crate::{Error, Result};

/// Default number of remembered directories.
pub const DEFAULT_RECENT_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct RecentDirs {
    file: PathBuf,
    capacity: usize,
    dirs: Vec<PathBuf>,
}

impl RecentDirs {
    /// Load the list stored in `file`.
    pub fn load(file: impl Into<PathBuf>, capacity: usize) -> Self {
        let file = file.into();
        let capacity = capacity.max(1);
        let dirs = match std::fs::read_to_string(&file) {
            Ok(text) => parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(file = %file.display(), error = %e, "Could not read recent directories");
                Vec::new()
            }
        };
        let mut recent = Self {
            file,
            capacity,
            dirs,
        };
        recent.truncate();
        recent
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Directories, oldest first.
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn most_recent(&self) -> Option<&Path> {
        self.dirs.last().map(PathBuf::as_path)
    }

    /// Move `dir` to the end of the list, dropping the oldest entries beyond
    /// capacity.
    pub fn push(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        self.dirs.retain(|d| *d != dir);
        self.dirs.push(dir);
        self.truncate();
    }

    fn truncate(&mut self) {
        if self.dirs.len() > self.capacity {
            let excess = self.dirs.len() - self.capacity;
            self.dirs.drain(..excess);
        }
    }

    pub fn save(&self) -> Result<()> {
        fs::ensure_parent_dir(&self.file)?;
        let mut text = String::new();
        for dir in &self.dirs {
            text.push_str(&dir.to_string_lossy());
            text.push('\n');
        }
        std::fs::write(&self.file, text)
            .map_err(|e| Error::io_path("writing recent directories", &self.file, e))?;
        debug!(file = %self.file.display(), entries = self.dirs.len(), "Saved recent directories");
        Ok(())
    }

    /// Push and save, logging instead of failing.
    pub fn remember(&mut self, dir: impl Into<PathBuf>) {
        self.push(dir);
        if let Err(e) = self.save() {
            warn!(error = %e, "Could not persist recent directories");
        }
    }
}

fn parse(text: &str) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let dir = PathBuf::from(line);
        dirs.retain(|d| *d != dir);
        dirs.push(dir);
    }
    dirs
}
