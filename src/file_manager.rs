use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Prefix of in-progress files. Anything carrying it is never referenced.
pub const PARTIAL_PREFIX: &str = ".partial-";

/// Persists run output under one root directory. Every write lands under a
/// temporary name in the target directory first and is renamed into place,
/// so a reader never observes a partially written file.
#[derive(Debug, Clone)]
pub struct FileManager {
    base_dir: PathBuf,
}

impl FileManager {
    pub fn new(base_dir: &Path) -> Result<Self> {
        let base_dir = base_dir.to_path_buf();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create base directory: {:?}", base_dir))?;

        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn absolute(&self, relative: &Path) -> PathBuf {
        self.base_dir.join(relative)
    }

    /// Write `content` to `relative` atomically, creating parent directories.
    pub fn write_atomic(&self, relative: &Path, content: &[u8]) -> Result<PathBuf> {
        let target = self.absolute(relative);
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_dir.clone());
        fs::create_dir_all(&parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;

        let mut partial = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(&parent)
            .with_context(|| format!("Failed to create temporary file in: {:?}", parent))?;
        partial
            .write_all(content)
            .with_context(|| format!("Failed to write to file: {:?}", target))?;
        partial
            .as_file()
            .sync_all()
            .with_context(|| format!("Failed to flush file: {:?}", target))?;
        partial
            .persist(&target)
            .with_context(|| format!("Failed to move file into place: {:?}", target))?;

        Ok(target)
    }

    pub async fn persist(&self, relative: PathBuf, content: Vec<u8>) -> Result<PathBuf> {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.write_atomic(&relative, &content))
            .await
            .context("File write task panicked")?
    }

    pub fn read_to_string(&self, relative: &Path) -> Result<String> {
        let path = self.absolute(relative);
        fs::read_to_string(&path).with_context(|| format!("Failed to read file: {:?}", path))
    }

    /// Leftover in-progress files anywhere under the root.
    pub fn partial_files(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![self.base_dir.clone()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX) {
                    found.push(path);
                }
            }
        }
        found
    }

    /// Remove leftover in-progress files; returns how many were removed.
    pub fn sweep_partial_files(&self) -> usize {
        self.partial_files()
            .into_iter()
            .filter(|path| fs::remove_file(path).is_ok())
            .count()
    }
}
