//! Volumes
//!
//! A volume is an enumerable set of named files. Blob stores hand volumes to
//! the worker, which materializes them on disk; the worker hands back a
//! directory-backed volume for upload.

use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Where a file's bytes live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Held in memory
    Bytes(Vec<u8>),
    /// Backed by a file on the local filesystem
    Path(PathBuf),
}

/// One named file of a volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeFile {
    /// Name relative to the volume root, `/`-separated
    pub name: String,
    pub size: u64,
    pub source: FileSource,
}

impl VolumeFile {
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            source: FileSource::Bytes(bytes),
        }
    }

    pub fn from_path(name: impl Into<String>, path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            source: FileSource::Path(path.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Volume {
    files: Vec<VolumeFile>,
}

impl Volume {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_files(files: Vec<VolumeFile>) -> Self {
        Self { files }
    }

    pub fn push(&mut self, file: VolumeFile) {
        self.files.push(file);
    }

    pub fn files(&self) -> &[VolumeFile] {
        &self.files
    }

    pub fn into_files(self) -> Vec<VolumeFile> {
        self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Lists the regular files below `dir`, sorted by name
    ///
    /// Names are relative to `dir` and `/`-separated; the files stay on disk.
    /// This walks the filesystem synchronously.
    pub fn from_dir(dir: &Path) -> Result<Self, walkdir::Error> {
        let mut files = Vec::new();

        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let size = entry.metadata()?.len();

            files.push(VolumeFile::from_path(name, entry.path(), size));
        }

        Ok(Self { files })
    }

    /// Total size of all files in bytes
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Sorts files by name so enumeration order is stable
    pub fn sorted(mut self) -> Self {
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
        self
    }
}

/// Resolves a volume file name to a relative path that stays inside its root
///
/// A single leading `/` is tolerated (blob keys are listed with their prefix
/// stripped); anything absolute beyond that, `.`/`..` components or an empty
/// name yields `None`.
pub fn safe_relative_path(name: &str) -> Option<PathBuf> {
    let trimmed = name.strip_prefix('/').unwrap_or(name);
    if trimmed.is_empty() {
        return None;
    }

    let path = Path::new(trimmed);
    path.components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then(|| path.to_path_buf())
}
