//! Working-directory volume manager
//!
//! Stages each job under `<working dir>/jobs/<job id>/`: the input volume is
//! written to `input/`, the task program writes into `output/`, and the
//! whole tree is removed once the job is finished.

use rototiller_core::domain::id::JobId;
use rototiller_core::volume::{FileSource, Volume, VolumeFile, safe_relative_path};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::VolumeError;

#[derive(Debug, Clone)]
pub struct WorkDir {
    jobs_root: PathBuf,
}

impl WorkDir {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            jobs_root: working_dir.as_ref().join("jobs"),
        }
    }

    pub fn job_path(&self, job: &JobId) -> PathBuf {
        self.jobs_root.join(job.as_str())
    }

    pub fn input_path(&self, job: &JobId) -> PathBuf {
        self.job_path(job).join("input")
    }

    pub fn output_path(&self, job: &JobId) -> PathBuf {
        self.job_path(job).join("output")
    }

    /// Writes every file of `volume` under the job's input directory and
    /// returns the path of the file handed to the task program
    ///
    /// Tasks take a single input file. With several, the first by name wins.
    pub async fn materialize_input(
        &self,
        job: &JobId,
        volume: Volume,
    ) -> Result<PathBuf, VolumeError> {
        let input_dir = self.input_path(job);
        create_dir(&input_dir).await?;

        let volume = volume.sorted();
        let mut staged = Vec::with_capacity(volume.len());

        for file in volume.into_files() {
            let relative = safe_relative_path(&file.name)
                .ok_or_else(|| VolumeError::UnsafePath(file.name.clone()))?;
            let target = input_dir.join(relative);
            write_file(&target, file).await?;
            staged.push(target);
        }

        match staged.len() {
            0 => Err(VolumeError::NoInput),
            1 => Ok(staged.swap_remove(0)),
            n => {
                warn!(job_id = %job, files = n, "Input has several files, using the first");
                Ok(staged.swap_remove(0))
            }
        }
    }

    /// Creates the job's empty output directory
    pub async fn prepare_output(&self, job: &JobId) -> Result<PathBuf, VolumeError> {
        let output_dir = self.output_path(job);
        create_dir(&output_dir).await?;
        Ok(output_dir)
    }

    /// Lists the regular files the task program left in the output directory
    pub async fn collect_output(&self, job: &JobId) -> Result<Volume, VolumeError> {
        let output_dir = self.output_path(job);
        let walk_dir = output_dir.clone();

        tokio::task::spawn_blocking(move || Volume::from_dir(&walk_dir))
            .await
            .map_err(|e| VolumeError::io(&output_dir, std::io::Error::other(e)))?
            .map_err(|source| VolumeError::Walk {
                path: output_dir,
                source,
            })
    }

    /// Removes the job's working tree; a tree that is already gone is fine
    pub async fn release(&self, job: &JobId) -> Result<(), VolumeError> {
        let path = self.job_path(job);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!(job_id = %job, "Released working directory");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VolumeError::io(path, e)),
        }
    }
}

async fn create_dir(path: &Path) -> Result<(), VolumeError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| VolumeError::io(path, e))
}

async fn write_file(target: &Path, file: VolumeFile) -> Result<(), VolumeError> {
    if let Some(parent) = target.parent() {
        create_dir(parent).await?;
    }

    let written = match file.source {
        FileSource::Bytes(bytes) => tokio::fs::write(target, bytes).await,
        FileSource::Path(source) => tokio::fs::copy(source, target).await.map(|_| ()),
    };
    written.map_err(|e| VolumeError::io(target, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> JobId {
        JobId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_paths() {
        let workdir = WorkDir::new("/var/lib/rototiller");
        assert_eq!(
            workdir.input_path(&job("job-1")),
            PathBuf::from("/var/lib/rototiller/jobs/job-1/input")
        );
        assert_eq!(
            workdir.output_path(&job("job-1")),
            PathBuf::from("/var/lib/rototiller/jobs/job-1/output")
        );
    }

    #[tokio::test]
    async fn test_materialize_single_input() {
        let root = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(root.path());
        let content = br#"{"type":"FeatureCollection","features":[]}"#.to_vec();

        let volume = Volume::from_files(vec![VolumeFile::from_bytes("input.geojson", content.clone())]);
        let input = workdir.materialize_input(&job("job-1"), volume).await.unwrap();

        assert_eq!(input, workdir.input_path(&job("job-1")).join("input.geojson"));
        assert_eq!(std::fs::read(&input).unwrap(), content);
    }

    #[tokio::test]
    async fn test_materialize_picks_first_by_name() {
        let root = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(root.path());

        let volume = Volume::from_files(vec![
            VolumeFile::from_bytes("b.geojson", b"b".to_vec()),
            VolumeFile::from_bytes("a.geojson", b"a".to_vec()),
        ]);
        let input = workdir.materialize_input(&job("job-1"), volume).await.unwrap();

        assert!(input.ends_with("a.geojson"));
        assert!(workdir.input_path(&job("job-1")).join("b.geojson").exists());
    }

    #[tokio::test]
    async fn test_materialize_empty_volume() {
        let root = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(root.path());

        let err = workdir
            .materialize_input(&job("job-1"), Volume::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::NoInput));
        assert_eq!(err.to_string(), "no input found");
    }

    #[tokio::test]
    async fn test_materialize_rejects_escaping_names() {
        let root = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(root.path());

        let volume = Volume::from_files(vec![VolumeFile::from_bytes("../../etc/passwd", b"x".to_vec())]);
        let err = workdir.materialize_input(&job("job-1"), volume).await.unwrap_err();
        assert!(matches!(err, VolumeError::UnsafePath(_)));
    }

    #[tokio::test]
    async fn test_collect_output() {
        let root = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(root.path());
        let output = workdir.prepare_output(&job("job-1")).await.unwrap();

        std::fs::write(output.join("output.geojson"), vec![b'x'; 120]).unwrap();
        std::fs::write(output.join("output.zip"), vec![0u8; 2048]).unwrap();

        let volume = workdir.collect_output(&job("job-1")).await.unwrap();
        let listed: Vec<(&str, u64)> = volume
            .files()
            .iter()
            .map(|f| (f.name.as_str(), f.size))
            .collect();
        assert_eq!(listed, vec![("output.geojson", 120), ("output.zip", 2048)]);
    }

    #[tokio::test]
    async fn test_release() {
        let root = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(root.path());
        workdir.prepare_output(&job("job-1")).await.unwrap();

        workdir.release(&job("job-1")).await.unwrap();
        assert!(!workdir.job_path(&job("job-1")).exists());

        // Already gone
        workdir.release(&job("job-1")).await.unwrap();
    }
}
