//! Task runner
//!
//! Runs one task program for one job and classifies how it exited. The
//! program gets no arguments; its parameters, input file and output
//! directory arrive as environment variables. stdin and stdout are
//! inherited, stderr is captured and becomes the job's error when non-empty.

use rototiller_core::domain::job::Job;
use rototiller_core::domain::storage::StorageStatus;
use rototiller_core::domain::task::Task;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ENV_PREFIX;
use crate::error::RunnerError;

pub const INPUT_FILE_VAR: &str = "ROTOTILLER_INPUT_FILE";
pub const OUTPUT_DIR_VAR: &str = "ROTOTILLER_OUTPUT_DIR";

/// Variables with these prefixes never reach a task program
const STRIPPED_PREFIXES: [&str; 2] = [ENV_PREFIX, "AWS_"];

/// Variables whose name contains one of these never reach a task program
const STRIPPED_WORDS: [&str; 3] = ["PASSWORD", "USERNAME", "SECRET"];

/// How a task program exited, following the BSD sysexits convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Ok,
    /// 65: the input data was malformed
    DataErr,
    /// 66: the input file was missing or unreadable
    NoInput,
    /// 73: the output could not be created
    CantCreat,
    /// 78: the task was misconfigured
    Config,
    /// Any other code; `None` when killed by a signal
    Unknown(Option<i32>),
}

impl ExitClass {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ExitClass::Ok,
            Some(65) => ExitClass::DataErr,
            Some(66) => ExitClass::NoInput,
            Some(73) => ExitClass::CantCreat,
            Some(78) => ExitClass::Config,
            other => ExitClass::Unknown(other),
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        Self::from_code(status.code())
    }

    /// New status of the job's input storage, if it changes
    pub fn input_status(self) -> Option<StorageStatus> {
        match self {
            ExitClass::Ok => Some(StorageStatus::Transformable),
            ExitClass::DataErr | ExitClass::NoInput => Some(StorageStatus::Unusable),
            ExitClass::CantCreat | ExitClass::Config => None,
            ExitClass::Unknown(_) => Some(StorageStatus::Unknown),
        }
    }

    /// Error recorded when the program wrote nothing to stderr
    pub fn message(self) -> Option<&'static str> {
        match self {
            ExitClass::Ok => None,
            ExitClass::DataErr | ExitClass::NoInput => Some("unusable input"),
            ExitClass::CantCreat => Some("can't create output file"),
            ExitClass::Config => Some("configuration error"),
            ExitClass::Unknown(_) => Some("unknown error"),
        }
    }
}

/// Result of one finished task program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub class: ExitClass,
    /// Captured stderr with trailing whitespace removed
    pub stderr: String,
}

impl RunOutcome {
    pub fn new(class: ExitClass, stderr: &[u8]) -> Self {
        Self {
            class,
            stderr: String::from_utf8_lossy(stderr).trim_end().to_string(),
        }
    }

    /// Clean exit with nothing on stderr
    pub fn succeeded(&self) -> bool {
        self.class == ExitClass::Ok && self.stderr.is_empty()
    }

    /// Error to record on the job; stderr wins over the exit-code message
    pub fn error(&self) -> Option<String> {
        if !self.stderr.is_empty() {
            Some(self.stderr.clone())
        } else {
            self.class.message().map(str::to_string)
        }
    }

    pub fn input_status(&self) -> Option<StorageStatus> {
        self.class.input_status()
    }
}

/// Launches task programs
#[derive(Debug, Clone, Default)]
pub struct TaskRunner {
    bin_dir: Option<PathBuf>,
}

impl TaskRunner {
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self { bin_dir }
    }

    /// Path or bare name of the program for a task type
    pub fn program(&self, task_type: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(task_type),
            None => PathBuf::from(task_type),
        }
    }

    /// Runs the task program to completion
    ///
    /// Any exit is an `Ok` outcome; only failing to start or wait on the
    /// process is an error.
    pub async fn run(
        &self,
        job: &Job,
        task: &Task,
        input_file: &Path,
        output_dir: &Path,
    ) -> Result<RunOutcome, RunnerError> {
        let program = self.program(&task.task_type);
        let env = task_env(std::env::vars(), job, task, input_file, output_dir);

        debug!(job_id = %job.id, program = %program.display(), "Starting task program");

        let child = Command::new(&program)
            .env_clear()
            .envs(env)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: program.clone(),
                source,
            })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| RunnerError::Wait {
                program: program.clone(),
                source,
            })?;

        let outcome = RunOutcome::new(ExitClass::from_status(output.status), &output.stderr);
        info!(
            job_id = %job.id,
            task = %task.task_type,
            exit = ?outcome.class,
            "Task program finished"
        );
        Ok(outcome)
    }
}

fn is_stripped(name: &str) -> bool {
    STRIPPED_PREFIXES.iter().any(|p| name.starts_with(p))
        || STRIPPED_WORDS.iter().any(|w| name.contains(w))
}

/// `ROTOTILLER_<PARAM>` for a task parameter name
pub fn param_var(param: &str) -> String {
    format!("{ENV_PREFIX}{}", param.to_uppercase().replace('-', "_"))
}

/// Environment handed to a task program
///
/// Starts from `base`, drops service and credential variables, then adds
/// the input file, output directory and one variable per bound parameter.
pub fn task_env(
    base: impl IntoIterator<Item = (String, String)>,
    job: &Job,
    task: &Task,
    input_file: &Path,
    output_dir: &Path,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = base
        .into_iter()
        .filter(|(name, _)| !is_stripped(name))
        .collect();

    env.push((INPUT_FILE_VAR.to_string(), input_file.display().to_string()));
    env.push((OUTPUT_DIR_VAR.to_string(), output_dir.display().to_string()));

    if job.args.len() > task.params.len() {
        warn!(
            job_id = %job.id,
            task = %task.task_type,
            extra = job.args.len() - task.params.len(),
            "Ignoring arguments beyond the task's parameters"
        );
    }

    for (param, arg) in task.params.iter().zip(&job.args) {
        env.push((param_var(param), arg.clone()));
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use rototiller_core::domain::id::{JobId, StorageId};
    use rototiller_core::domain::job::JobStatus;
    use rototiller_core::domain::task::TaskKind;
    use std::collections::HashMap;

    fn job(args: &[&str]) -> Job {
        Job {
            id: JobId::parse("job-1").unwrap(),
            customer_id: "customer".to_string(),
            task_type: "buffer".to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            input_id: StorageId::parse("in-1").unwrap(),
            output_id: None,
            status: JobStatus::InProgress,
            error: None,
            start_time: None,
            end_time: None,
        }
    }

    fn buffer_task() -> Task {
        Task {
            task_type: "buffer".to_string(),
            params: vec![
                "buffer-distance".to_string(),
                "quadrant-segment-count".to_string(),
            ],
            kind: TaskKind::Transformation,
            routing_key: "job.created".to_string(),
        }
    }

    fn env_of(base: &[(&str, &str)], job: &Job) -> HashMap<String, String> {
        let base = base.iter().map(|(k, v)| (k.to_string(), v.to_string()));
        task_env(
            base,
            job,
            &buffer_task(),
            Path::new("/w/jobs/job-1/input/in.geojson"),
            Path::new("/w/jobs/job-1/output"),
        )
        .into_iter()
        .collect()
    }

    #[test]
    fn test_exit_code_table() {
        let cases = [
            (Some(0), ExitClass::Ok, Some(StorageStatus::Transformable), None),
            (Some(65), ExitClass::DataErr, Some(StorageStatus::Unusable), Some("unusable input")),
            (Some(66), ExitClass::NoInput, Some(StorageStatus::Unusable), Some("unusable input")),
            (Some(73), ExitClass::CantCreat, None, Some("can't create output file")),
            (Some(78), ExitClass::Config, None, Some("configuration error")),
            (Some(1), ExitClass::Unknown(Some(1)), Some(StorageStatus::Unknown), Some("unknown error")),
            (None, ExitClass::Unknown(None), Some(StorageStatus::Unknown), Some("unknown error")),
        ];

        for (code, class, status, message) in cases {
            let actual = ExitClass::from_code(code);
            assert_eq!(actual, class, "code {code:?}");
            assert_eq!(actual.input_status(), status, "code {code:?}");
            assert_eq!(actual.message(), message, "code {code:?}");
        }
    }

    #[test]
    fn test_stderr_takes_priority() {
        let outcome = RunOutcome::new(ExitClass::DataErr, b"disk full\n");
        assert_eq!(outcome.error().as_deref(), Some("disk full"));
        assert_eq!(outcome.input_status(), Some(StorageStatus::Unusable));
        assert!(!outcome.succeeded());

        let outcome = RunOutcome::new(ExitClass::Ok, b"warning: empty layer  \n");
        assert_eq!(outcome.error().as_deref(), Some("warning: empty layer"));
        assert_eq!(outcome.input_status(), Some(StorageStatus::Transformable));
        assert!(!outcome.succeeded());

        let outcome = RunOutcome::new(ExitClass::Ok, b"");
        assert!(outcome.succeeded());
        assert_eq!(outcome.error(), None);
    }

    #[test]
    fn test_env_strips_sensitive_variables() {
        let env = env_of(
            &[
                ("PATH", "/usr/bin"),
                ("HOME", "/root"),
                ("ROTOTILLER_POSTGRES_ADDR", "postgres://secret"),
                ("AWS_ACCESS_KEY_ID", "AKIA"),
                ("DB_PASSWORD", "hunter2"),
                ("SMTP_USERNAME", "me"),
                ("CLIENT_SECRET_FILE", "/etc/x"),
            ],
            &job(&["10", "8"]),
        );

        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert!(env.contains_key("HOME"));
        assert!(!env.contains_key("ROTOTILLER_POSTGRES_ADDR"));
        assert!(!env.contains_key("AWS_ACCESS_KEY_ID"));
        assert!(!env.contains_key("DB_PASSWORD"));
        assert!(!env.contains_key("SMTP_USERNAME"));
        assert!(!env.contains_key("CLIENT_SECRET_FILE"));
    }

    #[test]
    fn test_env_injects_job_variables() {
        let env = env_of(&[], &job(&["10", "8"]));

        assert_eq!(
            env.get(INPUT_FILE_VAR).map(String::as_str),
            Some("/w/jobs/job-1/input/in.geojson")
        );
        assert_eq!(env.get(OUTPUT_DIR_VAR).map(String::as_str), Some("/w/jobs/job-1/output"));
        assert_eq!(env.get("ROTOTILLER_BUFFER_DISTANCE").map(String::as_str), Some("10"));
        assert_eq!(
            env.get("ROTOTILLER_QUADRANT_SEGMENT_COUNT").map(String::as_str),
            Some("8")
        );
    }

    #[test]
    fn test_env_with_missing_and_extra_args() {
        let env = env_of(&[], &job(&["10"]));
        assert!(env.contains_key("ROTOTILLER_BUFFER_DISTANCE"));
        assert!(!env.contains_key("ROTOTILLER_QUADRANT_SEGMENT_COUNT"));

        let env = env_of(&[], &job(&["10", "8", "extra"]));
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn test_param_var() {
        assert_eq!(param_var("target-projection"), "ROTOTILLER_TARGET_PROJECTION");
        assert_eq!(param_var("bands"), "ROTOTILLER_BANDS");
    }

    #[test]
    fn test_program_resolution() {
        assert_eq!(TaskRunner::default().program("buffer"), PathBuf::from("buffer"));
        assert_eq!(
            TaskRunner::new(Some(PathBuf::from("/opt/tasks"))).program("buffer"),
            PathBuf::from("/opt/tasks/buffer")
        );
    }

    #[tokio::test]
    async fn test_missing_program() {
        let bin = tempfile::tempdir().unwrap();
        let runner = TaskRunner::new(Some(bin.path().to_path_buf()));
        let scratch = tempfile::tempdir().unwrap();

        let err = runner
            .run(&job(&[]), &buffer_task(), &scratch.path().join("in"), scratch.path())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
