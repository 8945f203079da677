//! External command execution
//!
//! Runs a command with both output streams piped. Each stream is drained by
//! its own task while the child runs, so a chatty child can never block on a
//! full pipe buffer. The result is only reported after the child has exited
//! and both readers have finished.

use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, trace};

use crate::errors::{Classify, ErrorKind};

/// Errors from external command execution
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to collect output of '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with status {exit_code}: {}", .stderr.trim())]
    Failed {
        program: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
}

impl Classify for ExecError {
    fn kind(&self) -> ErrorKind {
        match self {
            ExecError::EmptyCommand => ErrorKind::Configuration,
            ExecError::Spawn { .. } | ExecError::Io { .. } => ErrorKind::Io,
            ExecError::Failed { .. } => ErrorKind::Subprocess,
        }
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external commands
#[derive(Debug, Clone, Default)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run a command and capture its output, whatever the exit status
    pub async fn execute(&self, argv: &[String]) -> Result<CommandOutput, ExecError> {
        let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;

        debug!(program = %program, args = ?args, "Running external command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout_task = child.stdout.take().map(|s| tokio::spawn(drain(s)));
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(drain(s)));

        let status = child.wait().await.map_err(|source| ExecError::Io {
            program: program.clone(),
            source,
        })?;

        let stdout = join_reader(program, stdout_task).await?;
        let stderr = join_reader(program, stderr_task).await?;
        let exit_code = status.code().unwrap_or(-1);

        trace!(program = %program, exit_code, "External command finished");

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Run a command and fail on a non-zero exit status
    pub async fn execute_checked(&self, argv: &[String]) -> Result<CommandOutput, ExecError> {
        let output = self.execute(argv).await?;

        if !output.success() {
            return Err(ExecError::Failed {
                program: argv[0].clone(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        Ok(output)
    }
}

async fn drain<R: AsyncRead + Unpin>(mut stream: R) -> std::io::Result<String> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn join_reader(
    program: &str,
    task: Option<tokio::task::JoinHandle<std::io::Result<String>>>,
) -> Result<String, ExecError> {
    let Some(task) = task else {
        return Ok(String::new());
    };

    match task.await {
        Ok(result) => result.map_err(|source| ExecError::Io {
            program: program.to_string(),
            source,
        }),
        Err(join_err) => Err(ExecError::Io {
            program: program.to_string(),
            source: std::io::Error::other(join_err),
        }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let output = CommandRunner::new()
            .execute(&sh("echo out; echo err >&2"))
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_large_output_does_not_deadlock() {
        // Well past a 64 KiB pipe buffer on both streams
        let script = "head -c 300000 /dev/zero | tr '\\0' a; head -c 300000 /dev/zero | tr '\\0' b >&2";
        let output = CommandRunner::new().execute(&sh(script)).await.unwrap();

        assert_eq!(output.stdout.len(), 300_000);
        assert_eq!(output.stderr.len(), 300_000);
    }

    #[tokio::test]
    async fn test_checked_failure_carries_stderr() {
        let err = CommandRunner::new()
            .execute_checked(&sh("echo broken >&2; exit 3"))
            .await
            .unwrap_err();

        match &err {
            ExecError::Failed {
                exit_code, stderr, ..
            } => {
                assert_eq!(*exit_code, 3);
                assert_eq!(stderr.trim(), "broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.kind(), ErrorKind::Subprocess);
    }

    #[tokio::test]
    async fn test_empty_command() {
        let err = CommandRunner::new().execute(&[]).await.unwrap_err();
        assert!(matches!(err, ExecError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = CommandRunner::new()
            .execute(&["/nonexistent/warden-test-binary".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
