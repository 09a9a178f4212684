/// External metrics snapshot: run the configured command with no arguments
/// and capture its combined stdout+stderr.
///
/// Both streams share one anonymous temp file, so their interleaving is the
/// order the command actually wrote them in.
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Captured result of one snapshot run.
#[derive(Debug)]
pub struct SnapshotOutput {
    /// Combined stdout and stderr, verbatim.
    pub output: Vec<u8>,
    pub status: ExitStatus,
}

/// Errors that keep a snapshot from producing an exit status.
#[derive(Debug)]
pub enum SnapshotError {
    /// Failed to create the capture file.
    Capture { source: std::io::Error },
    /// Failed to spawn the command.
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    /// Failed while waiting or reading captured output.
    Io { source: std::io::Error },
    /// The command ran past its timeout and was killed.
    Timeout { program: PathBuf, after: Duration },
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::Capture { source } => {
                write!(f, "failed to create snapshot capture file: {}", source)
            }
            SnapshotError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program.display(), source)
            }
            SnapshotError::Io { source } => {
                write!(f, "I/O error during snapshot: {}", source)
            }
            SnapshotError::Timeout { program, after } => {
                write!(
                    f,
                    "{} did not finish within {}s and was killed",
                    program.display(),
                    after.as_secs_f64()
                )
            }
        }
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SnapshotError::Capture { source } => Some(source),
            SnapshotError::Spawn { source, .. } => Some(source),
            SnapshotError::Io { source } => Some(source),
            SnapshotError::Timeout { .. } => None,
        }
    }
}

/// Capability to take one metrics snapshot.
#[allow(async_fn_in_trait)]
pub trait SnapshotRunner {
    async fn run_snapshot(&self) -> Result<SnapshotOutput, SnapshotError>;
}

/// Runs an executable with no arguments.
#[derive(Debug, Clone)]
pub struct CommandSnapshot {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl CommandSnapshot {
    pub fn new(program: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl SnapshotRunner for CommandSnapshot {
    async fn run_snapshot(&self) -> Result<SnapshotOutput, SnapshotError> {
        let mut capture =
            tempfile::tempfile().map_err(|e| SnapshotError::Capture { source: e })?;
        // Second handle for stderr since File doesn't impl Clone
        let capture_stderr = capture
            .try_clone()
            .map_err(|e| SnapshotError::Capture { source: e })?;
        let capture_stdout = capture
            .try_clone()
            .map_err(|e| SnapshotError::Capture { source: e })?;

        tracing::debug!(program = %self.program.display(), "running snapshot command");
        let start = Instant::now();

        let mut child = Command::new(&self.program)
            .stdin(Stdio::null())
            .stdout(Stdio::from(capture_stdout))
            .stderr(Stdio::from(capture_stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SnapshotError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited.map_err(|e| SnapshotError::Io { source: e })?,
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to kill timed-out snapshot command");
                    }
                    return Err(SnapshotError::Timeout {
                        program: self.program.clone(),
                        after: limit,
                    });
                }
            },
            None => child
                .wait()
                .await
                .map_err(|e| SnapshotError::Io { source: e })?,
        };

        let mut output = Vec::new();
        capture
            .seek(SeekFrom::Start(0))
            .and_then(|_| capture.read_to_end(&mut output))
            .map_err(|e| SnapshotError::Io { source: e })?;

        tracing::debug!(
            exit_code = ?status.code(),
            output_bytes = output.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "snapshot command completed"
        );

        Ok(SnapshotOutput { output, status })
    }
}
