/// Incremental reader for a log file that another process keeps appending to.
///
/// Lines are surfaced exactly once, in append order. A trailing partial line
/// is held back until its newline arrives. Rotation and truncation are not
/// detected: if the file is replaced underneath the open handle, what the
/// tailer yields afterwards is unspecified.
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where reading begins when the file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Skip existing content; only lines appended after opening are seen.
    #[default]
    End,
    Beginning,
}

/// Errors that can occur while tailing.
#[derive(Debug)]
pub enum TailError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for TailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TailError::Open { path, source } => {
                write!(f, "failed to open log {}: {}", path.display(), source)
            }
            TailError::Read { path, source } => {
                write!(f, "failed to read log {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for TailError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TailError::Open { source, .. } => Some(source),
            TailError::Read { source, .. } => Some(source),
        }
    }
}

pub struct LogTailer {
    path: PathBuf,
    reader: BufReader<File>,
    /// Bytes of a line whose newline has not been written yet.
    pending: Vec<u8>,
    poll_interval: Duration,
}

impl LogTailer {
    pub fn open(
        path: &Path,
        start: StartPosition,
        poll_interval: Duration,
    ) -> Result<Self, TailError> {
        let open_err = |e| TailError::Open {
            path: path.to_path_buf(),
            source: e,
        };
        let mut file = File::open(path).map_err(open_err)?;
        if start == StartPosition::End {
            file.seek(SeekFrom::End(0)).map_err(open_err)?;
        }
        tracing::debug!(path = %path.display(), ?start, "opened log for tailing");

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            pending: Vec::new(),
            poll_interval,
        })
    }

    /// Return the next complete line, or `None` if none is available yet.
    ///
    /// The trailing `\n` (and `\r`, if present) is stripped. Invalid UTF-8 is
    /// replaced rather than rejected.
    pub fn try_next_line(&mut self) -> Result<Option<String>, TailError> {
        let read = self
            .reader
            .read_until(b'\n', &mut self.pending)
            .map_err(|e| TailError::Read {
                path: self.path.clone(),
                source: e,
            })?;

        if read == 0 || self.pending.last() != Some(&b'\n') {
            return Ok(None);
        }

        let mut bytes = std::mem::take(&mut self.pending);
        bytes.pop();
        Ok(Some(decode(bytes)))
    }

    /// Hand back a trailing line that never got its newline.
    ///
    /// Only meaningful once the writer is gone; while it is still running the
    /// rest of the line may yet arrive.
    pub fn take_partial(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(decode(std::mem::take(&mut self.pending)))
    }

    /// Sleep one poll interval; called when the file has nothing new.
    pub async fn idle(&self) {
        tokio::time::sleep(self.poll_interval).await;
    }
}

fn decode(mut bytes: Vec<u8>) -> String {
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
