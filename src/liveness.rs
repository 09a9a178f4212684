/// Liveness probing for the monitored process.
///
/// `ProcfsProbe` checks for `/proc/<pid>`; `SignalProbe` sends the null
/// signal for platforms without procfs. Neither inspects exit codes.
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Outcome of a single liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Terminated,
    /// The probe itself failed (e.g. permission denied).
    Unknown(String),
}

/// Capability to ask whether a process identifier is still alive.
pub trait ProcessProbe {
    fn status(&self, pid: i32) -> ProcessStatus;

    /// Boolean view; an inconclusive probe counts as not alive.
    fn is_alive(&self, pid: i32) -> bool {
        self.status(pid) == ProcessStatus::Running
    }
}

/// Probe backed by the per-process directory under procfs.
#[derive(Debug, Clone)]
pub struct ProcfsProbe {
    root: PathBuf,
}

impl ProcfsProbe {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Use an alternate procfs mount point.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcfsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for ProcfsProbe {
    fn status(&self, pid: i32) -> ProcessStatus {
        let entry = self.root.join(pid.to_string());
        match std::fs::metadata(&entry) {
            Ok(_) => ProcessStatus::Running,
            Err(e) if e.kind() == ErrorKind::NotFound => ProcessStatus::Terminated,
            Err(e) => ProcessStatus::Unknown(format!("{}: {e}", entry.display())),
        }
    }
}

/// Probe that sends signal 0 to the pid.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    fn status(&self, pid: i32) -> ProcessStatus {
        // kill() with pid <= 0 addresses process groups.
        if pid <= 0 {
            return ProcessStatus::Unknown(format!("invalid pid {pid}"));
        }
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => ProcessStatus::Running,
            // Exists, but owned by someone else.
            Err(Errno::EPERM) => ProcessStatus::Running,
            Err(Errno::ESRCH) => ProcessStatus::Terminated,
            Err(e) => ProcessStatus::Unknown(format!("kill({pid}, 0): {e}")),
        }
    }
}

/// Pick procfs when it is mounted, signal probing otherwise.
pub fn default_probe() -> Box<dyn ProcessProbe> {
    if Path::new("/proc/self").exists() {
        Box::new(ProcfsProbe::new())
    } else {
        Box::new(SignalProbe)
    }
}

impl<P: ProcessProbe + ?Sized> ProcessProbe for Box<P> {
    fn status(&self, pid: i32) -> ProcessStatus {
        (**self).status(pid)
    }
}

/// What the monitor loop should do after a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessDecision {
    Continue,
    Terminated,
    /// Too many inconclusive probes in a row.
    GiveUp { reason: String },
}

/// Tolerates a bounded run of inconclusive probes before giving up.
///
/// A `Running` probe resets the count. With `max_uncertain == 0` any
/// inconclusive probe ends monitoring immediately.
pub struct LivenessGate {
    max_uncertain: u32,
    consecutive_uncertain: u32,
}

impl LivenessGate {
    pub fn new(max_uncertain: u32) -> Self {
        Self {
            max_uncertain,
            consecutive_uncertain: 0,
        }
    }

    pub fn evaluate(&mut self, pid: i32, status: ProcessStatus) -> LivenessDecision {
        match status {
            ProcessStatus::Running => {
                self.consecutive_uncertain = 0;
                LivenessDecision::Continue
            }
            ProcessStatus::Terminated => LivenessDecision::Terminated,
            ProcessStatus::Unknown(reason) => {
                self.consecutive_uncertain += 1;
                if self.consecutive_uncertain <= self.max_uncertain {
                    warn!(
                        pid,
                        attempt = self.consecutive_uncertain,
                        max_uncertain = self.max_uncertain,
                        %reason,
                        "cannot determine process status, retrying"
                    );
                    LivenessDecision::Continue
                } else {
                    LivenessDecision::GiveUp { reason }
                }
            }
        }
    }

    #[cfg(test)]
    pub fn consecutive_uncertain(&self) -> u32 {
        self.consecutive_uncertain
    }
}
