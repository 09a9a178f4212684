/// The monitor loop: drain new log lines, reconcile counter events, report
/// them, and stop once the monitored process is gone.
///
/// Liveness is probed each time the tailer runs dry, so termination is
/// noticed within one poll interval of the last write.
use crate::extract::{self, ExtractError};
use crate::liveness::{LivenessDecision, LivenessGate, ProcessProbe};
use crate::reconcile::{self, MonitorState};
use crate::reporter::Reporter;
use crate::snapshot::SnapshotRunner;
use crate::tailer::{LogTailer, TailError};
use chrono::Utc;
use tracing::{info, warn};

/// How a run ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The process is gone.
    Terminated,
    /// Liveness could not be determined for too many consecutive probes.
    Undetermined { reason: String },
}

/// Conditions that abort monitoring.
#[derive(Debug)]
pub enum MonitorError {
    Tail(TailError),
    /// A counter line could not be decoded; the log format is not the
    /// expected one.
    Format { line: String, source: ExtractError },
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::Tail(e) => write!(f, "{e}"),
            MonitorError::Format { line, source } => {
                write!(f, "{source} (line: {line:?})")
            }
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Tail(e) => Some(e),
            MonitorError::Format { source, .. } => Some(source),
        }
    }
}

impl From<TailError> for MonitorError {
    fn from(e: TailError) -> Self {
        MonitorError::Tail(e)
    }
}

pub struct Monitor<P, R> {
    pid: i32,
    probe: P,
    gate: LivenessGate,
    tailer: LogTailer,
    reporter: Reporter<R>,
    state: MonitorState,
    skew_threshold_secs: f64,
}

impl<P: ProcessProbe, R: SnapshotRunner> Monitor<P, R> {
    pub fn new(
        pid: i32,
        probe: P,
        gate: LivenessGate,
        tailer: LogTailer,
        reporter: Reporter<R>,
        skew_threshold_secs: f64,
    ) -> Self {
        Self {
            pid,
            probe,
            gate,
            tailer,
            reporter,
            state: MonitorState::default(),
            skew_threshold_secs,
        }
    }

    /// Run until the process terminates or a fatal error occurs.
    pub async fn run(&mut self) -> Result<Outcome, MonitorError> {
        let pid = self.pid;
        loop {
            self.drain().await?;

            match self.gate.evaluate(pid, self.probe.status(pid)) {
                LivenessDecision::Continue => {}
                LivenessDecision::Terminated => {
                    // Pick up anything written just before exit, including a
                    // last line the writer never terminated.
                    self.drain().await?;
                    if let Some(line) = self.tailer.take_partial() {
                        self.handle_line(&line).await?;
                    }
                    info!("Process {pid} has terminated.");
                    return Ok(Outcome::Terminated);
                }
                LivenessDecision::GiveUp { reason } => {
                    warn!(pid, %reason, "cannot determine process status, stopping");
                    return Ok(Outcome::Undetermined { reason });
                }
            }

            self.tailer.idle().await;
        }
    }

    /// Process every complete line currently available.
    async fn drain(&mut self) -> Result<(), MonitorError> {
        while let Some(line) = self.tailer.try_next_line()? {
            self.handle_line(&line).await?;
        }
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> Result<(), MonitorError> {
        let event = match extract::extract(line) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(()),
            Err(source) => {
                return Err(MonitorError::Format {
                    line: line.to_string(),
                    source,
                })
            }
        };

        let now = Utc::now();
        let (next, rec) = reconcile::reconcile(self.state, &event, now, self.skew_threshold_secs);
        self.state = next;

        self.reporter.record(&event, &rec, now);
        self.reporter.snapshot().await;
        Ok(())
    }

    #[cfg(test)]
    pub fn state(&self) -> &MonitorState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::{ProcessStatus, ProcfsProbe};
    use crate::output_log::{self, OutputLog};
    use crate::snapshot::{SnapshotError, SnapshotOutput};
    use crate::tailer::StartPosition;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::os::unix::process::ExitStatusExt;
    use std::path::{Path, PathBuf};
    use std::process::ExitStatus;
    use std::rc::Rc;
    use std::time::{Duration, Instant};
    use tracing_subscriber::EnvFilter;

    const POLL: Duration = Duration::from_millis(10);

    /// Returns the queued statuses in order, then `Terminated` forever.
    struct ScriptedProbe {
        statuses: RefCell<VecDeque<ProcessStatus>>,
    }

    impl ScriptedProbe {
        fn running_for(checks: usize) -> Self {
            Self::new(vec![ProcessStatus::Running; checks])
        }

        fn new(statuses: Vec<ProcessStatus>) -> Self {
            Self {
                statuses: RefCell::new(statuses.into()),
            }
        }
    }

    impl ProcessProbe for ScriptedProbe {
        fn status(&self, _pid: i32) -> ProcessStatus {
            self.statuses
                .borrow_mut()
                .pop_front()
                .unwrap_or(ProcessStatus::Terminated)
        }
    }

    /// Reports `Running` until `dies_at`, `Terminated` afterwards.
    struct DeadlineProbe {
        dies_at: Instant,
    }

    impl ProcessProbe for DeadlineProbe {
        fn status(&self, _pid: i32) -> ProcessStatus {
            if Instant::now() < self.dies_at {
                ProcessStatus::Running
            } else {
                ProcessStatus::Terminated
            }
        }
    }

    struct CountingSnapshot {
        calls: Rc<Cell<u32>>,
        code: i32,
    }

    impl SnapshotRunner for CountingSnapshot {
        async fn run_snapshot(&self) -> Result<SnapshotOutput, SnapshotError> {
            self.calls.set(self.calls.get() + 1);
            Ok(SnapshotOutput {
                output: format!("snapshot #{}\n", self.calls.get()).into_bytes(),
                status: ExitStatus::from_raw(self.code << 8),
            })
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        log: PathBuf,
        sink: OutputLog,
        calls: Rc<Cell<u32>>,
    }

    impl Harness {
        fn new(log_contents: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("load.log");
            std::fs::write(&log, log_contents).unwrap();
            let sink = OutputLog::open(&dir.path().join("monitor.log")).unwrap();
            Self {
                _dir: dir,
                log,
                sink,
                calls: Rc::new(Cell::new(0)),
            }
        }

        fn monitor<P: ProcessProbe>(
            &self,
            pid: i32,
            probe: P,
            snapshot_code: i32,
        ) -> Monitor<P, CountingSnapshot> {
            self.monitor_polling(pid, probe, snapshot_code, POLL)
        }

        fn monitor_polling<P: ProcessProbe>(
            &self,
            pid: i32,
            probe: P,
            snapshot_code: i32,
            poll: Duration,
        ) -> Monitor<P, CountingSnapshot> {
            let tailer = LogTailer::open(&self.log, StartPosition::Beginning, poll).unwrap();
            let reporter = Reporter::new(
                self.sink.clone(),
                CountingSnapshot {
                    calls: Rc::clone(&self.calls),
                    code: snapshot_code,
                },
            );
            Monitor::new(pid, probe, LivenessGate::new(2), tailer, reporter, 2.0)
        }

        fn output(&self) -> String {
            std::fs::read_to_string(self.sink.path()).unwrap()
        }

        fn count(&self, needle: &str) -> usize {
            self.output().lines().filter(|l| l.contains(needle)).count()
        }
    }

    fn counter_line(ts: &str, counter: u64) -> String {
        format!("ysqlsh:load.sql:9: NOTICE:  [{ts}+00s] counter: {counter}\n")
    }

    fn scoped(sink: &OutputLog) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(output_log::subscriber(sink, EnvFilter::new("info")))
    }

    #[tokio::test]
    async fn test_events_are_reported_then_termination() {
        let log = format!(
            "{}{}",
            counter_line("2024-03-01 10:00:10.000000", 1000),
            counter_line("2024-03-01 10:00:12.000000", 3000)
        );
        let h = Harness::new(&log);
        let _guard = scoped(&h.sink);

        let mut monitor = h.monitor(1, ScriptedProbe::running_for(3), 0);
        assert_eq!(monitor.run().await.unwrap(), Outcome::Terminated);

        assert_eq!(h.calls.get(), 2);
        assert_eq!(h.count("Counter value: "), 2);
        assert_eq!(h.count("Rate: 1000.00 per second"), 1);
        assert_eq!(h.count("Process 1 has terminated."), 1);

        let output = h.output();
        let first = output.find("snapshot #1").unwrap();
        let second_counter = output.find("Counter value: 3000").unwrap();
        let second = output.find("snapshot #2").unwrap();
        assert!(first < second_counter && second_counter < second);

        let state = monitor.state();
        assert_eq!(state.previous.unwrap().counter, 3000);
    }

    #[tokio::test]
    async fn test_snapshot_failure_does_not_stop_loop() {
        let log = format!(
            "{}{}",
            counter_line("2024-03-01 10:00:10.000000", 1000),
            counter_line("2024-03-01 10:00:11.000000", 1500)
        );
        let h = Harness::new(&log);
        let _guard = scoped(&h.sink);

        let mut monitor = h.monitor(7, ScriptedProbe::running_for(1), 1);
        assert_eq!(monitor.run().await.unwrap(), Outcome::Terminated);

        assert_eq!(h.calls.get(), 2);
        assert_eq!(h.count(" - ERROR - Error executing snapshot command"), 2);
        assert_eq!(h.count("Process 7 has terminated."), 1);
    }

    #[tokio::test]
    async fn test_non_matching_lines_have_no_side_effects() {
        let h = Harness::new("COPY 5000\nNOTICE:  vacuum skipped\nysqlsh:x: ERROR:  oops\n");
        let _guard = scoped(&h.sink);

        let mut monitor = h.monitor(3, ScriptedProbe::running_for(2), 0);
        monitor.run().await.unwrap();

        assert_eq!(h.calls.get(), 0);
        assert_eq!(*monitor.state(), MonitorState::default());
        let output = h.output();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("INFO - Process 3 has terminated."));
    }

    #[tokio::test]
    async fn test_bad_timestamp_is_fatal() {
        let h = Harness::new("ysqlsh:x: NOTICE:  [2024/03/01 10:00] counter: 5\n");
        let _guard = scoped(&h.sink);

        let mut monitor = h.monitor(3, ScriptedProbe::running_for(5), 0);
        let err = monitor.run().await.unwrap_err();
        assert!(matches!(
            err,
            MonitorError::Format {
                source: ExtractError::Timestamp { .. },
                ..
            }
        ));
        assert_eq!(h.calls.get(), 0);
        assert_eq!(h.count("has terminated"), 0);
    }

    #[tokio::test]
    async fn test_lines_written_after_start_are_picked_up() {
        let h = Harness::new("");
        let _guard = scoped(&h.sink);

        let log = h.log.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            append(&log, &counter_line("2024-03-01 10:00:10.000000", 10));
        });

        // Enough Running probes to outlast the writer's delay.
        let mut monitor = h.monitor(9, ScriptedProbe::running_for(50), 0);
        monitor.run().await.unwrap();
        writer.await.unwrap();

        assert_eq!(h.calls.get(), 1);
        assert_eq!(h.count("Counter value: 10"), 1);
    }

    #[tokio::test]
    async fn test_uncertain_liveness_gives_up_after_limit() {
        let h = Harness::new("");
        let _guard = scoped(&h.sink);

        let unknown = ProcessStatus::Unknown("permission denied".to_string());
        let probe = ScriptedProbe::new(vec![unknown; 10]);
        let mut monitor = h.monitor(4, probe, 0);

        let outcome = monitor.run().await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Undetermined {
                reason: "permission denied".to_string()
            }
        );
        // Two tolerated probes, then the give-up record.
        assert_eq!(h.count("cannot determine process status, retrying"), 2);
        assert_eq!(h.count("cannot determine process status, stopping"), 1);
        assert_eq!(h.count("has terminated"), 0);
    }

    #[tokio::test]
    async fn test_real_process_exit_ends_loop_promptly() {
        let h = Harness::new("");
        let _guard = scoped(&h.sink);

        let mut child = tokio::process::Command::new("sleep")
            .arg("0.2")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap() as i32;
        // Reap in the background so /proc/<pid> disappears on exit.
        let reaper = tokio::spawn(async move { child.wait().await });

        let start = Instant::now();
        let mut monitor = h.monitor(pid, ProcfsProbe::new(), 0);
        assert_eq!(monitor.run().await.unwrap(), Outcome::Terminated);
        assert!(start.elapsed() < Duration::from_secs(3));
        reaper.await.unwrap().unwrap();

        assert_eq!(h.count(&format!("Process {pid} has terminated.")), 1);
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_reported_on_exit() {
        let h = Harness::new(
            "ysqlsh:x: NOTICE:  [2024-03-01 10:00:10.000000+00s] counter: 777",
        );
        let _guard = scoped(&h.sink);

        let mut monitor = h.monitor(1, ScriptedProbe::running_for(3), 0);
        assert_eq!(monitor.run().await.unwrap(), Outcome::Terminated);

        assert_eq!(h.calls.get(), 1);
        assert_eq!(h.count("Counter value: 777"), 1);
        assert_eq!(monitor.state().previous.unwrap().counter, 777);

        let output = h.output();
        let counter = output.find("Counter value: 777").unwrap();
        let terminated = output.find("Process 1 has terminated.").unwrap();
        assert!(counter < terminated);
    }

    #[tokio::test]
    async fn test_termination_noticed_within_one_poll_interval() {
        let h = Harness::new("");
        let _guard = scoped(&h.sink);

        let poll = Duration::from_millis(50);
        let dies_at = Instant::now() + Duration::from_millis(120);
        let mut monitor = h.monitor_polling(5, DeadlineProbe { dies_at }, 0, poll);
        assert_eq!(monitor.run().await.unwrap(), Outcome::Terminated);

        let lag = Instant::now().saturating_duration_since(dies_at);
        assert!(lag <= poll + Duration::from_millis(40), "noticed after {lag:?}");
        assert_eq!(h.count("Process 5 has terminated."), 1);
    }

    fn append(path: &Path, text: &str) {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }
}
