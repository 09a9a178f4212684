/// Turns reconciled counter events into output-log records and triggers the
/// metrics snapshot after each one.
use crate::extract::CounterEvent;
use crate::output_log::OutputLog;
use crate::reconcile::Reconciliation;
use crate::snapshot::SnapshotRunner;
use chrono::{DateTime, Local, Utc};
use tracing::{debug, error, info, warn};

pub struct Reporter<R> {
    sink: OutputLog,
    runner: R,
}

impl<R: SnapshotRunner> Reporter<R> {
    pub fn new(sink: OutputLog, runner: R) -> Self {
        Self { sink, runner }
    }

    /// Emit one record per metric derived for `event`.
    pub fn record(&self, event: &CounterEvent, rec: &Reconciliation, now: DateTime<Utc>) {
        info!("Counter value: {}", event.counter);
        info!(
            "Current timestamp: {}",
            now.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S%.6f")
        );
        info!(
            "Log timestamp: {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S%.6f")
        );

        if rec.skewed {
            warn!(
                delta_secs = rec.delta_secs,
                "large delta between current and log timestamp"
            );
        } else {
            info!(
                "Delta between current and log timestamp: {:.6}s",
                rec.delta_secs
            );
        }

        info!(
            "Elapsed since first counter: {:.6}s",
            rec.elapsed_since_first_secs
        );

        if let Some(since) = rec.since_previous_secs {
            info!("Time since previous counter: {:.6}s", since);
            match rec.rate_per_sec {
                Some(rate) => info!("Rate: {:.2} per second", rate),
                None => debug!(
                    since_previous_secs = since,
                    "log timestamp did not advance, rate skipped"
                ),
            }
        }
    }

    /// Run the snapshot and append its output to the sink.
    ///
    /// Every failure here is logged and swallowed.
    pub async fn snapshot(&self) {
        match self.runner.run_snapshot().await {
            Ok(out) => {
                if let Err(e) = self.sink.append_raw(&out.output) {
                    error!(error = %e, "failed to append snapshot output");
                }
                if !out.status.success() {
                    error!("Error executing snapshot command: {}", out.status);
                }
            }
            Err(e) => error!("Error executing snapshot command: {e}"),
        }
    }
}
