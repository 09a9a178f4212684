/// Time reconciliation between embedded log timestamps and wall-clock time.
///
/// `reconcile` is pure: it takes the previous `MonitorState` and returns the
/// next one alongside the figures derived for the event.
use crate::extract::CounterEvent;
use chrono::{DateTime, TimeDelta, Utc};

/// State carried across counter events for the lifetime of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MonitorState {
    pub first_timestamp: Option<DateTime<Utc>>,
    pub previous: Option<PreviousEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviousEvent {
    pub timestamp: DateTime<Utc>,
    pub counter: u64,
}

/// Figures derived for a single counter event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    /// `|now - event.timestamp|` in seconds.
    pub delta_secs: f64,
    /// True when `delta_secs` reached the skew threshold.
    pub skewed: bool,
    /// Seconds between the first observed event and this one.
    pub elapsed_since_first_secs: f64,
    /// Seconds since the previous event; `None` on the first event.
    pub since_previous_secs: Option<f64>,
    /// Counter increments per second; `None` on the first event and whenever
    /// the timestamps did not move forward.
    pub rate_per_sec: Option<f64>,
}

/// Convert a signed duration to fractional seconds at microsecond precision.
pub fn secs_f64(delta: TimeDelta) -> f64 {
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        // Only reachable for spans of ~290k years.
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

pub fn reconcile(
    state: MonitorState,
    event: &CounterEvent,
    now: DateTime<Utc>,
    skew_threshold_secs: f64,
) -> (MonitorState, Reconciliation) {
    let delta_secs = secs_f64(now - event.timestamp).abs();
    let skewed = delta_secs >= skew_threshold_secs;

    let first = state.first_timestamp.unwrap_or(event.timestamp);
    let elapsed_since_first_secs = secs_f64(event.timestamp - first);

    let (since_previous_secs, rate_per_sec) = match state.previous {
        Some(prev) => {
            let since = secs_f64(event.timestamp - prev.timestamp);
            let rate = (since > 0.0).then(|| {
                let increments = i128::from(event.counter) - i128::from(prev.counter);
                increments as f64 / since
            });
            (Some(since), rate)
        }
        None => (None, None),
    };

    let next = MonitorState {
        first_timestamp: Some(first),
        previous: Some(PreviousEvent {
            timestamp: event.timestamp,
            counter: event.counter,
        }),
    };

    (
        next,
        Reconciliation {
            delta_secs,
            skewed,
            elapsed_since_first_secs,
            since_previous_secs,
            rate_per_sec,
        },
    )
}
