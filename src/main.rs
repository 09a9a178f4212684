mod config;
mod extract;
mod liveness;
mod monitor;
mod output_log;
mod reconcile;
mod reporter;
mod snapshot;
mod tailer;

use clap::Parser;
use config::{MonitorConfig, Overrides};
use liveness::{LivenessGate, ProcessProbe};
use monitor::{Monitor, Outcome};
use output_log::OutputLog;
use reporter::Reporter;
use snapshot::CommandSnapshot;
use std::path::PathBuf;
use std::process::ExitCode;
use tailer::{LogTailer, StartPosition};

/// Exit status for problems detected before monitoring starts.
const EXIT_STARTUP: u8 = 2;

/// Tail a bulk-load log, correlate its counter events with wall-clock time,
/// and snapshot metrics every time a new counter shows up. Exits once the
/// monitored process is gone.
#[derive(Parser, Debug)]
#[command(name = "counterwatch", version, about)]
pub struct Cli {
    /// Process ID of the load to watch
    #[arg(long, value_parser = clap::value_parser!(i32).range(1..))]
    pid: i32,

    /// Log file the load writes its NOTICE lines to
    #[arg(long = "log", value_name = "PATH")]
    log_path: PathBuf,

    /// Output log for status records and snapshot output
    #[arg(long = "output", value_name = "PATH")]
    output_path: PathBuf,

    /// Config file path
    #[arg(short, long, default_value = "counterwatch.toml")]
    config: PathBuf,

    /// Snapshot command, relative to the working directory (overrides config)
    #[arg(long, value_name = "PATH")]
    snapshot: Option<PathBuf>,

    /// Poll interval in milliseconds (overrides config)
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Skew warning threshold in seconds (overrides config)
    #[arg(long)]
    skew_threshold_secs: Option<f64>,

    /// Snapshot timeout in seconds, 0 for none (overrides config)
    #[arg(long)]
    snapshot_timeout_secs: Option<u64>,

    /// Read the log from the beginning instead of only new lines
    #[arg(long)]
    from_start: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            poll_interval_ms: self.poll_interval_ms,
            skew_threshold_secs: self.skew_threshold_secs,
            from_start: self.from_start,
            snapshot_command: self.snapshot.clone(),
            snapshot_timeout_secs: self.snapshot_timeout_secs,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match MonitorConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("counterwatch: {e}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };
    config.apply(cli.overrides());
    if let Err(e) = config.validate() {
        eprintln!("counterwatch: {e}");
        return ExitCode::from(EXIT_STARTUP);
    }

    let anchor = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("counterwatch: cannot determine working directory: {e}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };
    let snapshot_program = config.snapshot.resolve_command(&anchor);

    if cli.dry_run {
        println!("counterwatch v{}", env!("CARGO_PKG_VERSION"));
        println!("pid:            {}", cli.pid);
        println!("log:            {}", cli.log_path.display());
        println!("output:         {}", cli.output_path.display());
        println!("snapshot:       {}", snapshot_program.display());
        println!("{config:#?}");
        return ExitCode::SUCCESS;
    }

    let sink = match OutputLog::open(&cli.output_path) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!(
                "counterwatch: failed to open output log {}: {e}",
                cli.output_path.display()
            );
            return ExitCode::from(EXIT_STARTUP);
        }
    };
    if let Err(e) = output_log::init(&sink) {
        eprintln!("counterwatch: failed to install logger: {e}");
        return ExitCode::from(EXIT_STARTUP);
    }

    let start = if config.monitor.from_start {
        StartPosition::Beginning
    } else {
        StartPosition::End
    };
    let tailer = match LogTailer::open(&cli.log_path, start, config.monitor.poll_interval()) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("counterwatch: {e}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let probe = liveness::default_probe();
    if !probe.is_alive(cli.pid) {
        tracing::warn!(pid = cli.pid, "process is not running at startup");
    }

    tracing::info!(
        pid = cli.pid,
        log = %cli.log_path.display(),
        output = %sink.path().display(),
        snapshot = %snapshot_program.display(),
        poll_interval_ms = config.monitor.poll_interval_ms,
        "monitoring started"
    );

    let reporter = Reporter::new(
        sink,
        CommandSnapshot::new(snapshot_program, config.snapshot.timeout()),
    );
    let mut monitor = Monitor::new(
        cli.pid,
        probe,
        LivenessGate::new(config.liveness.max_uncertain_checks),
        tailer,
        reporter,
        config.monitor.skew_threshold_secs,
    );

    match monitor.run().await {
        Ok(Outcome::Terminated) => ExitCode::SUCCESS,
        Ok(Outcome::Undetermined { reason }) => {
            tracing::debug!(%reason, "exiting without confirmed termination");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
