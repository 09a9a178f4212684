/// The append-only output log: the single destination for status records and
/// captured snapshot output.
///
/// Records are rendered as `<timestamp> - <LEVEL> - <message> key=value...`.
/// Snapshot bytes go through the same file handle via `append_raw`, so both
/// streams interleave in event order.
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Shared handle to the output log file.
#[derive(Debug, Clone)]
pub struct OutputLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl OutputLog {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append bytes verbatim, outside the record format.
    pub fn append_raw(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = self.lock();
        file.write_all(bytes)?;
        file.flush()
    }

    fn lock(&self) -> MutexGuard<'_, File> {
        // A panic mid-write leaves the file usable; keep logging.
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Writer handed to the fmt layer for a single record.
pub struct OutputLogWriter<'a> {
    guard: MutexGuard<'a, File>,
}

impl Write for OutputLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

impl<'a> MakeWriter<'a> for OutputLog {
    type Writer = OutputLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        OutputLogWriter { guard: self.lock() }
    }
}

/// Level names as they appear in the output log.
pub fn level_label(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
}

/// `<local time> - <LEVEL> - <message> <fields>` event formatter.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLineFormat;

impl<S, N> FormatEvent<S, N> for LogLineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f");
        write!(writer, "{now} - {} - ", level_label(event.metadata().level()))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Build a subscriber that writes every record to `sink`.
pub fn subscriber(sink: &OutputLog, filter: EnvFilter) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_env_filter(filter)
        .with_writer(sink.clone())
        .event_format(LogLineFormat)
        .finish()
}

/// Filter for the output log given the raw `RUST_LOG` value.
///
/// The status records are this tool's output, not diagnostics, so a global
/// level such as `warn` only quiets other crates. Naming this crate in
/// `RUST_LOG` takes full control of its level.
pub fn filter_from(rust_log: Option<&str>) -> EnvFilter {
    let spec = rust_log.map(str::trim).filter(|s| !s.is_empty());
    let filter = spec
        .and_then(|s| EnvFilter::try_new(s).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let crate_name = env!("CARGO_CRATE_NAME");
    if spec.is_some_and(|s| s.contains(crate_name)) {
        return filter;
    }
    match format!("{crate_name}=info").parse::<Directive>() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

/// Install the output log as the global tracing destination.
pub fn init(sink: &OutputLog) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = filter_from(rust_log.as_deref());
    tracing::subscriber::set_global_default(subscriber(sink, filter))
}
