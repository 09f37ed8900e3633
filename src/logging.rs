//! Process-wide leveled logging.
//!
//! Every line goes to stderr as:
//!
//! ```text
//! [LEVEL] YYYY-MM-DD HH:MM:SS,000: message
//! ```
//!
//! The minimum severity is held in a single atomic (`LevelGate`) that every
//! connection task reads when it logs. It is written once at startup, before
//! any connection exists.

use chrono::{DateTime, Local};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::dynamic_filter_fn;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Exit status used for every fatal error.
pub const FATAL_EXIT_CODE: i32 = 2;

/// Ordered log importance tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    Debug = 0,
    Info = 1,
    Critical = 2,
    /// Suppresses every line.
    Off = 3,
}

impl Severity {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Severity::Debug,
            1 => Severity::Info,
            2 => Severity::Critical,
            _ => Severity::Off,
        }
    }

    /// Tier a `tracing` level is gated at. WARN shares the Info tier.
    pub fn of(level: &Level) -> Self {
        match *level {
            Level::TRACE | Level::DEBUG => Severity::Debug,
            Level::INFO | Level::WARN => Severity::Info,
            Level::ERROR => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Critical => "critical",
            Severity::Off => "none",
        };
        f.write_str(name)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "critical" => Ok(Severity::Critical),
            "none" | "off" => Ok(Severity::Off),
            _ => Err(s.to_string()),
        }
    }
}

/// Minimum severity filter, safe to read from any thread.
#[derive(Debug)]
pub struct LevelGate {
    minimum: AtomicU8,
}

impl LevelGate {
    pub const fn new(level: Severity) -> Self {
        Self {
            minimum: AtomicU8::new(level as u8),
        }
    }

    pub fn set(&self, level: Severity) {
        self.minimum.store(level as u8, Ordering::Release);
    }

    pub fn get(&self) -> Severity {
        Severity::from_u8(self.minimum.load(Ordering::Acquire))
    }

    /// Whether a line at `level` passes the gate.
    pub fn allows(&self, level: Severity) -> bool {
        level != Severity::Off && level >= self.get()
    }
}

static GATE: LevelGate = LevelGate::new(Severity::Info);

/// Set the process-wide minimum severity.
pub fn set_level(level: Severity) {
    GATE.set(level);
}

/// Current process-wide minimum severity.
pub fn effective_level() -> Severity {
    GATE.get()
}

/// Log at CRITICAL and terminate the process with status 2.
///
/// The process exits even if the gate suppresses the line.
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    tracing::error!("{args}");
    std::process::exit(FATAL_EXIT_CODE)
}

/// Install the stderr logger behind the process-wide gate.
pub fn init() {
    tracing_subscriber::registry()
        .with(layer(&GATE, std::io::stderr))
        .init();
}

/// Build the formatted, gated layer over an arbitrary writer.
///
/// The fmt layer renders each event into one buffer and hands it to the
/// writer in a single `write_all`, so concurrent lines never interleave.
pub fn layer<S, W>(gate: &'static LevelGate, writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .event_format(LineFormat)
        .with_writer(writer)
        // Evaluated per event: the gate can change after callsites register.
        .with_filter(dynamic_filter_fn(move |metadata, _| {
            gate.allows(Severity::of(metadata.level()))
        }))
}

fn label(level: &Level) -> &'static str {
    match *level {
        Level::TRACE | Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARNING",
        Level::ERROR => "CRITICAL",
    }
}

/// Render the line prefix. Timestamps have second resolution only.
fn prefix(level: &Level, now: DateTime<Local>) -> String {
    format!("[{}] {},000: ", label(level), now.format("%Y-%m-%d %H:%M:%S"))
}

struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
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
        writer.write_str(&prefix(event.metadata().level(), Local::now()))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
