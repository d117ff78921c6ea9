//! Tracing setup for the daemon.
//!
//! Call [`init_journald_or_stdout`] once at startup. Everything else only
//! needs `use crate::tracing::prelude::*` for the logging macros.
//!
//! On stdout each event is a single line:
//!
//! ```text
//! 14:02:17 INFO  controller: Status host=10.0.0.21 temp=74 freq=600 uptime=3605 hr=13.54 TH/s h5=13.61 TH/s hw=0.0012%
//! ```
//!
//! One line per event keeps per-tick status output greppable by host.

use std::env;
use std::io::IsTerminal;

use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

const CRATE_PREFIX: &str = "antminer_autotune::";

/// Log to journald when started by systemd, otherwise to stdout.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => tracing_subscriber::registry()
                .with(env_filter())
                .with(layer)
                .init(),
            Err(e) => {
                use_stdout();
                error!(error = %e, "Failed to initialize journald logging, using stdout");
            }
        }
    } else {
        use_stdout();
    }
}

// RUST_LOG filtering, defaulting to INFO rather than tracing's ERROR.
fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

fn use_stdout() {
    let formatter = LineFormatter {
        color: std::io::stdout().is_terminal(),
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().event_format(formatter))
        .init();
}

/// Event formatter producing `time level target: message key=value ...`.
struct LineFormatter {
    color: bool,
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldCollector {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let formatted = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(formatted);
        } else {
            self.fields.push((field.name(), formatted));
        }
    }
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for LineFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;

        let level = *event.metadata().level();
        let (color, label) = match level {
            tracing::Level::ERROR => ("\x1b[31m", "ERROR"),
            tracing::Level::WARN => ("\x1b[33m", "WARN "),
            tracing::Level::INFO => ("\x1b[32m", "INFO "),
            tracing::Level::DEBUG => ("\x1b[34m", "DEBUG"),
            tracing::Level::TRACE => ("\x1b[35m", "TRACE"),
        };
        if self.color {
            write!(writer, " {color}{label}\x1b[0m ")?;
        } else {
            write!(writer, " {label} ")?;
        }

        let target = event.metadata().target();
        let target = target.strip_prefix(CRATE_PREFIX).unwrap_or(target);
        write!(writer, "{target}: ")?;

        if let Some(message) = &visitor.message {
            write!(writer, "{message}")?;
        }
        for (key, value) in &visitor.fields {
            write!(writer, " {key}={value}")?;
        }

        writeln!(writer)
    }
}

// Local time to the second; the default timer is UTC with full precision.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{formatted}")
    }
}
