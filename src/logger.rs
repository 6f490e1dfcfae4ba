//! Logging setup for applications and tests driving the QP solver
//!
//! The solver itself only emits `tracing` events. This module installs a subscriber with
//! bracketed, timestamped output; per-iteration tables appear at DEBUG level.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with the standard configuration
///
/// Default log level: INFO (overrideable via RUST_LOG environment variable)
///
/// Format: `[LEVEL YYYY-MM-DD HH:MM:SS module]` for INFO/WARN/ERROR
///         `[LEVEL YYYY-MM-DD HH:MM:SS file:line]` for DEBUG/TRACE
///
/// # Example
/// ```no_run
/// use factor_qp::init_logger;
///
/// init_logger();
/// tracing::info!("Solving QP");
/// ```
///
/// # Environment Variables
/// Override the default log level using `RUST_LOG`:
/// ```bash
/// RUST_LOG=debug cargo test --test integration_tests
/// RUST_LOG=factor_qp::optimizer=debug cargo test
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// # Arguments
/// * `default_level` - The default log level (overrideable via RUST_LOG)
///
/// # Example
/// ```no_run
/// use factor_qp::init_logger_with_level;
/// use tracing::Level;
///
/// // Shows the per-iteration table of the active-set solver
/// init_logger_with_level(Level::DEBUG);
/// ```
pub fn init_logger_with_level(default_level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .event_format(BracketFormatter { colored: true })
        .init();
}

/// Install an uncolored subscriber writing through the test harness.
///
/// Safe to call from every test: only the first call installs a subscriber.
pub fn init_test_logger(default_level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .event_format(BracketFormatter { colored: false })
        .with_test_writer()
        .try_init();
}

fn env_filter(default_level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy()
}

/// Event formatter printing `[LEVEL timestamp location] message`
struct BracketFormatter {
    colored: bool,
}

impl BracketFormatter {
    fn level_label(&self, level: Level) -> &'static str {
        match (level, self.colored) {
            (Level::ERROR, true) => "\x1b[31mERROR\x1b[0m",
            (Level::WARN, true) => "\x1b[33mWARN\x1b[0m",
            (Level::INFO, true) => "\x1b[32mINFO\x1b[0m",
            (Level::DEBUG, true) => "\x1b[34mDEBUG\x1b[0m",
            (Level::TRACE, true) => "\x1b[35mTRACE\x1b[0m",
            (Level::ERROR, false) => "ERROR",
            (Level::WARN, false) => "WARN",
            (Level::INFO, false) => "INFO",
            (Level::DEBUG, false) => "DEBUG",
            (Level::TRACE, false) => "TRACE",
        }
    }
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for BracketFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        use chrono::Local;

        let metadata = event.metadata();
        let level = *metadata.level();

        write!(
            writer,
            "[{} {} ",
            self.level_label(level),
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;

        // DEBUG/TRACE lines point at file:line, the others at the module
        let verbose = level == Level::DEBUG || level == Level::TRACE;
        match (verbose, metadata.file()) {
            (true, Some(file)) => {
                let filename = file.rsplit('/').next().unwrap_or(file);
                write!(writer, "{filename}")?;
                if let Some(line) = metadata.line() {
                    write!(writer, ":{line}")?;
                }
            }
            _ => write!(writer, "{}", metadata.target())?,
        }

        write!(writer, "] ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
