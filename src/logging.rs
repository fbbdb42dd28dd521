/**
 * @module logging
 * @description Custom logging configuration for clean console output
 *
 * Replay runs emit a steady stream of per-transaction INFO/DEBUG lines, so
 * the formatter keeps those to `LEVEL: message`. Faults are rare and always
 * investigated after the fact, so WARN and ERROR additionally carry the
 * module target and file:line of their origin.
 *
 * The driver loop is deliberately span-free (one thread, one transaction at
 * a time, the xid is part of every message that needs it), so the formatter
 * does not render span context at all.
 *
 * ## Emoji Convention for Permanent Logs
 *
 * The codebase uses emojis to distinguish permanent production logs from
 * temporary debugging logs. This convention applies to INFO, DEBUG, and
 * TRACE levels:
 * - Logs with emojis (🐘, 📦, ✅, etc.) are intended for production
 * - Logs without emojis are typically temporary debugging aids
 * - ERROR and WARN logs are always kept regardless of emoji usage
 *
 * Example output:
 * ```text
 * ERROR tributary::load src/load/mod.rs:98: Permanent target fault: duplicate key value
 * WARN  tributary::extract src/extract/mod.rs:231: Skipping malformed operation record
 * INFO: 📦 Extract complete: 122 tx emitted
 * ```
 */

use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Terse event formatter: bare `LEVEL: message` lines, except WARN and
/// ERROR, which name their origin
pub struct PipelineLogFormat;

impl<S, N> FormatEvent<S, N> for PipelineLogFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        match *meta.level() {
            Level::ERROR | Level::WARN => {
                write!(writer, "{} {}", meta.level(), meta.target())?;
                if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
                    write!(writer, " {file}:{line}")?;
                }
                write!(writer, ": ")?;
            }
            level => write!(writer, "{level}: ")?,
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Build the base env filter with noisy dependencies turned down
pub fn create_base_env_filter(default_level: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level))
        // sled chats at debug constantly
        .add_directive("sled=warn".parse().unwrap())
        .add_directive("pagecache=warn".parse().unwrap())
        // tokio-postgres logs every query at trace
        .add_directive("tokio_postgres=info".parse().unwrap())
}

/// Initialize the tracing subscriber with custom formatting
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(create_base_env_filter("info"))
        .event_format(PipelineLogFormat)
        .init();
}
