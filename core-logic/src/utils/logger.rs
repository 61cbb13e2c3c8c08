use anyhow::{Context, Result};
use chrono::Local;
use nu_ansi_term::{Color, Style};
use std::fmt;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
    EnvFilter, Layer,
};

/// Target used for per-task outcome lines. These are always shown on the
/// console, everything else follows the configured filter.
pub const TASK_RESULT_TARGET: &str = "task_result";

#[derive(Debug, Clone)]
pub struct LoggerOptions {
    /// Directory for hourly rolled log files. `None` disables the file layer.
    pub log_dir: Option<String>,
    pub file_prefix: String,
    /// Default directive for non task-result events, overridden by `RUST_LOG`.
    pub console_level: String,
    pub ansi: bool,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            log_dir: Some("logs".to_string()),
            file_prefix: "dispatch".to_string(),
            console_level: "warn".to_string(),
            ansi: true,
        }
    }
}

pub fn setup_logger(options: &LoggerOptions) -> Result<Option<WorkerGuard>> {
    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.console_level))
        .context("Invalid console log level")?
        .add_directive(
            format!("{}=info", TASK_RESULT_TARGET)
                .parse()
                .context("Invalid task_result directive")?,
        );

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(options.ansi)
        .event_format(TerminalFormatter {
            colored: options.ansi,
        })
        .with_filter(console_filter);

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir))?;
            let file_appender = tracing_appender::rolling::hourly(dir, &options.file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // File keeps task results plus warnings from everything else
            let file_filter = tracing_subscriber::filter::Targets::new()
                .with_target(TASK_RESULT_TARGET, tracing::Level::INFO)
                .with_default(tracing::Level::WARN);

            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(FileFormatter)
                .with_filter(file_filter);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    // Caller must keep the guard alive for the file writer to flush
    Ok(guard)
}

/// Console-only ERROR level output, for runs where the task lines are noise.
pub fn setup_quiet_logger() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::ERROR)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

// --- Formatters ---

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }
}

impl MessageVisitor {
    fn render(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

fn colorize(msg: String) -> String {
    const TAGS: [(&str, Color); 4] = [
        ("SUCCESS", Color::LightGreen),
        ("FAILED", Color::LightRed),
        ("RETRY", Color::LightYellow),
        ("BACKOFF", Color::LightCyan),
    ];

    for (tag, color) in TAGS {
        if msg.contains(tag) {
            let painted = Style::new().fg(color).bold().paint(tag).to_string();
            return msg.replace(tag, &painted);
        }
    }
    msg
}

pub struct TerminalFormatter {
    colored: bool,
}

impl<S, N> FormatEvent<S, N> for TerminalFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let msg = visitor.render();

        let msg = if self.colored { colorize(msg) } else { msg };
        writeln!(writer, "{}", msg)
    }
}

pub struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let level = event.metadata().level();

        write!(writer, "{} [{}] ", timestamp, level)?;

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        writeln!(writer, "{}", visitor.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colorize_leaves_plain_messages_alone() {
        assert_eq!(colorize("worker idle".to_string()), "worker idle");
    }

    #[test]
    fn test_colorize_paints_status_tag() {
        let out = colorize("[WK:001] SUCCESS transfer".to_string());
        assert!(out.contains("\u{1b}["));
        assert!(out.contains("transfer"));
    }
}
