use anyhow::Context;
use camino::Utf8PathBuf;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        use LogFormat::*;
        match s {
            "plain" => Ok(Plain),
            "json" => Ok(Json),
            _ => anyhow::bail!("Unrecognized log format. Please specify 'plain' or 'json'."),
        }
    }
}

pub enum Output {
    Stdout,
    /// One file per day under `dir`, named `[<prefix>.]YYYY-MM-DD.log`.
    DailyFile {
        dir: Utf8PathBuf,
        prefix: Option<String>,
    },
}

/// Initializes the global tracing subscriber.
///
/// The returned guard must be held for the lifetime of the process when
/// logging to a file; dropping it flushes buffered log lines.
pub fn init(
    log_format: LogFormat,
    output: Output,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    // We fall back to printing all spans at info-level or above if
    // the RUST_LOG environment variable is not set.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (writer, guard) = match output {
        Output::Stdout => (BoxMakeWriter::new(std::io::stdout), None),
        Output::DailyFile { dir, prefix } => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {dir}"))?;
            let mut builder = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_suffix("log");
            if let Some(prefix) = prefix {
                builder = builder.filename_prefix(prefix);
            }
            let appender = builder
                .build(&dir)
                .with_context(|| format!("Failed to open a log file under {dir}"))?;
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer);

    let registry = tracing_subscriber::registry().with(env_filter);
    match log_format {
        LogFormat::Json => registry.with(fmt_layer.json()).init(),
        LogFormat::Plain => registry.with(fmt_layer).init(),
    }

    Ok(guard)
}

/// Replaces the default panic hook with one that reports the panic through
/// tracing before the process keeps unwinding, so panics end up in the log
/// file rather than only on stderr.
pub fn replace_panic_hook_with_tracing_panic_hook() {
    std::panic::set_hook(Box::new(tracing_panic_hook));
}

fn tracing_panic_hook(info: &std::panic::PanicInfo) {
    let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
        *s
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.as_str()
    } else {
        "Box<dyn Any>"
    };
    let location = info.location().map(|l| l.to_string());
    tracing::error!(
        location = location.as_deref().unwrap_or("<unknown>"),
        "panic: {payload}"
    );
}
