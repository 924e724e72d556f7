use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::utils::redact::{RedactingMakeWriter, Redactor};

pub const TIMING_TARGET: &str = "bot.timing";

pub struct LoggingGuards {
    _file_guard: WorkerGuard,
    _json_file_guard: WorkerGuard,
    _timing_guard: WorkerGuard,
}

pub fn parse_log_level(value: &str) -> LevelFilter {
    match value.trim().to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

fn general_targets(level: LevelFilter) -> Targets {
    Targets::new()
        .with_default(level)
        .with_target(TIMING_TARGET, LevelFilter::OFF)
        .with_target("hyper", LevelFilter::WARN)
        .with_target("hyper_util", LevelFilter::WARN)
        .with_target("reqwest", LevelFilter::WARN)
}

/// Runs `f` with a plain stderr subscriber, for work done before the real
/// writers can be set up (loading the config that configures them).
pub fn with_bootstrap_logging<T>(f: impl FnOnce() -> T) -> T {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(LevelFilter::INFO)
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}

/// Installs stdout plus daily-rolling `logs/bot.log`, `logs/bot.jsonl` and
/// `logs/timing.log` writers. Every line passes through `redactor`. Keep the
/// returned guards alive for the whole process or buffered lines are lost.
pub fn init_logging(log_level: &str, redactor: Redactor) -> LoggingGuards {
    let logs_dir = Path::new("logs");
    if let Err(err) = fs::create_dir_all(logs_dir) {
        eprintln!("Failed to create logs directory: {err}");
    }

    let file_appender = tracing_appender::rolling::daily(logs_dir, "bot.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let json_file_appender = tracing_appender::rolling::daily(logs_dir, "bot.jsonl");
    let (json_file_writer, json_file_guard) = tracing_appender::non_blocking(json_file_appender);

    let timing_appender = tracing_appender::rolling::daily(logs_dir, "timing.log");
    let (timing_writer, timing_guard) = tracing_appender::non_blocking(timing_appender);

    let general_filter = general_targets(parse_log_level(log_level));
    let timing_filter = Targets::new()
        .with_default(LevelFilter::OFF)
        .with_target(TIMING_TARGET, LevelFilter::INFO);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(RedactingMakeWriter::new(std::io::stdout, redactor.clone()))
        .with_filter(general_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(RedactingMakeWriter::new(file_writer, redactor.clone()))
        .with_ansi(false)
        .with_filter(general_filter.clone());
    let json_file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(RedactingMakeWriter::new(json_file_writer, redactor.clone()))
        .with_filter(general_filter);
    let timing_layer = tracing_subscriber::fmt::layer()
        .with_writer(RedactingMakeWriter::new(timing_writer, redactor))
        .with_ansi(false)
        .with_filter(timing_filter);

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .with(json_file_layer)
        .with(timing_layer)
        .init();

    LoggingGuards {
        _file_guard: file_guard,
        _json_file_guard: json_file_guard,
        _timing_guard: timing_guard,
    }
}
