use chrono::Local;
use log::{LevelFilter, Metadata, Record, SetLoggerError};
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// Writes records to stderr and, when a sink is attached, forwards them to the UI.
pub struct EventLogger {
    level: LevelFilter,
    sink: Option<mpsc::UnboundedSender<LogMessage>>,
}

impl EventLogger {
    pub fn new(level: LevelFilter, sink: Option<mpsc::UnboundedSender<LogMessage>>) -> Self {
        Self { level, sink }
    }

    fn forward(&self, record: &Record) {
        let Some(sink) = &self.sink else { return };
        let log_message = LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };

        if sink.send(log_message).is_err() {
            eprintln!("Log sink closed, dropping record");
        }
    }
}

impl log::Log for EventLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
            self.forward(record);
        }
    }

    fn flush(&self) {}
}

/// Installs the global logger. With a UI sink that is an [`EventLogger`];
/// without one, plain env_logger (which also honours `RUST_LOG`).
/// Fails if a logger is already installed.
pub fn init(level: LevelFilter, sink: Option<mpsc::UnboundedSender<LogMessage>>) -> Result<(), SetLoggerError> {
    match sink {
        Some(sink) => log::set_boxed_logger(Box::new(EventLogger::new(level, Some(sink))))
            .map(|()| log::set_max_level(level)),
        None => env_logger::builder().filter_level(level).parse_default_env().try_init(),
    }
}

/// Max level for the given config string, defaulting to info
pub fn parse_level(level: &str) -> LevelFilter {
    level.parse().unwrap_or(LevelFilter::Info)
}
