use anyhow::Result;
use chrono::{DateTime, Local};
use log::{LevelFilter, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

// Logging and terminal helpers for the chatwire binary

/// Appends timestamped log lines to a file.
pub struct SimpleLogger {
    log_file: Mutex<File>,
}

impl SimpleLogger {
    pub fn new(log_file_path: &Path) -> Result<Self> {
        let log_file = OpenOptions::new().create(true).append(true).open(log_file_path)?;
        Ok(SimpleLogger {
            log_file: Mutex::new(log_file),
        })
    }
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now: DateTime<Local> = Local::now();
            // Source file and line make it easier to follow reconnect storms in the log
            let log_message = format!(
                "[{}] {} [{}:{}] {}\n",
                now.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            );

            if let Ok(mut file) = self.log_file.lock() {
                let _ = file.write_all(log_message.as_bytes());
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.log_file.lock() {
            let _ = file.flush();
        }
    }
}

/// Read a line of input from stdin, trimming whitespace
pub fn read_line() -> Result<String> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// Log to `log_file` when given, otherwise to stderr through env_logger (`RUST_LOG` wins).
pub fn setup_logging(log_file: Option<&Path>, level: LevelFilter) -> Result<()> {
    match log_file {
        Some(path) => {
            let logger = SimpleLogger::new(path)?;
            log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;
            log::info!("Logging to file: {}", path.display());
        }
        None => {
            env_logger::Builder::new()
                .filter_level(level)
                .parse_default_env()
                .try_init()?;
        }
    }

    log::info!("Logging initialized at level: {}", level);
    log::info!("{} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    Ok(())
}
