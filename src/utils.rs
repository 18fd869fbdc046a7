use anyhow::Result;
use chrono::{DateTime, Local};
use log::{LevelFilter, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

// Logging helpers for the demo binary: a file logger with source locations,
// falling back to env_logger on stderr when no log file is requested.

pub struct FileLogger {
    log_file: Mutex<File>,
}

impl FileLogger {
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(FileLogger {
            log_file: Mutex::new(file),
        })
    }
}

impl log::Log for FileLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now: DateTime<Local> = Local::now();
            let line = format!(
                "[{}] {} [{}:{}] {}\n",
                now.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            );
            let mut file = self.log_file.lock().unwrap_or_else(|e| e.into_inner());
            let _ = file.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        let mut file = self.log_file.lock().unwrap_or_else(|e| e.into_inner());
        let _ = file.flush();
    }
}

pub fn setup_logging(log_file: Option<&Path>, level: LevelFilter) -> Result<()> {
    match log_file {
        Some(path) => {
            let logger = FileLogger::new(path)?;
            log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;
            log::info!("Logging to file: {}", path.display());
        }
        None => {
            env_logger::Builder::from_default_env()
                .filter_level(level)
                .try_init()?;
        }
    }

    log::info!("Logging initialized at level: {}", level);
    log::info!("{} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    Ok(())
}
