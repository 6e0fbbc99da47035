use std::io::{self, Write};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::config::Verbosity;

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Writes every record as one line: diagnostics to stdout, warnings and errors to stderr.
///
/// Each line is flushed before returning, so nothing is left buffered when the process forks.
struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Nowhere left to report a failed diagnostic write.
        let _ = match record.level() {
            Level::Error | Level::Warn => {
                let stderr = io::stderr();
                let mut out = stderr.lock();
                writeln!(out, "{}: {}", record.level(), record.args()).and_then(|_| out.flush())
            }
            _ => {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                writeln!(out, "{}", record.args()).and_then(|_| out.flush())
            }
        };
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
    }
}

/// Install the console logger at [`LevelFilter::Info`].
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Info);
    Ok(())
}

/// Raise or lower the reported level once the configuration is known.
pub fn set_verbosity(verbosity: Verbosity) {
    log::set_max_level(verbosity.level_filter());
}
