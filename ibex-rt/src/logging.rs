//! Runtime logger.
//!
//! A thin `log::Log` implementation writing `[file:line] LEVEL: message`
//! lines to stderr. Installing it is optional; the runtime only ever talks
//! to the `log` facade.

use log::{LevelFilter, Metadata, Record};

/// Logger writing to stderr.
pub struct Logger;

static LOGGER: Logger = Logger;

/// Install the logger at the given maximum level.
///
/// Safe to call more than once; later calls only adjust the level.
pub fn init(max_level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(max_level);
}

impl log::Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "[{}:{}] {}: {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        // nothing
    }
}
