//! Console logger that writes log records to stderr.

use std::io::Write as _;

use log::LevelFilter;
use spin::{Mutex, Once};

pub struct Console {
    stderr: Mutex<std::io::Stderr>,
}

static DEFAULT: Once<Console> = Once::new();

impl Console {
    /// Installs the console as the global logger, showing records up to `level`.
    pub fn init(level: LevelFilter) -> &'static Self {
        let console = Self::default();
        console.install(level);
        console
    }

    pub fn default() -> &'static Self {
        DEFAULT.call_once(|| Console {
            stderr: Mutex::new(std::io::stderr()),
        })
    }

    pub fn install(&'static self, level: LevelFilter) {
        // Only the first logger wins; a second install just adjusts the level.
        let _ = log::set_logger(self);
        log::set_max_level(level);
    }
}

impl log::Log for Console {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut line = String::new();
        if write_log_entry_to(&mut line, record).is_ok() {
            let _ = self.stderr.lock().write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        let _ = self.stderr.lock().flush();
    }
}

fn write_log_entry_to(
    writer: &mut impl core::fmt::Write,
    record: &log::Record,
) -> core::fmt::Result {
    #[cfg(any(debug_assertions, feature = "detailed-logging"))]
    return writeln!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(any(debug_assertions, feature = "detailed-logging")))]
    return writeln!(writer, "[{:5}] {}", record.level(), record.args());
}
