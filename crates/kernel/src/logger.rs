//! Kernel logger.
//!
//! Implements the `log::Log` facade over a pluggable line sink so the
//! embedding environment decides where diagnostics go (serial console
//! on hardware, capture buffers in tests).

use eos_utils::Once;
use log::{Level, LevelFilter, Metadata, Record};

static SINK: Once<fn(&str)> = Once::new();
static LOGGER: SimpleLogger = SimpleLogger;

struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = SINK.get() {
            sink(&alloc::format!("[{}] {}", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

/// Install the logger with the given level cap and line sink.
pub fn init(max_level: LevelFilter, sink: fn(&str)) -> Result<(), log::SetLoggerError> {
    SINK.call_once(|| sink);
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}
