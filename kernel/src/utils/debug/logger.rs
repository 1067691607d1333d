/*
 * Kernel Logging System
 *
 * A `log`-facade backend that writes records to the debug serial sink.
 * Performs no heap allocation, so it is safe to call from allocator
 * and interrupt context, which the buddy/slab/kmalloc/vmem code does
 * on every exhaustion or integrity failure it logs before panicking.
 */

use core::fmt::Write;

use log::{Level, LevelFilter, Metadata, Record};

use super::serial::SerialWriter;

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(SerialWriter, "[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Installs the logger. Must run after `debug::init_debug_infrastructure`
/// and before any other subsystem logs a message.
pub fn init() {
    match log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Info)) {
        Ok(()) => log::info!("logger initialized"),
        Err(err) => panic!("failed to initialize logger: {}", err),
    }
}
