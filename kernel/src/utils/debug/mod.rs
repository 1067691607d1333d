/*
 * Debugging and Logging Utilities
 *
 * Structured logging and a minimal debug-console sink. The actual
 * serial/VGA device driver is an external collaborator; this module
 * only assumes a raw debug port exists, exactly the way the rest of
 * this codebase treats devices as interfaces rather than full drivers.
 */

pub mod logger;
pub mod serial;

/// Initialize debug infrastructure (raw debug port for logging).
pub fn init_debug_infrastructure() {
    serial::init_debug_port();
}
