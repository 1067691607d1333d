/*
 * Minimal Debug Port Sink
 *
 * A raw COM1 byte writer used only as the logger's transport. Full
 * serial-port driving (baud negotiation, interrupts, flow control) is
 * an external collaborator's concern; the core only needs "write a
 * byte out for debugging" to exist.
 */

use spin::Mutex;
use x86::io::{inb, outb};

const COM1: u16 = 0x3F8;

struct DebugPort {
    initialized: bool,
}

impl DebugPort {
    const fn new() -> Self {
        Self { initialized: false }
    }

    fn init(&mut self) {
        unsafe {
            outb(COM1 + 1, 0x00); // disable interrupts
            outb(COM1 + 3, 0x80); // enable DLAB
            outb(COM1, 0x03); // divisor low byte: 38400 baud
            outb(COM1 + 1, 0x00); // divisor high byte
            outb(COM1 + 3, 0x03); // 8 bits, no parity, one stop bit
            outb(COM1 + 2, 0xC7); // enable FIFO, clear, 14-byte threshold
            outb(COM1 + 4, 0x0B); // IRQs disabled, RTS/DSR set
        }
        self.initialized = true;
    }

    fn write_byte(&self, byte: u8) {
        if !self.initialized {
            return;
        }
        unsafe {
            while inb(COM1 + 5) & 0x20 == 0 {}
            outb(COM1, byte);
        }
    }
}

static DEBUG_PORT: Mutex<DebugPort> = Mutex::new(DebugPort::new());

pub fn init_debug_port() {
    DEBUG_PORT.lock().init();
}

pub fn write_bytes(bytes: &[u8]) {
    let port = DEBUG_PORT.lock();
    for &b in bytes {
        if b == b'\n' {
            port.write_byte(b'\r');
        }
        port.write_byte(b);
    }
}

pub struct SerialWriter;

impl core::fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        write_bytes(s.as_bytes());
        Ok(())
    }
}
