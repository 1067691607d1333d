/*
 * 8259 PIC End-of-Interrupt
 *
 * Trap dispatch step 6 ("send the PIC end-of-interrupt") is part of
 * the core's IRQ handling contract, so a thin wrapper lives here
 * rather than in the external bootstrap. Remapping IRQ0-15 onto
 * vectors 32-47 happens once at `init`, matching the vector layout
 * `idt` installs its gates against.
 */

use spin::Mutex;

use pic8259::ChainedPics;

pub const PIC1_OFFSET: u8 = 32;
pub const PIC2_OFFSET: u8 = PIC1_OFFSET + 8;

static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC1_OFFSET, PIC2_OFFSET) });

/// Remaps the PIC so IRQ0-15 land on vectors 32-47, where `idt::init`
/// installed their gates. Must run before interrupts are enabled.
pub fn init() {
    unsafe { PICS.lock().initialize() };
    log::info!("pic remapped: irq0-7 -> {}-{}, irq8-15 -> {}-{}", PIC1_OFFSET, PIC1_OFFSET + 7, PIC2_OFFSET, PIC2_OFFSET + 7);
}

/// Acknowledges the interrupt at `vector` so the PIC releases the line
/// and can deliver further IRQs of equal or lower priority.
pub fn end_of_interrupt(vector: u8) {
    unsafe { PICS.lock().notify_end_of_interrupt(vector) };
}
