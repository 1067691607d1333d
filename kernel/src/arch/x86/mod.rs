/*
 * x86 (32-bit protected mode) Architecture Support
 *
 * Everything here is the thin sliver of GDT/IDT/PIC plumbing the core
 * contract itself requires: the TSS's ring-0 stack pointer (context
 * switch, section 4.6), the trap gates and vector table (trap
 * dispatch, section 4.7), and end-of-interrupt (section 4.7 step 6).
 * Full bootstrap concerns -- A20, PIT divisor programming, device PIC
 * remapping policy beyond "make IRQ0-15 land on vectors 32-47" -- stay
 * with the external bootstrap collaborator.
 */

pub mod gdt;
pub mod idt;
pub mod pic;
