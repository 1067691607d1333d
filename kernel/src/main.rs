/*
 * Kernel Entry Point
 *
 * The core's external interface is exactly one function:
 * `kernel_main(magic, boot_info_ptr)` (section 6). Everything above
 * that -- the Multiboot2 header bytes the loader scans for, the
 * early-boot stack switch, A20, GDT/IDT/PIC/PIT device programming --
 * is bootstrap, an external collaborator this core only hands control
 * back to in the one place it must (never, on this single-core
 * target: `kernel_main` does not return). The thin `_start` below is
 * that bootstrap glue, kept here only because this binary has nowhere
 * else to put the Multiboot2 header and the entry trampoline.
 */

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![feature(alloc_error_handler)]
#![allow(dead_code)]

extern crate alloc;

#[cfg(not(test))]
use core::panic::PanicInfo;

mod arch;
mod boot;
mod config;
mod memory;
mod process;
mod scheduler;
mod trap;
mod utils;

/// Multiboot2 header: magic, architecture (0 = i386 protected mode),
/// header length, checksum, followed by the mandatory end tag. Placed
/// in its own section so the linker script can keep it within the
/// first 8 KiB of the image, where every Multiboot2-compliant loader
/// scans for it. Compiled out for host test builds, which link against
/// the host's own `_start`/libtest harness instead of this one.
#[cfg(not(test))]
core::arch::global_asm!(
    r#"
    .section .multiboot_header, "a"
    .align 8
multiboot_header_start:
    .long 0xE85250D6
    .long 0
    .long (multiboot_header_end - multiboot_header_start)
    .long -(0xE85250D6 + 0 + (multiboot_header_end - multiboot_header_start))
    .align 8
    .word 0
    .word 0
    .long 8
multiboot_header_end:
    "#
);

#[cfg(not(test))]
#[repr(C, align(16))]
struct BootStack([u8; 32 * 1024]);

#[cfg(not(test))]
#[unsafe(no_mangle)]
static mut BOOT_STACK: BootStack = BootStack([0; 32 * 1024]);

/// Bootstrap entry point the Multiboot2 loader jumps to in 32-bit
/// protected mode with EAX = magic, EBX = boot-info pointer. Switches
/// onto this kernel's own stack (the loader's is not guaranteed to be
/// large enough) and falls straight into `kernel_main`, which never
/// returns.
#[cfg(not(test))]
#[unsafe(naked)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _start() -> ! {
    core::arch::naked_asm!(
        "lea esp, [{stack} + {stack_size}]",
        "push ebx", // boot_info_ptr
        "push eax", // magic
        "call {main}",
        "2:",
        "hlt",
        "jmp 2b",
        stack = sym BOOT_STACK,
        stack_size = const 32 * 1024,
        main = sym kernel_main,
    );
}

/// The core's actual entry point (section 6). Brings up every layer in
/// the dependency order section 2 lays out -- buddy, slab, kmalloc,
/// vmem, mem_space, then the trap tables and PIC remap, then the
/// scheduler -- and hands off to the idle loop once interrupts are
/// live. Never returns: once the scheduler is armed, control only
/// leaves this function through an interrupt.
#[cfg(not(test))]
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main(magic: u32, boot_info_ptr: u32) -> ! {
    utils::debug::init_debug_infrastructure();
    utils::debug::logger::init();
    log::info!("kernel starting");

    let boot_info = unsafe { boot::BootInfo::load(magic, boot_info_ptr) };

    let kernel_stack_top = core::ptr::addr_of!(BOOT_STACK) as u32 + 32 * 1024;
    arch::x86::gdt::init(kernel_stack_top);
    arch::x86::idt::init();
    arch::x86::pic::init();

    memory::init(&boot_info);

    {
        use alloc::vec::Vec;
        let mut probe: Vec<u32> = Vec::new();
        probe.push(0xC0FFEE);
        log::info!("kmalloc self-test: {:#x}", probe[0]);
    }

    log::info!("preemptive scheduler armed, enabling interrupts");
    utils::interrupts::enable();
    scheduler::enter_normal_mode();

    loop {
        utils::interrupts::without_interrupts(|| {
            if scheduler::current().is_none() {
                log::trace!("idle: no runnable process");
            }
        });
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    utils::interrupts::disable();
    if let Some(location) = info.location() {
        log::error!("PANIC at {}:{}: {}", location.file(), location.line(), info.message());
    } else {
        log::error!("PANIC: {}", info.message());
    }
    loop {
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}
