/*
 * Interrupt Descriptor Table and Trap Entry Stubs
 *
 * Installs gates for vectors 0-31 (CPU exceptions), 32-47 (IRQ0-15,
 * remapped by `pic::init`) and 0x80 (syscall), per the external
 * interfaces contract in the core spec. Every gate funnels into one of
 * two naked-asm common stubs that save the full register file in the
 * exact layout `process::Registers` expects, then hand a pointer to
 * that frame to `trap::dispatch`, which is the real L7 trap-dispatch
 * logic (exception-to-signal mapping, page-fault routing, scheduler
 * tick). This file only gets bytes onto the stack in the right shape;
 * it contains no policy.
 */

use core::mem::size_of;

use super::gdt::KERNEL_CODE_SELECTOR;

const IDT_ENTRIES: usize = 49; // 0-31 exceptions, 32-47 IRQs, plus one extra slot reserved
pub const SYSCALL_VECTOR: u8 = crate::config::SYSCALL_VECTOR;

#[repr(C, packed)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self { offset_low: 0, selector: 0, zero: 0, type_attr: 0, offset_high: 0 }
    }

    fn new(handler: u32, type_attr: u8) -> Self {
        Self {
            offset_low: (handler & 0xFFFF) as u16,
            selector: KERNEL_CODE_SELECTOR,
            zero: 0,
            type_attr,
            offset_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

const GATE_RING0: u8 = 0x8E; // present, DPL=0, 32-bit interrupt gate
const GATE_RING3: u8 = 0xEE; // present, DPL=3, so `int 0x80` is callable from user code

static mut IDT: [IdtEntry; 256] = {
    const MISSING: IdtEntry = IdtEntry::missing();
    [MISSING; 256]
};

/// Register layout a trap entry stub hands to `trap::dispatch`. Field
/// order mirrors `process::Registers` exactly for everything the CPU
/// or our stub actually pushes; `esp`/`ss` are only meaningful when
/// this trap interrupted ring 3 (see `RawFrame::user_esp`).
#[repr(C)]
pub struct RawFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Only pushed by the CPU, and only valid, when the trap crossed
    /// from ring 3 into ring 0 (`cs & 3 != 0` on entry is not what we
    /// test -- the *privilege change* is what adds these words; since
    /// this kernel's interrupt gates are always entered from whatever
    /// ring the interrupted code was in, `cs` here tells us which).
    pub user_esp: u32,
    pub user_ss: u32,
}

impl RawFrame {
    pub fn came_from_user(&self) -> bool {
        (self.cs & 0x3) == 3
    }
}

macro_rules! exception_stub {
    ($name:ident, $vector:expr, no_error_code) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() -> ! {
            core::arch::naked_asm!("push 0", "push {v}", "jmp {common}", v = const $vector, common = sym common_trap_entry)
        }
    };
    ($name:ident, $vector:expr, has_error_code) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() -> ! {
            core::arch::naked_asm!("push {v}", "jmp {common}", v = const $vector, common = sym common_trap_entry)
        }
    };
}

exception_stub!(isr_0, 0, no_error_code);
exception_stub!(isr_1, 1, no_error_code);
exception_stub!(isr_2, 2, no_error_code);
exception_stub!(isr_3, 3, no_error_code);
exception_stub!(isr_4, 4, no_error_code);
exception_stub!(isr_5, 5, no_error_code);
exception_stub!(isr_6, 6, no_error_code);
exception_stub!(isr_7, 7, no_error_code);
exception_stub!(isr_8, 8, has_error_code);
exception_stub!(isr_9, 9, no_error_code);
exception_stub!(isr_10, 10, has_error_code);
exception_stub!(isr_11, 11, has_error_code);
exception_stub!(isr_12, 12, has_error_code);
exception_stub!(isr_13, 13, has_error_code);
exception_stub!(isr_14, 14, has_error_code);
exception_stub!(isr_15, 15, no_error_code);
exception_stub!(isr_16, 16, no_error_code);
exception_stub!(isr_17, 17, has_error_code);
exception_stub!(isr_18, 18, no_error_code);
exception_stub!(isr_19, 19, no_error_code);
exception_stub!(isr_20, 20, no_error_code);
exception_stub!(isr_21, 21, has_error_code);
exception_stub!(isr_22, 22, no_error_code);
exception_stub!(isr_23, 23, no_error_code);
exception_stub!(isr_24, 24, no_error_code);
exception_stub!(isr_25, 25, no_error_code);
exception_stub!(isr_26, 26, no_error_code);
exception_stub!(isr_27, 27, no_error_code);
exception_stub!(isr_28, 28, no_error_code);
exception_stub!(isr_29, 29, no_error_code);
exception_stub!(isr_30, 30, has_error_code);
exception_stub!(isr_31, 31, no_error_code);

exception_stub!(irq_0, 32, no_error_code);
exception_stub!(irq_1, 33, no_error_code);
exception_stub!(irq_2, 34, no_error_code);
exception_stub!(irq_3, 35, no_error_code);
exception_stub!(irq_4, 36, no_error_code);
exception_stub!(irq_5, 37, no_error_code);
exception_stub!(irq_6, 38, no_error_code);
exception_stub!(irq_7, 39, no_error_code);
exception_stub!(irq_8, 40, no_error_code);
exception_stub!(irq_9, 41, no_error_code);
exception_stub!(irq_10, 42, no_error_code);
exception_stub!(irq_11, 43, no_error_code);
exception_stub!(irq_12, 44, no_error_code);
exception_stub!(irq_13, 45, no_error_code);
exception_stub!(irq_14, 46, no_error_code);
exception_stub!(irq_15, 47, no_error_code);

#[unsafe(naked)]
unsafe extern "C" fn isr_syscall() -> ! {
    core::arch::naked_asm!("push 0", "push {v}", "jmp {common}", v = const 0x80, common = sym common_trap_entry)
}

/// Shared epilogue/prologue for every vector: save the GP registers in
/// `RawFrame` order, call into `trap::dispatch` with a pointer to the
/// whole frame, then restore and `iretd`. Interrupts stay disabled for
/// the duration (the CPU already cleared IF on interrupt-gate entry);
/// `trap::dispatch` is the one place that may re-enable them
/// deliberately (it doesn't, today -- see trap.rs).
#[unsafe(naked)]
unsafe extern "C" fn common_trap_entry() -> ! {
    core::arch::naked_asm!(
        "push eax",
        "push ecx",
        "push edx",
        "push ebx",
        "push ebp",
        "push esi",
        "push edi",
        "mov ax, 0x10", // KERNEL_DATA_SELECTOR; restore known-good segments
        "mov ds, ax",
        "mov es, ax",
        "push esp",
        "call {dispatch}",
        "add esp, 4",
        "pop edi",
        "pop esi",
        "pop ebp",
        "pop ebx",
        "pop edx",
        "pop ecx",
        "pop eax",
        "add esp, 8", // discard vector, error_code
        "iretd",
        dispatch = sym trap_dispatch_trampoline,
    )
}

/// Bridges the naked stub's raw pointer into the safe `trap::dispatch`
/// entry point. `extern "C"` here only fixes the calling convention for
/// the `call` instruction above; this function itself is ordinary Rust.
unsafe extern "C" fn trap_dispatch_trampoline(frame: *mut RawFrame) {
    unsafe { crate::trap::dispatch(&mut *frame) };
}

fn stub_addr(f: unsafe extern "C" fn() -> !) -> u32 {
    f as u32
}

/// Builds the IDT, pointing every exception/IRQ/syscall vector at its
/// stub, and loads it with `lidt`. Must run after `gdt::init` (the
/// gates reference `KERNEL_CODE_SELECTOR`) and before `pic::init`
/// unmasks any IRQ line.
pub fn init() {
    macro_rules! set {
        ($vector:expr, $stub:expr, $attr:expr) => {
            unsafe {
                let entries = core::ptr::addr_of_mut!(IDT);
                (*entries)[$vector] = IdtEntry::new(stub_addr($stub), $attr);
            }
        };
    }

    set!(0, isr_0, GATE_RING0);
    set!(1, isr_1, GATE_RING0);
    set!(2, isr_2, GATE_RING0);
    set!(3, isr_3, GATE_RING0);
    set!(4, isr_4, GATE_RING0);
    set!(5, isr_5, GATE_RING0);
    set!(6, isr_6, GATE_RING0);
    set!(7, isr_7, GATE_RING0);
    set!(8, isr_8, GATE_RING0);
    set!(9, isr_9, GATE_RING0);
    set!(10, isr_10, GATE_RING0);
    set!(11, isr_11, GATE_RING0);
    set!(12, isr_12, GATE_RING0);
    set!(13, isr_13, GATE_RING0);
    set!(14, isr_14, GATE_RING0);
    set!(15, isr_15, GATE_RING0);
    set!(16, isr_16, GATE_RING0);
    set!(17, isr_17, GATE_RING0);
    set!(18, isr_18, GATE_RING0);
    set!(19, isr_19, GATE_RING0);
    set!(20, isr_20, GATE_RING0);
    set!(21, isr_21, GATE_RING0);
    set!(22, isr_22, GATE_RING0);
    set!(23, isr_23, GATE_RING0);
    set!(24, isr_24, GATE_RING0);
    set!(25, isr_25, GATE_RING0);
    set!(26, isr_26, GATE_RING0);
    set!(27, isr_27, GATE_RING0);
    set!(28, isr_28, GATE_RING0);
    set!(29, isr_29, GATE_RING0);
    set!(30, isr_30, GATE_RING0);
    set!(31, isr_31, GATE_RING0);

    set!(32, irq_0, GATE_RING0);
    set!(33, irq_1, GATE_RING0);
    set!(34, irq_2, GATE_RING0);
    set!(35, irq_3, GATE_RING0);
    set!(36, irq_4, GATE_RING0);
    set!(37, irq_5, GATE_RING0);
    set!(38, irq_6, GATE_RING0);
    set!(39, irq_7, GATE_RING0);
    set!(40, irq_8, GATE_RING0);
    set!(41, irq_9, GATE_RING0);
    set!(42, irq_10, GATE_RING0);
    set!(43, irq_11, GATE_RING0);
    set!(44, irq_12, GATE_RING0);
    set!(45, irq_13, GATE_RING0);
    set!(46, irq_14, GATE_RING0);
    set!(47, irq_15, GATE_RING0);

    unsafe {
        let entries = core::ptr::addr_of_mut!(IDT);
        (*entries)[SYSCALL_VECTOR as usize] = IdtEntry::new(stub_addr(isr_syscall), GATE_RING3);
    }

    let pointer = DescriptorTablePointer {
        limit: (size_of::<[IdtEntry; 256]>() - 1) as u16,
        base: core::ptr::addr_of!(IDT) as u32,
    };
    unsafe {
        core::arch::asm!("lidt [{0}]", in(reg) &pointer, options(nostack, preserves_flags));
    }

    log::info!("idt installed: exceptions 0-31, irq 32-47, syscall 0x{:02x}", SYSCALL_VECTOR);
}

const _: () = assert!(IDT_ENTRIES <= 256);
