/*
 * Trap Dispatch (L7)
 *
 * The one place exceptions and IRQs turn into scheduler/process/signal
 * actions. `arch::x86::idt`'s asm stubs are pure plumbing -- everything
 * here is the policy section 4.7 describes: the exception-to-signal
 * table, the GP+HLT "user process exits" decode, page-fault routing
 * into `mem_space::handle_page_fault`, and handing IRQ0 to the
 * scheduler tick.
 */

use x86::controlregs;

use crate::arch::x86::idt::RawFrame;
use crate::arch::x86::{gdt, pic};
use crate::memory::mem_space::FaultOutcome;
use crate::memory::VirtAddr;
use crate::process::{self, Registers};

pub const SIG_FPE: u8 = 8;
pub const SIG_ILL: u8 = 4;
pub const SIG_TRAP: u8 = 5;
pub const SIG_SEGV: u8 = 11;
pub const SIG_INT: u8 = 2;

const EXC_DIVIDE_ERROR: u32 = 0;
const EXC_DEBUG: u32 = 1;
const EXC_NMI: u32 = 2;
const EXC_BREAKPOINT: u32 = 3;
const EXC_OVERFLOW: u32 = 4;
const EXC_BOUND_RANGE: u32 = 5;
const EXC_INVALID_OPCODE: u32 = 6;
const EXC_DEVICE_NOT_AVAILABLE: u32 = 7;
const EXC_DOUBLE_FAULT: u32 = 8;
const EXC_INVALID_TSS: u32 = 10;
const EXC_SEGMENT_NOT_PRESENT: u32 = 11;
const EXC_STACK_SEGMENT: u32 = 12;
const EXC_GENERAL_PROTECTION: u32 = 13;
const EXC_PAGE_FAULT: u32 = 14;
const EXC_FPU: u32 = 16;
const EXC_ALIGNMENT_CHECK: u32 = 17;
const EXC_MACHINE_CHECK: u32 = 18;
const EXC_SIMD_FP: u32 = 19;

/// Maps each of the 32 CPU exception vectors to a signal, or `None` if
/// the exception has no signal mapping and is always fatal (NMI,
/// double fault, machine check, and every reserved vector the CPU
/// never actually raises on this architecture).
fn exception_signal(vector: u32) -> Option<u8> {
    match vector {
        EXC_DIVIDE_ERROR => Some(SIG_FPE),
        EXC_DEBUG => Some(SIG_TRAP),
        EXC_BREAKPOINT => Some(SIG_TRAP),
        EXC_OVERFLOW => Some(SIG_FPE),
        EXC_BOUND_RANGE => Some(SIG_FPE),
        EXC_INVALID_OPCODE => Some(SIG_ILL),
        EXC_DEVICE_NOT_AVAILABLE => Some(SIG_FPE),
        EXC_INVALID_TSS => Some(SIG_SEGV),
        EXC_SEGMENT_NOT_PRESENT => Some(SIG_SEGV),
        EXC_STACK_SEGMENT => Some(SIG_SEGV),
        EXC_GENERAL_PROTECTION => Some(SIG_SEGV),
        EXC_PAGE_FAULT => Some(SIG_SEGV),
        EXC_FPU => Some(SIG_FPE),
        EXC_ALIGNMENT_CHECK => Some(SIG_SEGV),
        EXC_SIMD_FP => Some(SIG_FPE),
        EXC_NMI | EXC_DOUBLE_FAULT | EXC_MACHINE_CHECK => None,
        _ => Some(SIG_INT),
    }
}

/// Pointer-type syscall hook. The calling convention and `syscalling`
/// bookkeeping are core; the actual syscall table (VFS, IPC, signal
/// control calls and the rest) is an external collaborator that
/// registers itself here once at boot.
pub type SyscallHandler = fn(&mut Registers) -> i32;

static mut SYSCALL_HANDLER: Option<SyscallHandler> = None;

pub fn set_syscall_handler(handler: SyscallHandler) {
    unsafe { SYSCALL_HANDLER = Some(handler) };
}

fn frame_to_registers(frame: &RawFrame) -> Registers {
    let (esp, ss) = if frame.came_from_user() {
        (frame.user_esp, frame.user_ss)
    } else {
        // No privilege change: the CPU didn't push esp/ss, so the
        // interrupted kernel stack pointer is whatever esp was right
        // after the hardware-pushed eflags -- i.e. immediately above
        // this RawFrame in memory.
        let esp = frame as *const RawFrame as u32 + core::mem::size_of::<RawFrame>() as u32 - 8;
        (esp, gdt::KERNEL_DATA_SELECTOR as u32)
    };
    Registers {
        edi: frame.edi,
        esi: frame.esi,
        ebp: frame.ebp,
        ebx: frame.ebx,
        edx: frame.edx,
        ecx: frame.ecx,
        eax: frame.eax,
        eip: frame.eip,
        cs: frame.cs,
        eflags: frame.eflags,
        esp,
        ss,
    }
}

fn registers_into_frame(regs: &Registers, frame: &mut RawFrame) {
    frame.edi = regs.edi;
    frame.esi = regs.esi;
    frame.ebp = regs.ebp;
    frame.ebx = regs.ebx;
    frame.edx = regs.edx;
    frame.ecx = regs.ecx;
    frame.eax = regs.eax;
    frame.eip = regs.eip;
    frame.cs = regs.cs;
    frame.eflags = regs.eflags;
    if frame.came_from_user() {
        frame.user_esp = regs.esp;
        frame.user_ss = regs.ss;
    }
}

/// True if the byte at the process's current EIP is `hlt` (0xF4): the
/// core's agreed "user process requests exit, status in EAX" protocol,
/// decoded out of a General Protection fault since ring 3 `hlt` always
/// traps there.
fn faulting_instruction_is_hlt(pid: process::Pid, eip: u32) -> bool {
    let mut byte = [0u8; 1];
    let read = process::with_process(pid, |p| p.mem_space.copy_from(VirtAddr(eip as usize), &mut byte));
    matches!(read, Some(Ok(()))) && byte[0] == 0xF4
}

/// The single entry point every trap stub in `idt.rs` calls.
pub fn dispatch(frame: &mut RawFrame) {
    let vector = frame.vector;

    if vector < 32 {
        dispatch_exception(vector, frame);
    } else if vector < 48 {
        dispatch_irq(vector, frame);
    } else if vector == crate::arch::x86::idt::SYSCALL_VECTOR as u32 {
        dispatch_syscall(frame);
    } else {
        panic!("trap: vector {} has no gate installed", vector);
    }
}

fn dispatch_exception(vector: u32, frame: &mut RawFrame) {
    let pid = crate::scheduler::current();

    let syscalling = pid.and_then(|p| process::with_process(p, |proc| proc.syscalling)).unwrap_or(false);
    let signal = exception_signal(vector);

    if pid.is_none() || signal.is_none() || (syscalling && vector != EXC_PAGE_FAULT) {
        panic!(
            "fatal exception {} (error_code={:#x}) at eip={:#010x} cs={:#06x} eflags={:#010x}, process={:?} syscalling={}",
            vector, frame.error_code, frame.eip, frame.cs, frame.eflags, pid, syscalling
        );
    }
    let pid = pid.unwrap();

    if vector == EXC_GENERAL_PROTECTION && faulting_instruction_is_hlt(pid, frame.eip) {
        let status = process::with_process(pid, |p| p.registers.eax as i32).unwrap_or(0);
        let _ = process::exit(pid, status);
        reschedule(frame);
        return;
    }

    if vector == EXC_PAGE_FAULT {
        let fault_addr = unsafe { controlregs::cr2() } as usize;
        let write = frame.error_code & 0x2 != 0;
        let present = frame.error_code & 0x1 != 0;
        let outcome = process::with_process_mut(pid, |p| p.mem_space.handle_page_fault(VirtAddr(fault_addr & !0xFFF), write, present)).unwrap_or(FaultOutcome::SegmentationFault);
        if outcome == FaultOutcome::Resolved {
            return;
        }
        let _ = process::deliver_signal(pid, SIG_SEGV);
        reschedule(frame);
        return;
    }

    let _ = process::deliver_signal(pid, signal.unwrap());
    reschedule(frame);
}

fn dispatch_irq(vector: u32, frame: &mut RawFrame) {
    let irq = (vector - 32) as u8;
    if irq == 0 {
        crate::utils::timer::on_timer_interrupt();
        let mut regs = frame_to_registers(frame);
        crate::scheduler::tick(&mut regs);
        registers_into_frame(&regs, frame);
    }
    pic::end_of_interrupt(vector as u8);
}

fn dispatch_syscall(frame: &mut RawFrame) {
    let mut regs = frame_to_registers(frame);
    if let Some(pid) = crate::scheduler::current() {
        process::with_process_mut(pid, |p| p.syscalling = true);
        if let Some(handler) = unsafe { SYSCALL_HANDLER } {
            regs.eax = handler(&mut regs) as u32;
        }
        process::with_process_mut(pid, |p| p.syscalling = false);
    }
    registers_into_frame(&regs, frame);
}

/// After a signal-causing or exit-causing event, give the scheduler a
/// chance to pick a different process immediately rather than waiting
/// for the next timer tick -- matches the "cancellation" contract: a
/// process can be removed from the run queue at any interrupt-return
/// boundary.
fn reschedule(frame: &mut RawFrame) {
    let mut regs = frame_to_registers(frame);
    crate::scheduler::yield_now(&mut regs);
    registers_into_frame(&regs, frame);
}
