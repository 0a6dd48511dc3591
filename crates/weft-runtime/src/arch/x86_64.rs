//! x86_64 context switching.
//!
//! Voluntary switches only: the fiber gives up the CPU at a known point, so
//! saving the System V callee-saved set plus rsp/rip is sufficient.

use std::arch::naked_asm;

/// Callee-saved register block. Field order is fixed; the assembly below
/// addresses fields by byte offset.
#[repr(C)]
#[derive(Default)]
pub struct Context {
    pub(crate) rsp: u64, // 0x00
    pub(crate) rip: u64, // 0x08
    pub(crate) rbx: u64, // 0x10
    pub(crate) rbp: u64, // 0x18
    pub(crate) r12: u64, // 0x20
    pub(crate) r13: u64, // 0x28
    pub(crate) r14: u64, // 0x30
    pub(crate) r15: u64, // 0x38
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }
}

/// Arm a context so the first switch into it runs `entry(arg)` on the given
/// stack.
///
/// # Safety
///
/// `stack_top` must be the high end of a live, writable stack mapping and
/// `entry` a valid `extern "C" fn(usize)` address.
pub unsafe fn init_context(ctx: &mut Context, stack_top: *mut u8, entry: usize, arg: usize) {
    // 16-byte aligned before the trampoline's `call`, per the SysV ABI.
    let aligned_sp = (stack_top as usize) & !0xF;

    ctx.rsp = aligned_sp as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry as u64;
    ctx.r13 = arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First frame of every fiber: calls the entry function with its argument,
/// then hands control to the terminal switch. Never returns.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {finish}",
        "ud2",
        finish = sym crate::fiber::fiber_finish,
    );
}

/// Save the current execution point into `old`, resume `new`.
///
/// # Safety
///
/// Both pointers must reference valid `Context` blocks; `new` must hold
/// either an armed initial context or one previously saved here.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save callee-saved registers into old (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from new (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved side
        "1:",
        "ret",
    );
}
