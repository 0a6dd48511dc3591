//! aarch64 context switching.
//!
//! Saves the AAPCS64 callee-saved set (x19-x28, fp, lr, d8-d15) plus sp and
//! a resume point.

use std::arch::naked_asm;

/// Callee-saved register block. The assembly addresses fields by byte
/// offset; keep the layout in sync.
#[repr(C)]
#[derive(Default)]
pub struct Context {
    pub(crate) sp: u64,            // 0x00
    pub(crate) pc: u64,            // 0x08
    pub(crate) x19_x28: [u64; 10], // 0x10..0x58
    pub(crate) fp: u64,            // 0x60 (x29)
    pub(crate) lr: u64,            // 0x68 (x30)
    pub(crate) d8_d15: [u64; 8],   // 0x70..0xa8
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
    // sp must stay 16-byte aligned at all times on aarch64.
    let aligned_sp = (stack_top as usize) & !0xF;

    *ctx = Context::new();
    ctx.sp = aligned_sp as u64;
    ctx.pc = fiber_trampoline as usize as u64;
    ctx.x19_x28[0] = entry as u64; // x19
    ctx.x19_x28[1] = arg as u64; // x20
}

/// First frame of every fiber: calls the entry function with its argument,
/// then hands control to the terminal switch. Never returns.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "bl {finish}",
        "brk #1",
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
        // Save into old (x0)
        "mov x10, sp",
        "str x10, [x0, #0x00]",
        "adr x9, 1f",
        "str x9, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "stp x29, x30, [x0, #0x60]",
        "stp d8, d9, [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xa0]",
        // Load from new (x1)
        "ldr x10, [x1, #0x00]",
        "mov sp, x10",
        "ldr x9, [x1, #0x08]",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldp x29, x30, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xa0]",
        "br x9",
        // Resume point for the saved side; lr was restored above
        "1:",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_aligns_stack() {
        let mut ctx = Context::new();
        let fake_top = 0x7000_0000_1238usize as *mut u8;
        unsafe { init_context(&mut ctx, fake_top, 0x1000, 42) };
        assert_eq!(ctx.sp % 16, 0);
        assert_eq!(ctx.x19_x28[0], 0x1000);
        assert_eq!(ctx.x19_x28[1], 42);
        assert_ne!(ctx.pc, 0);
    }
}
