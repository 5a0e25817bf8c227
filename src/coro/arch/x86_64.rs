//! x86_64 machine context.
//!
//! System V ABI: callee-saved registers only. A fresh coroutine receives its
//! frame pointer argument through `r15` and starts at the entry address
//! planted on its stack.

use std::arch::{asm, naked_asm};

/// Saved register state of a parked execution context.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct MachineContext {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

impl MachineContext {
    /// Builds the initial context for a fresh coroutine.
    ///
    /// `stack_top` must be 16-byte aligned. `entry` is entered via `ret`, so
    /// the stack is laid out as if `entry` had just been `call`ed: RSP ends
    /// up at 16n+8 as the ABI requires.
    pub fn for_entry(stack_top: usize, entry: usize, arg: u64) -> Self {
        let initial_rsp = stack_top - 16;
        unsafe {
            std::ptr::write(initial_rsp as *mut u64, entry as u64);
        }
        Self {
            rsp: initial_rsp as u64,
            r15: arg,
            ..Self::default()
        }
    }
}

/// Reads the argument planted in the callee-saved register by
/// [`MachineContext::for_entry`].
///
/// Must be the first thing the entry function does, before any call can
/// clobber the register.
pub fn entry_arg() -> u64 {
    let arg: u64;
    unsafe {
        asm!(
            "mov {}, r15",
            out(reg) arg,
            options(nomem, nostack, preserves_flags)
        );
    }
    arg
}

/// Saves the current register state into `old` and resumes `new`.
///
/// Returns when some other context switches back into `old`.
///
/// # Safety
/// Both pointers must be valid; `new` must hold either a state produced by a
/// previous switch or a fresh [`MachineContext::for_entry`] setup.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut MachineContext, _new: *const MachineContext) {
    naked_asm!(
        // Save callee-saved registers into old (rdi).
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // Restore from new (rsi).
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        // Fresh context: pops the planted entry address. Parked context:
        // returns into its pending context_switch call.
        "ret",
    );
}
