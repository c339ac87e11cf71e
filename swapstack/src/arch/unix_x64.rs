use std::arch::asm;

use stackarena::Stack;

use super::{aligned_start, push};
use crate::Relay;

pub unsafe fn init<S: Stack>(stack: &S, offset: usize, relay: Relay, planted: usize) -> *mut usize {
    let mut sp = aligned_start(stack.bottom(), offset);
    // Fake return address. `relay` is entered with a jump, the slot makes rsp look like a
    // call just happened (rsp + 8 is 16 byte aligned).
    sp = push(sp, 0);
    sp = push(sp, relay as usize);
    // rbp
    sp = push(sp, 0);
    // rbx, becomes rsi
    sp = push(sp, planted);
    sp
}

/// Swap between two stacks.
/// `new_sp` is the stack we are jumping to. This stack needs to have at the top:
/// 1. The saved rbx
/// 2. Stack frame pointer
/// 3. Pointer to the next instruction to execute on the new stack
/// If the pointer points to an `extern "C"` function then `arg` is forwarded to it through
/// the `rdi` register and the restored rbx through `rsi`.
///
/// The current stack pointer is written to `save` after the same three values were pushed
/// onto the current stack. When something swaps back to it, the `arg` of that swap is
/// returned.
#[inline(always)]
pub unsafe fn swap(arg: usize, save: *mut *mut usize, new_sp: *mut usize) -> usize {
    let ret_val: usize;

    asm!(
        // Save the continuation spot after we jump back here to be after this asm block.
        "lea rax, [rip + 2f]",
        "push rax",
        // rbp and rbx can't be marked as clobbered, preserve them by hand.
        "push rbp",
        "push rbx",
        "mov [rcx], rsp",
        // Change the stack pointer to the passed value.
        "mov rsp, rdx",
        "pop rbx",
        "pop rbp",
        // Get the next instruction to jump to.
        "pop rax",
        // Only meaningful on the first jump into a stack prepared by `init`.
        "mov rsi, rbx",
        // Doing a pop & jmp instad of a ret helps us here with branch prediction.
        "jmp rax",
        "2:",
        in("rcx") save,
        in("rdx") new_sp,
        inout("rdi") arg => ret_val, // 1st argument to called function
        // The other side can use any register, the compiler will only save the ones it
        // actually needs around this block.
        out("r12") _, out("r13") _, out("r14") _, out("r15") _,
        clobber_abi("C"),
    );

    ret_val
}
