use std::arch::asm;

use stackarena::Stack;

use super::{aligned_start, push};
use crate::Relay;

pub unsafe fn init<S: Stack>(stack: &S, offset: usize, relay: Relay, planted: usize) -> *mut usize {
    let mut sp = aligned_start(stack.bottom(), offset);
    // x29 / x9 pair
    sp = push(sp, relay as usize);
    sp = push(sp, 0);
    // x19 / padding pair
    sp = push(sp, 0);
    sp = push(sp, planted);
    sp
}

#[inline(always)]
pub unsafe fn swap(arg: usize, save: *mut *mut usize, new_sp: *mut usize) -> usize {
    let ret_val: usize;

    asm!(
        "adr x9, 2f",
        "stp x29, x9, [sp, #-16]!",
        "str x19, [sp, #-16]!",
        "mov x10, sp",
        "str x10, [x1]",
        "mov sp, x2",
        "ldr x19, [sp], #16",
        "ldp x29, x9, [sp], #16",
        "mov x1, x19",
        "br x9",
        "2:",

        inout("x0") arg => ret_val,
        in("x1") save,
        in("x2") new_sp,

        out("x20") _, out("x21") _, out("x22") _, out("x23") _,
        out("x24") _, out("x25") _, out("x26") _, out("x27") _,
        out("x28") _,

        out("v8") _, out("v9") _, out("v10") _, out("v11") _,
        out("v12") _, out("v13") _, out("v14") _, out("v15") _,
        clobber_abi("C"),
    );

    ret_val
}
