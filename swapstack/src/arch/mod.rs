// All architectures expose the same two functions:
// * `init(stack, offset, relay, planted) -> *mut usize`
// * `swap(arg, save, new_sp) -> usize`
//
// ### init
// `init` writes a fake suspended frame at the bottom of a fresh stack, so that the stack
// looks exactly like one that was switched away from by `swap`. The frame is what `swap`
// pops when it resumes a context:
// ```
//      +                  +
//      |     .......      |   <- stack.bottom() - offset, rounded down to 16 bytes
//      +------------------+
//      |0 (fake return)   |   x86_64 only, keeps the ABI alignment at `relay` entry
//      +------------------+
//      |Relay ptr         |   popped into the jump register
//      +------------------+
//      |0 (frame ptr)     |   a zero frame pointer terminates backtraces
//      +------------------+
//      |Planted word      |   popped into rbx / x19, forwarded as `relay`'s 2nd argument
//      +------------------+   <- returned stack pointer
// ```
// The aarch64 frame has an extra padding word instead of the fake return address, because
// `stp`/`ldp` pairs must keep sp 16 byte aligned.
//
// ### swap
// `swap` is the whole context switch:
// 1. Push the continuation address, the frame pointer and rbx (x19 on aarch64). These are
//    the registers inline assembly can't list as clobbered. Every other register is
//    declared clobbered, so the compiler spills exactly what is live at the call site.
// 2. Store the resulting stack pointer into `*save`.
// 3. Load `new_sp` and pop the same three words from the other stack.
// 4. Copy the popped rbx/x19 into the 2nd argument register and jump.
//
// `arg` travels in the first argument register. If the other side was suspended in
// `swap` it is the return value of that `swap`. If the other side is a fresh stack set up
// by `init`, the jump lands at the start of `relay`, which receives `arg` and the planted
// word as its two arguments.

#[cfg(all(target_family = "unix", target_arch = "x86_64"))]
mod unix_x64;
#[cfg(all(target_family = "unix", target_arch = "x86_64"))]
pub use self::unix_x64::*;

#[cfg(all(target_family = "unix", target_arch = "aarch64"))]
mod unix_aarch64;
#[cfg(all(target_family = "unix", target_arch = "aarch64"))]
pub use self::unix_aarch64::*;

#[cfg(not(all(
    target_family = "unix",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
compile_error!("swapstack only supports x86_64 and aarch64 unix targets");

/// Rounds the starting point of a fresh stack down to the 16 byte ABI alignment.
#[inline(always)]
fn aligned_start(bottom: *mut usize, offset: usize) -> *mut usize {
    ((bottom as usize - offset) & !15) as *mut usize
}

#[inline(always)]
unsafe fn push(mut sp: *mut usize, val: usize) -> *mut usize {
    sp = sp.offset(-1);
    *sp = val;
    sp
}
