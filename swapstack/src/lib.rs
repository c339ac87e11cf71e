//! Swapstack provides the raw context switch used by cooperative workers.
//!
//! A [`Context`] is the saved execution point of something that is not running. The
//! primitive [`switch`] stores the caller's execution point into one context and resumes
//! another. It carries no payload. [`transfer`] is the same switch carrying a single
//! word, which is enough to stage data into a fresh stack one value at a time.
//!
//! Nothing here checks who is running where. Switching into a context that belongs to a
//! stack which was freed, or which is currently executing on another path of the same
//! thread, corrupts memory. Higher layers own those invariants.
//! ## Example
//! ```
//! use stackarena::*;
//! use swapstack::{transfer, Context};
//!
//! struct PingPong {
//!     main: Context,
//!     worker: Context,
//! }
//!
//! unsafe extern "C" fn add_one(mut value: usize, planted: usize) -> ! {
//!     let pair = &*(planted as *const PingPong);
//!     loop {
//!         value = transfer(value + 1, &pair.worker, &pair.main);
//!     }
//! }
//!
//! let arena = LocaleArena::new();
//! let region = arena.allocate_aligned(16 * page_size() + 2 * page_size(), page_size()).unwrap();
//! let stack = GuardedStack::new(region, 16 * page_size()).map_err(|(_, e)| e).unwrap();
//!
//! let pair = PingPong { main: Context::empty(), worker: Context::empty() };
//! let planted = &pair as *const PingPong as usize;
//! unsafe { pair.worker.prepare(&stack, 0, add_one, planted) };
//!
//! unsafe {
//!     assert_eq!(transfer(2, &pair.main, &pair.worker), 3);
//!     assert_eq!(transfer(127, &pair.main, &pair.worker), 128);
//! }
//! # arena.deallocate(stack.into_region().map_err(|(_, e)| e).unwrap()).unwrap();
//! ```

mod arch;

use std::cell::Cell;
use std::ptr;

use stackarena::Stack;

/// Entry point of a fresh stack.
///
/// It receives the word passed to the first [`transfer`] into the stack, and the word
/// planted by [`Context::prepare`]. It must never return, there is nothing to return to.
pub type Relay = unsafe extern "C" fn(value: usize, planted: usize) -> !;

/// Saved execution point of a suspended stack.
///
/// A context holds a stack pointer while its owner is suspended and is empty while the
/// owner runs (or before it was ever prepared or switched away from).
pub struct Context {
    sp: Cell<*mut usize>,
}

impl Context {
    /// A context with nothing saved in it, to be filled by switching away from the
    /// current stack.
    pub const fn empty() -> Self {
        Self {
            sp: Cell::new(ptr::null_mut()),
        }
    }

    /// Prepares `stack` so that the first switch into this context calls
    /// `relay(value, planted)` on it. The first frame starts `offset` bytes below the
    /// bottom of the stack.
    ///
    /// # Safety
    ///
    /// `stack` must stay mapped and writable until the relay stops running on it, and
    /// `offset` must leave room for the relay's frames.
    pub unsafe fn prepare<S: Stack>(&self, stack: &S, offset: usize, relay: Relay, planted: usize) {
        assert!(self.is_empty(), "prepare on a context that holds a suspended stack");
        self.sp.set(arch::init(stack, offset, relay, planted));
    }

    /// Returns the saved stack pointer, or null while the owner is running.
    pub fn stack_pointer(&self) -> *mut usize {
        self.sp.get()
    }

    pub fn is_empty(&self) -> bool {
        self.sp.get().is_null()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("sp", &self.sp.get())
            .finish()
    }
}

/// Saves the current execution point into `save_into` and resumes `resume`.
///
/// Returns once something switches back into `save_into`.
///
/// # Safety
///
/// `resume` must hold an execution point on a stack that is still alive, and nothing
/// else may resume `save_into` before this call saved into it.
#[inline(always)]
pub unsafe fn switch(save_into: &Context, resume: &Context) {
    transfer(0, save_into, resume);
}

/// Like [`switch`], but carries `value` across. The value becomes the return value of
/// the `transfer` that suspended `resume`, or the first argument of the relay if
/// `resume` was never started. Returns the value passed by whoever switches back.
///
/// # Safety
///
/// Same as [`switch`].
#[inline(always)]
pub unsafe fn transfer(value: usize, save_into: &Context, resume: &Context) -> usize {
    // Taking the pointer leaves `resume` empty while it runs, a second switch into it
    // is caught here instead of jumping into a live stack.
    let new_sp = resume.sp.replace(ptr::null_mut());
    assert!(
        !new_sp.is_null(),
        "switch into a context that is running or was never prepared"
    );
    arch::swap(value, save_into.sp.as_ptr(), new_sp)
}
