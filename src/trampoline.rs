//! Bootstrap of a fresh worker stack.
//!
//! The context switch only carries a single word, but a worker needs four of them before
//! it can start: its parent, itself, the entry function and the entry argument. The
//! spawning side stages them one per switch, always in this order:
//!
//! 1. parent worker (the argument of the very first jump into the stack)
//! 2. self worker
//! 3. entry function
//! 4. entry argument
//!
//! After each delivery the relay switches straight back to the parent. After the fourth
//! it switches back once more and stays parked there, so a freshly spawned worker only
//! starts running `entry(arg)` when a scheduler switches it in. Changing the order on one
//! side without the other hands the wrong words to the wrong slots.

use std::any::Any;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;

use crate::fatal::{fatal, Fatal};
use crate::worker::{thread_exit, EntryFn, Worker};

/// Stages the four bootstrap words into `child`, which must have been prepared with
/// [`relay`] and `child` as the planted word. Returns with `child` parked right before
/// its entry call.
///
/// # Safety
///
/// `parent` must be the running worker and `child` a fresh worker nobody else switches
/// into until this returns.
pub(crate) unsafe fn bootstrap(
    parent: NonNull<Worker>,
    child: NonNull<Worker>,
    entry: EntryFn,
    arg: *mut (),
) {
    let deliveries = [
        parent.as_ptr() as usize,
        child.as_ptr() as usize,
        entry as usize,
        arg as usize,
    ];
    for word in deliveries.iter() {
        deliver(parent, child, *word);
    }
}

#[inline(always)]
unsafe fn deliver(parent: NonNull<Worker>, child: NonNull<Worker>, word: usize) {
    swapstack::transfer(word, &parent.as_ref().context, &child.as_ref().context);
}

/// Gives control back to `parent` and returns the next delivered word.
#[inline(always)]
unsafe fn hand_back(me: *mut Worker, parent: *mut Worker) -> usize {
    swapstack::transfer(0, &(*me).context, &(*parent).context)
}

/// First code to run on every worker stack.
pub(crate) unsafe extern "C" fn relay(parent: usize, planted: usize) -> ! {
    let me = planted as *mut Worker;
    let parent = parent as *mut Worker;

    let this = hand_back(me, parent);
    if this != planted {
        fatal(Fatal::IdentityMismatch {
            expected: planted,
            received: this,
        });
    }
    let entry: EntryFn = mem::transmute::<usize, EntryFn>(hand_back(me, parent));
    let arg = hand_back(me, parent) as *mut ();
    // Park until the first real switch-in.
    hand_back(me, parent);

    // Unwinding can't continue across the switch, stop it here.
    let value = match catch_unwind(AssertUnwindSafe(|| entry(arg))) {
        Ok(value) => value,
        Err(payload) => fatal(Fatal::Panicked {
            id: (*me).id(),
            message: panic_message(&*payload),
        }),
    };
    thread_exit(NonNull::new_unchecked(me), value)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
