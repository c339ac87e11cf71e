//! The fatal diagnostic channel.
//!
//! Everything reported here means a core invariant of the stack or scheduling model is
//! already broken. The error is logged with all the context we have and the process
//! aborts. Nothing is ever returned to a caller.

use std::io;

use thiserror::Error;

use crate::worker::WorkerState;

#[derive(Debug, Error)]
pub enum Fatal {
    #[error("stack arena could not supply {size} bytes (alignment {alignment}): {source}")]
    ArenaExhausted {
        size: usize,
        alignment: usize,
        #[source]
        source: io::Error,
    },

    #[error("stack arena refused region {addr:#x} ({len} bytes): {source}")]
    ArenaRelease {
        addr: usize,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("{operation} failed for stack {range_start:#x}..{range_end:#x}: {source}; {hint}",
        hint = errno_hint(.source))]
    Protection {
        operation: &'static str,
        range_start: usize,
        range_end: usize,
        #[source]
        source: io::Error,
    },

    #[error("stack size {size} is not a positive whole number of {page} byte pages that fits with its guard pages")]
    StackSize { size: usize, page: usize },

    #[error("spawn called with parent worker {parent} but the scheduler is running worker {current}")]
    ParentMismatch { parent: u64, current: u64 },

    #[error("bootstrap of worker at {expected:#x} was handed self pointer {received:#x}")]
    IdentityMismatch { expected: usize, received: usize },

    #[error("destroy called on worker {id} in state {state:?}")]
    DestroyLive { id: u64, state: WorkerState },

    #[error("worker {id} can't move from {from:?} to {to:?}")]
    IllegalTransition {
        id: u64,
        from: WorkerState,
        to: WorkerState,
    },

    #[error("a master worker already exists on this core")]
    MasterExists,

    #[error("master destroyed while {live} spawned workers are still alive")]
    LiveWorkers { live: usize },

    #[error("worker {id} exited but has no scheduler to hand control to")]
    Orphaned { id: u64 },

    #[error("worker {id} was switched into after it exited")]
    ResumedAfterExit { id: u64 },

    #[error("worker {id} panicked: {message}")]
    Panicked { id: u64, message: String },

    #[error("{operation} can't be called on the master worker, it drives the run queue")]
    OnMaster { operation: &'static str },

    #[error("{operation} must run on the master worker, but worker {current} is running")]
    NotOnMaster {
        operation: &'static str,
        current: u64,
    },
}

fn errno_hint(err: &io::Error) -> &'static str {
    match err.raw_os_error() {
        #[cfg(unix)]
        Some(libc::EINVAL) => "EINVAL: address not valid or not a multiple of the page size",
        #[cfg(unix)]
        Some(libc::ENOMEM) => "ENOMEM: kernel structures could not be allocated or range not mapped",
        _ => "unrecognized error",
    }
}

/// Reports `error` and aborts the process.
#[cold]
#[inline(never)]
pub fn fatal(error: Fatal) -> ! {
    tracing::error!(target: "fiberloom::fatal", %error, "unrecoverable worker runtime failure");
    eprintln!("fiberloom: fatal: {}", error);
    std::process::abort()
}
