//! Fiberloom runs many cooperative workers on one OS thread per core.
//!
//! Each worker gets its own stack from a [`stackarena`] arena, bracketed by guard pages,
//! and control moves between workers with the raw switch from [`swapstack`]. A worker
//! only gives up the core when it yields, parks or exits.
//!
//! The pieces:
//! - [`lifecycle::Lifecycle`] owns the memory of one core: it turns the calling thread
//!   into the master worker, creates workers and destroys finished ones.
//! - [`scheduler::Scheduler`] is what the core needs from a scheduler, and
//!   [`scheduler::FifoScheduler`] is a minimal one that runs workers in order.
//! - [`registry::Registry`] lists all live workers for debugging.
//!
//! Broken invariants (a switch into a dead worker, an illegal state change, stack memory
//! that can't be protected) are never returned as errors. They are reported through
//! [`fatal`] and abort the process.
//!
//! ## Example
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! use fiberloom::{Config, FifoScheduler};
//!
//! let scheduler = FifoScheduler::from_config(Config::default()).unwrap();
//! let trail = Rc::new(Cell::new(0));
//!
//! for _ in 0..2 {
//!     let trail = trail.clone();
//!     scheduler.spawn_closure(move |cx| {
//!         trail.set(trail.get() + 1);
//!         cx.yield_now();
//!         trail.set(trail.get() + 10);
//!     });
//! }
//! scheduler.run();
//!
//! assert_eq!(trail.get(), 22);
//! assert_eq!(scheduler.lifecycle().live_workers(), 0);
//! ```

pub mod config;
pub mod debug_tools;
pub mod fatal;
pub mod lifecycle;
pub mod registry;
pub mod scheduler;
mod trampoline;
pub mod worker;

pub use config::{Config, ConfigError};
pub use debug_tools::{NoRegistrar, StackRegistrar, ToolStackId};
pub use fatal::{fatal, Fatal};
pub use lifecycle::Lifecycle;
pub use registry::{Registry, WorkerInfo};
pub use scheduler::{FifoScheduler, Scheduler, WorkerCx};
pub use worker::{switch_context, thread_exit, EntryFn, Worker, WorkerState, MASTER_ID};
