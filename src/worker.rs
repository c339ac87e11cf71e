use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Range;
use std::ptr::{self, NonNull};

use stackarena::GuardedStack;
use swapstack::Context;

use crate::debug_tools::ToolStackId;
use crate::fatal::{fatal, Fatal};
use crate::scheduler::Scheduler;

/// Entry point of a worker. The returned pointer becomes the worker's exit value.
pub type EntryFn = fn(arg: *mut ()) -> *mut ();

/// Id reserved for the master worker of every core.
pub const MASTER_ID: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Stack allocated, the bootstrap hasn't been unwound by a first switch-in yet.
    Unborn,
    /// Currently executing on its core.
    Running,
    /// Yielded and waiting in a run queue.
    Suspended,
    /// Parked, only an explicit wake makes it runnable again.
    Idle,
    /// Exited, waiting to be destroyed.
    Done,
}

impl WorkerState {
    /// Returns true if a worker in this state may move to `next`.
    ///
    /// A parked worker is woken into `Suspended` and runs from there like any other
    /// yielded worker.
    pub fn can_become(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Unborn, Running)
                | (Running, Suspended)
                | (Suspended, Running)
                | (Running, Idle)
                | (Idle, Suspended)
                | (Running, Done)
        )
    }
}

/// The control block of one worker.
///
/// Workers are reached through raw pointers from several stacks of the same thread (the
/// scheduler, the worker itself, the registry), so every mutable field is a `Cell`.
/// A worker is never shared between threads.
pub struct Worker {
    id: Cell<u64>,
    state: Cell<WorkerState>,
    pub(crate) context: Context,
    pub(crate) stack: RefCell<Option<GuardedStack>>,
    stack_size: usize,
    scheduler: Cell<Option<NonNull<dyn Scheduler>>>,
    run_queue_next: Cell<*mut Worker>,
    exit_value: Cell<*mut ()>,
    pub(crate) registry_prev: Cell<*mut Worker>,
    pub(crate) registry_next: Cell<*mut Worker>,
    pub(crate) tool_id: Cell<Option<ToolStackId>>,
}

impl Worker {
    pub(crate) fn unborn(stack_size: usize) -> Self {
        Self {
            id: Cell::new(MASTER_ID),
            state: Cell::new(WorkerState::Unborn),
            context: Context::empty(),
            stack: RefCell::new(None),
            stack_size,
            scheduler: Cell::new(None),
            run_queue_next: Cell::new(ptr::null_mut()),
            exit_value: Cell::new(ptr::null_mut()),
            registry_prev: Cell::new(ptr::null_mut()),
            registry_next: Cell::new(ptr::null_mut()),
            tool_id: Cell::new(None),
        }
    }

    /// The master runs on the thread's own stack, so there is nothing to allocate.
    pub(crate) fn master() -> Self {
        let master = Self::unborn(0);
        master.state.set(WorkerState::Running);
        master
    }

    pub fn id(&self) -> u64 {
        self.id.get()
    }

    /// Records the id picked by the scheduler.
    pub fn assign_id(&self, id: u64) {
        self.id.set(id);
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// Moves the worker to `next`. Illegal transitions are fatal.
    ///
    /// # Safety
    ///
    /// The state tells the scheduler whether the worker may be switched into or
    /// destroyed. The caller must make the move only when it matches what the worker
    /// is actually doing: `Running` right before switching into it, `Suspended` or
    /// `Idle` right before it switches away, `Done` only from [`thread_exit`].
    ///
    /// ```compile_fail,E0133
    /// use fiberloom::{Config, FifoScheduler, WorkerState};
    ///
    /// let scheduler = FifoScheduler::from_config(Config::default()).unwrap();
    /// let master = unsafe { scheduler.master().as_ref() };
    /// master.transition(WorkerState::Idle);
    /// ```
    pub unsafe fn transition(&self, next: WorkerState) {
        let current = self.state.get();
        if !current.can_become(next) {
            fatal(Fatal::IllegalTransition {
                id: self.id(),
                from: current,
                to: next,
            });
        }
        self.state.set(next);
    }

    pub fn is_master(&self) -> bool {
        self.id() == MASTER_ID && self.stack_size == 0
    }

    /// Usable stack bytes, excluding guard pages. Zero for the master.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Address range of the usable stack, `None` for the master.
    pub fn stack_range(&self) -> Option<Range<usize>> {
        self.stack.borrow().as_ref().map(GuardedStack::usable_range)
    }

    /// Saved stack pointer, null while the worker runs.
    pub fn saved_stack_pointer(&self) -> *mut usize {
        self.context.stack_pointer()
    }

    pub fn scheduler(&self) -> Option<NonNull<dyn Scheduler>> {
        self.scheduler.get()
    }

    pub(crate) fn set_scheduler(&self, scheduler: NonNull<dyn Scheduler>) {
        self.scheduler.set(Some(scheduler));
    }

    /// Link used by a scheduler's run queue. The scheduler owns its meaning.
    pub fn run_queue_next(&self) -> *mut Worker {
        self.run_queue_next.get()
    }

    ///
    /// # Safety
    ///
    /// `next` must be null or a live worker of the same core, and only the scheduler that
    /// owns the run queue may change the link while the worker is queued.
    ///
    /// ```compile_fail,E0133
    /// use fiberloom::{Config, FifoScheduler};
    ///
    /// let scheduler = FifoScheduler::from_config(Config::default()).unwrap();
    /// let master = unsafe { scheduler.master().as_ref() };
    /// master.set_run_queue_next(0x10 as *mut fiberloom::Worker);
    /// ```
    pub unsafe fn set_run_queue_next(&self, next: *mut Worker) {
        self.run_queue_next.set(next);
    }

    /// Value handed to [`thread_exit`], null until the worker is done.
    pub fn exit_value(&self) -> *mut () {
        self.exit_value.get()
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("stack_size", &self.stack_size)
            .field("stack_range", &self.stack_range())
            .finish()
    }
}

/// Saves the running worker's execution point into `save_into` and resumes `resume` on
/// its own stack. Returns when something switches back into `save_into`.
///
/// # Safety
///
/// `save_into` must be the worker that is running right now and `resume` must be a live,
/// suspended worker (or a fresh one inside its bootstrap).
#[inline]
pub unsafe fn switch_context(save_into: NonNull<Worker>, resume: NonNull<Worker>) {
    let (from, to) = (save_into.as_ref(), resume.as_ref());
    tracing::trace!(from = from.id(), to = to.id(), "switch");
    swapstack::switch(&from.context, &to.context);
}

/// Finishes the worker `me` with `value` as its exit value and hands control to its
/// scheduler. Never returns.
///
/// Anything still alive on the worker's stack is abandoned without running destructors.
///
/// # Safety
///
/// `me` must be the worker that is running right now.
pub unsafe fn thread_exit(me: NonNull<Worker>, value: *mut ()) -> ! {
    let worker = me.as_ref();
    worker.exit_value.set(value);
    worker.transition(WorkerState::Done);
    tracing::trace!(id = worker.id(), "worker exited");
    match worker.scheduler() {
        Some(scheduler) => scheduler.as_ref().thread_on_exit(),
        None => fatal(Fatal::Orphaned { id: worker.id() }),
    }
}
