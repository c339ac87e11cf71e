//! The scheduler contract and a minimal FIFO scheduler for one core.

use std::cell::Cell;
use std::ops::Range;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::thread;

use stackarena::{page_size, Arena, LocaleArena};

use crate::config::{Config, ConfigError};
use crate::fatal::{fatal, Fatal};
use crate::lifecycle::Lifecycle;
use crate::worker::{switch_context, thread_exit, EntryFn, Worker, WorkerState};

/// What the worker core needs from whoever decides which worker runs next.
pub trait Scheduler {
    /// The worker running right now on this core.
    fn current_worker(&self) -> NonNull<Worker>;

    /// Gives a freshly created worker its id.
    fn assign_tid(&self, worker: &Worker);

    /// Called on the stack of the current worker after it exited. Must switch away and
    /// never come back.
    fn thread_on_exit(&self) -> !;
}

/// Single core scheduler that runs workers in the order they became ready.
///
/// The master worker (the thread that created the scheduler) drives everything from
/// [`run`](FifoScheduler::run): every worker switches back to the master when it yields,
/// parks or exits, and the master picks the next one from the queue. Finished workers are
/// destroyed right away.
///
/// The scheduler is always boxed, workers keep a pointer to it.
pub struct FifoScheduler {
    lifecycle: Lifecycle,
    master: NonNull<Worker>,
    current: Cell<NonNull<Worker>>,
    head: Cell<*mut Worker>,
    tail: Cell<*mut Worker>,
    next_tid: Cell<u64>,
}

impl FifoScheduler {
    /// Validates `config` and turns the calling thread into the master of a new core.
    pub fn new(config: Config, arena: Arc<dyn Arena>) -> Result<Box<Self>, ConfigError> {
        config.validate()?;
        Ok(Self::with_lifecycle(Lifecycle::new(config, arena)))
    }

    /// Uses a [`LocaleArena`] that caches `config.region_cache` default-sized stacks.
    pub fn from_config(config: Config) -> Result<Box<Self>, ConfigError> {
        config.validate()?;
        let region_len = config.stack_size.saturating_add(2 * page_size());
        let arena = LocaleArena::new().with_cache(region_len, config.region_cache);
        Self::new(config, Arc::new(arena))
    }

    /// Reads the configuration from `FIBERLOOM_*` environment variables.
    pub fn from_env() -> Result<Box<Self>, ConfigError> {
        Self::from_config(Config::from_env()?)
    }

    pub fn with_lifecycle(lifecycle: Lifecycle) -> Box<Self> {
        let master = lifecycle.convert_to_master();
        Box::new(Self {
            lifecycle,
            master,
            current: Cell::new(master),
            head: Cell::new(ptr::null_mut()),
            tail: Cell::new(ptr::null_mut()),
            next_tid: Cell::new(1),
        })
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn master(&self) -> NonNull<Worker> {
        self.master
    }

    /// Spawns a worker with the configured stack size and queues it.
    ///
    /// The returned pointer dangles once the worker finished and was destroyed by
    /// [`run`](FifoScheduler::run).
    pub fn spawn(&self, entry: EntryFn, arg: *mut ()) -> NonNull<Worker> {
        self.spawn_with_stack(entry, arg, self.lifecycle.config().stack_size)
    }

    pub fn spawn_with_stack(&self, entry: EntryFn, arg: *mut (), stack_size: usize) -> NonNull<Worker> {
        // `current` is the running worker, and workers never outlive the boxed scheduler.
        let worker = unsafe {
            self.lifecycle
                .spawn(self.current.get(), self, entry, arg, stack_size)
        };
        self.push(worker);
        worker
    }

    /// Spawns a worker running `f`. The worker's exit value is null unless `f` calls
    /// [`WorkerCx::exit`].
    pub fn spawn_closure<F>(&self, f: F) -> NonNull<Worker>
    where
        F: FnOnce(&WorkerCx) + 'static,
    {
        let job = Box::new(Job {
            scheduler: NonNull::from(self),
            f: Box::new(f),
        });
        self.spawn(run_job, Box::into_raw(job) as *mut ())
    }

    /// Runs workers until the queue is empty. Must be called on the master.
    pub fn run(&self) {
        self.run_with_exits(|_, _| {})
    }

    /// Like [`run`](FifoScheduler::run), calling `on_exit(id, exit_value)` for every
    /// worker that finishes.
    pub fn run_with_exits<F>(&self, mut on_exit: F)
    where
        F: FnMut(u64, *mut ()),
    {
        let current = self.current.get();
        if current != self.master {
            fatal(Fatal::NotOnMaster {
                operation: "run",
                current: unsafe { current.as_ref().id() },
            });
        }

        tracing::debug!(live = self.lifecycle.live_workers(), "run queue started");
        let mut switches = 0u64;
        while let Some(next) = self.pop() {
            self.current.set(next);
            unsafe { self.lifecycle.switch_in(self.master, next) };
            self.current.set(self.master);
            switches += 1;

            let worker = unsafe { next.as_ref() };
            if worker.state() == WorkerState::Done {
                let id = worker.id();
                let value = unsafe { self.lifecycle.destroy(next) };
                on_exit(id, value);
            }
        }
        tracing::debug!(
            switches,
            live = self.lifecycle.live_workers(),
            "run queue drained"
        );
    }

    /// Puts the current worker at the back of the queue. On the master there is nothing
    /// to yield to and this returns at once.
    pub fn yield_now(&self) {
        let me = self.current.get();
        if me == self.master {
            return;
        }
        unsafe {
            me.as_ref().transition(WorkerState::Suspended);
            self.push(me);
            switch_context(me, self.master);
        }
    }

    /// Suspends the current worker until someone calls [`wake`](FifoScheduler::wake)
    /// with it.
    pub fn park(&self) {
        let me = self.current.get();
        if me == self.master {
            fatal(Fatal::OnMaster { operation: "park" });
        }
        unsafe {
            me.as_ref().transition(WorkerState::Idle);
            tracing::trace!(id = me.as_ref().id(), "parked");
            switch_context(me, self.master);
        }
    }

    /// Makes a parked worker runnable again.
    ///
    /// # Safety
    ///
    /// `worker` must be alive and belong to this scheduler.
    pub unsafe fn wake(&self, worker: NonNull<Worker>) {
        let target = worker.as_ref();
        // Running to Suspended is a legal move for a yield, not for a wake.
        if target.state() != WorkerState::Idle {
            fatal(Fatal::IllegalTransition {
                id: target.id(),
                from: target.state(),
                to: WorkerState::Suspended,
            });
        }
        target.transition(WorkerState::Suspended);
        tracing::trace!(id = target.id(), "woken");
        self.push(worker);
    }

    /// Finishes the current worker with `value` as its exit value.
    pub fn exit(&self, value: *mut ()) -> ! {
        let me = self.current.get();
        if me == self.master {
            fatal(Fatal::OnMaster { operation: "exit" });
        }
        unsafe { thread_exit(me, value) }
    }

    fn push(&self, worker: NonNull<Worker>) {
        unsafe {
            worker.as_ref().set_run_queue_next(ptr::null_mut());
            match self.tail.get().as_ref() {
                Some(tail) => tail.set_run_queue_next(worker.as_ptr()),
                None => self.head.set(worker.as_ptr()),
            }
        }
        self.tail.set(worker.as_ptr());
    }

    fn pop(&self) -> Option<NonNull<Worker>> {
        let head = NonNull::new(self.head.get())?;
        let node = unsafe { head.as_ref() };
        let next = node.run_queue_next();
        self.head.set(next);
        if next.is_null() {
            self.tail.set(ptr::null_mut());
        }
        unsafe { node.set_run_queue_next(ptr::null_mut()) };
        Some(head)
    }
}

impl Scheduler for FifoScheduler {
    fn current_worker(&self) -> NonNull<Worker> {
        self.current.get()
    }

    fn assign_tid(&self, worker: &Worker) {
        let id = self.next_tid.get();
        self.next_tid.set(id + 1);
        worker.assign_id(id);
    }

    fn thread_on_exit(&self) -> ! {
        let me = self.current.get();
        unsafe { switch_context(me, self.master) };
        // The master destroys exited workers, so getting here means the stack was reused.
        fatal(Fatal::ResumedAfterExit {
            id: unsafe { me.as_ref().id() },
        })
    }
}

impl Drop for FifoScheduler {
    fn drop(&mut self) {
        // Workers may still hold frames that reference state being unwound, leak them.
        if thread::panicking() {
            return;
        }
        let current = self.current.get();
        if current != self.master {
            fatal(Fatal::NotOnMaster {
                operation: "drop scheduler",
                current: unsafe { current.as_ref().id() },
            });
        }
        unsafe { self.lifecycle.destroy(self.master) };
    }
}

struct Job {
    scheduler: NonNull<FifoScheduler>,
    f: Box<dyn FnOnce(&WorkerCx)>,
}

fn run_job(arg: *mut ()) -> *mut () {
    let job = unsafe { Box::from_raw(arg as *mut Job) };
    let Job { scheduler, f } = *job;
    let cx = WorkerCx {
        scheduler,
        worker: unsafe { scheduler.as_ref().current_worker() },
    };
    f(&cx);
    ptr::null_mut()
}

/// Handed to closures spawned through [`FifoScheduler::spawn_closure`].
pub struct WorkerCx {
    scheduler: NonNull<FifoScheduler>,
    worker: NonNull<Worker>,
}

impl WorkerCx {
    fn scheduler(&self) -> &FifoScheduler {
        // The scheduler outlives every worker it runs.
        unsafe { self.scheduler.as_ref() }
    }

    pub fn id(&self) -> u64 {
        unsafe { self.worker.as_ref().id() }
    }

    /// The worker this closure runs on, for handing to [`wake`](WorkerCx::wake).
    pub fn worker(&self) -> NonNull<Worker> {
        self.worker
    }

    pub fn stack_range(&self) -> Range<usize> {
        match unsafe { self.worker.as_ref().stack_range() } {
            Some(range) => range,
            None => unreachable!("closures never run on the master"),
        }
    }

    pub fn yield_now(&self) {
        self.scheduler().yield_now()
    }

    pub fn park(&self) {
        self.scheduler().park()
    }

    /// # Safety
    ///
    /// See [`FifoScheduler::wake`].
    pub unsafe fn wake(&self, worker: NonNull<Worker>) {
        self.scheduler().wake(worker)
    }

    pub fn spawn<F>(&self, f: F) -> NonNull<Worker>
    where
        F: FnOnce(&WorkerCx) + 'static,
    {
        self.scheduler().spawn_closure(f)
    }

    /// Ends this worker right away. Nothing left on its stack is dropped.
    pub fn exit(&self, value: *mut ()) -> ! {
        self.scheduler().exit(value)
    }
}
