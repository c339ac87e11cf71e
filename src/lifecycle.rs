//! Creation and destruction of workers on one core.

use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use stackarena::{page_size, utils::is_page_multiple, Arena, GuardedStack, StackPlacer};

use crate::config::Config;
use crate::debug_tools::{NoRegistrar, StackRegistrar};
use crate::fatal::{fatal, Fatal};
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::trampoline;
use crate::worker::{switch_context, EntryFn, Worker, WorkerState};

/// Per-core owner of worker memory.
///
/// A lifecycle is created explicitly when a core starts, produces the core's master
/// worker once, and hands out and takes back every spawned worker. Dropping the master
/// through [`destroy`](Lifecycle::destroy) is the teardown check: it is fatal while any
/// spawned worker is still registered.
pub struct Lifecycle {
    config: Config,
    arena: Arc<dyn Arena>,
    registrar: Box<dyn StackRegistrar>,
    registry: Registry,
    placer: Cell<StackPlacer>,
    master: Cell<*mut Worker>,
    spawned: Cell<u64>,
}

impl Lifecycle {
    /// `config` is expected to be validated already.
    pub fn new(config: Config, arena: Arc<dyn Arena>) -> Self {
        let placer = StackPlacer::new(config.stack_offset);
        Self {
            config,
            arena,
            registrar: Box::new(NoRegistrar),
            registry: Registry::new(),
            placer: Cell::new(placer),
            master: Cell::new(ptr::null_mut()),
            spawned: Cell::new(0),
        }
    }

    /// Reports stack ranges to an external memory checker.
    pub fn with_registrar<R: StackRegistrar + 'static>(mut self, registrar: R) -> Self {
        self.registrar = Box::new(registrar);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn arena(&self) -> &Arc<dyn Arena> {
        &self.arena
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Spawned workers not destroyed yet.
    pub fn live_workers(&self) -> usize {
        self.registry.len()
    }

    /// Workers spawned over the lifetime of this core.
    pub fn spawned_total(&self) -> u64 {
        self.spawned.get()
    }

    pub fn master(&self) -> Option<NonNull<Worker>> {
        NonNull::new(self.master.get())
    }

    /// Turns the calling thread's own stack into worker 0. Called once, when the core
    /// starts.
    pub fn convert_to_master(&self) -> NonNull<Worker> {
        if !self.master.get().is_null() {
            fatal(Fatal::MasterExists);
        }
        let master = Box::into_raw(Box::new(Worker::master()));
        self.master.set(master);
        tracing::debug!(master = ?master, "converted thread stack to master worker");
        unsafe { NonNull::new_unchecked(master) }
    }

    /// Creates a worker that will run `entry(arg)` on a fresh stack of `stack_size`
    /// usable bytes.
    ///
    /// `parent` must be the worker the scheduler reports as current, it is the one that
    /// drives the bootstrap switches. The returned worker is `Unborn`: it has an id from
    /// the scheduler, is registered, and starts running its entry on the first switch-in.
    ///
    /// # Safety
    ///
    /// `parent` must be the live worker running right now and `scheduler` must report it
    /// from [`Scheduler::current_worker`]. The scheduler must outlive the new worker.
    /// `entry` runs with `arg` on the new stack and must uphold whatever `arg` requires.
    ///
    /// ```compile_fail,E0133
    /// use fiberloom::{Config, FifoScheduler};
    ///
    /// fn noop(_: *mut ()) -> *mut () {
    ///     std::ptr::null_mut()
    /// }
    ///
    /// let scheduler = FifoScheduler::from_config(Config::default()).unwrap();
    /// let page = stackarena::page_size();
    /// scheduler
    ///     .lifecycle()
    ///     .spawn(scheduler.master(), &*scheduler, noop, std::ptr::null_mut(), 16 * page);
    /// ```
    pub unsafe fn spawn(
        &self,
        parent: NonNull<Worker>,
        scheduler: &(dyn Scheduler + 'static),
        entry: EntryFn,
        arg: *mut (),
        stack_size: usize,
    ) -> NonNull<Worker> {
        let current = scheduler.current_worker();
        if current != parent {
            let (parent, current) = (parent.as_ref().id(), current.as_ref().id());
            fatal(Fatal::ParentMismatch { parent, current });
        }
        if !is_page_multiple(stack_size) {
            fatal(Fatal::StackSize {
                size: stack_size,
                page: page_size(),
            });
        }

        let worker = Box::new(Worker::unborn(stack_size));
        worker.set_scheduler(NonNull::from(scheduler));
        scheduler.assign_tid(&worker);

        let stack = self.allocate_stack(stack_size);
        worker.tool_id.set(self.registrar.register(stack.usable_range()));

        let mut placer = self.placer.get();
        let offset = placer.next(stack_size);
        self.placer.set(placer);

        let worker = NonNull::new_unchecked(Box::into_raw(worker));
        let this = worker.as_ref();
        this.context
            .prepare(&stack, offset, trampoline::relay, worker.as_ptr() as usize);
        *this.stack.borrow_mut() = Some(stack);
        self.registry.insert(worker);
        trampoline::bootstrap(parent, worker, entry, arg);

        if self.config.protect_idle_stacks {
            self.protect(worker);
        }
        self.spawned.set(self.spawned.get() + 1);

        tracing::debug!(
            id = this.id(),
            parent = parent.as_ref().id(),
            stack = ?this.stack_range(),
            offset,
            "spawned worker"
        );
        worker
    }

    /// Tears down a finished worker, or the master at shutdown, and returns its exit
    /// value. Guard pages are disarmed and the stack goes back to the arena.
    ///
    /// # Safety
    ///
    /// `worker` must come from this lifecycle and not be destroyed yet. Nothing may switch
    /// into it afterwards.
    pub unsafe fn destroy(&self, worker: NonNull<Worker>) -> *mut () {
        if worker.as_ptr() == self.master.get() {
            self.destroy_master(worker);
            return ptr::null_mut();
        }

        let this = worker.as_ref();
        if this.state() != WorkerState::Done {
            fatal(Fatal::DestroyLive {
                id: this.id(),
                state: this.state(),
            });
        }
        debug_assert!(self.registry.contains(worker.as_ptr()));

        let id = this.id();
        let exit_value = this.exit_value();
        if let Some(tool_id) = this.tool_id.take() {
            self.registrar.deregister(tool_id);
        }
        self.registry.remove(worker);

        // The stack goes back to the arena before the block itself is freed.
        let stack = this.stack.borrow_mut().take();
        if let Some(stack) = stack {
            let range = stack.region().as_ptr() as usize..stack.region().end() as usize;
            let region = match stack.into_region() {
                Ok(region) => region,
                Err((_, source)) => fatal(Fatal::Protection {
                    operation: "disarm stack protection",
                    range_start: range.start,
                    range_end: range.end,
                    source,
                }),
            };
            if let Err(source) = self.arena.deallocate(region) {
                fatal(Fatal::ArenaRelease {
                    addr: range.start,
                    len: range.end - range.start,
                    source,
                });
            }
        }
        drop(Box::from_raw(worker.as_ptr()));
        tracing::debug!(id, live = self.registry.len(), "destroyed worker");
        exit_value
    }

    unsafe fn destroy_master(&self, master: NonNull<Worker>) {
        let live = self.registry.len();
        if live != 0 {
            self.registry.dump();
            fatal(Fatal::LiveWorkers { live });
        }
        self.master.set(ptr::null_mut());
        drop(Box::from_raw(master.as_ptr()));
        tracing::debug!(spawned = self.spawned.get(), "master worker destroyed, core is quiescent");
    }

    /// Switches from the running worker `from` into `to`, marking `to` as running. Returns
    /// once something switches back into `from`.
    ///
    /// With idle stack protection on, `to`'s stack is writable only while it runs.
    ///
    /// # Safety
    ///
    /// `from` must be running, `to` must be a live `Unborn` or `Suspended` worker.
    pub unsafe fn switch_in(&self, from: NonNull<Worker>, to: NonNull<Worker>) {
        let target = to.as_ref();
        if self.config.protect_idle_stacks {
            self.unprotect(to);
        }
        target.transition(WorkerState::Running);
        switch_context(from, to);
        if self.config.protect_idle_stacks && target.state() != WorkerState::Done {
            self.protect(to);
        }
    }

    fn protect(&self, worker: NonNull<Worker>) {
        let this = unsafe { worker.as_ref() };
        let mut stack = this.stack.borrow_mut();
        if let Some(stack) = stack.as_mut() {
            if let Err(source) = stack.protect_unused() {
                let range = stack.usable_range();
                fatal(Fatal::Protection {
                    operation: "write-protect idle stack",
                    range_start: range.start,
                    range_end: range.end,
                    source,
                });
            }
        }
    }

    fn unprotect(&self, worker: NonNull<Worker>) {
        let this = unsafe { worker.as_ref() };
        let mut stack = this.stack.borrow_mut();
        if let Some(stack) = stack.as_mut() {
            if stack.is_read_only() {
                if let Err(source) = stack.unprotect() {
                    let range = stack.usable_range();
                    fatal(Fatal::Protection {
                        operation: "unprotect stack",
                        range_start: range.start,
                        range_end: range.end,
                        source,
                    });
                }
            }
        }
    }

    fn allocate_stack(&self, stack_size: usize) -> GuardedStack {
        let page = page_size();
        let size = match stack_size.checked_add(2 * page) {
            Some(size) => size,
            None => fatal(Fatal::StackSize {
                size: stack_size,
                page,
            }),
        };
        let region = match self.arena.allocate_aligned(size, page) {
            Ok(region) => region,
            Err(source) => fatal(Fatal::ArenaExhausted {
                size,
                alignment: page,
                source,
            }),
        };
        let mut stack = match GuardedStack::new(region, stack_size) {
            Ok(stack) => stack,
            Err((region, source)) => fatal(Fatal::ArenaExhausted {
                size: region.len(),
                alignment: page,
                source,
            }),
        };
        if self.config.guard_pages {
            if let Err(source) = stack.arm() {
                let range = stack.region().as_ptr() as usize..stack.region().end() as usize;
                fatal(Fatal::Protection {
                    operation: "arm guard pages",
                    range_start: range.start,
                    range_end: range.end,
                    source,
                });
            }
        }
        stack
    }
}
