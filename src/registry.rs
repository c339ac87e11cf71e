//! List of all live workers of a core, used only for debugging.
//!
//! The list is intrusive: the links live in the workers themselves, so inserting and
//! removing never allocates and both are O(1). Nothing in scheduling depends on it.

use std::cell::Cell;
use std::ops::Range;
use std::ptr::{self, NonNull};

use crate::worker::{Worker, WorkerState};

/// What the registry knows about one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: u64,
    pub state: WorkerState,
    pub stack_size: usize,
    pub stack_range: Option<Range<usize>>,
}

pub struct Registry {
    head: Cell<*mut Worker>,
    len: Cell<usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            head: Cell::new(ptr::null_mut()),
            len: Cell::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        self.head.get().is_null()
    }

    /// Prepends `worker`.
    ///
    /// # Safety
    ///
    /// `worker` must stay alive until it is removed and must not be in any registry.
    pub unsafe fn insert(&self, worker: NonNull<Worker>) {
        let node = worker.as_ref();
        let head = self.head.get();
        if let Some(head) = head.as_ref() {
            debug_assert!(
                head.registry_prev.get().is_null(),
                "registry head must not have a prev"
            );
            head.registry_prev.set(worker.as_ptr());
        }
        node.registry_prev.set(ptr::null_mut());
        node.registry_next.set(head);
        self.head.set(worker.as_ptr());
        self.len.set(self.len.get() + 1);
    }

    /// Unlinks `worker`.
    ///
    /// # Safety
    ///
    /// `worker` must currently be in this registry.
    pub unsafe fn remove(&self, worker: NonNull<Worker>) {
        let node = worker.as_ref();
        let prev = node.registry_prev.get();
        let next = node.registry_next.get();
        match prev.as_ref() {
            Some(prev) => prev.registry_next.set(next),
            None => {
                debug_assert_eq!(self.head.get(), worker.as_ptr());
                self.head.set(next);
            }
        }
        if let Some(next) = next.as_ref() {
            next.registry_prev.set(prev);
        }
        node.registry_prev.set(ptr::null_mut());
        node.registry_next.set(ptr::null_mut());
        self.len.set(self.len.get() - 1);
    }

    /// Walks the list looking for `worker`. O(n), meant for debug checks.
    pub fn contains(&self, worker: *const Worker) -> bool {
        self.nodes().any(|node| node as *const Worker == worker)
    }

    /// Copies out what is known about every live worker, most recently spawned first.
    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        self.nodes()
            .map(|node| WorkerInfo {
                id: node.id(),
                state: node.state(),
                stack_size: node.stack_size(),
                stack_range: node.stack_range(),
            })
            .collect()
    }

    /// Logs every live worker at debug level.
    pub fn dump(&self) {
        tracing::debug!(live = self.len(), "worker registry");
        for info in self.snapshot() {
            tracing::debug!(
                id = info.id,
                state = ?info.state,
                stack_size = info.stack_size,
                stack = ?info.stack_range,
                "live worker"
            );
        }
    }

    fn nodes(&self) -> impl Iterator<Item = &Worker> + '_ {
        let mut cursor = self.head.get();
        std::iter::from_fn(move || {
            // Every node stays alive while it is linked.
            let node = unsafe { cursor.as_ref()? };
            cursor = node.registry_next.get();
            Some(node)
        })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
