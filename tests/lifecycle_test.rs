mod common;

use std::cell::{Cell, RefCell};
use std::ops::Range;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::sync::Arc;

use common::{init_test_logging, scheduler, scheduler_with};
use fiberloom::{Config, FifoScheduler, Lifecycle, StackRegistrar, ToolStackId, Worker, WorkerState};
use stackarena::{page_size, Arena, LocaleArena};

fn small_stacks() -> Config {
    Config::default().with_stack_size(16 * page_size())
}

fn write_sentinel(arg: *mut ()) -> *mut () {
    let slot = unsafe { &*(arg as *const Cell<u64>) };
    slot.set(42);
    arg
}

#[test]
fn entry_runs_only_after_first_switch_in() {
    let (scheduler, arena) = scheduler();
    let slot = Cell::new(0u64);
    let arg = &slot as *const Cell<u64> as *mut ();

    let worker = scheduler.spawn(write_sentinel, arg);
    assert_eq!(slot.get(), 0);
    assert_eq!(unsafe { worker.as_ref().state() }, WorkerState::Unborn);

    let mut exits = Vec::new();
    scheduler.run_with_exits(|id, value| exits.push((id, value)));

    assert_eq!(slot.get(), 42);
    assert_eq!(exits, vec![(1, arg)]);
    assert_eq!(scheduler.lifecycle().live_workers(), 0);
    assert_eq!(arena.outstanding_bytes(), 0);
}

#[test]
fn yield_resumes_where_it_left_off() {
    let (scheduler, _arena) = scheduler();
    let slot = Rc::new(Cell::new(0u64));

    let inner = slot.clone();
    scheduler.spawn_closure(move |cx| {
        inner.set(42);
        cx.yield_now();
        assert_eq!(inner.get(), 43);
        inner.set(44);
    });
    let inner = slot.clone();
    scheduler.spawn_closure(move |_| {
        assert_eq!(inner.get(), 42);
        inner.set(43);
    });
    scheduler.run();

    assert_eq!(slot.get(), 44);
}

#[test]
fn thousand_workers_write_their_ids_once() {
    let (scheduler, arena) = scheduler_with(small_stacks());
    let seen = Rc::new(RefCell::new(Vec::new()));

    for _ in 0..1000 {
        let seen = seen.clone();
        scheduler.spawn_closure(move |cx| seen.borrow_mut().push(cx.id()));
    }
    assert_eq!(scheduler.lifecycle().live_workers(), 1000);
    scheduler.run();

    let mut seen = seen.borrow().clone();
    seen.sort_unstable();
    assert_eq!(seen, (1..=1000).collect::<Vec<u64>>());
    assert_eq!(scheduler.lifecycle().spawned_total(), 1000);
    assert_eq!(scheduler.lifecycle().live_workers(), 0);
    assert_eq!(arena.outstanding_bytes(), 0);
}

#[test]
fn fresh_worker_is_registered_and_parked_in_its_stack() {
    let (scheduler, _arena) = scheduler();
    let slot = Cell::new(0u64);
    let worker = scheduler.spawn(write_sentinel, &slot as *const Cell<u64> as *mut ());

    let registry = scheduler.lifecycle().registry();
    assert_eq!(registry.len(), 1);
    assert!(registry.contains(worker.as_ptr()));

    let info = &registry.snapshot()[0];
    assert_eq!(info.id, 1);
    assert_eq!(info.state, WorkerState::Unborn);
    assert_eq!(info.stack_size, Config::default().stack_size);

    let range = info.stack_range.clone().expect("spawned workers own a stack");
    assert_eq!(range.end - range.start, info.stack_size);
    let sp = unsafe { worker.as_ref().saved_stack_pointer() } as usize;
    assert!(range.contains(&sp), "{:#x} not in {:x?}", sp, range);

    scheduler.run();
    assert!(registry.is_empty());
}

#[test]
fn master_is_worker_zero_and_not_registered() {
    let (scheduler, _arena) = scheduler();
    let master = unsafe { scheduler.master().as_ref() };
    assert_eq!(master.id(), fiberloom::MASTER_ID);
    assert!(master.is_master());
    assert_eq!(master.state(), WorkerState::Running);
    assert!(!scheduler.lifecycle().registry().contains(master));

    let first = scheduler.spawn_closure(|_| {});
    assert_eq!(unsafe { first.as_ref().id() }, 1);
    assert_eq!(scheduler.lifecycle().registry().len(), 1);
    scheduler.run();
}

#[test]
fn workers_interleave_in_fifo_order() {
    let (scheduler, _arena) = scheduler();
    let trail = Rc::new(RefCell::new(Vec::new()));

    for name in 0..3u64 {
        let trail = trail.clone();
        scheduler.spawn_closure(move |cx| {
            for round in 0..3 {
                trail.borrow_mut().push(name * 10 + round);
                cx.yield_now();
            }
        });
    }
    scheduler.run();

    assert_eq!(
        *trail.borrow(),
        vec![0, 10, 20, 1, 11, 21, 2, 12, 22]
    );
}

#[test]
fn stacks_are_disjoint_and_locals_stay_put() {
    let (scheduler, _arena) = scheduler_with(small_stacks());
    let ranges = Rc::new(RefCell::new(Vec::<Range<usize>>::new()));

    for seed in 0..8u64 {
        let ranges = ranges.clone();
        scheduler.spawn_closure(move |cx| {
            let mut pattern = [0u64; 32];
            for (i, slot) in pattern.iter_mut().enumerate() {
                *slot = seed * 1000 + i as u64;
            }
            let local = &pattern as *const _ as usize;
            let range = cx.stack_range();
            assert!(range.contains(&local));
            ranges.borrow_mut().push(range);

            for _ in 0..4 {
                cx.yield_now();
                for (i, slot) in pattern.iter().enumerate() {
                    assert_eq!(*slot, seed * 1000 + i as u64);
                }
            }
        });
    }
    scheduler.run();

    let ranges = ranges.borrow();
    assert_eq!(ranges.len(), 8);
    for (i, a) in ranges.iter().enumerate() {
        for b in ranges.iter().skip(i + 1) {
            assert!(a.end <= b.start || b.end <= a.start, "{:x?} overlaps {:x?}", a, b);
        }
    }
}

#[test]
fn parked_worker_waits_for_wake() {
    let (scheduler, _arena) = scheduler();
    let trail = Rc::new(RefCell::new(Vec::new()));
    let sleeper: Rc<Cell<Option<NonNull<Worker>>>> = Rc::new(Cell::new(None));

    {
        let trail = trail.clone();
        let sleeper = sleeper.clone();
        scheduler.spawn_closure(move |cx| {
            trail.borrow_mut().push("sleeper parks");
            sleeper.set(Some(cx.worker()));
            cx.park();
            trail.borrow_mut().push("sleeper woke");
        });
    }
    {
        let trail = trail.clone();
        let sleeper = sleeper.clone();
        scheduler.spawn_closure(move |cx| {
            cx.yield_now();
            cx.yield_now();
            let worker = sleeper.get().expect("sleeper ran first");
            assert_eq!(unsafe { worker.as_ref().state() }, WorkerState::Idle);
            trail.borrow_mut().push("waker wakes");
            unsafe { cx.wake(worker) };
        });
    }
    scheduler.run();

    assert_eq!(
        *trail.borrow(),
        vec!["sleeper parks", "waker wakes", "sleeper woke"]
    );
}

#[test]
fn workers_spawn_workers() {
    let (scheduler, arena) = scheduler_with(small_stacks());
    let trail = Rc::new(RefCell::new(Vec::new()));

    let outer = trail.clone();
    scheduler.spawn_closure(move |cx| {
        let parent = cx.id();
        let inner = outer.clone();
        let child = cx.spawn(move |cx| {
            inner.borrow_mut().push(("child", cx.id()));
            let leaf = inner.clone();
            cx.spawn(move |cx| leaf.borrow_mut().push(("grandchild", cx.id())));
        });
        assert_eq!(unsafe { child.as_ref().state() }, WorkerState::Unborn);
        outer.borrow_mut().push(("parent", parent));
    });
    scheduler.run();

    assert_eq!(
        *trail.borrow(),
        vec![("parent", 1), ("child", 2), ("grandchild", 3)]
    );
    assert_eq!(scheduler.lifecycle().spawned_total(), 3);
    assert_eq!(arena.outstanding_bytes(), 0);
}

fn double(arg: *mut ()) -> *mut () {
    (arg as usize * 2) as *mut ()
}

#[test]
fn exit_values_reach_the_scheduler() {
    let (scheduler, _arena) = scheduler();
    scheduler.spawn(double, 21 as *mut ());
    scheduler.spawn_closure(|cx| {
        cx.yield_now();
        cx.exit(7 as *mut ());
    });
    scheduler.spawn_closure(|_| {});

    let mut exits = Vec::new();
    scheduler.run_with_exits(|id, value| exits.push((id, value as usize)));
    exits.sort_unstable();

    assert_eq!(exits, vec![(1, 42), (2, 7), (3, 0)]);
}

fn depth(n: u64) -> u64 {
    let pad = [n; 16];
    if n == 0 {
        0
    } else {
        pad[15] / n + depth(n - 1)
    }
}

fn recurse(arg: *mut ()) -> *mut () {
    let out = unsafe { &*(arg as *const Cell<u64>) };
    out.set(depth(500));
    ptr::null_mut()
}

#[test]
fn deep_recursion_fits_a_larger_stack() {
    let (scheduler, _arena) = scheduler();
    let result = Cell::new(0u64);
    let worker = scheduler.spawn_with_stack(
        recurse,
        &result as *const Cell<u64> as *mut (),
        64 * page_size(),
    );
    assert_eq!(unsafe { worker.as_ref().stack_size() }, 64 * page_size());
    scheduler.run();

    assert_eq!(result.get(), 500);
}

#[test]
fn idle_stacks_can_be_write_protected() {
    let (scheduler, arena) = scheduler_with(small_stacks().with_protect_idle_stacks(true));
    let total = Rc::new(Cell::new(0u64));

    for seed in 1..=4u64 {
        let total = total.clone();
        scheduler.spawn_closure(move |cx| {
            let mut local = [seed; 8];
            for _ in 0..3 {
                cx.yield_now();
                local[0] += 1;
            }
            total.set(total.get() + local.iter().sum::<u64>());
        });
    }
    scheduler.run();

    // Every worker ends with 8 * seed + 3.
    assert_eq!(total.get(), 8 * (1 + 2 + 3 + 4) + 4 * 3);
    assert_eq!(arena.outstanding_bytes(), 0);
}

#[test]
fn runs_without_guard_pages() {
    let (scheduler, arena) = scheduler_with(small_stacks().with_guard_pages(false));
    let count = Rc::new(Cell::new(0));
    for _ in 0..10 {
        let count = count.clone();
        scheduler.spawn_closure(move |cx| {
            cx.yield_now();
            count.set(count.get() + 1);
        });
    }
    scheduler.run();
    assert_eq!(count.get(), 10);
    assert_eq!(arena.outstanding_bytes(), 0);
}

#[test]
fn single_page_stacks_survive_every_placement_offset() {
    // More workers than the offset window has slots for a one page stack.
    let (scheduler, arena) = scheduler_with(Config::default().with_stack_size(page_size()));
    let count = Rc::new(Cell::new(0));
    for _ in 0..200 {
        let count = count.clone();
        scheduler.spawn_closure(move |cx| {
            cx.yield_now();
            count.set(count.get() + 1);
        });
    }
    scheduler.run();
    assert_eq!(count.get(), 200);
    assert_eq!(arena.outstanding_bytes(), 0);
}

#[derive(Default)]
struct Counting {
    next: Cell<u32>,
    live: RefCell<Vec<(ToolStackId, Range<usize>)>>,
    withdrawn: Cell<u32>,
}

struct Shared(Rc<Counting>);

impl StackRegistrar for Shared {
    fn register(&self, usable: Range<usize>) -> Option<ToolStackId> {
        let next = self.0.next.get() + 1;
        self.0.next.set(next);
        let id = ToolStackId(std::num::NonZeroU32::new(next)?);
        self.0.live.borrow_mut().push((id, usable));
        Some(id)
    }

    fn deregister(&self, id: ToolStackId) {
        let mut live = self.0.live.borrow_mut();
        let index = live
            .iter()
            .position(|(known, _)| *known == id)
            .expect("deregistered an unknown id");
        live.remove(index);
        self.0.withdrawn.set(self.0.withdrawn.get() + 1);
    }
}

#[test]
fn memory_checker_sees_every_stack() {
    init_test_logging();
    let counting = Rc::new(Counting::default());
    let arena: Arc<dyn Arena> = Arc::new(LocaleArena::new());
    let lifecycle =
        Lifecycle::new(small_stacks(), arena).with_registrar(Shared(counting.clone()));
    let scheduler = FifoScheduler::with_lifecycle(lifecycle);

    let seen = counting.clone();
    for _ in 0..5 {
        let seen = seen.clone();
        scheduler.spawn_closure(move |cx| {
            let range = cx.stack_range();
            assert!(seen.live.borrow().iter().any(|(_, usable)| *usable == range));
        });
    }
    assert_eq!(counting.live.borrow().len(), 5);
    scheduler.run();

    assert_eq!(counting.next.get(), 5);
    assert_eq!(counting.withdrawn.get(), 5);
    assert!(counting.live.borrow().is_empty());
}

#[test]
fn cached_regions_are_reused() {
    init_test_logging();
    let config = small_stacks();
    let region_len = config.stack_size + 2 * page_size();
    let arena = Arc::new(LocaleArena::new().with_cache(region_len, 4));
    let shared: Arc<dyn Arena> = arena.clone();
    let scheduler = FifoScheduler::new(config, shared).unwrap();

    for _ in 0..3 {
        for _ in 0..4 {
            scheduler.spawn_closure(|cx| cx.yield_now());
        }
        scheduler.run();
        assert_eq!(arena.cached_regions(), 4);
        assert_eq!(arena.outstanding_bytes(), 0);
    }
}

#[test]
fn dropping_the_scheduler_releases_everything() {
    let (scheduler, arena) = scheduler();
    scheduler.spawn_closure(|cx| cx.yield_now());
    scheduler.run();
    drop(scheduler);
    assert_eq!(arena.outstanding_bytes(), 0);
    assert_eq!(arena.live_regions(), 0);
}

#[test]
fn yield_on_master_returns_immediately() {
    let (scheduler, _arena) = scheduler();
    scheduler.yield_now();
    scheduler.run();
    assert_eq!(scheduler.lifecycle().spawned_total(), 0);
}
