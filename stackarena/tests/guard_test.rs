mod common;

use std::io::Error;

use common::{in_child, is_protection_fault, ChildExit};
use stackarena::*;

fn guarded(arena: &LocaleArena, usable: usize) -> Result<GuardedStack, Error> {
    let region = arena.allocate_aligned(usable + 2 * page_size(), page_size())?;
    GuardedStack::new(region, usable).map_err(|(_, err)| err)
}

#[test]
fn usable_range_is_writable() -> Result<(), Error> {
    let arena = LocaleArena::new();
    let mut stack = guarded(&arena, 4 * page_size())?;
    stack.arm()?;
    unsafe {
        *stack.top() = 64;
        *stack.bottom().sub(1) = 64;
        assert_eq!(*stack.top(), 64);
    }
    arena.deallocate(stack.into_region().map_err(|(_, e)| e)?)
}

#[test]
fn write_below_usable_range_faults() -> Result<(), Error> {
    let arena = LocaleArena::new();
    let mut stack = guarded(&arena, 4 * page_size())?;
    stack.arm()?;
    let below = unsafe { stack.top().sub(1) };
    let exit = in_child(|| unsafe { below.write_volatile(42) });
    assert!(is_protection_fault(&exit), "child ended with {:?}", exit);
    arena.deallocate(stack.into_region().map_err(|(_, e)| e)?)
}

#[test]
fn write_above_usable_range_faults() -> Result<(), Error> {
    let arena = LocaleArena::new();
    let mut stack = guarded(&arena, 4 * page_size())?;
    stack.arm()?;
    let above = stack.bottom();
    let exit = in_child(|| unsafe { above.write_volatile(42) });
    assert!(is_protection_fault(&exit), "child ended with {:?}", exit);
    arena.deallocate(stack.into_region().map_err(|(_, e)| e)?)
}

#[test]
fn disarmed_guards_are_plain_memory() -> Result<(), Error> {
    let arena = LocaleArena::new();
    let mut stack = guarded(&arena, 4 * page_size())?;
    stack.arm()?;
    stack.disarm()?;
    let below = unsafe { stack.top().sub(1) };
    assert_eq!(in_child(|| unsafe { below.write_volatile(42) }), ChildExit::Code(0));
    arena.deallocate(stack.into_region().map_err(|(_, e)| e)?)
}

#[test]
fn read_only_stack_rejects_writes() -> Result<(), Error> {
    let arena = LocaleArena::new();
    let mut stack = guarded(&arena, 4 * page_size())?;
    stack.protect_unused()?;
    let inside = stack.top();
    let exit = in_child(|| unsafe { inside.write_volatile(1) });
    assert!(is_protection_fault(&exit), "child ended with {:?}", exit);

    stack.unprotect()?;
    unsafe { inside.write_volatile(1) };
    arena.deallocate(stack.into_region().map_err(|(_, e)| e)?)
}
