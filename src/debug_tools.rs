//! Hooks for external memory checkers.
//!
//! Tools like valgrind need to be told when a block of memory starts being used as a
//! stack, otherwise every switch looks like a wild stack pointer jump. A core calls the
//! registrar with the usable range of each stack it creates and deregisters it again
//! before the memory goes back to the arena.

use std::num::NonZeroU32;
use std::ops::Range;

/// Handle returned by a [`StackRegistrar`]. A worker without a registration simply holds
/// `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ToolStackId(pub NonZeroU32);

pub trait StackRegistrar {
    /// Announces that `usable` is now a stack.
    fn register(&self, usable: Range<usize>) -> Option<ToolStackId>;

    /// Withdraws a registration made by `register`.
    fn deregister(&self, id: ToolStackId);
}

/// Registrar used when no memory checker is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRegistrar;

impl StackRegistrar for NoRegistrar {
    #[inline(always)]
    fn register(&self, _usable: Range<usize>) -> Option<ToolStackId> {
        None
    }

    #[inline(always)]
    fn deregister(&self, _id: ToolStackId) {}
}
