//! Stack memory for cooperatively scheduled workers.
//!
//! Every worker stack is a [`Region`] handed out by an [`Arena`] and wrapped in a
//! [`GuardedStack`]:
//! ```text
//!  low address                                               high address
//!  +------------+--------------------------------------+------------+
//!  | guard page |            usable stack              | guard page |
//!  +------------+--------------------------------------+------------+
//!               ^ top()                       bottom() ^
//! ```
//! Stacks grow down, from `bottom()` towards `top()`. Running off either end hits a
//! page marked `PROT_NONE` once the guards are armed.
//!
//! [`StackPlacer`] spreads the initial stack pointers of consecutive stacks over a
//! small window of cache lines, so that many live stacks don't all start on the same
//! cache set.

#[cfg(not(target_family = "unix"))]
compile_error!("stackarena only supports unix targets");

pub mod arena;
pub mod guard;
pub mod placement;
pub mod utils;

pub use arena::{Arena, LocaleArena, Region};
pub use guard::GuardedStack;
pub use placement::StackPlacer;
pub use utils::page_size;

pub trait Stack {
    /// Returns a pointer to the bottom of the stack (the highest usable address).
    fn bottom(&self) -> *mut usize;

    /// Returns a pointer to the top of the stack (the lowest usable address).
    fn top(&self) -> *mut usize;
}
