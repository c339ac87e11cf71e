/// Size of a cache line.
pub const CACHE_LINE: usize = 64;
/// Number of distinct cache lines the offsets cycle through.
pub const OFFSET_SLOTS: usize = 128;
/// Offsets always stay below this value.
pub const OFFSET_WINDOW: usize = CACHE_LINE * OFFSET_SLOTS;
/// Offsets also stay below `usable / OFFSET_SHARE`.
pub const OFFSET_SHARE: usize = 16;

/// Staggers the starting points of consecutive stacks.
///
/// Without it every fresh stack would begin at the same offset from a page boundary
/// and the hot top frames of all live workers would compete for the same cache sets.
/// This is purely a performance heuristic.
#[derive(Debug, Clone, Copy)]
pub struct StackPlacer {
    stride: usize,
    current: usize,
}

impl StackPlacer {
    /// `stride` must be a multiple of 16, so that offsets keep the stack pointer aligned.
    pub fn new(stride: usize) -> Self {
        debug_assert_eq!(stride % 16, 0, "stack offset stride must be 16 byte aligned");
        Self { stride, current: 0 }
    }

    /// Returns how many bytes below the bottom of a stack with `usable` bytes the next
    /// worker should start, and advances to the next slot.
    pub fn next(&mut self, usable: usize) -> usize {
        let offset = self.current;
        self.current = (self.current + self.stride) & (OFFSET_WINDOW - 1);

        // The offset never takes more than a sixteenth of the usable stack, so a stack
        // that fits its worker at offset 0 still fits it at any offset.
        let limit = (usable / OFFSET_SHARE) & !15;
        if limit == 0 {
            0
        } else {
            (offset % limit) & !15
        }
    }
}
