use std::collections::HashMap;
use std::io::{Error, ErrorKind};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;
use libc::{mmap, munmap, MAP_ANON, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use parking_lot::Mutex;

use crate::utils::{page_size, round_to_pages};

/// A block of memory handed out by an [`Arena`].
///
/// Regions are move-only. Give the exact region you received back to the arena that
/// produced it; dropping a region without doing so leaks its memory.
#[must_use = "dropping a region leaks it, give it back with `Arena::deallocate`"]
#[derive(Debug)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Region {}

impl Region {
    /// Builds a region handle out of raw parts.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + len` must be memory owned by an arena and not described by any other
    /// live `Region`.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last byte of the region.
    pub fn end(&self) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(self.len) }
    }
}

/// A locale-wide source of stack memory, shared by all cores of a node.
pub trait Arena: Send + Sync {
    /// Returns a zero-initialized region of at least `size` bytes whose start is a
    /// multiple of `alignment`.
    fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<Region, Error>;

    /// Takes back a region previously returned by `allocate_aligned`.
    fn deallocate(&self, region: Region) -> Result<(), Error>;

    /// Bytes handed out and not yet returned.
    fn outstanding_bytes(&self) -> usize;
}

struct RecycleCache {
    region_len: usize,
    queue: ArrayQueue<Region>,
}

/// The default [`Arena`], backed by anonymous memory mappings.
///
/// Mappings are created with `MAP_NORESERVE`, so reserving a big stack only costs
/// address space until its pages are touched.
pub struct LocaleArena {
    live: Mutex<HashMap<usize, usize>>,
    outstanding: AtomicUsize,
    limit: Option<usize>,
    cache: Option<RecycleCache>,
}

impl LocaleArena {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            limit: None,
            cache: None,
        }
    }

    /// Keep up to `capacity` returned regions of exactly `region_len` bytes (rounded up
    /// to pages) around for reuse instead of unmapping them.
    pub fn with_cache(mut self, region_len: usize, capacity: usize) -> Self {
        self.cache = if capacity == 0 {
            None
        } else {
            Some(RecycleCache {
                region_len: round_to_pages(region_len),
                queue: ArrayQueue::new(capacity),
            })
        };
        self
    }

    /// Refuse allocations that would push the outstanding bytes above `bytes`.
    pub fn with_limit(mut self, bytes: usize) -> Self {
        self.limit = Some(bytes);
        self
    }

    /// Number of regions currently parked in the recycle cache.
    pub fn cached_regions(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.queue.len())
    }

    /// Number of regions handed out and not yet returned.
    pub fn live_regions(&self) -> usize {
        self.live.lock().len()
    }

    fn reserve(&self, len: usize) -> Result<(), Error> {
        let mut current = self.outstanding.load(Ordering::Relaxed);
        loop {
            let next = current + len;
            if let Some(limit) = self.limit {
                if next > limit {
                    return Err(Error::new(
                        ErrorKind::OutOfMemory,
                        format!(
                            "arena limit of {} bytes reached ({} outstanding, {} requested)",
                            limit, current, len
                        ),
                    ));
                }
            }
            match self.outstanding.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn recycled(&self, len: usize) -> Option<Region> {
        let cache = self.cache.as_ref()?;
        if cache.region_len != len {
            return None;
        }
        let region = cache.queue.pop()?;
        // Handed out memory is always zeroed, fresh mappings are zeroed by the kernel.
        unsafe { ptr::write_bytes(region.as_ptr(), 0, region.len()) };
        Some(region)
    }

    unsafe fn map(len: usize) -> Result<Region, Error> {
        let ptr = mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANON | MAP_NORESERVE,
            -1,
            0,
        );
        if ptr == MAP_FAILED {
            Err(Error::last_os_error())
        } else {
            Ok(Region::from_raw_parts(
                NonNull::new_unchecked(ptr as *mut u8),
                len,
            ))
        }
    }

    unsafe fn unmap(region: Region) -> Result<(), Error> {
        if munmap(region.as_ptr() as *mut libc::c_void, region.len()) == 0 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }
}

impl Default for LocaleArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena for LocaleArena {
    fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<Region, Error> {
        if !alignment.is_power_of_two() || alignment > page_size() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "alignment {} must be a power of two no larger than the page size {}",
                    alignment,
                    page_size()
                ),
            ));
        }
        if size == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "zero sized region"));
        }

        let len = round_to_pages(size);
        self.reserve(len)?;

        let region = match self.recycled(len) {
            Some(region) => region,
            None => match unsafe { Self::map(len) } {
                Ok(region) => region,
                Err(err) => {
                    self.outstanding.fetch_sub(len, Ordering::AcqRel);
                    return Err(err);
                }
            },
        };

        self.live.lock().insert(region.as_ptr() as usize, len);
        tracing::trace!(addr = ?region.as_ptr(), len, "region allocated");
        Ok(region)
    }

    fn deallocate(&self, region: Region) -> Result<(), Error> {
        let addr = region.as_ptr() as usize;
        {
            let mut live = self.live.lock();
            match live.get(&addr) {
                Some(&len) if len == region.len() => {
                    live.remove(&addr);
                }
                Some(&len) => {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        format!(
                            "region {:#x} was handed out with {} bytes, returned with {}",
                            addr,
                            len,
                            region.len()
                        ),
                    ));
                }
                None => {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        format!(
                            "region {:#x} ({} bytes) is not outstanding in this arena",
                            addr,
                            region.len()
                        ),
                    ));
                }
            }
        }
        self.outstanding.fetch_sub(region.len(), Ordering::AcqRel);
        tracing::trace!(addr = ?region.as_ptr(), len = region.len(), "region returned");

        let region = match &self.cache {
            Some(cache) if cache.region_len == region.len() => match cache.queue.push(region) {
                Ok(()) => return Ok(()),
                // Over capacity, unmap it.
                Err(region) => region,
            },
            _ => region,
        };
        unsafe { Self::unmap(region) }
    }

    fn outstanding_bytes(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl Drop for LocaleArena {
    fn drop(&mut self) {
        let leaked = self.live.get_mut().len();
        if leaked != 0 {
            tracing::warn!(
                regions = leaked,
                bytes = self.outstanding.load(Ordering::Acquire),
                "arena dropped with regions still outstanding"
            );
        }
        if let Some(cache) = &self.cache {
            while let Some(region) = cache.queue.pop() {
                let result = unsafe { Self::unmap(region) };
                debug_assert!(result.is_ok());
            }
        }
    }
}
