use std::io::{Error, ErrorKind};
use std::mem::size_of;
use std::ops::Range;

use libc::{PROT_NONE, PROT_READ, PROT_WRITE};

use crate::arena::Region;
use crate::utils::{is_page_multiple, page_size, protect};
use crate::Stack;

/// A worker stack bracketed by two guard pages.
///
/// The guards start disarmed (read/write). [`arm`](GuardedStack::arm) turns them into
/// `PROT_NONE` pages, so that running off either end of the usable range faults instead
/// of silently writing into a neighbour. The whole usable range can additionally be made
/// read-only while the owning worker is not running, which catches writes through stale
/// references into a suspended stack.
pub struct GuardedStack {
    region: Region,
    usable: usize,
    page: usize,
    armed: bool,
    read_only: bool,
}

unsafe impl Send for GuardedStack {}

impl GuardedStack {
    /// Lays out `[guard][usable_size bytes][guard]` inside `region`.
    pub fn new(region: Region, usable_size: usize) -> Result<Self, (Region, Error)> {
        let page = page_size();
        if !is_page_multiple(usable_size) {
            let err = Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "usable stack size {} is not a positive multiple of the page size {}",
                    usable_size, page
                ),
            );
            return Err((region, err));
        }
        if region.as_ptr() as usize % page != 0 || region.len() < usable_size + 2 * page {
            let err = Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "region {:?} ({} bytes) can't hold a {} byte stack and two guard pages",
                    region.as_ptr(),
                    region.len(),
                    usable_size
                ),
            );
            return Err((region, err));
        }
        Ok(Self {
            region,
            usable: usable_size,
            page,
            armed: false,
            read_only: false,
        })
    }

    pub fn usable_size(&self) -> usize {
        self.usable
    }

    /// Address range a worker may touch.
    pub fn usable_range(&self) -> Range<usize> {
        let start = self.region.as_ptr() as usize + self.page;
        start..start + self.usable
    }

    /// The guard below the usable range, hit by a stack overflow.
    pub fn low_guard(&self) -> Range<usize> {
        let start = self.region.as_ptr() as usize;
        start..start + self.page
    }

    /// The guard above the usable range, hit by an underflow.
    pub fn high_guard(&self) -> Range<usize> {
        let start = self.usable_range().end;
        start..start + self.page
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns true if `addr` lies inside one of the two guard pages.
    pub fn in_guard(&self, addr: usize) -> bool {
        self.low_guard().contains(&addr) || self.high_guard().contains(&addr)
    }

    /// Makes both guard pages inaccessible.
    pub fn arm(&mut self) -> Result<(), Error> {
        self.set_guards(PROT_NONE)?;
        self.armed = true;
        Ok(())
    }

    /// Makes both guard pages read/write again.
    pub fn disarm(&mut self) -> Result<(), Error> {
        self.set_guards(PROT_READ | PROT_WRITE)?;
        self.armed = false;
        Ok(())
    }

    /// Makes the usable range read-only.
    pub fn protect_unused(&mut self) -> Result<(), Error> {
        unsafe { protect(self.usable_start(), self.usable, PROT_READ)? };
        self.read_only = true;
        Ok(())
    }

    /// Makes the usable range read/write again.
    pub fn unprotect(&mut self) -> Result<(), Error> {
        unsafe { protect(self.usable_start(), self.usable, PROT_READ | PROT_WRITE)? };
        self.read_only = false;
        Ok(())
    }

    /// Restores read/write access everywhere and gives back the underlying region, so it
    /// can be returned to the arena. On failure the stack is handed back unchanged.
    pub fn into_region(mut self) -> Result<Region, (Self, Error)> {
        if self.read_only {
            if let Err(err) = self.unprotect() {
                return Err((self, err));
            }
        }
        if self.armed {
            if let Err(err) = self.disarm() {
                return Err((self, err));
            }
        }
        Ok(self.region)
    }

    fn usable_start(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(self.page) }
    }

    fn set_guards(&mut self, prot: libc::c_int) -> Result<(), Error> {
        unsafe {
            protect(self.region.as_ptr(), self.page, prot)?;
            protect(self.usable_start().add(self.usable), self.page, prot)
        }
    }
}

impl Stack for GuardedStack {
    fn bottom(&self) -> *mut usize {
        // The `add(size)` function for type T adds `size * size_of(T)` bytes to the pointer.
        unsafe { (self.usable_start() as *mut usize).add(self.usable / size_of::<usize>()) }
    }

    fn top(&self) -> *mut usize {
        self.usable_start() as *mut usize
    }
}
