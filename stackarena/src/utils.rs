use std::io::Error;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns page size in bytes
pub fn page_size() -> usize {
    #[cold]
    fn sys_page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    static PAGE_SIZE_CACHE: AtomicUsize = AtomicUsize::new(0);
    match PAGE_SIZE_CACHE.load(Ordering::Relaxed) {
        0 => {
            let page_size = sys_page_size();
            assert!(
                page_size.is_power_of_two(),
                "page size {} is not a power of two",
                page_size
            );

            PAGE_SIZE_CACHE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

/// Returns true if `size` is a positive whole number of pages.
pub fn is_page_multiple(size: usize) -> bool {
    size != 0 && size % page_size() == 0
}

/// Rounds `size` up to the next page boundary.
pub fn round_to_pages(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

/// Changes the protection of `len` bytes starting at `addr`.
///
/// # Safety
///
/// `addr..addr + len` must be page aligned and mapped by the caller.
pub(crate) unsafe fn protect(addr: *mut u8, len: usize, prot: libc::c_int) -> Result<(), Error> {
    if libc::mprotect(addr as *mut libc::c_void, len, prot) == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}
