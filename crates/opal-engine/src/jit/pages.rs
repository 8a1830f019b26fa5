//! Executable-page manager
//!
//! A process-wide cache of read/write/execute pages. Compiled method bodies
//! are appended to the first page with enough remaining space; when none
//! fits, a new page is mapped. Pages live for the life of the process, so
//! published code pointers never dangle.

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Native page size used for code mappings.
pub const PAGE_SIZE: usize = 4096;

/// Method bodies are aligned to this boundary within a page.
const CODE_ALIGN: usize = 16;

struct Page {
    base: *mut u8,
    capacity: usize,
    used: usize,
}

unsafe impl Send for Page {}

impl Page {
    fn remaining(&self) -> usize {
        self.capacity - self.used
    }
}

struct PageManager {
    pages: Vec<Page>,
}

static PAGES: Lazy<Mutex<PageManager>> = Lazy::new(|| Mutex::new(PageManager { pages: Vec::new() }));

#[cfg(unix)]
fn map_rwx(size: usize) -> Option<*mut u8> {
    // SAFETY: anonymous private mapping, unobservable until code is copied in.
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        None
    } else {
        Some(base as *mut u8)
    }
}

#[cfg(not(unix))]
fn map_rwx(_size: usize) -> Option<*mut u8> {
    None
}

/// Copy `code` into executable memory and return its address, or `None`
/// when the platform cannot provide executable pages.
pub fn install(code: &[u8]) -> Option<*const u8> {
    let size = code.len();
    let mut manager = PAGES.lock();

    let slot = manager
        .pages
        .iter_mut()
        .find(|page| page.remaining() >= size);
    let page = match slot {
        Some(page) => page,
        None => {
            let capacity = size.max(PAGE_SIZE).div_ceil(PAGE_SIZE) * PAGE_SIZE;
            let base = map_rwx(capacity)?;
            manager.pages.push(Page {
                base,
                capacity,
                used: 0,
            });
            manager.pages.last_mut().expect("page just added")
        }
    };

    let target = unsafe { page.base.add(page.used) };
    unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), target, size) };
    page.used = (page.used + size).div_ceil(CODE_ALIGN) * CODE_ALIGN;
    page.used = page.used.min(page.capacity);
    Some(target)
}

/// Total pages mapped so far.
pub fn page_count() -> usize {
    PAGES.lock().pages.len()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_install_packs_small_bodies() {
        let a = install(&[0xC3]).expect("executable page");
        let b = install(&[0x90, 0xC3]).expect("executable page");
        assert_ne!(a, b);
        unsafe {
            assert_eq!(*a, 0xC3);
            assert_eq!(*b, 0x90);
            assert_eq!(*b.add(1), 0xC3);
        }
    }

    #[test]
    fn test_large_body_gets_own_mapping() {
        let body = vec![0x90u8; PAGE_SIZE + 17];
        let before = page_count();
        let ptr = install(&body).expect("executable page");
        assert!(page_count() > before);
        unsafe { assert_eq!(*ptr.add(PAGE_SIZE + 16), 0x90) };
    }
}
