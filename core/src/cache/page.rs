//! The cache page itself: a 4 KiB buffer plus physical address and validity.

use crate::address::{PhysAddr, PAGE_SIZE};
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) struct PageInner {
    pub addr: PhysAddr,
    pub valid: bool,
    pub data: Box<[u8; PAGE_SIZE as usize]>,
}

/// A cached 4 KiB page.
///
/// Content access always goes through the page's own short-lived lock and
/// copies bytes in or out -- callers never hold a live borrow into
/// cache-owned memory. A page is only ever handed back to the empty pool by
/// an explicit `reclaim`/`invalidate`, never implicitly when some caller's
/// handle is dropped, because no caller retains one past a single
/// `read_into`/`write_from` call.
pub struct Page {
    pub(crate) inner: Mutex<PageInner>,
}

pub type PageHandle = Arc<Page>;

impl Page {
    pub(crate) fn new() -> PageHandle {
        Arc::new(Page {
            inner: Mutex::new(PageInner {
                addr: PhysAddr::INVALID,
                valid: false,
                data: Box::new([0u8; PAGE_SIZE as usize]),
            }),
        })
    }

    pub fn addr(&self) -> PhysAddr {
        self.inner.lock().addr
    }

    pub fn is_valid(&self) -> bool {
        self.inner.lock().valid
    }

    pub fn read_into(&self, out: &mut [u8]) {
        let inner = self.inner.lock();
        let len = out.len().min(inner.data.len());
        out[..len].copy_from_slice(&inner.data[..len]);
    }

    pub fn write_from(&self, addr: PhysAddr, valid: bool, src: &[u8]) {
        let mut inner = self.inner.lock();
        inner.addr = addr;
        inner.valid = valid;
        let len = src.len().min(inner.data.len());
        inner.data[..len].copy_from_slice(&src[..len]);
    }

    pub fn mark_valid(&self, valid: bool) {
        self.inner.lock().valid = valid;
    }

    /// Returns the page to its pristine, unpublished state: sentinel
    /// address, invalid, contents left as-is (the next `write_from` call
    /// overwrites them before anyone can observe stale data).
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.addr = PhysAddr::INVALID;
        inner.valid = false;
    }
}
