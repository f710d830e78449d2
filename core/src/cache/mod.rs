//! The three-tier page cache.
//!
//! PHYS caches arbitrary physical pages, TLB caches physical pages already
//! verified to be page-table pages, and PAGING caches reconstructed
//! paged-out pages. PHYS and TLB are invalidated together on a
//! write-through to physical memory; PAGING is not (a paged-out
//! reconstruction has no corresponding live physical address to write
//! through to).

mod page;
mod table;

pub use page::{Page, PageHandle};
pub use table::CacheTable;

use crate::address::PhysAddr;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum CacheTag {
    Phys,
    Tlb,
    Paging,
}

pub struct Cache {
    phys: CacheTable,
    tlb: CacheTable,
    paging: CacheTable,
}

impl Cache {
    pub fn new(max_entries_per_table: usize) -> Self {
        Cache {
            phys: CacheTable::new(max_entries_per_table),
            tlb: CacheTable::new(max_entries_per_table),
            paging: CacheTable::new(max_entries_per_table),
        }
    }

    pub fn table(&self, tag: CacheTag) -> &CacheTable {
        match tag {
            CacheTag::Phys => &self.phys,
            CacheTag::Tlb => &self.tlb,
            CacheTag::Paging => &self.paging,
        }
    }

    pub fn get(&self, tag: CacheTag, addr: PhysAddr) -> Option<PageHandle> {
        self.table(tag).get(addr)
    }

    pub fn reserve(&self, tag: CacheTag) -> Option<PageHandle> {
        self.table(tag).reserve()
    }

    pub fn publish(&self, tag: CacheTag, page: PageHandle) {
        self.table(tag).publish(page);
    }

    /// Invalidates `addr` in both PHYS and TLB, as required whenever a
    /// physical write goes through.
    pub fn invalidate_phys_and_tlb(&self, addr: PhysAddr) {
        self.phys.invalidate(addr);
        self.tlb.invalidate(addr);
    }

    pub fn clear(&self, tag: CacheTag) {
        self.table(tag).clear();
    }

    pub fn close_all(&self) {
        self.phys.close();
        self.tlb.close();
        self.paging.close();
    }
}
