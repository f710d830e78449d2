//! TLB cache helpers: fetching and
//! structurally-validating individual page-table pages, plus a batched
//! prefetch used ahead of a page-table walk.

use crate::address::{PhysAddr, PAGE_SIZE};
use crate::cache::{CacheTag, Cache, PageHandle};
use crate::config::MAX_TLB_PREFETCH_BATCH;
use crate::device::{MemScatter, ScatterDevice};
use crate::memmodel::MemoryModel;

/// Returns the page-table page at `pa`, consulting the TLB cache first,
/// then the PHYS cache, and only then the device: on a miss (unless
/// `cache_only`), a present PHYS entry for the same address is copied in
/// directly rather than re-reading it, otherwise a single-page device read
/// is issued. Either way the page is structurally checked before being
/// published into the TLB cache; a page that fails validation is never
/// returned as a page table.
pub fn tlb_get_page_table(
    cache: &Cache,
    device: &dyn ScatterDevice,
    memory_model: &dyn MemoryModel,
    is_x64: bool,
    pa: PhysAddr,
    cache_only: bool,
) -> Option<PageHandle> {
    if let Some(page) = cache.get(CacheTag::Tlb, pa) {
        return Some(page);
    }

    if cache_only {
        return None;
    }

    let mut buf = [0u8; PAGE_SIZE as usize];

    if let Some(phys_page) = cache.get(CacheTag::Phys, pa) {
        phys_page.read_into(&mut buf);
    } else {
        let mut units = [MemScatter::new(pa, &mut buf)];
        device.read_scatter(&mut units);

        if !units[0].valid {
            return None;
        }
    }

    if !memory_model.verify_page_table(&buf, pa, is_x64) {
        log::debug!("tlb: page at {pa} failed page-table validation, not caching");
        return None;
    }

    let page = cache.reserve(CacheTag::Tlb)?;
    page.write_from(pa, true, &buf);
    cache.publish(CacheTag::Tlb, page.clone());
    Some(page)
}

/// Warms the TLB cache for a batch of page-table addresses ahead of a
/// walk. Pages that fail to read are simply skipped; pages that read back
/// but fail the structural page-table check are not cached either --
/// the TLB table only ever holds pages `verify_page_table` has accepted.
pub fn tlb_prefetch(
    cache: &Cache,
    device: &dyn ScatterDevice,
    memory_model: &dyn MemoryModel,
    is_x64: bool,
    addrs: &[PhysAddr],
) {
    for batch in addrs.chunks(MAX_TLB_PREFETCH_BATCH) {
        let missing: Vec<PhysAddr> = batch
            .iter()
            .copied()
            .filter(|&addr| cache.get(CacheTag::Tlb, addr).is_none())
            .collect();

        if missing.is_empty() {
            continue;
        }

        let mut bufs = vec![[0u8; PAGE_SIZE as usize]; missing.len()];
        let mut units: Vec<MemScatter<'_>> = missing
            .iter()
            .zip(bufs.iter_mut())
            .map(|(&addr, buf)| MemScatter::new(addr, buf))
            .collect();

        device.read_scatter(&mut units);

        for (addr, unit) in missing.iter().zip(units.iter()) {
            if !unit.valid {
                continue;
            }
            if !memory_model.verify_page_table(unit.buf, *addr, is_x64) {
                log::debug!("tlb: prefetched page at {addr} failed page-table validation, not caching");
                continue;
            }
            if let Some(page) = cache.reserve(CacheTag::Tlb) {
                page.write_from(*addr, true, unit.buf);
                cache.publish(CacheTag::Tlb, page);
            }
        }
    }
}
