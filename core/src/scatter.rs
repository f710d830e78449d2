//! The physical and virtual scatter I/O pipelines.
//!
//! Physical reads go cache -> speculative device batch -> cache publish.
//! Physical writes go straight to the device, then invalidate whatever they
//! touched in PHYS and TLB. Virtual reads/writes sit on top, translating
//! through a [`crate::memmodel::MemoryModel`] and falling back to its
//! paged-read hook when translation fails.

use crate::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::cache::{Cache, CacheTag};
use crate::config::MAX_SPECULATIVE_UNITS;
use crate::device::{MemScatter, ScatterAux, ScatterDevice, ScatterFlags};
use crate::memmodel::{MemoryModel, PagedReadOutcome, VirtualFlags};
use crate::process::Process;

/// One page-sized physical I/O request. Unlike [`MemScatter`], the buffer
/// lives with the caller for the whole pipeline, not just one device call.
pub struct ScatterRequest<'a> {
    pub addr: PhysAddr,
    pub buf: &'a mut [u8; PAGE_SIZE as usize],
    pub valid: bool,
}

impl<'a> ScatterRequest<'a> {
    pub fn new(addr: PhysAddr, buf: &'a mut [u8; PAGE_SIZE as usize]) -> Self {
        ScatterRequest { addr, buf, valid: false }
    }
}

/// Phase A+B+C+D+E of the physical read pipeline.
pub fn read_phys(cache: &Cache, device: &dyn ScatterDevice, flags: ScatterFlags, requests: &mut [ScatterRequest<'_>]) {
    // Phase A: cache probe.
    if !flags.contains(ScatterFlags::NOCACHE) {
        for req in requests.iter_mut() {
            if let Some(page) = cache.get(CacheTag::Phys, req.addr) {
                page.read_into(&mut req.buf[..]);
                req.valid = true;
            }
        }
    }

    if flags.contains(ScatterFlags::FORCECACHE_READ) {
        // Cache-only: the device is never touched, by contract.
        return;
    }

    let missing: Vec<usize> = requests
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.valid)
        .map(|(i, _)| i)
        .collect();

    if missing.is_empty() {
        return;
    }

    // Phase B+C: batch the device call, padding each batch out with
    // speculative neighbor-page reads to amortize the round trip. Only
    // `Normal` units ever get promoted back into a caller's buffer or act
    // as a future anchor; `Speculative` units only ever warm the cache.
    for anchors in missing.chunks(MAX_SPECULATIVE_UNITS) {
        let speculative_budget = MAX_SPECULATIVE_UNITS - anchors.len();
        let speculative_addrs = speculative_neighbors(requests, anchors, speculative_budget, cache);

        let mut anchor_bufs = vec![[0u8; PAGE_SIZE as usize]; anchors.len()];
        let mut speculative_bufs = vec![[0u8; PAGE_SIZE as usize]; speculative_addrs.len()];

        let mut units: Vec<MemScatter<'_>> = Vec::with_capacity(anchors.len() + speculative_addrs.len());
        for (&idx, buf) in anchors.iter().zip(anchor_bufs.iter_mut()) {
            units.push(MemScatter::new(requests[idx].addr, buf));
        }
        for (&addr, buf) in speculative_addrs.iter().zip(speculative_bufs.iter_mut()) {
            let mut unit = MemScatter::new(addr, buf);
            unit.aux = ScatterAux::Speculative;
            units.push(unit);
        }

        device.read_scatter(&mut units);

        for (pos, &idx) in anchors.iter().enumerate() {
            let unit = &units[pos];
            if unit.valid {
                requests[idx].buf.copy_from_slice(unit.buf);
                requests[idx].valid = true;
                maybe_publish(cache, flags, requests[idx].addr, unit.buf);
            } else if flags.contains(ScatterFlags::ZEROPAD_ON_FAIL) && requests[idx].addr.as_u64() < device.pa_max().as_u64() {
                requests[idx].buf.iter_mut().for_each(|b| *b = 0);
                requests[idx].valid = true;
            }
        }

        for (pos, unit) in units.iter().enumerate().skip(anchors.len()) {
            if unit.valid {
                maybe_publish(cache, flags, speculative_addrs[pos - anchors.len()], unit.buf);
            }
        }
    }
}

fn maybe_publish(cache: &Cache, flags: ScatterFlags, addr: PhysAddr, data: &[u8; PAGE_SIZE as usize]) {
    if flags.contains(ScatterFlags::NOCACHEPUT) {
        return;
    }
    if let Some(page) = cache.reserve(CacheTag::Phys) {
        page.write_from(addr, true, data);
        cache.publish(CacheTag::Phys, page);
    }
}

/// Picks up to `budget` neighbor pages (one page past each anchor) that
/// aren't already among the anchors and aren't already cached, to fold into
/// the same device round-trip.
fn speculative_neighbors(
    requests: &[ScatterRequest<'_>],
    anchors: &[usize],
    budget: usize,
    cache: &Cache,
) -> Vec<PhysAddr> {
    let mut picked = Vec::with_capacity(budget);
    let anchor_addrs: Vec<PhysAddr> = anchors.iter().map(|&i| requests[i].addr).collect();

    for &idx in anchors {
        if picked.len() >= budget {
            break;
        }
        let candidate = requests[idx].addr + PAGE_SIZE;
        if anchor_addrs.contains(&candidate) || picked.contains(&candidate) {
            continue;
        }
        if cache.get(CacheTag::Phys, candidate).is_some() {
            continue;
        }
        picked.push(candidate);
    }

    picked
}

/// Issues a device write for each request, then invalidates PHYS and TLB
/// for whatever addresses the write actually touched.
pub fn write_phys(cache: &Cache, device: &dyn ScatterDevice, requests: &mut [ScatterRequest<'_>]) {
    let mut units: Vec<MemScatter<'_>> = requests
        .iter_mut()
        .map(|r| {
            let mut unit = MemScatter::new(r.addr, r.buf);
            unit.valid = true;
            unit
        })
        .collect();

    device.write_scatter(&mut units);

    for (req, unit) in requests.iter_mut().zip(units.iter()) {
        req.valid = unit.valid;
        if unit.valid {
            cache.invalidate_phys_and_tlb(req.addr);
        }
    }
}

pub struct VirtUnit<'a> {
    pub va: VirtAddr,
    pub buf: &'a mut [u8; PAGE_SIZE as usize],
    pub valid: bool,
}

#[allow(clippy::too_many_arguments)]
pub fn read_virt(
    process: &Process,
    memory_model: &dyn MemoryModel,
    cache: &Cache,
    device: &dyn ScatterDevice,
    flags: VirtualFlags,
    phys_flags: ScatterFlags,
    units: &mut [VirtUnit<'_>],
) {
    // Pass 1: translate (or paged-read) every unit, sharing buffers by
    // pointer rather than copying, and collect everything that still needs
    // a physical fetch into one contiguous request vector instead of
    // issuing a device round trip per unit.
    let mut reqs: Vec<ScatterRequest<'_>> = Vec::new();
    let mut req_indices: Vec<usize> = Vec::new();

    for (i, unit) in units.iter_mut().enumerate() {
        if let Some(pa) = memory_model.virt_to_phys(process, unit.va) {
            reqs.push(ScatterRequest::new(pa, &mut *unit.buf));
            req_indices.push(i);
            continue;
        }

        if flags.contains(VirtualFlags::NOPAGING) {
            if flags.contains(VirtualFlags::ZEROPAD_ON_FAIL) {
                unit.buf.iter_mut().for_each(|b| *b = 0);
                unit.valid = true;
            }
            continue;
        }

        match memory_model.paged_read(process, unit.va, PhysAddr::INVALID, &mut unit.buf[..], flags) {
            PagedReadOutcome::Done => unit.valid = true,
            PagedReadOutcome::TranslatedTo(pa) => {
                reqs.push(ScatterRequest::new(pa, &mut *unit.buf));
                req_indices.push(i);
            }
            PagedReadOutcome::Fail => {
                if flags.contains(VirtualFlags::ZEROPAD_ON_FAIL) {
                    unit.buf.iter_mut().for_each(|b| *b = 0);
                    unit.valid = true;
                }
            }
        }
    }

    // Pass 2: one batched physical call for every unit that needs it, so
    // the cache probe and speculative device read happen across the whole
    // batch rather than per-unit.
    if !reqs.is_empty() {
        read_phys(cache, device, phys_flags, &mut reqs);
    }

    let results: Vec<bool> = reqs.iter().map(|r| r.valid).collect();
    for (idx, valid) in req_indices.into_iter().zip(results) {
        units[idx].valid = valid;
    }
}

/// Byte-range read on top of [`read_virt`], splitting into page-aligned
/// units with bounce buffers for the (possibly partial) first and last
/// pages. Returns the number of bytes actually copied into `out`.
#[allow(clippy::too_many_arguments)]
pub fn read_virt_bytes(
    process: &Process,
    memory_model: &dyn MemoryModel,
    cache: &Cache,
    device: &dyn ScatterDevice,
    flags: VirtualFlags,
    phys_flags: ScatterFlags,
    va: VirtAddr,
    out: &mut [u8],
) -> usize {
    let mut copied = 0usize;

    while copied < out.len() {
        let cur_va = va + copied as u64;
        let page_va = cur_va.align_down();
        let page_off = cur_va.page_offset() as usize;
        let chunk_len = (PAGE_SIZE as usize - page_off).min(out.len() - copied);

        let mut page_buf = [0u8; PAGE_SIZE as usize];
        let mut units = [VirtUnit { va: page_va, buf: &mut page_buf, valid: false }];
        read_virt(process, memory_model, cache, device, flags, phys_flags, &mut units);

        if units[0].valid {
            out[copied..copied + chunk_len].copy_from_slice(&page_buf[page_off..page_off + chunk_len]);
        } else if flags.contains(VirtualFlags::ZEROPAD_ON_FAIL) {
            out[copied..copied + chunk_len].fill(0);
        } else {
            break;
        }

        copied += chunk_len;
    }

    copied
}

/// Byte-range write: translates every page touched, writes through the
/// physical pipeline, and stops at the first page that fails to translate.
/// Returns the number of bytes actually written.
pub fn write_virt_bytes(
    process: &Process,
    memory_model: &dyn MemoryModel,
    cache: &Cache,
    device: &dyn ScatterDevice,
    va: VirtAddr,
    data: &[u8],
) -> usize {
    let mut written = 0usize;

    while written < data.len() {
        let cur_va = va + written as u64;
        let page_va = cur_va.align_down();
        let page_off = cur_va.page_offset() as usize;
        let chunk_len = (PAGE_SIZE as usize - page_off).min(data.len() - written);

        let Some(pa) = memory_model.virt_to_phys(process, page_va) else {
            break;
        };

        // Partial-page writes need a read-modify-write so we don't clobber
        // the untouched bytes on either side of the chunk.
        let mut page_buf = [0u8; PAGE_SIZE as usize];
        if chunk_len != PAGE_SIZE as usize {
            let mut reqs = [ScatterRequest::new(pa, &mut page_buf)];
            read_phys(cache, device, ScatterFlags::empty(), &mut reqs);
        }
        page_buf[page_off..page_off + chunk_len].copy_from_slice(&data[written..written + chunk_len]);

        let mut reqs = [ScatterRequest::new(pa, &mut page_buf)];
        write_phys(cache, device, &mut reqs);

        if !reqs[0].valid {
            break;
        }

        written += chunk_len;
    }

    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CACHE_MAX_ENTRIES;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct FakeDevice {
        pages: Mutex<HashMap<u64, [u8; PAGE_SIZE as usize]>>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl FakeDevice {
        fn new() -> Self {
            FakeDevice { pages: Mutex::new(HashMap::new()), calls: std::sync::atomic::AtomicUsize::new(0) }
        }

        fn seed(&self, addr: u64, byte: u8) {
            self.pages.lock().insert(addr, [byte; PAGE_SIZE as usize]);
        }
    }

    impl ScatterDevice for FakeDevice {
        fn read_scatter(&self, units: &mut [MemScatter<'_>]) {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let pages = self.pages.lock();
            for unit in units.iter_mut() {
                if let Some(data) = pages.get(&unit.addr.as_u64()) {
                    unit.buf.copy_from_slice(data);
                    unit.valid = true;
                } else {
                    unit.valid = false;
                }
            }
        }

        fn write_scatter(&self, units: &mut [MemScatter<'_>]) {
            let mut pages = self.pages.lock();
            for unit in units.iter_mut() {
                pages.insert(unit.addr.as_u64(), *unit.buf);
                unit.valid = true;
            }
        }

        fn pa_max(&self) -> PhysAddr {
            PhysAddr::new(1 << 40)
        }
    }

    #[test]
    fn read_phys_populates_cache_on_miss_then_hits_it() {
        let cache = Cache::new(DEFAULT_CACHE_MAX_ENTRIES);
        let device = FakeDevice::new();
        device.seed(0x1000, 0x42);

        let mut buf = [0u8; PAGE_SIZE as usize];
        let mut reqs = [ScatterRequest::new(PhysAddr::new(0x1000), &mut buf)];
        read_phys(&cache, &device, ScatterFlags::empty(), &mut reqs);

        assert!(reqs[0].valid);
        assert_eq!(reqs[0].buf[0], 0x42);
        assert!(cache.get(CacheTag::Phys, PhysAddr::new(0x1000)).is_some());

        let calls_before = device.calls.load(std::sync::atomic::Ordering::SeqCst);
        let mut buf2 = [0u8; PAGE_SIZE as usize];
        let mut reqs2 = [ScatterRequest::new(PhysAddr::new(0x1000), &mut buf2)];
        read_phys(&cache, &device, ScatterFlags::empty(), &mut reqs2);
        assert_eq!(device.calls.load(std::sync::atomic::Ordering::SeqCst), calls_before);
        assert_eq!(reqs2[0].buf[0], 0x42);
    }

    #[test]
    fn force_cache_read_never_touches_the_device() {
        let cache = Cache::new(DEFAULT_CACHE_MAX_ENTRIES);
        let device = FakeDevice::new();
        device.seed(0x2000, 0x7);

        let mut buf = [0u8; PAGE_SIZE as usize];
        let mut reqs = [ScatterRequest::new(PhysAddr::new(0x2000), &mut buf)];
        read_phys(&cache, &device, ScatterFlags::FORCECACHE_READ, &mut reqs);

        assert!(!reqs[0].valid);
        assert_eq!(device.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn write_invalidates_phys_and_tlb() {
        let cache = Cache::new(DEFAULT_CACHE_MAX_ENTRIES);
        let device = FakeDevice::new();
        let addr = PhysAddr::new(0x3000);

        for tag in [CacheTag::Phys, CacheTag::Tlb] {
            let page = cache.reserve(tag).unwrap();
            page.write_from(addr, true, &[9; PAGE_SIZE as usize]);
            cache.publish(tag, page);
        }

        let mut buf = [5u8; PAGE_SIZE as usize];
        let mut reqs = [ScatterRequest::new(addr, &mut buf)];
        write_phys(&cache, &device, &mut reqs);

        assert!(reqs[0].valid);
        assert!(cache.get(CacheTag::Phys, addr).is_none());
        assert!(cache.get(CacheTag::Tlb, addr).is_none());
    }

    #[test]
    fn zeropad_on_fail_fills_unreachable_unit() {
        let cache = Cache::new(DEFAULT_CACHE_MAX_ENTRIES);
        let device = FakeDevice::new();

        let mut buf = [0xffu8; PAGE_SIZE as usize];
        let mut reqs = [ScatterRequest::new(PhysAddr::new(0x9000), &mut buf)];
        read_phys(&cache, &device, ScatterFlags::ZEROPAD_ON_FAIL, &mut reqs);

        assert!(reqs[0].valid);
        assert!(reqs[0].buf.iter().all(|&b| b == 0));
    }
}
