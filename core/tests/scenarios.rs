//! End-to-end scenarios exercising `Context` as a whole, rather than one
//! module at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use vmm_core::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use vmm_core::config::SystemType;
use vmm_core::device::{MemScatter, ScatterDevice, ScatterFlags};
use vmm_core::maps::{self, HandleEntry, HeapEntry, ModuleEntry, ThreadEntry, VadEntry};
use vmm_core::memmodel::{MemoryModel, PagedReadOutcome, VirtualFlags};
use vmm_core::process::{GetNextFlags, Pid, Process, ProcessState, ShortName};
use vmm_core::{Config, Context, ProcessDescriptor};

struct CountingDevice {
    pages: Mutex<HashMap<u64, [u8; PAGE_SIZE as usize]>>,
    read_calls: AtomicUsize,
    write_calls: AtomicUsize,
}

impl CountingDevice {
    fn new() -> Self {
        CountingDevice {
            pages: Mutex::new(HashMap::new()),
            read_calls: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
        }
    }

    fn seed(&self, addr: u64, fill: u8) {
        self.pages.lock().insert(addr, [fill; PAGE_SIZE as usize]);
    }
}

impl ScatterDevice for CountingDevice {
    fn read_scatter(&self, units: &mut [MemScatter<'_>]) {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let pages = self.pages.lock();
        for unit in units.iter_mut() {
            match pages.get(&unit.addr.as_u64()) {
                Some(data) => {
                    unit.buf.copy_from_slice(data);
                    unit.valid = true;
                }
                None => unit.valid = false,
            }
        }
    }

    fn write_scatter(&self, units: &mut [MemScatter<'_>]) {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
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

struct IdentityModel;

impl MemoryModel for IdentityModel {
    fn virt_to_phys(&self, _process: &Process, va: VirtAddr) -> Option<PhysAddr> {
        Some(PhysAddr::new(va.as_u64()))
    }

    fn verify_page_table(&self, _page: &[u8; 4096], _pa: PhysAddr, _is_x64: bool) -> bool {
        true
    }

    fn paged_read(
        &self,
        _process: &Process,
        _va: VirtAddr,
        _pa: PhysAddr,
        _scratch: &mut [u8],
        _flags: VirtualFlags,
    ) -> PagedReadOutcome {
        PagedReadOutcome::Fail
    }

    fn pte_map_initialize(&self, _process: &Process) -> bool {
        true
    }
}

fn make_process(ctx: &Context, raw_pid: u64, dtb: u64) -> Arc<Process> {
    ctx.create_process_entry(
        true,
        ProcessDescriptor {
            pid: Pid::new(raw_pid).unwrap(),
            parent_pid: None,
            state: ProcessState::Active,
            dtb: PhysAddr::new(dtb),
            dtb_user: None,
            name: ShortName::new("scenario.exe"),
            user_mode_only: true,
            eprocess_bytes: None,
        },
    )
    .expect("process creation should succeed")
}

/// Scenario 1: a page-aligned virtual read warms the PHYS cache, and a
/// second read of the same page is served from cache without another
/// device round trip.
#[test]
fn scenario_read_then_cache_warm() {
    let device = Arc::new(CountingDevice::new());
    device.seed(0x1000, 0x5A);

    let ctx = Context::open(Config::new(SystemType::X64), device.clone(), Arc::new(IdentityModel)).unwrap();
    let process = make_process(&ctx, 1, 0x1000);
    ctx.finish_process_refresh();

    let mut out = [0u8; PAGE_SIZE as usize];
    assert_eq!(ctx.read_virt(&process, VirtAddr::new(0x1000), &mut out), out.len());
    assert!(out.iter().all(|&b| b == 0x5A));

    let calls_after_first = device.read_calls.load(Ordering::SeqCst);
    assert!(calls_after_first >= 1);

    let mut out2 = [0u8; PAGE_SIZE as usize];
    ctx.read_virt(&process, VirtAddr::new(0x1000), &mut out2);
    assert_eq!(device.read_calls.load(Ordering::SeqCst), calls_after_first);
    assert_eq!(out, out2);
}

/// Scenario 2: a physical write invalidates both PHYS and TLB for that
/// address, so a subsequent read observes the new contents rather than a
/// stale cached copy.
#[test]
fn scenario_write_invalidates_cache() {
    let device = Arc::new(CountingDevice::new());
    device.seed(0x4000, 0x11);

    let ctx = Context::open(Config::new(SystemType::X64), device, Arc::new(IdentityModel)).unwrap();

    let mut out = [0u8; PAGE_SIZE as usize];
    ctx.read_phys(PhysAddr::new(0x4000), &mut out);
    assert!(out.iter().all(|&b| b == 0x11));

    let new_contents = [0x99u8; PAGE_SIZE as usize];
    assert!(ctx.write_phys(PhysAddr::new(0x4000), &new_contents));

    let mut out2 = [0u8; PAGE_SIZE as usize];
    ctx.read_phys(PhysAddr::new(0x4000), &mut out2);
    assert!(out2.iter().all(|&b| b == 0x99));
}

/// Scenario 3: TLB prefetch warms the cache for a batch of addresses, and
/// a subsequent `tlb_get_page_table` call for one of them is served from
/// cache.
#[test]
fn scenario_tlb_prefetch_then_get() {
    let device = Arc::new(CountingDevice::new());
    for i in 0..8u64 {
        device.seed(i * PAGE_SIZE, i as u8);
    }

    let ctx = Context::open(Config::new(SystemType::X64), device, Arc::new(IdentityModel)).unwrap();

    let addrs: Vec<PhysAddr> = (0..8u64).map(|i| PhysAddr::new(i * PAGE_SIZE)).collect();
    ctx.tlb_prefetch(&addrs);

    for addr in &addrs {
        let page = ctx.tlb_get_page_table(*addr, true).expect("should be warmed in cache");
        assert_eq!(page.addr(), *addr);
    }
}

/// Scenario 4: `parallel_foreach_processes` runs exactly once per process,
/// with no duplicates and no missed entries, across a few dozen processes.
#[test]
fn scenario_parallel_foreach_visits_each_process_once() {
    let device = Arc::new(CountingDevice::new());
    device.seed(0x1000, 0);

    let ctx = Context::open(Config::new(SystemType::X64), device, Arc::new(IdentityModel)).unwrap();

    for raw_pid in 1..=64u64 {
        make_process(&ctx, raw_pid, 0x1000);
    }
    ctx.finish_process_refresh();

    let visit_counts = Arc::new(Mutex::new(HashMap::<u64, u32>::new()));
    let visit_counts_clone = visit_counts.clone();
    ctx.parallel_foreach_processes(GetNextFlags::empty(), move |process| {
        let mut counts = visit_counts_clone.lock();
        *counts.entry(process.pid.get()).or_insert(0) += 1;
    });

    let counts = visit_counts.lock();
    assert_eq!(counts.len(), 64);
    assert!(counts.values().all(|&c| c == 1));
}

/// Scenario 5: a total refresh replaces process identity but preserves the
/// persistent sub-object keyed by PID.
#[test]
fn scenario_total_refresh_preserves_persistent_object() {
    let device = Arc::new(CountingDevice::new());
    device.seed(0x1000, 0);

    let ctx = Context::open(Config::new(SystemType::X64), device, Arc::new(IdentityModel)).unwrap();

    let first = make_process(&ctx, 1, 0x1000);
    first.persistent.set("note", vec![1, 2, 3]);
    ctx.finish_process_refresh();

    ctx.begin_process_refresh(true);
    let second = make_process(&ctx, 1, 0x1000);
    ctx.finish_process_refresh();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.persistent.get("note"), Some(vec![1, 2, 3]));
}

/// Scenario 6: `FORCECACHE_READ` issues zero device calls even on a total
/// cache miss.
#[test]
fn scenario_forcecache_read_issues_no_device_calls() {
    let device = Arc::new(CountingDevice::new());

    let cache = vmm_core::cache::Cache::new(64);
    let calls_before = device.read_calls.load(Ordering::SeqCst);

    let mut buf = [0u8; PAGE_SIZE as usize];
    let mut reqs = [vmm_core::scatter::ScatterRequest::new(PhysAddr::new(0x1000), &mut buf)];
    vmm_core::scatter::read_phys(&cache, device.as_ref(), ScatterFlags::FORCECACHE_READ, &mut reqs);

    assert!(!reqs[0].valid);
    assert_eq!(device.read_calls.load(Ordering::SeqCst), calls_before);
}

struct ScenarioProcessEnumerator;

impl maps::ProcessEnumerator for ScenarioProcessEnumerator {
    fn enumerate_modules(&self, _pid: Pid) -> Vec<ModuleEntry> {
        vec![
            ModuleEntry { base: 0x40_0000, size: 0x1000, name: "scenario.exe".into(), full_path: None },
            ModuleEntry { base: 0x7f_0000_0000, size: 0x9000, name: "ntdll.dll".into(), full_path: None },
        ]
    }

    fn enumerate_vads(&self, _pid: Pid) -> Vec<VadEntry> {
        vec![
            VadEntry { va_start: 0x40_0000, va_end: 0x41_0000, is_private: false, protection: 0x20 },
            VadEntry { va_start: 0x1_0000_0000, va_end: 0x1_0010_0000, is_private: true, protection: 0x04 },
        ]
    }

    fn enumerate_threads(&self, _pid: Pid) -> Vec<ThreadEntry> {
        vec![ThreadEntry { tid: 555, entry_point: 0x40_1000, suspend_count: 0 }]
    }

    fn enumerate_handles(&self, _pid: Pid) -> Vec<HandleEntry> {
        vec![HandleEntry { handle: 8, object_type: "File".into(), granted_access: 0x12_0089 }]
    }

    fn enumerate_heaps(&self, _pid: Pid) -> Vec<HeapEntry> {
        vec![HeapEntry { base: 0x2_0000_0000, size: 0x10_0000 }]
    }
}

/// Scenario 7: per-process maps build once (cached `Arc` is stable across
/// repeat calls) and are then queryable through the binary-search lookup
/// helpers rather than a linear scan.
#[test]
fn scenario_process_maps_build_once_and_support_lookup() {
    let device = Arc::new(CountingDevice::new());
    device.seed(0x1000, 0);

    let ctx = Context::open(Config::new(SystemType::X64), device, Arc::new(IdentityModel))
        .unwrap()
        .with_process_enumerator(Arc::new(ScenarioProcessEnumerator));

    let process = make_process(&ctx, 9, 0x1000);
    ctx.finish_process_refresh();

    let modules = ctx.modules(&process);
    assert!(maps::find_module_by_name(&modules, "NTDLL.DLL").is_some());
    assert!(Arc::ptr_eq(&modules, &ctx.modules(&process)));

    let vads = ctx.vads(&process);
    assert_eq!(maps::find_vad_containing(&vads, 0x40_0500).unwrap().protection, 0x20);
    assert!(maps::find_vad_containing(&vads, 0x50_0000).is_none());

    let threads = ctx.threads(&process);
    assert_eq!(maps::find_thread_by_tid(&threads, 555).unwrap().entry_point, 0x40_1000);

    assert_eq!(ctx.handles(&process)[0].object_type, "File");
    assert_eq!(ctx.heaps(&process)[0].size, 0x10_0000);
}
