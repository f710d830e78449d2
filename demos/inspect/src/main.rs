//! A small demo: opens a `Context` against an in-memory fake device and a
//! toy identity memory model, creates a couple of processes, reads and
//! writes their virtual memory, then fans a read out across every process
//! with `parallel_foreach_processes`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use vmm_core::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use vmm_core::config::SystemType;
use vmm_core::device::{MemScatter, ScatterDevice};
use vmm_core::maps::{self, HandleEntry, HeapEntry, ModuleEntry, ProcessEnumerator, ThreadEntry, VadEntry};
use vmm_core::memmodel::{MemoryModel, PagedReadOutcome, VirtualFlags};
use vmm_core::process::{GetNextFlags, Pid, Process, ProcessState, ShortName};
use vmm_core::{Config, Context, ProcessDescriptor};

/// A flat in-memory "device": just a map from page-aligned physical
/// address to page contents.
struct FlatMemoryDevice {
    pages: Mutex<HashMap<u64, [u8; PAGE_SIZE as usize]>>,
    pa_max: PhysAddr,
}

impl FlatMemoryDevice {
    fn new(pa_max: u64) -> Self {
        FlatMemoryDevice { pages: Mutex::new(HashMap::new()), pa_max: PhysAddr::new(pa_max) }
    }

    fn seed(&self, addr: u64, fill: u8) {
        self.pages.lock().insert(addr, [fill; PAGE_SIZE as usize]);
    }
}

impl ScatterDevice for FlatMemoryDevice {
    fn read_scatter(&self, units: &mut [MemScatter<'_>]) {
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
        let mut pages = self.pages.lock();
        for unit in units.iter_mut() {
            pages.insert(unit.addr.as_u64(), *unit.buf);
            unit.valid = true;
        }
    }

    fn pa_max(&self) -> PhysAddr {
        self.pa_max
    }
}

/// Identity translation: every process's address space is just physical
/// memory itself. Page tables always "validate" since there aren't any.
struct IdentityMemoryModel;

impl MemoryModel for IdentityMemoryModel {
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

/// A toy enumerator standing in for whatever real introspection code would
/// actually walk PEB module lists, VAD trees, etc.
struct ToyProcessEnumerator;

impl ProcessEnumerator for ToyProcessEnumerator {
    fn enumerate_modules(&self, pid: Pid) -> Vec<ModuleEntry> {
        vec![
            ModuleEntry { base: 0x1000, size: 0x1000, name: format!("{}.exe", pid.get()), full_path: None },
            ModuleEntry { base: 0x2000, size: 0x4000, name: "libc.so".into(), full_path: None },
        ]
    }

    fn enumerate_vads(&self, _pid: Pid) -> Vec<VadEntry> {
        vec![VadEntry { va_start: 0x1000, va_end: 0x2000, is_private: true, protection: 0x20 }]
    }

    fn enumerate_threads(&self, _pid: Pid) -> Vec<ThreadEntry> {
        vec![ThreadEntry { tid: 1, entry_point: 0x1000, suspend_count: 0 }]
    }

    fn enumerate_handles(&self, _pid: Pid) -> Vec<HandleEntry> {
        Vec::new()
    }

    fn enumerate_heaps(&self, _pid: Pid) -> Vec<HeapEntry> {
        Vec::new()
    }
}

fn main() {
    env_logger::init();

    let device = Arc::new(FlatMemoryDevice::new(1 << 32));
    device.seed(0x1000, 0x11);
    device.seed(0x2000, 0x22);

    let config = Config::new(SystemType::X64);
    let ctx = Context::open(config, device.clone(), Arc::new(IdentityMemoryModel))
        .expect("failed to open context")
        .with_process_enumerator(Arc::new(ToyProcessEnumerator));

    for (raw_pid, dtb, name) in [(4u64, 0x1000u64, "init"), (8, 0x2000, "shell")] {
        ctx.create_process_entry(
            true,
            ProcessDescriptor {
                pid: Pid::new(raw_pid).unwrap(),
                parent_pid: None,
                state: ProcessState::Active,
                dtb: PhysAddr::new(dtb),
                dtb_user: None,
                name: ShortName::new(name),
                user_mode_only: true,
                eprocess_bytes: None,
            },
        );
    }
    ctx.finish_process_refresh();

    let init = ctx.processes().get(Pid::new(4).unwrap()).unwrap();
    let mut buf = [0u8; 16];
    ctx.read_virt(&init, VirtAddr::new(0x1000), &mut buf);
    println!("init's first 16 bytes at VA 0x1000: {buf:02x?}");

    ctx.write_virt(&init, VirtAddr::new(0x1000), &[0xAAu8; 4]);
    ctx.read_virt(&init, VirtAddr::new(0x1000), &mut buf);
    println!("after write: {buf:02x?}");

    ctx.parallel_foreach_processes(GetNextFlags::empty(), move |process| {
        println!("visiting pid {} ({})", process.pid.get(), process.name.as_str());
    });

    let modules = ctx.modules(&init);
    println!("init's modules: {:?}", modules.iter().map(|m| &m.name).collect::<Vec<_>>());
    if let Some(main_module) = maps::find_module_by_name(&modules, "4.exe") {
        println!("found init's main module at base {:#x}", main_module.base);
    }

    ctx.close();
}
