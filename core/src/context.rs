//! `Context`: the engine itself. Wires together the acquisition backend,
//! memory model, page cache, process table, worker pool and maps.

use std::sync::Arc;

use crate::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::cache::Cache;
use crate::config::Config;
use crate::device::{ScatterDevice, ScatterFlags};
use crate::error::EngineError;
use crate::maps::{
    self, HandleEntry, HeapEntry, ModuleEntry, NetworkConnectionEntry, PhysicalMemoryRange,
    ProcessEnumerator, PteMapEntry, SystemEnumerator, SystemMaps, ThreadEntry, UserEntry, VadEntry,
};
use crate::memmodel::{MemoryModel, VirtualFlags};
use crate::process::{
    GetNextFlags, Pid, Process, ProcessState, ProcessTable, ShortName, TokenFetcher,
};
use crate::scatter;
use crate::tlb;
use crate::worker::WorkerPool;

/// Everything a caller needs to describe one process to `create_entry`.
pub struct ProcessDescriptor {
    pub pid: Pid,
    pub parent_pid: Option<Pid>,
    pub state: ProcessState,
    pub dtb: PhysAddr,
    pub dtb_user: Option<PhysAddr>,
    pub name: ShortName,
    pub user_mode_only: bool,
    pub eprocess_bytes: Option<Vec<u8>>,
}

pub struct Context {
    config: Config,
    device: Arc<dyn ScatterDevice>,
    memory_model: Arc<dyn MemoryModel>,
    cache: Cache,
    processes: ProcessTable,
    workers: WorkerPool,
    system_maps: SystemMaps,
    process_enumerator: Option<Arc<dyn ProcessEnumerator>>,
    system_enumerator: Option<Arc<dyn SystemEnumerator>>,
    /// Serializes system-wide map initialization (`LockUpdateMap` /
    /// `LockUpdateModule`): this crate's three system-wide maps (users,
    /// physical memory ranges, network connections) share one guard rather
    /// than one lock per map, since none of their initializers call each
    /// other and a single short critical section is enough to avoid
    /// duplicate work under concurrent first-touch.
    update_map_lock: parking_lot::Mutex<()>,
}

impl Context {
    /// Validates `config`, checks the device reports usable memory, starts
    /// the worker pool and returns a ready-to-use engine.
    pub fn open(
        config: Config,
        device: Arc<dyn ScatterDevice>,
        memory_model: Arc<dyn MemoryModel>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        if device.pa_max().as_u64() == 0 {
            return Err(EngineError::NoUsablePhysicalMemory);
        }

        let workers = WorkerPool::new(config.worker_count)
            .map_err(|e| EngineError::WorkerPoolStartFailed(e.to_string()))?;

        log::info!(
            "vmm context open: system_type={:?} cache_max={} workers={}",
            config.system_type,
            config.cache_max_entries,
            config.worker_count
        );

        Ok(Context {
            cache: Cache::new(config.cache_max_entries),
            processes: ProcessTable::with_capacity(config.process_table_capacity),
            workers,
            system_maps: SystemMaps::default(),
            process_enumerator: None,
            system_enumerator: None,
            update_map_lock: parking_lot::Mutex::new(()),
            config,
            device,
            memory_model,
        })
    }

    pub fn with_process_enumerator(mut self, enumerator: Arc<dyn ProcessEnumerator>) -> Self {
        self.process_enumerator = Some(enumerator);
        self
    }

    pub fn with_system_enumerator(mut self, enumerator: Arc<dyn SystemEnumerator>) -> Self {
        self.system_enumerator = Some(enumerator);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn system_maps(&self) -> &SystemMaps {
        &self.system_maps
    }

    /// Shuts the worker pool down and drains every cache table. The
    /// `Context` itself is still droppable afterwards, just inert.
    pub fn close(&self) {
        self.workers.shutdown();
        self.cache.close_all();
        log::info!("vmm context closed");
    }

    fn is_x64(&self) -> bool {
        !self.config.is_32_bit
    }

    fn phys_flags(&self) -> ScatterFlags {
        if self.config.flags.contains(crate::config::EngineFlags::NOCACHE) {
            ScatterFlags::NOCACHE
        } else {
            ScatterFlags::empty()
        }
    }

    fn virt_flags(&self) -> VirtualFlags {
        if self.config.flags.contains(crate::config::EngineFlags::NOPAGING) {
            VirtualFlags::NOPAGING
        } else {
            VirtualFlags::empty()
        }
    }

    pub fn read_virt(&self, process: &Process, va: VirtAddr, out: &mut [u8]) -> usize {
        scatter::read_virt_bytes(
            process,
            self.memory_model.as_ref(),
            &self.cache,
            self.device.as_ref(),
            self.virt_flags(),
            self.phys_flags(),
            va,
            out,
        )
    }

    pub fn write_virt(&self, process: &Process, va: VirtAddr, data: &[u8]) -> usize {
        scatter::write_virt_bytes(process, self.memory_model.as_ref(), &self.cache, self.device.as_ref(), va, data)
    }

    pub fn read_phys(&self, addr: PhysAddr, out: &mut [u8; PAGE_SIZE as usize]) -> bool {
        let mut reqs = [scatter::ScatterRequest::new(addr, out)];
        scatter::read_phys(&self.cache, self.device.as_ref(), self.phys_flags(), &mut reqs);
        reqs[0].valid
    }

    pub fn write_phys(&self, addr: PhysAddr, data: &[u8; PAGE_SIZE as usize]) -> bool {
        let mut buf = *data;
        let mut reqs = [scatter::ScatterRequest::new(addr, &mut buf)];
        scatter::write_phys(&self.cache, self.device.as_ref(), &mut reqs);
        reqs[0].valid
    }

    pub fn tlb_get_page_table(&self, pa: PhysAddr, cache_only: bool) -> Option<crate::cache::PageHandle> {
        tlb::tlb_get_page_table(&self.cache, self.device.as_ref(), self.memory_model.as_ref(), self.is_x64(), pa, cache_only)
    }

    pub fn tlb_prefetch(&self, addrs: &[PhysAddr]) {
        tlb::tlb_prefetch(&self.cache, self.device.as_ref(), self.memory_model.as_ref(), self.is_x64(), addrs)
    }

    /// Reclaims every shard of `tag`'s cache table back to empty. For the
    /// TLB table this additionally clears every process's "TLB spidered"
    /// flag, since a dropped TLB cache invalidates any prior page-table
    /// spidering.
    pub fn clear_cache(&self, tag: crate::cache::CacheTag) {
        self.cache.clear(tag);
        if tag == crate::cache::CacheTag::Tlb {
            self.processes.clear_tlb_spidered_flags();
        }
    }

    /// Runs `f` once per currently-known process, in parallel, across the
    /// worker pool.
    pub fn parallel_foreach_processes<F>(&self, flags: GetNextFlags, f: F)
    where
        F: Fn(Arc<Process>) + Send + Sync + 'static,
    {
        let mut pids = self.processes.all_pids();
        if !flags.contains(GetNextFlags::SKIP_TERMINATED) {
            // Nothing to filter.
        } else {
            pids.retain(|&pid| {
                self.processes
                    .get(pid)
                    .map(|p| p.state().is_active())
                    .unwrap_or(false)
            });
        }

        let targets: Vec<Arc<Process>> = pids
            .into_iter()
            .filter_map(|pid| self.processes.get(pid))
            .collect();

        self.workers.parallel_foreach(targets, f);
    }

    /// Begins a refresh pass: clears TLB-spidered flags (for a tree-walk
    /// refresh) if `total_refresh`, and returns a closure-friendly handle
    /// for staging entries. Callers insert every currently-live process via
    /// [`Context::create_process_entry`], then call
    /// [`Context::finish_process_refresh`] to publish the new table.
    pub fn begin_process_refresh(&self, total_refresh: bool) {
        if total_refresh {
            self.processes.clear_tlb_spidered_flags();
        }
    }

    pub fn create_process_entry(&self, total_refresh: bool, descriptor: ProcessDescriptor) -> Option<Arc<Process>> {
        let memory_model = self.memory_model.clone();
        let device = self.device.clone();
        let is_x64 = self.is_x64();

        let verify_dtb = move |dtb: PhysAddr| {
            // A DTB is verifiable if the top-level page table page it
            // points to reads back and structurally checks out.
            let mut buf = [0u8; PAGE_SIZE as usize];
            let mut units = [crate::device::MemScatter::new(dtb, &mut buf)];
            device.read_scatter(&mut units);
            units[0].valid && memory_model.verify_page_table(&buf, dtb, is_x64)
        };

        self.processes.create_entry(
            total_refresh,
            descriptor.pid,
            descriptor.parent_pid,
            descriptor.state,
            descriptor.dtb,
            descriptor.dtb_user,
            descriptor.name,
            descriptor.user_mode_only,
            descriptor.eprocess_bytes,
            &verify_dtb,
        )
    }

    pub fn finish_process_refresh(&self) {
        self.processes.create_finish();
    }

    /// Initializes every process's token sub-structure that isn't already
    /// initialized, using `fetcher` to do the actual (batched) device work.
    pub fn initialize_tokens(&self, fetcher: &dyn TokenFetcher) {
        self.processes.initialize_tokens(fetcher);
    }

    pub fn process_enumerator(&self) -> Option<&Arc<dyn ProcessEnumerator>> {
        self.process_enumerator.as_ref()
    }

    pub fn system_enumerator(&self) -> Option<&Arc<dyn SystemEnumerator>> {
        self.system_enumerator.as_ref()
    }

    /// Checks the process's cached pointer; on a miss, invokes the
    /// caller-supplied `ProcessEnumerator` under the process's update lock,
    /// publishes the result, and returns a cheap `Arc` clone either way.
    /// Every per-process map accessor below follows this same pattern.
    fn process_map<T>(
        &self,
        cell: &maps::MapCell<Vec<T>>,
        process: &Process,
        build: impl FnOnce(&dyn ProcessEnumerator, Pid) -> Vec<T>,
    ) -> Arc<Vec<T>> {
        cell.get_or_init(|| {
            let _guard = process.update_lock.lock();
            let enumerator = self
                .process_enumerator
                .as_ref()
                .expect("no ProcessEnumerator configured on this Context");
            build(enumerator.as_ref(), process.pid)
        })
    }

    /// The process's module list, sorted by upper-cased basename hash so
    /// [`crate::maps::find_module_by_name`] can binary-search it.
    pub fn modules(&self, process: &Process) -> Arc<Vec<ModuleEntry>> {
        self.process_map(&process.maps.modules, process, |e, pid| {
            let mut modules = e.enumerate_modules(pid);
            modules.sort_unstable_by_key(|m| maps::hash_basename(&m.name));
            modules
        })
    }

    /// The process's VAD list, sorted by `va_start` so
    /// [`crate::maps::find_vad_containing`] can binary-search it.
    pub fn vads(&self, process: &Process) -> Arc<Vec<VadEntry>> {
        self.process_map(&process.maps.vads, process, |e, pid| {
            let mut vads = e.enumerate_vads(pid);
            vads.sort_unstable_by_key(|v| v.va_start);
            vads
        })
    }

    /// The process's thread list, sorted by TID so
    /// [`crate::maps::find_thread_by_tid`] can binary-search it.
    pub fn threads(&self, process: &Process) -> Arc<Vec<ThreadEntry>> {
        self.process_map(&process.maps.threads, process, |e, pid| {
            let mut threads = e.enumerate_threads(pid);
            threads.sort_unstable_by_key(|t| t.tid);
            threads
        })
    }

    pub fn handles(&self, process: &Process) -> Arc<Vec<HandleEntry>> {
        self.process_map(&process.maps.handles, process, |e, pid| e.enumerate_handles(pid))
    }

    pub fn heaps(&self, process: &Process) -> Arc<Vec<HeapEntry>> {
        self.process_map(&process.maps.heaps, process, |e, pid| e.enumerate_heaps(pid))
    }

    /// The process's flattened PTE map. Unlike the other per-process maps,
    /// this one is populated by the memory model plug (it has to walk the
    /// same page tables the translation path does), not by a
    /// `ProcessEnumerator`: `MemoryModel::pte_map_initialize` is expected to
    /// publish into `process.maps.pte_map` itself, sorted by `va`, so
    /// [`crate::maps::find_pte_by_va`] can binary-search the result.
    pub fn pte_map(&self, process: &Process) -> Option<Arc<Vec<PteMapEntry>>> {
        if let Some(existing) = process.maps.pte_map.peek() {
            return Some(existing);
        }

        let _guard = process.update_lock.lock();
        if let Some(existing) = process.maps.pte_map.peek() {
            return Some(existing);
        }

        if !self.memory_model.pte_map_initialize(process) {
            return None;
        }

        process.maps.pte_map.peek()
    }

    fn system_map<T>(
        &self,
        cell: &maps::MapCell<Vec<T>>,
        build: impl FnOnce(&dyn SystemEnumerator) -> Vec<T>,
    ) -> Arc<Vec<T>> {
        cell.get_or_init(|| {
            let _guard = self.update_map_lock.lock();
            let enumerator = self
                .system_enumerator
                .as_ref()
                .expect("no SystemEnumerator configured on this Context");
            build(enumerator.as_ref())
        })
    }

    pub fn users(&self) -> Arc<Vec<UserEntry>> {
        self.system_map(&self.system_maps.users, |e| e.enumerate_users())
    }

    pub fn physical_memory_ranges(&self) -> Arc<Vec<PhysicalMemoryRange>> {
        self.system_map(&self.system_maps.physical_memory_ranges, |e| {
            e.enumerate_physical_memory_ranges()
        })
    }

    pub fn network_connections(&self) -> Arc<Vec<NetworkConnectionEntry>> {
        self.system_map(&self.system_maps.network_connections, |e| {
            e.enumerate_network_connections()
        })
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.close();
    }
}
