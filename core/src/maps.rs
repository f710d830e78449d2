//! Lazily-populated semantic maps: modules, VADs, threads,
//! handles, heaps, the flattened PTE map, and their system-wide cousins
//! (users, physical-memory ranges, network connections).
//!
//! Every map follows the same shape: empty until first requested, built
//! once under the owning process's `update_lock`, and cached until the
//! next total refresh replaces the owning `Process` outright. `MapCell<T>`
//! factors that shape out once instead of repeating it seven times.

use parking_lot::Mutex;
use std::sync::Arc;

/// A lazily-populated, cached value. `get_or_init` runs `init` at most once
/// (races are resolved by the `Mutex`, not by redoing the work twice).
pub struct MapCell<T> {
    value: Mutex<Option<Arc<T>>>,
}

impl<T> Default for MapCell<T> {
    fn default() -> Self {
        MapCell { value: Mutex::new(None) }
    }
}

impl<T> MapCell<T> {
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> Arc<T> {
        let mut slot = self.value.lock();
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }
        let built = Arc::new(init());
        *slot = Some(built.clone());
        built
    }

    /// Returns the cached value without building it, if present.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.value.lock().clone()
    }

    /// Drops the cached value, forcing the next `get_or_init` to rebuild.
    pub fn invalidate(&self) {
        *self.value.lock() = None;
    }
}

#[derive(Clone, Debug)]
pub struct ModuleEntry {
    pub base: u64,
    pub size: u64,
    pub name: String,
    pub full_path: Option<String>,
}

#[derive(Clone, Debug)]
pub struct VadEntry {
    pub va_start: u64,
    pub va_end: u64,
    pub is_private: bool,
    pub protection: u32,
}

#[derive(Clone, Debug)]
pub struct ThreadEntry {
    pub tid: u32,
    pub entry_point: u64,
    pub suspend_count: u32,
}

#[derive(Clone, Debug)]
pub struct HandleEntry {
    pub handle: u64,
    pub object_type: String,
    pub granted_access: u32,
}

#[derive(Clone, Debug)]
pub struct HeapEntry {
    pub base: u64,
    pub size: u64,
}

#[derive(Clone, Debug)]
pub struct PteMapEntry {
    pub va: u64,
    pub pa: u64,
    pub writable: bool,
    pub user: bool,
    pub large_page: bool,
}

/// The set of per-process maps a `Process` lazily populates.
#[derive(Default)]
pub struct ProcessMaps {
    pub modules: MapCell<Vec<ModuleEntry>>,
    pub vads: MapCell<Vec<VadEntry>>,
    pub threads: MapCell<Vec<ThreadEntry>>,
    pub handles: MapCell<Vec<HandleEntry>>,
    pub heaps: MapCell<Vec<HeapEntry>>,
    pub pte_map: MapCell<Vec<PteMapEntry>>,
}

#[derive(Clone, Debug)]
pub struct UserEntry {
    pub sid_string: String,
    pub name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PhysicalMemoryRange {
    pub base: u64,
    pub size: u64,
}

#[derive(Clone, Debug)]
pub struct NetworkConnectionEntry {
    pub pid: u64,
    pub local_addr: String,
    pub remote_addr: Option<String>,
    pub state: String,
}

/// System-wide maps, owned by the engine rather than any one process.
#[derive(Default)]
pub struct SystemMaps {
    pub users: MapCell<Vec<UserEntry>>,
    pub physical_memory_ranges: MapCell<Vec<PhysicalMemoryRange>>,
    pub network_connections: MapCell<Vec<NetworkConnectionEntry>>,
}

/// Upper-cases and strips any path prefix before hashing, so module lookup
/// can go through a hash-sorted side array instead of a name comparison
/// per candidate. FNV-1a, chosen for being a small, dependency-free,
/// well-distributed hash -- no particular algorithm is required here.
pub fn hash_basename(path_or_name: &str) -> u64 {
    let base = path_or_name.rsplit(['/', '\\']).next().unwrap_or(path_or_name);
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in base.bytes() {
        hash ^= byte.to_ascii_uppercase() as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Looks up a module by basename in a modules slice that has already been
/// sorted by [`hash_basename`] (`Context::modules` guarantees this before
/// caching). Falls back to a linear scan among same-hash neighbors so a
/// hash collision never produces a false miss.
pub fn find_module_by_name<'a>(modules: &'a [ModuleEntry], name: &str) -> Option<&'a ModuleEntry> {
    let target = hash_basename(name);
    let pos = modules.binary_search_by_key(&target, |m| hash_basename(&m.name)).ok()?;

    let mut lo = pos;
    while lo > 0 && hash_basename(&modules[lo - 1].name) == target {
        lo -= 1;
    }
    modules[lo..]
        .iter()
        .take_while(|m| hash_basename(&m.name) == target)
        .find(|m| m.name.eq_ignore_ascii_case(name))
}

/// Looks up the VAD containing `va` in a slice already sorted by
/// `va_start` with non-overlapping ranges (`Context::vads` guarantees this).
pub fn find_vad_containing(vads: &[VadEntry], va: u64) -> Option<&VadEntry> {
    let idx = vads
        .binary_search_by(|v| {
            if va < v.va_start {
                std::cmp::Ordering::Greater
            } else if va >= v.va_end {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        })
        .ok()?;
    Some(&vads[idx])
}

/// Looks up a thread by TID in a slice already sorted by `tid`
/// (`Context::threads` guarantees this).
pub fn find_thread_by_tid(threads: &[ThreadEntry], tid: u32) -> Option<&ThreadEntry> {
    threads.binary_search_by_key(&tid, |t| t.tid).ok().map(|i| &threads[i])
}

/// Looks up a PTE by VA in a slice already sorted by `va`
/// (`Context::pte_map` guarantees this).
pub fn find_pte_by_va(ptes: &[PteMapEntry], va: u64) -> Option<&PteMapEntry> {
    ptes.binary_search_by_key(&va, |p| p.va).ok().map(|i| &ptes[i])
}

/// Builds a process's per-process maps from whatever collaborator backs
/// them (the memory model, the scatter pipeline, etc). Kept as a trait so
/// `Context` can wire together concrete builders without `maps.rs` needing
/// to know about `MemoryModel` or `ScatterDevice` directly.
pub trait ProcessEnumerator: Send + Sync {
    fn enumerate_modules(&self, pid: crate::process::Pid) -> Vec<ModuleEntry>;
    fn enumerate_vads(&self, pid: crate::process::Pid) -> Vec<VadEntry>;
    fn enumerate_threads(&self, pid: crate::process::Pid) -> Vec<ThreadEntry>;
    fn enumerate_handles(&self, pid: crate::process::Pid) -> Vec<HandleEntry>;
    fn enumerate_heaps(&self, pid: crate::process::Pid) -> Vec<HeapEntry>;
}

pub trait SystemEnumerator: Send + Sync {
    fn enumerate_users(&self) -> Vec<UserEntry>;
    fn enumerate_physical_memory_ranges(&self) -> Vec<PhysicalMemoryRange>;
    fn enumerate_network_connections(&self) -> Vec<NetworkConnectionEntry>;
}
