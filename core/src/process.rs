//! The process table: an open-addressed hash
//! keyed by PID with generational current/pending refresh semantics.
//!
//! The open-addressed hash with linear probing is realized here as a
//! `DashMap<Pid, Arc<Process>>` plus a side `Vec<Pid>` tracking insertion
//! order, since `DashMap` does not guarantee iteration order but callers
//! need a stable enumeration of processes in the order they were created.

use crate::address::PhysAddr;
use crate::maps::ProcessMaps;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Pid(pub NonZeroU64);

impl Pid {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Pid)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ProcessState {
    Active,
    Terminated(u32),
}

impl ProcessState {
    pub fn is_active(self) -> bool {
        matches!(self, ProcessState::Active)
    }
}

/// Short (16-byte, nul-terminated) process name, mirroring the fixed-size
/// `ImageFileName`-style field carried in an EPROCESS snapshot.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ShortName([u8; 16]);

impl ShortName {
    pub fn new(name: &str) -> Self {
        let mut buf = [0u8; 16];
        let bytes = name.as_bytes();
        let len = bytes.len().min(15);
        buf[..len].copy_from_slice(&bytes[..len]);
        ShortName(buf)
    }

    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        std::str::from_utf8(&self.0[..len]).unwrap_or("")
    }
}

impl std::fmt::Debug for ShortName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// A sub-object that survives across generational refreshes, keyed by PID.
/// Stands in for whatever a plugin wants to keep alive for a process across
/// its lifetime.
#[derive(Default)]
pub struct ProcessPersistent {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl ProcessPersistent {
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Vec<u8>) {
        self.data.lock().insert(key.to_owned(), value);
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TokenPass {
    TokenVa,
    TokenBytes,
    SidPointer,
    SidBytes,
}

#[derive(Default)]
pub struct TokenData {
    pub luid: u64,
    pub session: u32,
    pub sid_bytes: Vec<u8>,
    pub sid_string: Option<String>,
    pub sid_valid: bool,
}

pub struct Token {
    initialized: AtomicBool,
    data: RwLock<TokenData>,
}

impl Default for Token {
    fn default() -> Self {
        Token {
            initialized: AtomicBool::new(false),
            data: RwLock::new(TokenData::default()),
        }
    }
}

impl Token {
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, TokenData> {
        self.data.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, TokenData> {
        self.data.write()
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }
}

/// Batched token-population contract.
/// Each pass is handed the full slice of processes still awaiting
/// initialization so the implementation can batch device round-trips
/// (typically via `prefetch`) instead of fetching one process at a time.
pub trait TokenFetcher: Send + Sync {
    fn fetch(&self, pass: TokenPass, processes: &[Arc<Process>]);
}

pub struct Process {
    pub pid: Pid,
    pub parent_pid: Option<Pid>,
    state: RwLock<ProcessState>,
    pub user_mode_only: bool,
    pub dtb: PhysAddr,
    pub dtb_user: Option<PhysAddr>,
    pub name: ShortName,
    pub eprocess_bytes: Option<Vec<u8>>,
    pub persistent: Arc<ProcessPersistent>,
    pub maps: ProcessMaps,
    pub token: Token,
    tlb_spidered: AtomicBool,
    /// Serializes mutation of this process's maps and token.
    pub update_lock: Mutex<()>,
    /// Serializes plugin mutations.
    pub plugin_lock: Mutex<()>,
}

impl Process {
    fn new(
        pid: Pid,
        parent_pid: Option<Pid>,
        state: ProcessState,
        user_mode_only: bool,
        dtb: PhysAddr,
        dtb_user: Option<PhysAddr>,
        name: ShortName,
        eprocess_bytes: Option<Vec<u8>>,
        persistent: Arc<ProcessPersistent>,
    ) -> Arc<Process> {
        Arc::new(Process {
            pid,
            parent_pid,
            state: RwLock::new(state),
            user_mode_only,
            dtb,
            dtb_user,
            name,
            eprocess_bytes,
            persistent,
            maps: ProcessMaps::default(),
            token: Token::default(),
            tlb_spidered: AtomicBool::new(false),
            update_lock: Mutex::new(()),
            plugin_lock: Mutex::new(()),
        })
    }

    pub fn state(&self) -> ProcessState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ProcessState) {
        *self.state.write() = state;
    }

    pub fn is_tlb_spidered(&self) -> bool {
        self.tlb_spidered.load(Ordering::Acquire)
    }

    pub fn mark_tlb_spidered(&self) {
        self.tlb_spidered.store(true, Ordering::Release);
    }

    pub fn clear_tlb_spidered(&self) {
        let _guard = self.update_lock.lock();
        self.tlb_spidered.store(false, Ordering::Release);
    }

    /// A dedicated accessor for viewing a process with kernel-mode
    /// permissions: same DTB and maps, `user_only` forced to `false`.
    pub fn kernel_view(self: &Arc<Self>) -> KernelView {
        KernelView { process: self.clone() }
    }
}

pub struct KernelView {
    process: Arc<Process>,
}

impl KernelView {
    pub fn dtb(&self) -> PhysAddr {
        self.process.dtb
    }

    pub fn user_mode_only(&self) -> bool {
        false
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }
}

struct ProcessTableInner {
    map: DashMap<Pid, Arc<Process>>,
    order: RwLock<Vec<Pid>>,
    pending: Mutex<Option<Arc<ProcessTableInner>>>,
}

impl ProcessTableInner {
    fn new() -> Arc<Self> {
        Self::with_capacity(0)
    }

    fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(ProcessTableInner {
            map: DashMap::with_capacity(capacity),
            order: RwLock::new(Vec::with_capacity(capacity)),
            pending: Mutex::new(None),
        })
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub struct GetNextFlags: u32 {
        const SKIP_TERMINATED = 1 << 0;
    }
}

pub struct ProcessTable {
    current: RwLock<Arc<ProcessTableInner>>,
    /// Global `LockMaster`: serializes one-time token initialization.
    token_init_lock: Mutex<()>,
    capacity_hint: usize,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Pre-sizes the underlying map and insertion-order list for an
    /// expected process count, avoiding rehash/reallocation churn during
    /// the first full enumeration pass. Every pending table staged by a
    /// later refresh is sized the same way.
    pub fn with_capacity(capacity: usize) -> Self {
        ProcessTable {
            current: RwLock::new(ProcessTableInner::with_capacity(capacity)),
            token_init_lock: Mutex::new(()),
            capacity_hint: capacity,
        }
    }

    fn current(&self) -> Arc<ProcessTableInner> {
        self.current.read().clone()
    }

    fn ensure_pending(&self, current: &Arc<ProcessTableInner>) -> Arc<ProcessTableInner> {
        let mut slot = current.pending.lock();
        if slot.is_none() {
            *slot = Some(ProcessTableInner::with_capacity(self.capacity_hint));
        }
        slot.as_ref().unwrap().clone()
    }

    /// Inserts (or carries forward) a process into the staged "pending"
    /// table. Returns `None` if the PID is already present in the pending
    /// table (step 3) or if the DTB fails structural validation.
    #[allow(clippy::too_many_arguments)]
    pub fn create_entry(
        &self,
        total_refresh: bool,
        pid: Pid,
        parent_pid: Option<Pid>,
        state: ProcessState,
        dtb: PhysAddr,
        dtb_user: Option<PhysAddr>,
        name: ShortName,
        user_mode_only: bool,
        eprocess_bytes: Option<Vec<u8>>,
        verify_dtb: &dyn Fn(PhysAddr) -> bool,
    ) -> Option<Arc<Process>> {
        if state.is_active() && !verify_dtb(dtb) {
            log::warn!("process table: pid {} has an unverifiable DTB, rejecting", pid.get());
            return None;
        }

        let current = self.current();
        let pending = self.ensure_pending(&current);

        if pending.map.contains_key(&pid) {
            log::warn!("process table: pid {} already present in pending table", pid.get());
            return None;
        }

        let process = if !total_refresh {
            match current.map.get(&pid) {
                Some(existing) => existing.clone(),
                None => {
                    let persistent = Self::persistent_for(&current, pid);
                    Process::new(
                        pid,
                        parent_pid,
                        state,
                        user_mode_only,
                        dtb,
                        dtb_user,
                        name,
                        eprocess_bytes,
                        persistent,
                    )
                }
            }
        } else {
            let persistent = Self::persistent_for(&current, pid);
            Process::new(
                pid,
                parent_pid,
                state,
                user_mode_only,
                dtb,
                dtb_user,
                name,
                eprocess_bytes,
                persistent,
            )
        };

        pending.map.insert(pid, process.clone());
        pending.order.write().push(pid);

        Some(process)
    }

    fn persistent_for(current: &Arc<ProcessTableInner>, pid: Pid) -> Arc<ProcessPersistent> {
        current
            .map
            .get(&pid)
            .map(|p| p.persistent.clone())
            .unwrap_or_default()
    }

    /// Atomically swaps the pending table in as current.
    pub fn create_finish(&self) {
        let current = self.current();
        let pending = current.pending.lock().take();

        if let Some(pending) = pending {
            *self.current.write() = pending;
        }
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<Process>> {
        self.current().map.get(&pid).map(|p| p.clone())
    }

    pub fn len(&self) -> usize {
        self.current().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walks the insertion-order chain starting after `prev` (or from the
    /// beginning if `prev` is `None`).
    pub fn get_next(&self, prev: Option<Pid>, flags: GetNextFlags) -> Option<Arc<Process>> {
        let current = self.current();
        let order = current.order.read();

        let start = match prev {
            None => 0,
            Some(prev_pid) => order.iter().position(|&p| p == prev_pid).map(|i| i + 1)?,
        };

        for &pid in &order[start..] {
            if let Some(process) = current.map.get(&pid) {
                if flags.contains(GetNextFlags::SKIP_TERMINATED) && !process.state().is_active() {
                    continue;
                }
                return Some(process.clone());
            }
        }

        None
    }

    pub fn all_pids(&self) -> Vec<Pid> {
        self.current().order.read().clone()
    }

    /// Flips every process's "TLB spidered" flag to `false`.
    pub fn clear_tlb_spidered_flags(&self) {
        let current = self.current();
        for entry in current.map.iter() {
            entry.value().clear_tlb_spidered();
        }
    }

    /// Runs the four batched token-initialization passes across every
    /// process that has not yet been initialized, under the global
    /// `LockMaster` (so concurrent callers don't duplicate the work). Per
    /// spec §4.4 this operates on the staged "pending" table while a
    /// refresh is in progress (so newly-discovered processes get tokens
    /// before the table is published); if no refresh is staged, the
    /// current table is the only one there is, so that's used instead.
    pub fn initialize_tokens(&self, fetcher: &dyn TokenFetcher) {
        let _guard = self.token_init_lock.lock();

        let current = self.current();
        let target = current.pending.lock().clone().unwrap_or_else(|| current.clone());

        let awaiting: Vec<Arc<Process>> = target
            .map
            .iter()
            .filter(|entry| !entry.value().token.is_initialized())
            .map(|entry| entry.value().clone())
            .collect();

        if awaiting.is_empty() {
            return;
        }

        for pass in [
            TokenPass::TokenVa,
            TokenPass::TokenBytes,
            TokenPass::SidPointer,
            TokenPass::SidBytes,
        ] {
            fetcher.fetch(pass, &awaiting);
        }

        for process in &awaiting {
            process.token.mark_initialized();
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_valid(_: PhysAddr) -> bool {
        true
    }

    fn insert_process(table: &ProcessTable, raw_pid: u64, total_refresh: bool) -> Arc<Process> {
        table
            .create_entry(
                total_refresh,
                Pid::new(raw_pid).unwrap(),
                None,
                ProcessState::Active,
                PhysAddr::new(0x1000),
                None,
                ShortName::new("test.exe"),
                true,
                None,
                &always_valid,
            )
            .expect("create_entry should succeed")
    }

    #[test]
    fn create_then_finish_then_get_is_the_same_process() {
        let table = ProcessTable::new();
        let created = insert_process(&table, 4, true);
        table.create_finish();

        let fetched = table.get(Pid::new(4).unwrap()).unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
    }

    #[test]
    fn duplicate_pid_in_pending_is_rejected() {
        let table = ProcessTable::new();
        insert_process(&table, 10, true);

        let second = table.create_entry(
            true,
            Pid::new(10).unwrap(),
            None,
            ProcessState::Active,
            PhysAddr::new(0x2000),
            None,
            ShortName::new("dup.exe"),
            true,
            None,
            &always_valid,
        );

        assert!(second.is_none());
    }

    #[test]
    fn total_refresh_replaces_identity_but_keeps_persistent() {
        let table = ProcessTable::new();
        let first = insert_process(&table, 100, true);
        first.persistent.set("marker", vec![42]);
        table.create_finish();

        let second = insert_process(&table, 100, true);
        table.create_finish();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.persistent.get("marker"), Some(vec![42]));
    }

    #[test]
    fn partial_refresh_carries_forward_identity() {
        let table = ProcessTable::new();
        let first = insert_process(&table, 200, true);
        table.create_finish();

        let carried = insert_process(&table, 200, false);
        table.create_finish();

        assert!(Arc::ptr_eq(&first, &carried));
    }

    #[test]
    fn get_next_walks_insertion_order() {
        let table = ProcessTable::new();
        insert_process(&table, 1, true);
        insert_process(&table, 2, true);
        insert_process(&table, 3, true);
        table.create_finish();

        let p1 = table.get_next(None, GetNextFlags::empty()).unwrap();
        assert_eq!(p1.pid.get(), 1);
        let p2 = table.get_next(Some(p1.pid), GetNextFlags::empty()).unwrap();
        assert_eq!(p2.pid.get(), 2);
        let p3 = table.get_next(Some(p2.pid), GetNextFlags::empty()).unwrap();
        assert_eq!(p3.pid.get(), 3);
        assert!(table.get_next(Some(p3.pid), GetNextFlags::empty()).is_none());
    }

    #[test]
    fn get_next_can_skip_terminated() {
        let table = ProcessTable::new();
        let p1 = insert_process(&table, 1, true);
        p1.set_state(ProcessState::Terminated(0));
        insert_process(&table, 2, true);
        table.create_finish();

        let first = table
            .get_next(None, GetNextFlags::SKIP_TERMINATED)
            .unwrap();
        assert_eq!(first.pid.get(), 2);
    }

    #[test]
    fn rejects_unverifiable_dtb_for_active_process() {
        let table = ProcessTable::new();
        let result = table.create_entry(
            true,
            Pid::new(5).unwrap(),
            None,
            ProcessState::Active,
            PhysAddr::new(0x3000),
            None,
            ShortName::new("bad.exe"),
            true,
            None,
            &|_| false,
        );
        assert!(result.is_none());
    }

    struct CountingFetcher {
        calls: Mutex<Vec<TokenPass>>,
    }

    impl TokenFetcher for CountingFetcher {
        fn fetch(&self, pass: TokenPass, processes: &[Arc<Process>]) {
            self.calls.lock().push(pass);
            for process in processes {
                let mut token = process.token.write();
                token.sid_valid = true;
            }
        }
    }

    #[test]
    fn token_initialization_runs_four_passes_once() {
        let table = ProcessTable::new();
        insert_process(&table, 1, true);
        insert_process(&table, 2, true);
        table.create_finish();

        let fetcher = CountingFetcher { calls: Mutex::new(Vec::new()) };
        table.initialize_tokens(&fetcher);

        assert_eq!(fetcher.calls.lock().len(), 4);
        for pid in [1, 2] {
            let process = table.get(Pid::new(pid).unwrap()).unwrap();
            assert!(process.token.is_initialized());
            assert!(process.token.read().sid_valid);
        }

        // Second call is a no-op: everyone is already initialized.
        table.initialize_tokens(&fetcher);
        assert_eq!(fetcher.calls.lock().len(), 4);
    }
}
