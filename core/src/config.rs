//! Process-wide configuration: system type, feature flags and the knobs
//! controlling cache and worker-pool sizing.

use crate::error::ConfigError;

/// Which page-table format the memory model on the other end of [`crate::memmodel::MemoryModel`]
/// understands. Purely advisory metadata carried by `Context` -- the engine
/// itself is architecture-agnostic.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SystemType {
    X86,
    X86Pae,
    X64,
}

bitflags::bitflags! {
    /// Process-wide feature flags.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct EngineFlags: u32 {
        /// Never consult or populate the PHYS/TLB caches.
        const NOCACHE = 1 << 0;
        /// Never fall back to the paged-read hook on translation failure.
        const NOPAGING = 1 << 1;
        /// Include terminated processes in enumeration.
        const PROCESS_SHOW_TERMINATED = 1 << 2;
        /// Eagerly populate the token sub-structure on process creation.
        const PROCESS_TOKEN = 1 << 3;
    }
}

/// Default cache ceiling per table.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 0x4000;
/// Number of shards per cache table.
pub const CACHE_SHARD_COUNT: usize = 17;
/// Bucket array size per shard.
pub const CACHE_BUCKET_COUNT: usize = 17;
/// Default worker pool size.
pub const DEFAULT_WORKER_COUNT: usize = 32;
/// Default process table capacity (must be a power of two).
pub const DEFAULT_PROCESS_TABLE_CAPACITY: usize = 1024;
/// Maximum units folded into one speculative scatter read.
pub const MAX_SPECULATIVE_UNITS: usize = 24;
/// Maximum addresses per `tlb_prefetch` round.
pub const MAX_TLB_PREFETCH_BATCH: usize = 0x2000;

#[derive(Clone, Debug)]
pub struct Config {
    pub system_type: SystemType,
    pub is_32_bit: bool,
    pub flags: EngineFlags,
    pub cache_max_entries: usize,
    pub worker_count: usize,
    pub process_table_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            system_type: SystemType::X64,
            is_32_bit: false,
            flags: EngineFlags::empty(),
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            worker_count: DEFAULT_WORKER_COUNT,
            process_table_capacity: DEFAULT_PROCESS_TABLE_CAPACITY,
        }
    }
}

impl Config {
    pub fn new(system_type: SystemType) -> Self {
        Config {
            system_type,
            is_32_bit: matches!(system_type, SystemType::X86 | SystemType::X86Pae),
            ..Config::default()
        }
    }

    pub fn with_flags(mut self, flags: EngineFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_cache_max_entries(mut self, entries: usize) -> Self {
        self.cache_max_entries = entries;
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_process_table_capacity(mut self, capacity: usize) -> Self {
        self.process_table_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_max_entries == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }

        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkerCount);
        }

        if !self.process_table_capacity.is_power_of_two() {
            return Err(ConfigError::ProcessTableNotPowerOfTwo);
        }

        Ok(())
    }
}
