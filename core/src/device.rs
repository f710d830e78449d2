//! The acquisition backend contract.
//!
//! A `ScatterDevice` is a "leechcore"-style scatter read/write device: its
//! internals (DMA over PCILeech, a raw memory-dump file, a live hypervisor
//! channel, ...) are none of this crate's business. It must be safe to call
//! from multiple threads concurrently; the worker pool and arbitrary caller
//! threads may issue scatter I/O at the same time.

use crate::address::{PhysAddr, PAGE_SIZE};

/// Per-unit state threaded through the scatter pipeline. A speculative
/// readahead unit is never promoted into an anchor for further speculation:
/// only `Normal` units (ones that started life as an actual caller request)
/// can ever be chosen as an anchor.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ScatterAux {
    Normal,
    Speculative,
    CacheHit,
}

/// A single-page I/O descriptor.
///
/// Stack- or arena-allocated per call; never cached. The buffer may alias a
/// page owned by the cache or a slice of the caller's own buffer.
pub struct MemScatter<'a> {
    pub addr: PhysAddr,
    pub buf: &'a mut [u8; PAGE_SIZE as usize],
    pub valid: bool,
    pub aux: ScatterAux,
}

impl<'a> MemScatter<'a> {
    pub fn new(addr: PhysAddr, buf: &'a mut [u8; PAGE_SIZE as usize]) -> Self {
        MemScatter {
            addr,
            buf,
            valid: false,
            aux: ScatterAux::Normal,
        }
    }
}

bitflags::bitflags! {
    /// Flags accepted by the physical scatter pipeline.
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub struct ScatterFlags: u32 {
        /// Bypass the PHYS cache entirely on read.
        const NOCACHE = 1 << 0;
        /// Do not publish freshly-read pages back into the cache.
        const NOCACHEPUT = 1 << 1;
        /// Only serve from cache; never touch the device.
        const FORCECACHE_READ = 1 << 2;
        /// Zero-fill and mark valid any unit the device failed on, provided
        /// its address is within `pa_max`.
        const ZEROPAD_ON_FAIL = 1 << 3;
    }
}

/// The acquisition backend. Provided by the caller; the engine treats it as
/// an opaque, internally thread-safe collaborator.
pub trait ScatterDevice: Send + Sync {
    /// Issue a single scatter read. Each unit's `valid` flag is set by the
    /// device to indicate whether its buffer now holds real data.
    fn read_scatter(&self, units: &mut [MemScatter<'_>]);

    /// Issue a single scatter write. Each unit's `valid` flag is set to
    /// indicate whether the write succeeded.
    fn write_scatter(&self, units: &mut [MemScatter<'_>]);

    /// The highest physical address the device can address. Used to decide
    /// whether `ZEROPAD_ON_FAIL` applies to a given failed unit.
    fn pa_max(&self) -> PhysAddr;
}
