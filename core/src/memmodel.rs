//! The per-architecture memory-model plug.
//!
//! Everything here is a contract a collaborator fulfils -- the x86 /
//! x86-PAE / x64 page-table walkers themselves are out of scope for this
//! crate.

use crate::address::{PhysAddr, VirtAddr};
use crate::process::Process;

bitflags::bitflags! {
    /// Flags accepted by the virtual scatter pipeline.
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub struct VirtualFlags: u32 {
        /// Never fall back to `paged_read` on translation failure.
        const NOPAGING = 1 << 0;
        /// `va` in each unit is actually the address of a PTE, not data.
        const ALTADDR_VA_PTE = 1 << 1;
        /// Zero-fill units the pipeline could not ultimately service.
        const ZEROPAD_ON_FAIL = 1 << 2;
    }
}

/// The single return channel for a paged-read attempt. A memory model
/// either fully satisfies the read itself (`Done`), hands back a physical
/// address for the pipeline to continue with (`TranslatedTo`), or gives up
/// (`Fail`).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PagedReadOutcome {
    Done,
    TranslatedTo(PhysAddr),
    Fail,
}

/// A per-architecture page-table walker and structural validator.
pub trait MemoryModel: Send + Sync {
    /// Translate a virtual address in `process`'s address space to physical.
    fn virt_to_phys(&self, process: &Process, va: VirtAddr) -> Option<PhysAddr>;

    /// Structurally validate that `page` (the 4 KiB contents at `pa`) looks
    /// like a page-table page for this architecture. Used to decide whether
    /// a TLB-cached page may be returned as a page table.
    fn verify_page_table(&self, page: &[u8; 4096], pa: PhysAddr, is_x64: bool) -> bool;

    /// Invoked when `virt_to_phys` fails and paging fallback is enabled for
    /// a 4 KiB unit: handles transition/prototype PTEs and demand-paged-out
    /// pages.
    fn paged_read(
        &self,
        process: &Process,
        va: VirtAddr,
        pa: PhysAddr,
        scratch: &mut [u8],
        flags: VirtualFlags,
    ) -> PagedReadOutcome;

    /// Populate `process`'s flattened, deduplicated page-table-entry map.
    fn pte_map_initialize(&self, process: &Process) -> bool;
}
