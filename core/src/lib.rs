//! A memory-introspection engine: given an acquisition backend and a
//! per-architecture memory model, exposes cached physical/virtual memory
//! access, a process table, and a worker pool for fanning work out across
//! every known process.
//!
//! See [`Context`] for the entry point.

pub mod address;
pub mod cache;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod maps;
pub mod memmodel;
pub mod process;
pub mod scatter;
pub mod tlb;
pub mod worker;

pub use address::{PhysAddr, VirtAddr};
pub use config::{Config, EngineFlags, SystemType};
pub use context::{Context, ProcessDescriptor};
pub use device::{MemScatter, ScatterAux, ScatterDevice, ScatterFlags};
pub use error::{ConfigError, EngineError};
pub use memmodel::{MemoryModel, PagedReadOutcome, VirtualFlags};
pub use process::{GetNextFlags, Pid, Process, ProcessState, ProcessTable, ShortName};
