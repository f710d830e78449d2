//! Setup-time error taxonomy.
//!
//! Everything on the data plane (cache hits/misses, scatter I/O, process
//! lookups) is expressed as `Option`/`bool`/plain structs -- it never
//! throws. These types only cover the construction/configuration surface,
//! where a typed reason is actually useful to a caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cache capacity must be greater than zero")]
    ZeroCacheCapacity,
    #[error("worker pool size must be greater than zero")]
    ZeroWorkerCount,
    #[error("process table capacity must be a power of two")]
    ProcessTableNotPowerOfTwo,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("device reports no usable physical memory")]
    NoUsablePhysicalMemory,
    #[error("device rejected the supplied configuration: {0}")]
    DeviceRejectedConfig(String),
    #[error("worker pool failed to start: {0}")]
    WorkerPoolStartFailed(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
