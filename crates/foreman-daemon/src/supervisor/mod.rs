//! Worker process supervision.
//!
//! Provides:
//! - [`WorkerSupervisor`]: owns live instances, spawn de-duplication, requests
//! - [`health`]: probe-with-retries and the periodic health task
//! - [`PortAllocator`]: worker port assignment
//! - [`orphans`]: on-disk registry used to reap workers left by a crashed daemon

pub mod health;
pub mod manager;
pub mod orphans;
pub mod ports;
pub mod types;

pub use manager::{SupervisorDeps, SupervisorSettings, WorkerSupervisor};
pub use orphans::WorkerRegistryFile;
pub use ports::PortAllocator;
pub use types::{WorkerInstance, WorkerStatus};
