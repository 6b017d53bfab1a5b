//! Foreman Core Library
//!
//! Shared functionality for Foreman components:
//! - Configuration resolution and hierarchy
//! - Worker profile catalog with inheritance
//! - Spawn policy, warm pool, health and workflow settings
//! - Common error types and tracing setup

pub mod config;
pub mod error;
pub mod profile;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use profile::{ProfileCatalog, WorkerProfile};
