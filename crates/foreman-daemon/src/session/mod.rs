//! Session tracking.
//!
//! Every worker instance gets one session when it is spawned. The
//! [`SessionManager`] records message and tool activity against it in a
//! bounded ring and publishes session lifecycle events.

pub mod manager;
pub mod types;

pub use manager::{NewSession, SessionManager};
pub use types::{Activity, ActivityKind, SessionStatus, SessionSummary, TrackedSession};
