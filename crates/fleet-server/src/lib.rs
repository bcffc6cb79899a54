//! Fleet coordination server: session management, command routing,
//! liveness tracking, audio ingest, and the audit trail for a fleet of
//! voice-controlled robotics devices.

pub mod api;
pub mod error;
pub mod logbuf;
pub mod pipeline;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod sessions;
pub mod snapshot;
pub mod store;
pub mod types;

pub use error::ApiError;
pub use store::Store;
