//! Realtime event consistency engine for Vigil.
//!
//! Turns at-least-once, possibly reordered server-push streams into
//! exactly-once-effective notifications for every open tab:
//! - Leader election over a cross-tab bus plus an advisory shared lease
//! - Ref-counted push-stream pool with jittered exponential backoff
//! - Durable processed-event log and per-channel cursors (leader only)
//! - In-memory authority log for fast-path and semantic deduplication
//! - Ordered gap-resync through the backend catch-up endpoint
//!
//! Golden invariant: persist, then notify, then acknowledge.

pub mod ack;
pub mod authority;
pub mod backend;
pub mod backoff;
pub mod bus;
pub mod clock;
pub mod config;
pub mod election;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod orchestrator;
pub mod pool;
pub mod routing;
pub mod sse;
pub mod transport;
pub mod types;

pub use config::RealtimeConfig;
pub use engine::{EngineDeps, RealtimeEngine, RealtimeHandle, create_engine};
pub use error::{RealtimeError, RealtimeResult};
pub use types::*;
