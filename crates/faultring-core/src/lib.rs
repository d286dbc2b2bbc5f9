//! faultring-core: a shared, fixed-capacity log of recent errors
//!
//! Many independent worker processes write error events into one circular
//! ring living in a shared, memory-backed region; any of them can read it
//! back. The newest record overwrites the oldest once the ring is full.
//!
//! # Architecture
//!
//! ```text
//! host error → CaptureHook / CaptureLayer → WriteGuard (exclusive) → RingStore.append
//! caller     → query_last / query_history → ReadGuard (shared) → scan/copy
//! ```
//!
//! # Modules
//!
//! - `record`: Record type and fixed-width slot encoding
//! - `ring_store`: Circular slot array with cursor bookkeeping
//! - `region`: Reservation plan and shared region lifecycle
//! - `guard`: Scoped shared/exclusive access to the ring
//! - `ring`: `ErrorRing` process handle (capture, queries, clear, stats)
//! - `capture`: Error hook chain, request context and tracing layer
//! - `config`: Configuration (faultring.toml)
//! - `logging`: Structured logging setup
//! - `error`: Error types with remediation hints
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod capture;
pub mod config;
pub mod error;
pub mod guard;
pub mod logging;
pub mod record;
pub mod region;
pub mod ring;
pub mod ring_store;

pub use capture::{CaptureHook, CaptureLayer, ErrorEvent, ErrorHook, HookSlot, RequestContext};
pub use config::{Config, RingConfig};
pub use error::{Error, Remediation, Result};
pub use record::{Record, Severity};
pub use region::{Attachment, RegionLayout, RegionPlan, SharedRegion};
pub use ring::{ErrorRing, HistoryIter};
pub use ring_store::RingStats;
