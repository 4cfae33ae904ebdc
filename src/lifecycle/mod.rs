//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Trigger → server stops accepting → in-flight dispatches settle → exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful shutdown
//!
//! In-flight (inflight.rs):
//!     dispatch start → guard held → Done (guard dropped)
//! ```
//!
//! # Design Decisions
//! - Shutdown waits for dispatches, bounded by the shadow timeout
//! - One in-flight tracker spans config reloads, so dispatches started on a
//!   replaced handler are still waited for

pub mod inflight;
pub mod shutdown;
pub mod signals;

pub use inflight::InFlight;
pub use shutdown::Shutdown;
