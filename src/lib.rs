//! stationhub: a single long-lived process that exposes a local coding
//! agent (or terminal) to an authenticated WebSocket client through a
//! stable public URL, surviving both tunnel drops and the agent's own
//! server restarts.
//!
//! - [`supervisor`]: owns the child server's lifecycle — start, drain,
//!   restart with backoff, deploy-crash-loop rollback.
//! - [`tunnel`]: runs the external tunnel binary and recovers it after drops.
//! - [`session`]: creates/lists/destroys sessions and fans agent events out.
//! - [`broker`]: the authenticated per-client WebSocket + HTTP surface.
//! - [`client_core`]: the resilience core a thin client embeds (state
//!   machine, TTL queue, dispatcher) — reusable independent of this binary.

pub mod atomic;
pub mod broker;
pub mod client_core;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod settings_lock;
pub mod supervisor;
pub mod tunnel;
