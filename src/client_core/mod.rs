//! Client-side resilience core (§4.5): the connection state machine, the
//! TTL-tagged outbound queue, and the inbound message dispatcher that a
//! thin client embeds to survive tunnel drops and server restarts
//! without losing in-flight input.
//!
//! Built around a thin `connect()` returning split sink/stream halves,
//! with a reconnect loop layered on top to drive the state machine and
//! flush the queue once the socket reopens.

mod dispatch;
mod queue;
mod state;

pub use dispatch::{Dispatcher, InboundHandler};
pub use queue::{OutboundQueue, QueuedMessage, QUEUE_CAPACITY};
pub use state::{ConnectionState, StateMachine};
