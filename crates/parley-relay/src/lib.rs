//! parley-relay
//!
//! WebSocket transport to the relay network. A process-wide [`RelayPool`]
//! multiplexes connections: idempotent connect with capped backoff,
//! publish-with-acks, filter subscriptions with cross-relay deduplication.
//!
//! Per-relay delivery order is whatever the relay sent; cross-relay
//! interleaving is allowed, so consumers must tolerate `created_at`
//! reordering.

pub mod connection;
pub mod message;
pub mod pool;
pub mod testing;

pub use connection::RelayConnection;
pub use message::{ClientMessage, RelayMessage};
pub use pool::{RelayPool, Subscription, SubscriptionItem};
