//! # japi-realtime — Subscriptions and post-commit change broadcasting
//!
//! Maintains per-connection subscriptions and turns the executor's change
//! events into at most one notification per connection per event, after
//! the producing transaction commits.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`SubscriptionRegistry`] | Per-connection subscriptions, filter validation, idempotent restore |
//! | [`ChangeBroadcaster`] | [`ChangeSink`](japi_core::ChangeSink) impl: transaction buffering, filter matching, send timeouts |
//! | [`Connection`] / [`ChannelConnection`] | How the broadcaster reaches one client |
//! | [`ClientMessage`] / [`ServerMessage`] | The JSON wire frames (`subscribe`, `subscription.created`, `resource.<op>d`, …) |
//!
//! Wiring: build the engine with
//! `.change_sink(broadcaster)` and share one [`SubscriptionRegistry`]
//! between the broadcaster and the transport's socket handlers.

pub mod broadcaster;
pub mod connection;
pub mod messages;
pub mod registry;

pub use broadcaster::ChangeBroadcaster;
pub use connection::{ChannelConnection, Connection, ConnectionClosed, ConnectionId};
pub use messages::{ClientMessage, Notification, ServerMessage, SubscribeRequest};
pub use registry::{Subscription, SubscriptionRegistry};

/// Re-exports of the most commonly used realtime types.
pub mod prelude {
    pub use crate::{
        ChangeBroadcaster, ChannelConnection, ClientMessage, Connection, ServerMessage,
        SubscribeRequest, SubscriptionRegistry,
    };
}
