//! KINETIC Bridge - Publications and Subscriptions
//!
//! Turns cached computations into push streams. A [`Publisher`] keeps one
//! [`Publication`] per subscribed key; every subscribed [`Channel`] receives
//! the current value on subscribe and each newer version after the key is
//! invalidated, newest-only and never out of order.

pub mod channel;
pub mod config;
pub mod publication;
pub mod publisher;
pub mod stats;

pub use channel::{Channel, ChannelClosed};
pub use config::BridgeConfig;
pub use publication::{Publication, PublicationState};
pub use publisher::{Publisher, Subscription};
pub use stats::{PublisherStats, PublisherStatsSnapshot};
