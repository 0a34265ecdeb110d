//! Delivery paths from a publication to one remote subscriber.

use async_trait::async_trait;
use kinetic_core::{ChannelId, PublicationUpdate};
use thiserror::Error;

/// The remote end of a channel is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel closed")]
pub struct ChannelClosed;

/// One subscriber slot for one key, e.g. one key on one WebSocket
/// connection.
///
/// `deliver` may wait for buffer space but must return once the remote end
/// is gone.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    fn id(&self) -> ChannelId;

    async fn deliver(&self, update: PublicationUpdate) -> Result<(), ChannelClosed>;
}
