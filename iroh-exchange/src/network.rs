//! Seams to the transport and content routing layers.

use std::fmt::Debug;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cid::Cid;
use futures::stream::BoxStream;
use libp2p_identity::PeerId;

use crate::message::BitswapMessage;

/// The transport, as far as the exchange engine cares.
#[async_trait]
pub trait Network: Debug + Send + Sync + 'static {
    /// Our own peer id.
    fn self_id(&self) -> PeerId;

    /// Dials the peer, giving up after `timeout`.
    async fn connect(&self, peer: PeerId, timeout: Duration) -> Result<()>;

    /// Opens a stream to send messages to `peer`.
    async fn open_sender(&self, peer: PeerId) -> Result<Box<dyn MessageSender>>;
}

/// An open outbound message stream to a single peer.
#[async_trait]
pub trait MessageSender: Debug + Send + Sync {
    async fn send(&mut self, message: BitswapMessage) -> Result<()>;

    /// Gracefully closes the stream.
    async fn close(&mut self) -> Result<()>;

    /// Abruptly tears down the stream.
    fn reset(&mut self);
}

/// Provider discovery and announcement.
#[async_trait]
pub trait ContentRouting: Debug + Send + Sync + 'static {
    /// Streams up to `max_results` peers believed to hold `cid`, ending after `timeout`.
    async fn find_providers(
        &self,
        cid: Cid,
        max_results: usize,
        timeout: Duration,
    ) -> Result<BoxStream<'static, PeerId>>;

    /// Announces that we hold `cid`.
    async fn provide(&self, cid: Cid) -> Result<()>;
}

/// Inbound callbacks, invoked by whoever owns the transport.
///
/// Implementations must not block, events are expected to be queued and
/// processed in order.
pub trait Delegate: Send + Sync {
    fn on_message(&self, peer: PeerId, message: BitswapMessage);

    /// A message from `peer` could not be decoded.
    fn on_error(&self, peer: PeerId, error: anyhow::Error);

    fn on_peer_connected(&self, peer: PeerId);

    fn on_peer_disconnected(&self, peer: PeerId);
}
