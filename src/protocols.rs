//! # Transport Seam
//!
//! The mesh engine never opens connections itself. It hands encoded frames
//! to a [`PubsubTransport`] implementation and learns about connection
//! lifecycle through `peer_connected` / `peer_disconnected` calls on the
//! `Pubsub` handle. Production transports bind identities to authenticated
//! connections; tests wire nodes together in memory.

use async_trait::async_trait;

use crate::identity::Identity;

/// Outbound frame dispatch.
///
/// Implementations must bound their own blocking: a send that cannot make
/// progress should fail rather than stall the caller, since the engine
/// invokes this from its event loop. A failed send is skipped; the next
/// heartbeat's rebalance is the retry path.
#[async_trait]
pub trait PubsubTransport: Send + Sync + 'static {
    async fn send(&self, to: &Identity, frame: Vec<u8>) -> anyhow::Result<()>;
}
