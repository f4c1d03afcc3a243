//! # Meshsub
//!
//! Gossip-based publish/subscribe mesh engine. Nodes maintain a
//! bounded-degree mesh of peers per topic, forward full messages eagerly
//! inside the mesh and gossip message IDs lazily outside it, rebalance on a
//! heartbeat using peer scores, and enforce a process-wide message
//! signature policy.
//!
//! The engine is transport-agnostic: encoded frames leave through the
//! [`protocols::PubsubTransport`] trait and arrive via
//! [`pubsub::Pubsub::handle_inbound`]. Binding identities to authenticated
//! connections is the transport's job.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`identity`] | Ed25519 keypairs and 32-byte peer identities |
//! | [`crypto`] | Domain-separated message signing and verification |
//! | [`messages`] | Wire frames and bounded bincode codecs |
//! | [`subscriptions`] | Local and remote subscription tracking |
//! | [`mesh`] | Per-topic mesh member sets and phases |
//! | [`score`] | IP-colocation and invalid-message peer scoring |
//! | [`validation`] | Signature-policy and dedup pipeline |
//! | [`pubsub`] | The engine actor and its public handle |
//! | [`protocols`] | Transport seam |
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshsub::identity::Keypair;
//! use meshsub::protocols::PubsubTransport;
//! use meshsub::pubsub::{Pubsub, PubsubConfig};
//!
//! # async fn example<T: PubsubTransport>(transport: Arc<T>) -> anyhow::Result<()> {
//! let (node, mut deliveries) = Pubsub::spawn(
//!     Keypair::generate(),
//!     PubsubConfig::default(),
//!     transport,
//! );
//! node.subscribe("news").await?;
//! while let Some(message) = deliveries.recv().await {
//!     println!("got {} bytes on {}", message.data.len(), message.topic);
//! }
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod identity;
pub mod mesh;
pub mod messages;
pub mod protocols;
pub mod pubsub;
pub mod score;
pub mod subscriptions;
pub mod validation;

pub use identity::{Identity, Keypair};
pub use protocols::PubsubTransport;
pub use pubsub::{
    ControlEvent, DeliveredMessage, Pubsub, PubsubConfig, PublishError, PublishReceipt,
};
pub use score::ScoreParams;
pub use validation::{RejectReason, SignaturePolicy};
