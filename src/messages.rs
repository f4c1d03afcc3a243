//! # Wire Protocol Frames
//!
//! This module defines the serializable frame types exchanged between peers.
//! Frames are serialized using bincode with size limits to prevent memory
//! exhaustion from hostile input.
//!
//! ## Frame Types
//!
//! | Frame | Purpose |
//! |-------|---------|
//! | `Subscribe` / `Unsubscribe` | Announce (loss of) interest in a topic |
//! | `Graft` / `Prune` | Mesh membership control exchange |
//! | `Publish` | Full message content, eager forwarding |
//! | `IHave` / `IWant` | Lazy gossip announcement and repair |
//!
//! ## Message IDs
//!
//! A `MessageId` is a 32-byte BLAKE3 hash computed locally from the decoded
//! frame (see `validation::compute_message_id`); IDs are never carried on the
//! wire, so a relay cannot lie about deduplication identity.
//!
//! ## Security Limits
//!
//! All deserialization goes through [`decode_frame`], which enforces
//! `MAX_FRAME_SIZE` via bincode's `with_limit` to prevent OOM attacks.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// 32-byte BLAKE3 message identifier.
pub type MessageId = [u8; 32];

/// Maximum encoded frame size accepted from the wire (128 KiB).
/// Larger frames fail structural decoding and are dropped as malformed.
pub const MAX_FRAME_SIZE: u64 = 128 * 1024;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE)
        .with_fixint_encoding()
}

/// Serialize a frame for the wire.
pub fn encode_frame(frame: &PubsubFrame) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(frame)
}

/// Deserialize a frame with size bounds enforced.
/// SECURITY: Use this instead of raw `bincode::deserialize`.
pub fn decode_frame(bytes: &[u8]) -> Result<PubsubFrame, bincode::Error> {
    bincode_options().deserialize(bytes)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PubsubFrame {
    /// Subscribe to a topic - informs the peer we want messages for it.
    Subscribe { topic: String },
    /// Unsubscribe from a topic - informs the peer we no longer want messages.
    Unsubscribe { topic: String },
    /// GRAFT - we added the peer to our mesh for a topic and expect symmetry.
    Graft { topic: String },
    /// PRUNE - we removed the peer from our mesh for a topic.
    Prune { topic: String },
    /// Publish a message with full content.
    ///
    /// `source`, `seqno` and `signature` are all present under `StrictSign`
    /// and all absent under `StrictNoSign`; any other combination is a
    /// policy violation at the receiver.
    Publish {
        topic: String,
        source: Option<Identity>,
        seqno: Option<u64>,
        data: Vec<u8>,
        signature: Option<Vec<u8>>,
    },
    /// IHAVE - lazy gossip announcing message IDs we hold for a topic.
    IHave {
        topic: String,
        msg_ids: Vec<MessageId>,
    },
    /// IWANT - request full messages by their IDs.
    IWant { msg_ids: Vec<MessageId> },
}

impl PubsubFrame {
    pub fn topic(&self) -> Option<&str> {
        match self {
            PubsubFrame::Subscribe { topic } => Some(topic),
            PubsubFrame::Unsubscribe { topic } => Some(topic),
            PubsubFrame::Graft { topic } => Some(topic),
            PubsubFrame::Prune { topic } => Some(topic),
            PubsubFrame::Publish { topic, .. } => Some(topic),
            PubsubFrame::IHave { topic, .. } => Some(topic),
            PubsubFrame::IWant { .. } => None,
        }
    }
}
