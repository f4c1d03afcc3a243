//! # Message Validation Pipeline
//!
//! Every inbound publish frame runs through a fixed sequence of checks
//! before it may be delivered or forwarded:
//!
//! 1. structural decode (done by the caller via bounded bincode)
//! 2. signature-policy field presence
//! 3. cryptographic signature verification
//! 4. duplicate suppression against the seen cache
//!
//! The stages short-circuit: the first failing stage names the rejection
//! and nothing later runs. A rejected message is dropped at this layer,
//! never delivered and never forwarded.
//!
//! ## Policies
//!
//! - `StrictSign`: `source`, `seqno` and `signature` must all be present and
//!   the signature must verify against the source key. The message ID binds
//!   the signer, so two signers publishing identical payloads produce two
//!   distinct messages.
//! - `StrictNoSign`: all three fields must be absent. The message ID is a
//!   pure content hash, so identical anonymous payloads arriving via
//!   different relays collapse into one message.
//!
//! Nodes with different policies reject each other's traffic at the first
//! hop; the policy is fixed per node at construction.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::crypto::{self, MESSAGE_SIGNATURE_DOMAIN};
use crate::identity::Identity;
use crate::messages::MessageId;

/// Process-wide message signing discipline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignaturePolicy {
    /// Messages carry source, seqno and a signature over the full envelope.
    StrictSign,
    /// Messages are anonymous; any authorship field is a violation.
    StrictNoSign,
}

/// Why a message was dropped by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Frame failed structural decoding.
    Malformed,
    /// Authorship fields do not match the local signature policy.
    PolicyViolation,
    /// Signature present but cryptographically invalid.
    InvalidSignature,
    /// Message ID already in the seen cache.
    Duplicate,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Malformed => write!(f, "malformed frame"),
            RejectReason::PolicyViolation => write!(f, "signature policy violation"),
            RejectReason::InvalidSignature => write!(f, "invalid signature"),
            RejectReason::Duplicate => write!(f, "duplicate message"),
        }
    }
}

impl std::error::Error for RejectReason {}

/// A publish frame's content fields, as validated.
#[derive(Clone, Debug)]
pub struct MessageRecord {
    pub topic: String,
    pub source: Option<Identity>,
    pub seqno: Option<u64>,
    pub data: Vec<u8>,
    pub id: MessageId,
}

/// Compute the message ID for a publish frame.
///
/// Pure function of the decoded fields, always computed locally. IDs are
/// never read from the wire, so a relay cannot influence deduplication.
pub fn compute_message_id(
    policy: SignaturePolicy,
    topic: &str,
    source: Option<&Identity>,
    seqno: Option<u64>,
    data: &[u8],
) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    match policy {
        SignaturePolicy::StrictSign => {
            // Presence was checked by the policy stage; fall back to zeros
            // only for callers hashing before validation.
            let source_bytes = source.map(|s| *s.as_bytes()).unwrap_or([0u8; 32]);
            hasher.update(&source_bytes);
            hasher.update(&seqno.unwrap_or(0).to_le_bytes());
            hasher.update(data);
        }
        SignaturePolicy::StrictNoSign => {
            hasher.update(&(topic.len() as u32).to_le_bytes());
            hasher.update(topic.as_bytes());
            hasher.update(data);
        }
    }
    *hasher.finalize().as_bytes()
}

/// Canonical byte string covered by a message signature.
///
/// Length-prefixes the variable-size fields so distinct envelopes can never
/// serialize to the same byte string.
pub fn signed_payload(source: &Identity, topic: &str, seqno: u64, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 + 4 + topic.len() + 8 + 4 + data.len());
    payload.extend_from_slice(source.as_bytes());
    payload.extend_from_slice(&(topic.len() as u32).to_le_bytes());
    payload.extend_from_slice(topic.as_bytes());
    payload.extend_from_slice(&seqno.to_le_bytes());
    payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
    payload.extend_from_slice(data);
    payload
}

/// TTL-bounded LRU cache of recently seen message IDs.
pub struct SeenCache {
    entries: LruCache<MessageId, Instant>,
    ttl: Duration,
}

impl SeenCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity floored at 1");
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Record an ID. Returns true if it was fresh (not seen within the TTL).
    pub fn observe(&mut self, id: MessageId) -> bool {
        let now = Instant::now();
        if let Some(seen_at) = self.entries.get(&id) {
            if now.duration_since(*seen_at) < self.ttl {
                return false;
            }
        }
        self.entries.put(id, now);
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        match self.entries.peek(id) {
            Some(seen_at) => seen_at.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Drop entries past their TTL. Called on the heartbeat cadence.
    pub fn purge_expired(&mut self) {
        let ttl = self.ttl;
        while let Some((_, seen_at)) = self.entries.peek_lru() {
            if seen_at.elapsed() < ttl {
                break;
            }
            self.entries.pop_lru();
        }
    }
}

/// Stateful validation pipeline: policy check, signature check, dedup.
pub struct ValidationPipeline {
    policy: SignaturePolicy,
    seen: SeenCache,
}

impl ValidationPipeline {
    pub fn new(policy: SignaturePolicy, seen_capacity: usize, seen_ttl: Duration) -> Self {
        Self {
            policy,
            seen: SeenCache::new(seen_capacity, seen_ttl),
        }
    }

    pub fn policy(&self) -> SignaturePolicy {
        self.policy
    }

    /// Mark a locally published message as seen so the forward path cannot
    /// loop it back in.
    pub fn mark_seen(&mut self, id: MessageId) -> bool {
        self.seen.observe(id)
    }

    pub fn has_seen(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    pub fn purge_expired(&mut self) {
        self.seen.purge_expired();
    }

    /// Run the policy, signature and dedup stages over a decoded publish
    /// frame. On `Ok` the message is recorded in the seen cache.
    pub fn validate(
        &mut self,
        topic: &str,
        source: Option<Identity>,
        seqno: Option<u64>,
        data: &[u8],
        signature: Option<&[u8]>,
    ) -> Result<MessageRecord, RejectReason> {
        match self.policy {
            SignaturePolicy::StrictSign => {
                let (source_id, seqno_val, sig) = match (source, seqno, signature) {
                    (Some(s), Some(n), Some(sig)) => (s, n, sig),
                    _ => return Err(RejectReason::PolicyViolation),
                };
                let payload = signed_payload(&source_id, topic, seqno_val, data);
                crypto::verify_with_domain(&source_id, MESSAGE_SIGNATURE_DOMAIN, &payload, sig)
                    .map_err(|_| RejectReason::InvalidSignature)?;
            }
            SignaturePolicy::StrictNoSign => {
                if source.is_some() || seqno.is_some() || signature.is_some() {
                    return Err(RejectReason::PolicyViolation);
                }
            }
        }

        let id = compute_message_id(self.policy, topic, source.as_ref(), seqno, data);
        if !self.seen.observe(id) {
            return Err(RejectReason::Duplicate);
        }

        Ok(MessageRecord {
            topic: topic.to_string(),
            source,
            seqno,
            data: data.to_vec(),
            id,
        })
    }
}
