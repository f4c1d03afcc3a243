//! # Peer Scoring
//!
//! Per-peer score computed from two inputs:
//!
//! - **IP colocation**: peers sharing a single IP address beyond a threshold
//!   accrue a quadratic penalty. Sybil operators running many identities from
//!   one host score progressively worse; unrelated peers behind ordinary NAT
//!   stay below the threshold and are unaffected.
//! - **Invalid messages**: each message rejected for a bad signature adds to
//!   a decaying counter with a quadratic negative contribution.
//!
//! Scores gate mesh admission only. A low-scoring peer still receives and
//! relays messages; it is just the last pick when grafting and the first
//! pick when pruning.

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::identity::Identity;

/// Bound on the number of tracked IPs and peers.
const SCORE_TABLE_CAPACITY: usize = 10_000;

/// Tunable weights for the scoring function.
#[derive(Clone, Copy, Debug)]
pub struct ScoreParams {
    /// Number of peers allowed to share one IP before the penalty applies.
    pub ip_colocation_threshold: usize,
    /// Negative weight applied to the squared excess over the threshold.
    pub ip_colocation_weight: f64,
    /// Negative weight applied to the squared invalid-message counter.
    pub invalid_message_weight: f64,
    /// Multiplicative decay applied to the invalid-message counter each
    /// heartbeat.
    pub invalid_message_decay: f64,
    /// Counter values below this decay straight to zero.
    pub decay_to_zero: f64,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            ip_colocation_threshold: 1,
            ip_colocation_weight: -10.0,
            invalid_message_weight: -1.0,
            invalid_message_decay: 0.9,
            decay_to_zero: 0.01,
        }
    }
}

/// Tracks how many connected peers share each IP address.
struct IpColocationTracker {
    /// IP -> number of connected peers observed at that address.
    ip_counts: LruCache<IpAddr, usize>,
    /// Peer -> the IP it connected from, for symmetric removal.
    peer_ips: LruCache<Identity, IpAddr>,
    threshold: usize,
}

impl IpColocationTracker {
    fn new(threshold: usize) -> Self {
        let capacity = NonZeroUsize::new(SCORE_TABLE_CAPACITY)
            .expect("SCORE_TABLE_CAPACITY must be non-zero");
        Self {
            ip_counts: LruCache::new(capacity),
            peer_ips: LruCache::new(capacity),
            threshold,
        }
    }

    fn register(&mut self, peer: Identity, ip: IpAddr) {
        // A reconnect from a new address replaces the old binding.
        if let Some(old_ip) = self.peer_ips.pop(&peer) {
            self.decrement(old_ip);
        }
        let count = self.ip_counts.get_or_insert_mut(ip, || 0);
        *count += 1;
        self.peer_ips.put(peer, ip);
    }

    fn unregister(&mut self, peer: &Identity) {
        if let Some(ip) = self.peer_ips.pop(peer) {
            self.decrement(ip);
        }
    }

    fn decrement(&mut self, ip: IpAddr) {
        if let Some(count) = self.ip_counts.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.ip_counts.pop(&ip);
            }
        }
    }

    /// Squared excess of the peer's shared-IP count over the threshold.
    /// Zero at or below the threshold, monotonically increasing above it.
    fn factor(&mut self, peer: &Identity) -> f64 {
        let ip = match self.peer_ips.get(peer) {
            Some(ip) => *ip,
            None => return 0.0,
        };
        let count = self.ip_counts.get(&ip).copied().unwrap_or(0);
        if count <= self.threshold {
            return 0.0;
        }
        let excess = (count - self.threshold) as f64;
        excess * excess
    }
}

/// Aggregates scoring inputs and produces per-peer scores.
pub struct PeerScoreTracker {
    params: ScoreParams,
    colocation: IpColocationTracker,
    /// Decaying count of invalid messages per peer.
    invalid_messages: HashMap<Identity, f64>,
}

impl PeerScoreTracker {
    pub fn new(params: ScoreParams) -> Self {
        Self {
            colocation: IpColocationTracker::new(params.ip_colocation_threshold),
            invalid_messages: HashMap::new(),
            params,
        }
    }

    pub fn record_connection(&mut self, peer: Identity, ip: IpAddr) {
        self.colocation.register(peer, ip);
    }

    pub fn record_disconnection(&mut self, peer: &Identity) {
        self.colocation.unregister(peer);
        self.invalid_messages.remove(peer);
    }

    pub fn record_invalid_message(&mut self, peer: &Identity) {
        *self.invalid_messages.entry(*peer).or_insert(0.0) += 1.0;
    }

    /// Current score for a peer. At most zero; clean peers score exactly zero.
    pub fn score(&mut self, peer: &Identity) -> f64 {
        let colo = self.params.ip_colocation_weight * self.colocation.factor(peer);
        let invalid = self
            .invalid_messages
            .get(peer)
            .map(|count| self.params.invalid_message_weight * count * count)
            .unwrap_or(0.0);
        colo + invalid
    }

    /// Apply counter decay. Called once per heartbeat.
    pub fn decay(&mut self) {
        let decay = self.params.invalid_message_decay;
        let floor = self.params.decay_to_zero;
        self.invalid_messages.retain(|_, count| {
            *count *= decay;
            *count >= floor
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> Identity {
        Identity::from([byte; 32])
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    fn tracker() -> PeerScoreTracker {
        PeerScoreTracker::new(ScoreParams {
            ip_colocation_threshold: 1,
            ..ScoreParams::default()
        })
    }

    #[test]
    fn clean_peer_scores_zero() {
        let mut scores = tracker();
        scores.record_connection(peer(1), ip(1));
        assert_eq!(scores.score(&peer(1)), 0.0);
        assert_eq!(scores.score(&peer(99)), 0.0);
    }

    #[test]
    fn colocation_penalty_above_threshold() {
        let mut scores = tracker();
        scores.record_connection(peer(1), ip(1));
        scores.record_connection(peer(2), ip(1));
        scores.record_connection(peer(3), ip(2));

        // Two peers share ip(1) with threshold 1: excess 1, factor 1.
        assert!(scores.score(&peer(1)) < 0.0);
        assert_eq!(scores.score(&peer(1)), scores.score(&peer(2)));
        // Lone peer on its own IP is unaffected.
        assert_eq!(scores.score(&peer(3)), 0.0);
    }

    #[test]
    fn colocation_penalty_is_monotone() {
        let mut scores = tracker();
        scores.record_connection(peer(1), ip(1));
        scores.record_connection(peer(2), ip(1));
        let two_sharing = scores.score(&peer(1));

        scores.record_connection(peer(3), ip(1));
        let three_sharing = scores.score(&peer(1));

        scores.record_connection(peer(4), ip(1));
        let four_sharing = scores.score(&peer(1));

        assert!(three_sharing < two_sharing);
        assert!(four_sharing < three_sharing);
    }

    #[test]
    fn disconnect_removes_colocation_penalty() {
        let mut scores = tracker();
        scores.record_connection(peer(1), ip(1));
        scores.record_connection(peer(2), ip(1));
        assert!(scores.score(&peer(1)) < 0.0);

        scores.record_disconnection(&peer(2));
        assert_eq!(scores.score(&peer(1)), 0.0);
    }

    #[test]
    fn reconnect_from_new_address_rebinds() {
        let mut scores = tracker();
        scores.record_connection(peer(1), ip(1));
        scores.record_connection(peer(2), ip(1));
        assert!(scores.score(&peer(1)) < 0.0);

        // Peer 2 reconnects from a different address; the old count drops.
        scores.record_connection(peer(2), ip(2));
        assert_eq!(scores.score(&peer(1)), 0.0);
        assert_eq!(scores.score(&peer(2)), 0.0);
    }

    #[test]
    fn invalid_messages_penalize_and_decay() {
        let mut scores = tracker();
        scores.record_connection(peer(1), ip(1));

        scores.record_invalid_message(&peer(1));
        let one_strike = scores.score(&peer(1));
        assert!(one_strike < 0.0);

        scores.record_invalid_message(&peer(1));
        assert!(scores.score(&peer(1)) < one_strike);

        // Enough decay rounds drive the counter to zero.
        for _ in 0..200 {
            scores.decay();
        }
        assert_eq!(scores.score(&peer(1)), 0.0);
    }
}
