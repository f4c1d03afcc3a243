//! # Topic Mesh
//!
//! A mesh is the per-topic set of peers we exchange full messages with
//! eagerly. Membership is bounded by the configured degree targets and is
//! negotiated with GRAFT/PRUNE frames so both sides agree on the link.
//!
//! The mesh moves through three phases as peers arrive:
//! no mesh while unsubscribed or empty, forming while below the low
//! watermark, stable once the degree sits inside the configured band.

use std::collections::HashSet;

use crate::identity::Identity;

/// Lifecycle phase of a topic's mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshPhase {
    /// Not subscribed, or subscribed with no members yet.
    NoMesh,
    /// Members present but below the low watermark.
    Forming,
    /// Degree within the healthy band.
    Stable,
}

/// Member set for one topic's mesh.
#[derive(Default)]
pub struct TopicMesh {
    members: HashSet<Identity>,
}

impl TopicMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the peer was not already a member.
    pub fn add(&mut self, peer: Identity) -> bool {
        self.members.insert(peer)
    }

    /// Returns true if the peer was a member.
    pub fn remove(&mut self, peer: &Identity) -> bool {
        self.members.remove(peer)
    }

    pub fn contains(&self, peer: &Identity) -> bool {
        self.members.contains(peer)
    }

    pub fn degree(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = &Identity> {
        self.members.iter()
    }

    /// Keep only members passing the predicate, returning the evicted peers.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<Identity>
    where
        F: FnMut(&Identity) -> bool,
    {
        let evicted: Vec<Identity> = self
            .members
            .iter()
            .filter(|&peer| !keep(peer))
            .copied()
            .collect();
        for peer in &evicted {
            self.members.remove(peer);
        }
        evicted
    }

    pub fn phase(&self, subscribed: bool, mesh_n_low: usize) -> MeshPhase {
        if !subscribed || self.members.is_empty() {
            MeshPhase::NoMesh
        } else if self.members.len() < mesh_n_low {
            MeshPhase::Forming
        } else {
            MeshPhase::Stable
        }
    }
}
