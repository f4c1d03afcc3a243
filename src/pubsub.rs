//! # Publish/Subscribe Engine
//!
//! Gossip-based pubsub over per-topic meshes. Each node maintains a
//! bounded-degree set of mesh peers per subscribed topic, forwards full
//! messages eagerly inside the mesh, and announces message IDs lazily to
//! peers outside it. A heartbeat rebalances mesh degree using peer scores.
//!
//! ## Architecture
//!
//! Follows the actor pattern used across the codebase: [`Pubsub`] is a
//! cheap-to-clone handle that sends commands over an mpsc channel to a
//! private actor task owning all mutable state. Mesh mutation, validation
//! and forwarding are serialized on the actor loop, so no rebalance can
//! interleave with a publish or an unsubscribe.
//!
//! ## Message Flow
//!
//! - `publish` stamps the message per the node's signature policy, records
//!   it as seen and fans it out to the topic mesh (or, with no mesh yet, to
//!   every connected subscriber). The publisher does not deliver its own
//!   messages locally.
//! - Inbound publish frames run the validation pipeline (policy, signature,
//!   dedup). Accepted messages are delivered to the local subscriber stream
//!   and forwarded to the mesh minus the arrival peer.
//! - Heartbeats evict stale mesh members, graft the highest-scoring
//!   candidates, prune overfull meshes and emit IHAVE gossip.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use lru::LruCache;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::crypto::{sign_with_domain, MESSAGE_SIGNATURE_DOMAIN};
use crate::identity::{Identity, Keypair};
use crate::mesh::TopicMesh;
use crate::messages::{decode_frame, encode_frame, MessageId, PubsubFrame};
use crate::protocols::PubsubTransport;
use crate::score::{PeerScoreTracker, ScoreParams};
use crate::subscriptions::SubscriptionTable;
use crate::validation::{
    compute_message_id, signed_payload, RejectReason, SignaturePolicy, ValidationPipeline,
};

// ============================================================================
// Configuration
// ============================================================================

/// Maximum topic name length in bytes.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Engine configuration. Defaults give a 6-wide mesh with a 5..12 band and
/// a one-second heartbeat.
#[derive(Clone, Debug)]
pub struct PubsubConfig {
    /// Message signing discipline, fixed for the life of the node.
    pub policy: SignaturePolicy,
    /// Target mesh degree per topic.
    pub mesh_n: usize,
    /// Low watermark; below this the heartbeat grafts.
    pub mesh_n_low: usize,
    /// High watermark; above this the heartbeat prunes back to `mesh_n`.
    pub mesh_n_high: usize,
    /// Number of non-mesh subscribers receiving IHAVE gossip per heartbeat.
    pub gossip_lazy: usize,
    pub heartbeat_interval: Duration,
    /// How long a message ID stays in the dedup cache. An ID seen again
    /// after expiry counts as a new message.
    pub seen_ttl: Duration,
    pub seen_cache_size: usize,
    /// Full messages retained for answering IWANT.
    pub message_cache_size: usize,
    pub message_cache_ttl: Duration,
    pub max_message_size: usize,
    /// Bound on IDs per IHAVE/IWANT frame, sent or honored.
    pub max_ihave_length: usize,
    pub score: ScoreParams,
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self {
            policy: SignaturePolicy::StrictSign,
            mesh_n: 6,
            mesh_n_low: 5,
            mesh_n_high: 12,
            gossip_lazy: 6,
            heartbeat_interval: Duration::from_secs(1),
            seen_ttl: Duration::from_secs(120),
            seen_cache_size: 100_000,
            message_cache_size: 10_000,
            message_cache_ttl: Duration::from_secs(60),
            max_message_size: 64 * 1024,
            max_ihave_length: 100,
            score: ScoreParams::default(),
        }
    }
}

/// Topic names are non-empty, bounded and printable ASCII.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic
            .bytes()
            .all(|b| b.is_ascii_graphic() || b == b' ')
}

// ============================================================================
// Public Types
// ============================================================================

/// Why a local publish call failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishError {
    InvalidTopic,
    MessageTooLarge { size: usize, max: usize },
    /// No connected subscriber or mesh member exists for the topic.
    NoRecipients,
    /// The message ID is already in the seen cache. Under `StrictNoSign`
    /// this happens whenever the same payload is republished within the
    /// seen TTL.
    Duplicate,
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishError::InvalidTopic => write!(f, "invalid topic name"),
            PublishError::MessageTooLarge { size, max } => {
                write!(f, "message too large: {size} bytes (max {max})")
            }
            PublishError::NoRecipients => write!(f, "no recipients for topic"),
            PublishError::Duplicate => write!(f, "message already published"),
        }
    }
}

impl std::error::Error for PublishError {}

/// Result of a publish call: the peers the message was directly sent to.
/// Says nothing about onward propagation.
#[derive(Clone, Debug)]
pub struct PublishReceipt {
    pub recipients: Vec<Identity>,
}

/// Control-plane observations, broadcast to any number of listeners.
#[derive(Clone, Debug)]
pub enum ControlEvent {
    /// A remote peer's subscription state for a topic changed.
    SubscriptionChanged {
        topic: String,
        peer: Identity,
        subscribed: bool,
    },
    /// A heartbeat pass over the topic finished.
    HeartbeatCompleted { topic: String },
}

/// A validated message delivered to the local subscriber.
#[derive(Clone, Debug)]
pub struct DeliveredMessage {
    pub topic: String,
    /// Signer identity under `StrictSign`, absent under `StrictNoSign`.
    pub source: Option<Identity>,
    pub seqno: Option<u64>,
    pub data: Vec<u8>,
    pub msg_id: MessageId,
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Subscribe {
        topic: String,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<PublishReceipt, PublishError>>,
    },
    Inbound {
        from: Identity,
        frame: Vec<u8>,
    },
    PeerConnected {
        peer: Identity,
        ip: IpAddr,
    },
    PeerDisconnected {
        peer: Identity,
    },
    MeshPeers {
        topic: String,
        reply: oneshot::Sender<Vec<Identity>>,
    },
    PeerScore {
        peer: Identity,
        reply: oneshot::Sender<f64>,
    },
    Subscriptions {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

/// Cheap-to-clone handle to a pubsub actor.
#[derive(Clone)]
pub struct Pubsub {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ControlEvent>,
    identity: Identity,
}

const COMMAND_QUEUE_DEPTH: usize = 256;
const DELIVERY_QUEUE_DEPTH: usize = 256;
const EVENT_QUEUE_DEPTH: usize = 256;

impl Pubsub {
    /// Spawn the actor task. Returns the handle and the stream of messages
    /// delivered for locally subscribed topics.
    pub fn spawn<T: PubsubTransport>(
        keypair: Keypair,
        config: PubsubConfig,
        transport: Arc<T>,
    ) -> (Self, mpsc::Receiver<DeliveredMessage>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_QUEUE_DEPTH);
        let (event_tx, _) = broadcast::channel(EVENT_QUEUE_DEPTH);

        let identity = keypair.identity();
        let actor = PubsubActor::new(keypair, config, transport, event_tx.clone(), delivery_tx);
        tokio::spawn(actor.run(command_rx));

        let handle = Self {
            commands: command_tx,
            events: event_tx,
            identity,
        };
        (handle, delivery_rx)
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Subscribe to control-plane events. Late subscribers only see events
    /// emitted after this call.
    pub fn control_events(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Subscribe to a topic. Returns false if already subscribed.
    pub async fn subscribe(&self, topic: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            topic: topic.to_string(),
            reply,
        })
        .await?;
        rx.await.context("pubsub actor stopped")
    }

    /// Unsubscribe from a topic, draining its mesh. Returns false if not
    /// subscribed.
    pub async fn unsubscribe(&self, topic: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe {
            topic: topic.to_string(),
            reply,
        })
        .await?;
        rx.await.context("pubsub actor stopped")
    }

    /// Publish a message. Returns once the direct fan-out has been
    /// dispatched; the receipt lists the peers actually sent to.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<PublishReceipt> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Publish {
            topic: topic.to_string(),
            data,
            reply,
        })
        .await?;
        rx.await.context("pubsub actor stopped")?.map_err(Into::into)
    }

    /// Feed a raw frame received from a connected peer into the engine.
    pub async fn handle_inbound(&self, from: Identity, frame: Vec<u8>) -> Result<()> {
        self.send(Command::Inbound { from, frame }).await
    }

    /// Notify the engine of a new authenticated connection.
    pub async fn peer_connected(&self, peer: Identity, ip: IpAddr) -> Result<()> {
        self.send(Command::PeerConnected { peer, ip }).await
    }

    pub async fn peer_disconnected(&self, peer: Identity) -> Result<()> {
        self.send(Command::PeerDisconnected { peer }).await
    }

    /// Current mesh members for a topic.
    pub async fn mesh_peers(&self, topic: &str) -> Result<Vec<Identity>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::MeshPeers {
            topic: topic.to_string(),
            reply,
        })
        .await?;
        rx.await.context("pubsub actor stopped")
    }

    /// Current score for a peer.
    pub async fn peer_score(&self, peer: Identity) -> Result<f64> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::PeerScore { peer, reply }).await?;
        rx.await.context("pubsub actor stopped")
    }

    /// Topics the node is currently subscribed to.
    pub async fn subscriptions(&self) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscriptions { reply }).await?;
        rx.await.context("pubsub actor stopped")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("pubsub actor stopped"))
    }
}

// ============================================================================
// Actor
// ============================================================================

struct CachedMessage {
    frame: Vec<u8>,
    cached_at: Instant,
}

struct PubsubActor<T: PubsubTransport> {
    transport: Arc<T>,
    keypair: Keypair,
    identity: Identity,
    config: PubsubConfig,
    subs: SubscriptionTable,
    meshes: HashMap<String, TopicMesh>,
    pipeline: ValidationPipeline,
    scores: PeerScoreTracker,
    /// Connected peers and the address they connected from.
    connected: HashMap<Identity, IpAddr>,
    next_seqno: u64,
    /// Recently accepted full messages, for answering IWANT.
    message_cache: LruCache<MessageId, CachedMessage>,
    /// Per-topic window of recent IDs advertised in IHAVE.
    recent_ids: HashMap<String, VecDeque<MessageId>>,
    events: broadcast::Sender<ControlEvent>,
    deliveries: mpsc::Sender<DeliveredMessage>,
}

impl<T: PubsubTransport> PubsubActor<T> {
    fn new(
        keypair: Keypair,
        config: PubsubConfig,
        transport: Arc<T>,
        events: broadcast::Sender<ControlEvent>,
        deliveries: mpsc::Sender<DeliveredMessage>,
    ) -> Self {
        let identity = keypair.identity();
        let pipeline =
            ValidationPipeline::new(config.policy, config.seen_cache_size, config.seen_ttl);
        let cache_capacity = NonZeroUsize::new(config.message_cache_size.max(1))
            .expect("capacity floored at 1");
        Self {
            transport,
            keypair,
            identity,
            scores: PeerScoreTracker::new(config.score),
            pipeline,
            message_cache: LruCache::new(cache_capacity),
            config,
            subs: SubscriptionTable::new(),
            meshes: HashMap::new(),
            connected: HashMap::new(),
            next_seqno: 0,
            recent_ids: HashMap::new(),
            events,
            deliveries,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the initial heartbeat
        // runs one interval after startup.
        heartbeat.tick().await;

        debug!(identity = %self.identity, policy = ?self.config.policy, "pubsub actor started");

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                }
            }
        }

        debug!(identity = %self.identity, "pubsub actor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { topic, reply } => {
                let changed = self.handle_subscribe(&topic).await;
                let _ = reply.send(changed);
            }
            Command::Unsubscribe { topic, reply } => {
                let changed = self.handle_unsubscribe(&topic).await;
                let _ = reply.send(changed);
            }
            Command::Publish { topic, data, reply } => {
                let result = self.handle_publish(&topic, data).await;
                let _ = reply.send(result);
            }
            Command::Inbound { from, frame } => {
                self.handle_inbound(from, frame).await;
            }
            Command::PeerConnected { peer, ip } => {
                self.handle_peer_connected(peer, ip).await;
            }
            Command::PeerDisconnected { peer } => {
                self.handle_peer_disconnected(peer);
            }
            Command::MeshPeers { topic, reply } => {
                let members = self
                    .meshes
                    .get(&topic)
                    .map(|mesh| mesh.members().copied().collect())
                    .unwrap_or_default();
                let _ = reply.send(members);
            }
            Command::PeerScore { peer, reply } => {
                let _ = reply.send(self.scores.score(&peer));
            }
            Command::Subscriptions { reply } => {
                let topics = self.subs.local_topics().map(String::from).collect();
                let _ = reply.send(topics);
            }
            Command::Shutdown => unreachable!("handled in run loop"),
        }
    }

    // ------------------------------------------------------------------
    // Subscription management
    // ------------------------------------------------------------------

    async fn handle_subscribe(&mut self, topic: &str) -> bool {
        if !is_valid_topic(topic) {
            warn!(topic, "rejecting subscription to invalid topic");
            return false;
        }
        if !self.subs.subscribe(topic) {
            return false;
        }
        debug!(topic, "subscribed");
        self.meshes.entry(topic.to_string()).or_default();

        let frame = PubsubFrame::Subscribe {
            topic: topic.to_string(),
        };
        self.announce(&frame).await;
        true
    }

    async fn handle_unsubscribe(&mut self, topic: &str) -> bool {
        if !self.subs.unsubscribe(topic) {
            return false;
        }
        debug!(topic, "unsubscribed");

        // Drain the mesh in the same command so no graft can interleave.
        if let Some(mesh) = self.meshes.remove(topic) {
            let prune = PubsubFrame::Prune {
                topic: topic.to_string(),
            };
            for peer in mesh.members() {
                self.send_frame(peer, &prune).await;
            }
        }
        self.recent_ids.remove(topic);

        let frame = PubsubFrame::Unsubscribe {
            topic: topic.to_string(),
        };
        self.announce(&frame).await;
        true
    }

    // ------------------------------------------------------------------
    // Publish path
    // ------------------------------------------------------------------

    async fn handle_publish(
        &mut self,
        topic: &str,
        data: Vec<u8>,
    ) -> Result<PublishReceipt, PublishError> {
        if !is_valid_topic(topic) {
            return Err(PublishError::InvalidTopic);
        }
        if data.len() > self.config.max_message_size {
            return Err(PublishError::MessageTooLarge {
                size: data.len(),
                max: self.config.max_message_size,
            });
        }

        // Stamp the envelope per the local policy. The local origin is
        // trusted; it never runs the rejection pipeline.
        let (source, seqno, signature) = match self.config.policy {
            SignaturePolicy::StrictSign => {
                let seqno = self.next_seqno;
                self.next_seqno += 1;
                let payload = signed_payload(&self.identity, topic, seqno, &data);
                let sig = sign_with_domain(&self.keypair, MESSAGE_SIGNATURE_DOMAIN, &payload);
                (Some(self.identity), Some(seqno), Some(sig))
            }
            SignaturePolicy::StrictNoSign => (None, None, None),
        };

        let msg_id =
            compute_message_id(self.config.policy, topic, source.as_ref(), seqno, &data);

        let targets = self.fanout_targets(topic, None);
        if targets.is_empty() {
            return Err(PublishError::NoRecipients);
        }

        // Both the publish and the forward path go through the seen cache;
        // a message the node already knows is not sent again. Also makes an
        // echo from a mesh peer a duplicate.
        if !self.pipeline.mark_seen(msg_id) {
            debug!(topic, msg_id = %hex::encode(&msg_id[..8]), "refusing duplicate publish");
            return Err(PublishError::Duplicate);
        }

        let data_len = data.len();
        let frame = PubsubFrame::Publish {
            topic: topic.to_string(),
            source,
            seqno,
            data,
            signature,
        };
        let encoded = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "failed to encode publish frame");
                return Err(PublishError::MessageTooLarge {
                    size: data_len,
                    max: self.config.max_message_size,
                });
            }
        };

        self.remember_message(topic, msg_id, encoded.clone());

        let mut recipients = Vec::with_capacity(targets.len());
        for peer in targets {
            match self.transport.send(&peer, encoded.clone()).await {
                Ok(()) => recipients.push(peer),
                Err(error) => {
                    debug!(peer = %peer, %error, "publish send failed, skipping peer");
                }
            }
        }

        trace!(
            topic,
            msg_id = %hex::encode(&msg_id[..8]),
            recipients = recipients.len(),
            "published message"
        );
        Ok(PublishReceipt { recipients })
    }

    /// Direct send set for a message on a topic: the mesh if it has
    /// members, otherwise every connected remote subscriber (flood
    /// fallback). `exclude` drops the arrival peer on the forward path.
    fn fanout_targets(&self, topic: &str, exclude: Option<&Identity>) -> Vec<Identity> {
        let mesh_members: Vec<Identity> = self
            .meshes
            .get(topic)
            .map(|mesh| {
                mesh.members()
                    .filter(|peer| Some(*peer) != exclude)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        if !mesh_members.is_empty() {
            return mesh_members;
        }
        self.subs
            .subscribers(topic)
            .filter(|&peer| self.connected.contains_key(peer) && Some(peer) != exclude)
            .copied()
            .collect()
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    async fn handle_inbound(&mut self, from: Identity, bytes: Vec<u8>) {
        let frame = match decode_frame(&bytes) {
            Ok(frame) => frame,
            Err(error) => {
                debug!(peer = %from, %error, reason = %RejectReason::Malformed, "dropping frame");
                return;
            }
        };

        if let Some(topic) = frame.topic() {
            if !is_valid_topic(topic) {
                debug!(peer = %from, topic, "dropping frame with invalid topic");
                return;
            }
        }

        match frame {
            PubsubFrame::Subscribe { topic } => {
                if self.subs.on_peer_announcement(from, &topic, true) {
                    trace!(peer = %from, topic, "peer subscribed");
                    let _ = self.events.send(ControlEvent::SubscriptionChanged {
                        topic,
                        peer: from,
                        subscribed: true,
                    });
                }
            }
            PubsubFrame::Unsubscribe { topic } => {
                if self.subs.on_peer_announcement(from, &topic, false) {
                    trace!(peer = %from, topic, "peer unsubscribed");
                    if let Some(mesh) = self.meshes.get_mut(&topic) {
                        mesh.remove(&from);
                    }
                    let _ = self.events.send(ControlEvent::SubscriptionChanged {
                        topic,
                        peer: from,
                        subscribed: false,
                    });
                }
            }
            PubsubFrame::Graft { topic } => {
                self.handle_graft(from, topic).await;
            }
            PubsubFrame::Prune { topic } => {
                if let Some(mesh) = self.meshes.get_mut(&topic) {
                    if mesh.remove(&from) {
                        trace!(peer = %from, topic, "pruned by peer");
                    }
                }
            }
            PubsubFrame::Publish {
                topic,
                source,
                seqno,
                data,
                signature,
            } => {
                self.handle_publish_frame(from, topic, source, seqno, data, signature, bytes)
                    .await;
            }
            PubsubFrame::IHave { topic, msg_ids } => {
                self.handle_ihave(from, &topic, msg_ids).await;
            }
            PubsubFrame::IWant { msg_ids } => {
                self.handle_iwant(from, msg_ids).await;
            }
        }
    }

    async fn handle_graft(&mut self, from: Identity, topic: String) {
        if !self.subs.is_subscribed(&topic) || !self.connected.contains_key(&from) {
            // Not a mesh we participate in; tell the peer to back off.
            let prune = PubsubFrame::Prune {
                topic: topic.clone(),
            };
            self.send_frame(&from, &prune).await;
            return;
        }
        // A graft implies the peer subscribes to the topic.
        self.subs.on_peer_announcement(from, &topic, true);
        let mesh = self.meshes.entry(topic.clone()).or_default();
        if mesh.add(from) {
            trace!(peer = %from, topic, "grafted by peer");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_publish_frame(
        &mut self,
        from: Identity,
        topic: String,
        source: Option<Identity>,
        seqno: Option<u64>,
        data: Vec<u8>,
        signature: Option<Vec<u8>>,
        raw_frame: Vec<u8>,
    ) {
        if data.len() > self.config.max_message_size {
            debug!(
                peer = %from,
                topic,
                size = data.len(),
                "dropping oversized message"
            );
            return;
        }

        let record = match self.pipeline.validate(
            &topic,
            source,
            seqno,
            &data,
            signature.as_deref(),
        ) {
            Ok(record) => record,
            Err(reason) => {
                debug!(peer = %from, topic, reason = %reason, "dropping message");
                if reason == RejectReason::InvalidSignature {
                    self.scores.record_invalid_message(&from);
                }
                return;
            }
        };

        if self.subs.is_subscribed(&topic) {
            // Only subscribed topics are cached: IHAVE is emitted solely
            // for them, and caching relayed traffic on arbitrary topic
            // names would let a peer grow the window map without bound.
            self.remember_message(&topic, record.id, raw_frame.clone());

            let delivery = DeliveredMessage {
                topic: record.topic.clone(),
                source: record.source,
                seqno: record.seqno,
                data: record.data,
                msg_id: record.id,
            };
            if self.deliveries.send(delivery).await.is_err() {
                trace!(topic, "delivery receiver dropped");
            }
        }

        // Forward to the mesh, never back to where it came from. The
        // original signer is also skipped when it happens to be a member.
        let mut targets = self.fanout_targets(&topic, Some(&from));
        if let Some(source) = record.source {
            targets.retain(|peer| *peer != source);
        }
        for peer in targets {
            self.transport
                .send(&peer, raw_frame.clone())
                .await
                .unwrap_or_else(|error| {
                    debug!(peer = %peer, %error, "forward send failed, skipping peer");
                });
        }
    }

    async fn handle_ihave(&mut self, from: Identity, topic: &str, msg_ids: Vec<MessageId>) {
        if !self.subs.is_subscribed(topic) {
            return;
        }
        let wanted: Vec<MessageId> = msg_ids
            .into_iter()
            .take(self.config.max_ihave_length)
            .filter(|id| !self.pipeline.has_seen(id))
            .collect();
        if wanted.is_empty() {
            return;
        }
        trace!(peer = %from, topic, count = wanted.len(), "requesting announced messages");
        let frame = PubsubFrame::IWant { msg_ids: wanted };
        self.send_frame(&from, &frame).await;
    }

    async fn handle_iwant(&mut self, from: Identity, msg_ids: Vec<MessageId>) {
        let frames: Vec<Vec<u8>> = msg_ids
            .iter()
            .take(self.config.max_ihave_length)
            .filter_map(|id| self.message_cache.get(id).map(|m| m.frame.clone()))
            .collect();
        for frame in frames {
            self.transport.send(&from, frame).await.unwrap_or_else(|error| {
                debug!(peer = %from, %error, "iwant reply failed");
            });
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    async fn handle_peer_connected(&mut self, peer: Identity, ip: IpAddr) {
        debug!(peer = %peer, %ip, "peer connected");
        self.connected.insert(peer, ip);
        self.scores.record_connection(peer, ip);

        // Announce our topics so the new peer can route to us.
        let topics: Vec<String> = self.subs.local_topics().map(String::from).collect();
        for topic in topics {
            let frame = PubsubFrame::Subscribe { topic };
            self.send_frame(&peer, &frame).await;
        }
    }

    fn handle_peer_disconnected(&mut self, peer: Identity) {
        debug!(peer = %peer, "peer disconnected");
        self.connected.remove(&peer);
        self.scores.record_disconnection(&peer);
        self.subs.remove_peer(&peer);
        for mesh in self.meshes.values_mut() {
            mesh.remove(&peer);
        }
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    async fn heartbeat(&mut self) {
        let topics: Vec<String> = self.subs.local_topics().map(String::from).collect();
        for topic in topics {
            self.rebalance_topic(&topic).await;
            self.emit_gossip(&topic).await;
            let _ = self.events.send(ControlEvent::HeartbeatCompleted {
                topic: topic.clone(),
            });
        }

        self.scores.decay();
        self.pipeline.purge_expired();
        self.purge_message_cache();

        // Gossip windows for topics we dropped have no readers left.
        let subs = &self.subs;
        self.recent_ids.retain(|topic, _| subs.is_subscribed(topic));
    }

    async fn rebalance_topic(&mut self, topic: &str) {
        // Evict members that are gone or no longer subscribed.
        let evicted = {
            let connected = &self.connected;
            let subs = &self.subs;
            let mesh = self.meshes.entry(topic.to_string()).or_default();
            mesh.retain(|peer| connected.contains_key(peer) && subs.is_subscriber(topic, peer))
        };
        let prune = PubsubFrame::Prune {
            topic: topic.to_string(),
        };
        for peer in &evicted {
            if self.connected.contains_key(peer) {
                self.send_frame(peer, &prune).await;
            }
        }

        let degree = self.meshes.get(topic).map(TopicMesh::degree).unwrap_or(0);

        if degree < self.config.mesh_n {
            // Graft the best-scoring eligible subscribers up to target.
            let mut candidates: Vec<(Identity, f64)> = {
                let connected = &self.connected;
                let mesh = self.meshes.get(topic);
                self.subs
                    .subscribers(topic)
                    .filter(|&peer| {
                        connected.contains_key(peer)
                            && !mesh.map(|m| m.contains(peer)).unwrap_or(false)
                    })
                    .copied()
                    .map(|peer| (peer, 0.0))
                    .collect()
            };
            for (peer, score) in &mut candidates {
                *score = self.scores.score(peer);
            }
            candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            let want = self.config.mesh_n - degree;
            let graft = PubsubFrame::Graft {
                topic: topic.to_string(),
            };
            for (peer, score) in candidates.into_iter().take(want) {
                if self.send_frame(&peer, &graft).await {
                    trace!(peer = %peer, topic, score, "grafted");
                    if let Some(mesh) = self.meshes.get_mut(topic) {
                        mesh.add(peer);
                    }
                }
            }
        } else if degree > self.config.mesh_n_high {
            // Prune the worst-scoring members back down to target.
            let mut members: Vec<(Identity, f64)> = self
                .meshes
                .get(topic)
                .map(|mesh| mesh.members().copied().collect::<Vec<Identity>>())
                .unwrap_or_default()
                .into_iter()
                .map(|peer| (peer, 0.0))
                .collect();
            for (peer, score) in &mut members {
                *score = self.scores.score(peer);
            }
            members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            let excess = degree - self.config.mesh_n;
            let prune = PubsubFrame::Prune {
                topic: topic.to_string(),
            };
            for (peer, score) in members.into_iter().take(excess) {
                trace!(peer = %peer, topic, score, "pruned");
                if let Some(mesh) = self.meshes.get_mut(topic) {
                    mesh.remove(&peer);
                }
                self.send_frame(&peer, &prune).await;
            }
        }

        if let Some(mesh) = self.meshes.get(topic) {
            trace!(
                topic,
                degree = mesh.degree(),
                phase = ?mesh.phase(true, self.config.mesh_n_low),
                "mesh rebalanced"
            );
        }
    }

    /// Announce recent message IDs to a few subscribers outside the mesh.
    async fn emit_gossip(&mut self, topic: &str) {
        let msg_ids: Vec<MessageId> = self
            .recent_ids
            .get(topic)
            .map(|window| window.iter().copied().collect())
            .unwrap_or_default();
        if msg_ids.is_empty() {
            return;
        }

        let targets: Vec<Identity> = {
            let connected = &self.connected;
            let mesh = self.meshes.get(topic);
            self.subs
                .subscribers(topic)
                .filter(|&peer| {
                    connected.contains_key(peer)
                        && !mesh.map(|m| m.contains(peer)).unwrap_or(false)
                })
                .take(self.config.gossip_lazy)
                .copied()
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let frame = PubsubFrame::IHave {
            topic: topic.to_string(),
            msg_ids,
        };
        for peer in targets {
            self.send_frame(&peer, &frame).await;
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn remember_message(&mut self, topic: &str, id: MessageId, frame: Vec<u8>) {
        self.message_cache.put(
            id,
            CachedMessage {
                frame,
                cached_at: Instant::now(),
            },
        );
        let window = self.recent_ids.entry(topic.to_string()).or_default();
        window.push_back(id);
        while window.len() > self.config.max_ihave_length {
            window.pop_front();
        }
    }

    fn purge_message_cache(&mut self) {
        let ttl = self.config.message_cache_ttl;
        while let Some((_, cached)) = self.message_cache.peek_lru() {
            if cached.cached_at.elapsed() < ttl {
                break;
            }
            self.message_cache.pop_lru();
        }
    }

    /// Send an encodable frame to one peer. Returns true on success.
    async fn send_frame(&self, peer: &Identity, frame: &PubsubFrame) -> bool {
        let encoded = match encode_frame(frame) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "failed to encode control frame");
                return false;
            }
        };
        match self.transport.send(peer, encoded).await {
            Ok(()) => true,
            Err(error) => {
                debug!(peer = %peer, %error, "control frame send failed");
                false
            }
        }
    }

    /// Send a frame to every connected peer.
    async fn announce(&self, frame: &PubsubFrame) {
        let peers: Vec<Identity> = self.connected.keys().copied().collect();
        for peer in peers {
            self.send_frame(&peer, frame).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl PubsubTransport for NullTransport {
        async fn send(&self, _to: &Identity, _frame: Vec<u8>) -> Result<()> {
            Ok(())
        }
    }

    fn spawn_node(policy: SignaturePolicy) -> (Pubsub, mpsc::Receiver<DeliveredMessage>) {
        let config = PubsubConfig {
            policy,
            ..PubsubConfig::default()
        };
        Pubsub::spawn(Keypair::generate(), config, Arc::new(NullTransport))
    }

    #[test]
    fn topic_validation() {
        assert!(is_valid_topic("news"));
        assert!(is_valid_topic("chat/room-1"));
        assert!(is_valid_topic("topic with spaces"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("tab\tseparated"));
        assert!(!is_valid_topic("new\nline"));
        assert!(!is_valid_topic(&"x".repeat(MAX_TOPIC_LENGTH + 1)));
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let (node, _rx) = spawn_node(SignaturePolicy::StrictSign);
        assert!(node.subscribe("news").await.unwrap());
        assert!(!node.subscribe("news").await.unwrap());

        let topics = node.subscriptions().await.unwrap();
        assert_eq!(topics, vec!["news".to_string()]);

        assert!(node.unsubscribe("news").await.unwrap());
        assert!(!node.unsubscribe("news").await.unwrap());
        assert!(node.subscriptions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_without_peers_fails() {
        let (node, _rx) = spawn_node(SignaturePolicy::StrictSign);
        node.subscribe("news").await.unwrap();

        let error = node
            .publish("news", b"hello".to_vec())
            .await
            .expect_err("publish with no peers must fail");
        let publish_error = error.downcast::<PublishError>().unwrap();
        assert_eq!(publish_error, PublishError::NoRecipients);
    }

    #[tokio::test]
    async fn publish_rejects_local_hygiene_failures() {
        let (node, _rx) = spawn_node(SignaturePolicy::StrictNoSign);

        let error = node.publish("", b"data".to_vec()).await.unwrap_err();
        assert_eq!(
            error.downcast::<PublishError>().unwrap(),
            PublishError::InvalidTopic
        );

        let oversized = vec![0u8; PubsubConfig::default().max_message_size + 1];
        let error = node.publish("news", oversized).await.unwrap_err();
        assert!(matches!(
            error.downcast::<PublishError>().unwrap(),
            PublishError::MessageTooLarge { .. }
        ));
    }

    async fn await_heartbeats(
        events: &mut broadcast::Receiver<ControlEvent>,
        topic: &str,
        mut count: usize,
    ) {
        let wait = async {
            while count > 0 {
                match events.recv().await {
                    Ok(ControlEvent::HeartbeatCompleted { topic: t }) if t == topic => {
                        count -= 1;
                    }
                    Ok(_) => {}
                    Err(error) => panic!("event stream closed: {error}"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for heartbeats");
    }

    #[tokio::test]
    async fn mesh_inside_degree_band_is_left_alone() {
        let config = PubsubConfig {
            policy: SignaturePolicy::StrictSign,
            mesh_n: 2,
            mesh_n_low: 1,
            mesh_n_high: 4,
            heartbeat_interval: Duration::from_millis(30),
            ..PubsubConfig::default()
        };
        let (node, _rx) = Pubsub::spawn(Keypair::generate(), config, Arc::new(NullTransport));
        node.subscribe("band").await.unwrap();
        let mut events = node.control_events();

        let graft = encode_frame(&PubsubFrame::Graft {
            topic: "band".to_string(),
        })
        .unwrap();
        for i in 0..3u8 {
            let peer = Keypair::generate().identity();
            node.peer_connected(peer, IpAddr::from([10, 0, 0, i + 1]))
                .await
                .unwrap();
            node.handle_inbound(peer, graft.clone()).await.unwrap();
        }
        await_heartbeats(&mut events, "band", 2).await;
        // Degree 3 sits between the target (2) and the high watermark (4);
        // rebalancing neither grafts nor prunes.
        assert_eq!(node.mesh_peers("band").await.unwrap().len(), 3);

        for i in 3..5u8 {
            let peer = Keypair::generate().identity();
            node.peer_connected(peer, IpAddr::from([10, 0, 0, i + 1]))
                .await
                .unwrap();
            node.handle_inbound(peer, graft.clone()).await.unwrap();
        }
        await_heartbeats(&mut events, "band", 2).await;
        // Past the high watermark the mesh shrinks back to the target.
        assert_eq!(node.mesh_peers("band").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mesh_peers_empty_without_connections() {
        let (node, _rx) = spawn_node(SignaturePolicy::StrictSign);
        node.subscribe("news").await.unwrap();
        assert!(node.mesh_peers("news").await.unwrap().is_empty());
        assert_eq!(node.peer_score(Identity::from([9u8; 32])).await.unwrap(), 0.0);
    }
}
