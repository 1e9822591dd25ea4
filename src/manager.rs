//! Per message class topic managers.

use crate::channel::{GossipChannel, GossipContext, PayloadHandler};
use crate::error::{GossipError, Result};
use crate::overlay::OperationProcessor;
use crate::topics::TopicNamer;
use crate::types::{
    AttesterSlashing, GossipPayload, MessageClass, ProposerSlashing, SignedAggregateAndProof,
    SignedBeaconBlock, SignedVoluntaryExit, ValidatableAttestation,
};
use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle shared by every message class.
///
/// `subscribe` and `unsubscribe` never block and are idempotent: asking for
/// the state a manager is already in does not touch the network.
pub trait GossipManager: Send + Sync {
    fn message_class(&self) -> MessageClass;

    fn subscribe(&self);

    fn unsubscribe(&self);

    fn is_enabled_during_optimistic_sync(&self) -> bool {
        self.message_class().is_enabled_during_optimistic_sync()
    }

    /// Whether the manager is currently active on the network.
    fn is_subscribed(&self) -> bool;

    /// Resolves once all pending subscription changes have been applied.
    fn settled(&self) -> BoxFuture<'_, ()>;
}

/// Manager for a class carried on exactly one topic per fork.
pub struct TopicGossipManager<T: GossipPayload> {
    channel: Arc<GossipChannel>,
    ctx: GossipContext,
    _payload: std::marker::PhantomData<fn(T)>,
}

pub type BlockGossipManager = TopicGossipManager<SignedBeaconBlock>;
pub type AggregateGossipManager = TopicGossipManager<SignedAggregateAndProof>;
pub type VoluntaryExitGossipManager = TopicGossipManager<SignedVoluntaryExit>;
pub type ProposerSlashingGossipManager = TopicGossipManager<ProposerSlashing>;
pub type AttesterSlashingGossipManager = TopicGossipManager<AttesterSlashing>;

impl<T: GossipPayload> TopicGossipManager<T> {
    pub fn new(
        namer: &TopicNamer,
        processor: Arc<dyn OperationProcessor<T::Operation>>,
        ctx: GossipContext,
    ) -> Self {
        let topic = namer.class_topic(T::CLASS);
        let handler = PayloadHandler::<T>::new(topic.clone(), None, processor, &ctx);
        let channel = GossipChannel::new(T::CLASS, topic, handler, ctx.clone());
        Self { channel, ctx, _payload: std::marker::PhantomData }
    }

    pub fn topic(&self) -> &str {
        self.channel.topic()
    }

    fn observed(&self) {
        self.ctx.metrics.publish_requests.with_label_values(&[T::CLASS.as_str()]).inc();
    }

    /// Publishing follows the requested state, so a topic that is still
    /// being joined already accepts messages.
    fn is_active(&self) -> bool {
        self.channel.is_requested()
    }

    fn gossip(&self, message: &T) -> BoxFuture<'static, Result<()>> {
        if !self.is_active() {
            debug!(topic = %self.channel.topic(), "Not publishing on inactive gossip topic");
            return future::ready(Err(GossipError::TopicInactive { topic: self.channel.topic().to_string() })).boxed();
        }
        match message.encode() {
            Ok(payload) => self.channel.publish(payload),
            Err(e) => {
                warn!(topic = %self.channel.topic(), error = %e, "Could not encode gossip message");
                future::ready(Err(e)).boxed()
            }
        }
    }

    /// Best effort: the outcome is only logged and counted.
    fn broadcast(&self, message: &T) {
        self.observed();
        drop(self.gossip(message));
    }
}

impl<T: GossipPayload> GossipManager for TopicGossipManager<T> {
    fn message_class(&self) -> MessageClass {
        T::CLASS
    }

    fn subscribe(&self) {
        self.channel.subscribe();
    }

    fn unsubscribe(&self) {
        self.channel.unsubscribe();
    }

    fn is_subscribed(&self) -> bool {
        self.channel.is_subscribed()
    }

    fn settled(&self) -> BoxFuture<'_, ()> {
        self.channel.settled().boxed()
    }
}

impl BlockGossipManager {
    /// Resolves when the network has taken or refused the block, not when
    /// peers accept it. Fails with `TopicInactive` while the manager is
    /// unsubscribed.
    pub fn publish_block(&self, block: &SignedBeaconBlock) -> BoxFuture<'static, Result<()>> {
        self.observed();
        debug!(slot = block.message.slot, proposer = block.message.proposer_index, "Publishing block");
        self.gossip(block)
    }
}

impl AggregateGossipManager {
    /// Only signed aggregates that have not been gossiped yet go out.
    pub fn on_new_aggregate(&self, attestation: &ValidatableAttestation) {
        self.observed();
        let Some(aggregate) = attestation.aggregate_and_proof() else {
            return;
        };
        if !self.is_active() {
            debug!(topic = %self.topic(), "Aggregate gossip inactive, not publishing");
            return;
        }
        if !attestation.mark_gossiped() {
            return;
        }
        drop(self.gossip(aggregate));
    }
}

impl VoluntaryExitGossipManager {
    pub fn publish_voluntary_exit(&self, exit: &SignedVoluntaryExit) {
        self.broadcast(exit);
    }
}

impl ProposerSlashingGossipManager {
    pub fn publish_proposer_slashing(&self, slashing: &ProposerSlashing) {
        self.broadcast(slashing);
    }
}

impl AttesterSlashingGossipManager {
    pub fn publish_attester_slashing(&self, slashing: &AttesterSlashing) {
        self.broadcast(slashing);
    }
}
