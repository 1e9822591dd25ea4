//! Attestation gossip: a manager over a dynamic set of subnet topics.

use crate::channel::{GossipChannel, GossipContext, PayloadHandler};
use crate::error::Result;
use crate::manager::GossipManager;
use crate::overlay::OperationProcessor;
use crate::topics::TopicNamer;
use crate::types::{Attestation, GossipPayload, MessageClass, SubnetId, ValidatableAttestation};
use futures::future::{self, join_all, BoxFuture, FutureExt};
use prometheus::IntGauge;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

#[derive(Default)]
struct SubnetState {
    /// Set while the attestation manager is subscribed.
    enabled: bool,
    /// Subnets validator duties currently ask for.
    requested: BTreeSet<SubnetId>,
    /// Every channel ever opened. Entries are kept so that no subscription
    /// outlives its owner.
    channels: BTreeMap<SubnetId, Arc<GossipChannel>>,
}

/// Subnet id to topic mapping for one fork digest.
pub struct AttestationSubnetSubscriptions {
    namer: TopicNamer,
    subnet_count: u64,
    processor: Arc<dyn OperationProcessor<ValidatableAttestation>>,
    ctx: GossipContext,
    /// Requested subnets of this fork digest only.
    requested_gauge: IntGauge,
    state: Mutex<SubnetState>,
}

impl AttestationSubnetSubscriptions {
    pub fn new(
        namer: TopicNamer,
        processor: Arc<dyn OperationProcessor<ValidatableAttestation>>,
        ctx: GossipContext,
    ) -> Self {
        let requested_gauge = ctx
            .metrics
            .active_subnets
            .with_label_values(&[namer.fork_digest().to_string().as_str()]);
        Self {
            subnet_count: ctx.settings.attestation_subnet_count,
            requested_gauge,
            namer,
            processor,
            ctx,
            state: Mutex::new(SubnetState::default()),
        }
    }

    pub fn subnet_count(&self) -> u64 {
        self.subnet_count
    }

    fn state(&self) -> MutexGuard<'_, SubnetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel(&self, channels: &mut BTreeMap<SubnetId, Arc<GossipChannel>>, id: SubnetId) -> Arc<GossipChannel> {
        Arc::clone(channels.entry(id).or_insert_with(|| {
            let topic = self.namer.subnet_topic(id);
            let handler = PayloadHandler::<Attestation>::new(
                topic.clone(),
                Some(id),
                Arc::clone(&self.processor),
                &self.ctx,
            );
            GossipChannel::new(MessageClass::Attestation, topic, handler, self.ctx.clone())
        }))
    }

    /// No-op when the subnet is already requested.
    pub fn subscribe_to_subnet_id(&self, id: SubnetId) {
        let mut state = self.state();
        if !state.requested.insert(id) {
            return;
        }
        self.requested_gauge.inc();
        debug!(subnet = %id, enabled = state.enabled, "Attestation subnet requested");
        if state.enabled {
            let SubnetState { channels, .. } = &mut *state;
            self.channel(channels, id).subscribe();
        }
    }

    /// No-op when the subnet was not requested.
    pub fn unsubscribe_from_subnet_id(&self, id: SubnetId) {
        let mut state = self.state();
        if !state.requested.remove(&id) {
            return;
        }
        self.requested_gauge.dec();
        debug!(subnet = %id, "Attestation subnet released");
        if let Some(channel) = state.channels.get(&id) {
            channel.unsubscribe();
        }
    }

    /// Joins every requested subnet.
    pub fn subscribe(&self) {
        let mut state = self.state();
        state.enabled = true;
        let SubnetState { requested, channels, .. } = &mut *state;
        for id in requested.iter() {
            self.channel(channels, *id).subscribe();
        }
    }

    /// Leaves every subnet but remembers which ones were requested.
    pub fn unsubscribe(&self) {
        let mut state = self.state();
        state.enabled = false;
        for channel in state.channels.values() {
            channel.unsubscribe();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    /// Enabled, and every requested subnet confirmed by the network.
    pub fn is_active(&self) -> bool {
        let state = self.state();
        state.enabled
            && state
                .requested
                .iter()
                .all(|id| state.channels.get(id).is_some_and(|channel| channel.is_subscribed()))
    }

    pub fn requested_subnet_ids(&self) -> Vec<SubnetId> {
        self.state().requested.iter().copied().collect()
    }

    /// Subnets the network has confirmed a subscription for.
    pub fn subscribed_subnet_ids(&self) -> Vec<SubnetId> {
        self.state()
            .channels
            .iter()
            .filter(|(_, channel)| channel.is_subscribed())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Publishes on the attestation's subnet, subscribed or not.
    pub fn gossip(&self, attestation: &ValidatableAttestation) -> BoxFuture<'static, Result<()>> {
        let id = attestation.subnet_id(self.subnet_count);
        let channel = {
            let mut state = self.state();
            self.channel(&mut state.channels, id)
        };
        match attestation.attestation().encode() {
            Ok(payload) => channel.publish(payload),
            Err(e) => {
                warn!(subnet = %id, error = %e, "Could not encode attestation");
                future::ready(Err(e)).boxed()
            }
        }
    }

    pub async fn settled(&self) {
        let channels: Vec<_> = self.state().channels.values().cloned().collect();
        join_all(channels.iter().map(|c| c.settled())).await;
    }
}

/// Manager for unaggregated attestations. Subscribing enables the subnet
/// set; the subnets themselves follow validator duties.
pub struct AttestationGossipManager {
    subnets: AttestationSubnetSubscriptions,
}

impl AttestationGossipManager {
    pub fn new(subnets: AttestationSubnetSubscriptions) -> Self {
        Self { subnets }
    }

    pub fn subnets(&self) -> &AttestationSubnetSubscriptions {
        &self.subnets
    }

    /// Aggregates and already gossiped attestations are skipped, and
    /// nothing goes out while the manager is unsubscribed.
    pub fn on_new_attestation(&self, attestation: &ValidatableAttestation) {
        self.subnets
            .ctx
            .metrics
            .publish_requests
            .with_label_values(&[MessageClass::Attestation.as_str()])
            .inc();
        if attestation.is_aggregate() {
            return;
        }
        if !self.subnets.is_enabled() {
            debug!(slot = attestation.attestation().data.slot, "Attestation gossip inactive, not publishing");
            return;
        }
        if !attestation.mark_gossiped() {
            return;
        }
        drop(self.subnets.gossip(attestation));
    }

    pub fn subscribe_to_subnet_id(&self, id: SubnetId) {
        self.subnets.subscribe_to_subnet_id(id);
    }

    pub fn unsubscribe_from_subnet_id(&self, id: SubnetId) {
        self.subnets.unsubscribe_from_subnet_id(id);
    }
}

impl GossipManager for AttestationGossipManager {
    fn message_class(&self) -> MessageClass {
        MessageClass::Attestation
    }

    fn subscribe(&self) {
        self.subnets.subscribe();
    }

    fn unsubscribe(&self) {
        self.subnets.unsubscribe();
    }

    fn is_subscribed(&self) -> bool {
        self.subnets.is_active()
    }

    fn settled(&self) -> BoxFuture<'_, ()> {
        self.subnets.settled().boxed()
    }
}
