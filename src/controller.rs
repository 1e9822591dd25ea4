//! Gossip lifecycle for one fork.

use crate::attestation::{AttestationGossipManager, AttestationSubnetSubscriptions};
use crate::channel::GossipContext;
use crate::error::{GossipError, Result};
use crate::fork::ChainView;
use crate::manager::{
    AggregateGossipManager, AttesterSlashingGossipManager, BlockGossipManager, GossipManager,
    ProposerSlashingGossipManager, VoluntaryExitGossipManager,
};
use crate::overlay::OperationProcessor;
use crate::topics::TopicNamer;
use crate::types::{
    AttesterSlashing, Epoch, Fork, ForkDigest, ForkInfo, MessageClass, ProposerSlashing, Root,
    SignedBeaconBlock, SignedVoluntaryExit, SubnetId, ValidatableAttestation,
};
use futures::future::{self, join_all, BoxFuture, FutureExt};
use once_cell::sync::OnceCell;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Upstream consumers of inbound gossip, one per message class.
#[derive(Clone)]
pub struct OperationProcessors {
    pub block: Arc<dyn OperationProcessor<SignedBeaconBlock>>,
    pub attestation: Arc<dyn OperationProcessor<ValidatableAttestation>>,
    pub aggregate: Arc<dyn OperationProcessor<ValidatableAttestation>>,
    pub attester_slashing: Arc<dyn OperationProcessor<AttesterSlashing>>,
    pub proposer_slashing: Arc<dyn OperationProcessor<ProposerSlashing>>,
    pub voluntary_exit: Arc<dyn OperationProcessor<SignedVoluntaryExit>>,
}

/// The managers of an activated fork. Built once, read-only afterwards.
struct ActiveManagers {
    fork_info: ForkInfo,
    fork_digest: ForkDigest,
    attestation: AttestationGossipManager,
    block: BlockGossipManager,
    aggregate: AggregateGossipManager,
    voluntary_exit: VoluntaryExitGossipManager,
    proposer_slashing: ProposerSlashingGossipManager,
    attester_slashing: AttesterSlashingGossipManager,
}

impl ActiveManagers {
    /// In construction order.
    fn all(&self) -> [&dyn GossipManager; 6] {
        [
            &self.attestation,
            &self.block,
            &self.aggregate,
            &self.voluntary_exit,
            &self.proposer_slashing,
            &self.attester_slashing,
        ]
    }
}

/// Topic managers of one fork.
///
/// Managers are built on the first successful `start_gossip` and live as
/// long as the controller. Stopping only unsubscribes them, so a later start
/// re-subscribes the same instances.
pub struct GossipForkSubscriptions {
    fork: Fork,
    chain: Arc<dyn ChainView>,
    ctx: GossipContext,
    processors: OperationProcessors,
    managers: OnceCell<ActiveManagers>,
    /// Subnet requests received before the managers exist.
    pending_subnets: Mutex<BTreeSet<SubnetId>>,
}

impl GossipForkSubscriptions {
    pub fn new(
        fork: Fork,
        chain: Arc<dyn ChainView>,
        ctx: GossipContext,
        processors: OperationProcessors,
    ) -> Self {
        Self {
            fork,
            chain,
            ctx,
            processors,
            managers: OnceCell::new(),
            pending_subnets: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn fork(&self) -> &Fork {
        &self.fork
    }

    pub fn activation_epoch(&self) -> Epoch {
        self.fork.epoch
    }

    pub fn fork_info(&self) -> Option<ForkInfo> {
        self.managers.get().map(|m| m.fork_info)
    }

    pub fn fork_digest(&self) -> Option<ForkDigest> {
        self.managers.get().map(|m| m.fork_digest)
    }

    pub fn is_started(&self) -> bool {
        self.managers.get().is_some()
    }

    /// Builds the managers on first use, then subscribes every manager that
    /// may run given the head's optimistic status.
    pub fn start_gossip(&self, genesis_validators_root: Root, is_optimistic_head: bool) -> Result<()> {
        let managers = self
            .managers
            .get_or_try_init(|| self.build_managers(genesis_validators_root))?;
        if managers.fork_info.genesis_validators_root != genesis_validators_root {
            warn!(
                expected = %hex::encode(managers.fork_info.genesis_validators_root),
                got = %hex::encode(genesis_validators_root),
                "Ignoring different genesis validators root on restart"
            );
        }

        {
            let mut pending = self.pending_subnets.lock().unwrap_or_else(PoisonError::into_inner);
            for id in std::mem::take(&mut *pending) {
                managers.attestation.subscribe_to_subnet_id(id);
            }
        }

        info!(
            activation_epoch = self.activation_epoch(),
            fork_digest = %managers.fork_digest,
            optimistic = is_optimistic_head,
            "Starting gossip"
        );
        for manager in managers.all() {
            if manager.is_enabled_during_optimistic_sync() || !is_optimistic_head {
                manager.subscribe();
            }
        }
        Ok(())
    }

    fn build_managers(&self, genesis_validators_root: Root) -> Result<ActiveManagers> {
        let fork_info = ForkInfo::new(self.fork, genesis_validators_root);
        let fork_digest = self.chain.fork_digest(self.activation_epoch())?;
        let namer = TopicNamer::new(self.ctx.settings.topic_prefix.clone(), fork_digest, self.ctx.settings.encoding);
        let ctx = &self.ctx;
        let p = &self.processors;

        let subnets = AttestationSubnetSubscriptions::new(namer.clone(), Arc::clone(&p.attestation), ctx.clone());
        Ok(ActiveManagers {
            fork_info,
            fork_digest,
            attestation: AttestationGossipManager::new(subnets),
            block: BlockGossipManager::new(&namer, Arc::clone(&p.block), ctx.clone()),
            aggregate: AggregateGossipManager::new(&namer, Arc::clone(&p.aggregate), ctx.clone()),
            voluntary_exit: VoluntaryExitGossipManager::new(&namer, Arc::clone(&p.voluntary_exit), ctx.clone()),
            proposer_slashing: ProposerSlashingGossipManager::new(&namer, Arc::clone(&p.proposer_slashing), ctx.clone()),
            attester_slashing: AttesterSlashingGossipManager::new(&namer, Arc::clone(&p.attester_slashing), ctx.clone()),
        })
    }

    /// Unsubscribes every manager. Reversible by `start_gossip`.
    pub fn stop_gossip(&self) {
        if let Some(managers) = self.managers.get() {
            info!(activation_epoch = self.activation_epoch(), "Stopping gossip");
            for manager in managers.all() {
                manager.unsubscribe();
            }
        }
    }

    /// Unsubscribes the managers that must not run on an optimistic head.
    pub fn stop_gossip_for_optimistic_sync(&self) {
        if let Some(managers) = self.managers.get() {
            info!(activation_epoch = self.activation_epoch(), "Stopping gossip for optimistic sync");
            for manager in managers.all() {
                if !manager.is_enabled_during_optimistic_sync() {
                    manager.unsubscribe();
                }
            }
        }
    }

    /// Offers the attestation both to its subnet and to the aggregate topic.
    pub fn publish_attestation(&self, attestation: &ValidatableAttestation) {
        match self.managers.get() {
            Some(managers) => {
                managers.attestation.on_new_attestation(attestation);
                managers.aggregate.on_new_aggregate(attestation);
            }
            None => warn!(slot = attestation.attestation().data.slot, "Dropping attestation, gossip not started"),
        }
    }

    pub fn publish_block(&self, block: &SignedBeaconBlock) -> BoxFuture<'static, Result<()>> {
        match self.managers.get() {
            Some(managers) => managers.block.publish_block(block),
            None => future::ready(Err(GossipError::NotStarted)).boxed(),
        }
    }

    pub fn publish_proposer_slashing(&self, slashing: &ProposerSlashing) {
        match self.managers.get() {
            Some(managers) => managers.proposer_slashing.publish_proposer_slashing(slashing),
            None => warn!("Dropping proposer slashing, gossip not started"),
        }
    }

    pub fn publish_attester_slashing(&self, slashing: &AttesterSlashing) {
        match self.managers.get() {
            Some(managers) => managers.attester_slashing.publish_attester_slashing(slashing),
            None => warn!("Dropping attester slashing, gossip not started"),
        }
    }

    pub fn publish_voluntary_exit(&self, exit: &SignedVoluntaryExit) {
        match self.managers.get() {
            Some(managers) => managers.voluntary_exit.publish_voluntary_exit(exit),
            None => warn!(validator = exit.message.validator_index, "Dropping voluntary exit, gossip not started"),
        }
    }

    /// Requests made before `start_gossip` are applied when it runs.
    pub fn subscribe_to_attestation_subnet_id(&self, subnet_id: u64) -> Result<()> {
        let id = SubnetId::new(subnet_id, self.ctx.settings.attestation_subnet_count)?;
        let mut pending = self.pending_subnets.lock().unwrap_or_else(PoisonError::into_inner);
        match self.managers.get() {
            Some(managers) => managers.attestation.subscribe_to_subnet_id(id),
            None => {
                pending.insert(id);
            }
        }
        Ok(())
    }

    pub fn unsubscribe_from_attestation_subnet_id(&self, subnet_id: u64) -> Result<()> {
        let id = SubnetId::new(subnet_id, self.ctx.settings.attestation_subnet_count)?;
        let mut pending = self.pending_subnets.lock().unwrap_or_else(PoisonError::into_inner);
        match self.managers.get() {
            Some(managers) => managers.attestation.unsubscribe_from_subnet_id(id),
            None => {
                pending.remove(&id);
            }
        }
        Ok(())
    }

    pub fn manager(&self, class: MessageClass) -> Option<&dyn GossipManager> {
        self.managers.get()?.all().into_iter().find(|m| m.message_class() == class)
    }

    pub fn managers(&self) -> Vec<&dyn GossipManager> {
        self.managers.get().map(|m| m.all().to_vec()).unwrap_or_default()
    }

    /// Attestation subnets with a confirmed subscription.
    pub fn subscribed_subnet_ids(&self) -> Vec<SubnetId> {
        self.managers
            .get()
            .map(|m| m.attestation.subnets().subscribed_subnet_ids())
            .unwrap_or_default()
    }

    /// Waits for every requested subscription change to reach the network.
    pub async fn settled(&self) {
        join_all(self.managers().into_iter().map(|m| m.settled())).await;
    }
}

impl fmt::Debug for GossipForkSubscriptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GossipForkSubscriptions")
            .field("fork", &self.fork)
            .field("activation_epoch", &self.activation_epoch())
            .field("fork_digest", &self.fork_digest())
            .finish()
    }
}
