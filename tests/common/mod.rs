// Shared fixtures: an in-memory overlay that records every call, recording
// processors, and sample consensus messages.
#![allow(dead_code)]

use forkgossip::{
    config,
    debug::DebugDataDumper,
    error::{GossipError, Result},
    metrics::GossipMetrics,
    topics::{GossipEncoding, TopicNamer},
    types::*,
    ChainView, DiscoveryNetwork, ForkSchedule, GossipContext, GossipForkSubscriptions,
    OperationProcessor, OperationProcessors, TopicHandler, ValidationResult,
};
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub const ZERO_ROOT: Root = [0u8; 32];

pub const GENESIS_FORK: Fork = Fork { previous_version: [0, 0, 0, 0], current_version: [0, 0, 0, 0], epoch: 0 };
pub const FORK: Fork = Fork { previous_version: [0, 0, 0, 0], current_version: [1, 0, 0, 0], epoch: 74240 };

#[derive(Default)]
pub struct NetState {
    pub subscribed: HashMap<String, Arc<dyn TopicHandler>>,
    pub subscribe_calls: Vec<String>,
    pub unsubscribe_calls: Vec<String>,
    pub published: Vec<(String, Vec<u8>)>,
    pub fail_subscribe: HashSet<String>,
    pub fail_publish: bool,
}

/// Overlay double. Subscribes can be held back to simulate slow peers.
pub struct RecordingNetwork {
    state: Arc<Mutex<NetState>>,
    gate: watch::Sender<bool>,
}

impl RecordingNetwork {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self { state: Arc::default(), gate })
    }

    pub fn hold_subscribes(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_subscribes(&self) {
        self.gate.send_replace(true);
    }

    pub fn fail_subscribe(&self, topic: &str) {
        self.state.lock().unwrap().fail_subscribe.insert(topic.to_string());
    }

    pub fn fail_publish(&self, fail: bool) {
        self.state.lock().unwrap().fail_publish = fail;
    }

    pub fn subscribed_topics(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().subscribed.keys().cloned().collect()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state.lock().unwrap().subscribed.contains_key(topic)
    }

    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.state.lock().unwrap().subscribe_calls.iter().filter(|t| *t == topic).count()
    }

    pub fn total_subscribe_calls(&self) -> usize {
        self.state.lock().unwrap().subscribe_calls.len()
    }

    pub fn unsubscribe_count(&self, topic: &str) -> usize {
        self.state.lock().unwrap().unsubscribe_calls.iter().filter(|t| *t == topic).count()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn published_count(&self) -> usize {
        self.state.lock().unwrap().published.len()
    }

    pub fn handler(&self, topic: &str) -> Option<Arc<dyn TopicHandler>> {
        self.state.lock().unwrap().subscribed.get(topic).cloned()
    }

    /// Feeds `payload` to whatever handler is subscribed on `topic`.
    pub async fn deliver(&self, topic: &str, payload: Vec<u8>) -> Option<ValidationResult> {
        let handler = self.state.lock().unwrap().subscribed.get(topic).cloned()?;
        Some(handler.handle_message(payload).await)
    }
}

impl DiscoveryNetwork for RecordingNetwork {
    fn subscribe(&self, topic: &str, handler: Arc<dyn TopicHandler>) -> BoxFuture<'static, Result<()>> {
        let state = Arc::clone(&self.state);
        let mut gate = self.gate.subscribe();
        let topic = topic.to_string();
        async move {
            let _ = gate.wait_for(|open| *open).await;
            let mut state = state.lock().unwrap();
            state.subscribe_calls.push(topic.clone());
            if state.fail_subscribe.contains(&topic) {
                return Err(GossipError::transport(&topic, "mesh refused subscription"));
            }
            state.subscribed.insert(topic, handler);
            Ok(())
        }
        .boxed()
    }

    fn unsubscribe(&self, topic: &str) -> BoxFuture<'static, Result<()>> {
        let mut state = self.state.lock().unwrap();
        state.unsubscribe_calls.push(topic.to_string());
        state.subscribed.remove(topic);
        future::ready(Ok(())).boxed()
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'static, Result<()>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_publish {
            return future::ready(Err(GossipError::transport(topic, "InsufficientPeers"))).boxed();
        }
        state.published.push((topic.to_string(), payload));
        future::ready(Ok(())).boxed()
    }
}

pub struct RecordingProcessor<T> {
    pub seen: Mutex<Vec<T>>,
    result: ValidationResult,
}

impl<T> RecordingProcessor<T> {
    pub fn new(result: ValidationResult) -> Arc<Self> {
        Arc::new(Self { seen: Mutex::new(Vec::new()), result })
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl<T: Send + 'static> OperationProcessor<T> for RecordingProcessor<T> {
    fn process(&self, message: T) -> BoxFuture<'static, ValidationResult> {
        self.seen.lock().unwrap().push(message);
        future::ready(self.result).boxed()
    }
}

#[derive(Default)]
pub struct RecordingDumper {
    pub saved: Mutex<Vec<(MessageClass, String, Vec<u8>, String)>>,
}

impl DebugDataDumper for RecordingDumper {
    fn save_gossip_rejected(&self, class: MessageClass, topic: &str, payload: &[u8], reason: &str) {
        self.saved
            .lock()
            .unwrap()
            .push((class, topic.to_string(), payload.to_vec(), reason.to_string()));
    }
}

pub struct Harness {
    pub net: Arc<RecordingNetwork>,
    pub metrics: GossipMetrics,
    pub dumper: Arc<RecordingDumper>,
    pub blocks: Arc<RecordingProcessor<SignedBeaconBlock>>,
    pub attestations: Arc<RecordingProcessor<ValidatableAttestation>>,
    pub aggregates: Arc<RecordingProcessor<ValidatableAttestation>>,
    pub exits: Arc<RecordingProcessor<SignedVoluntaryExit>>,
    pub proposer_slashings: Arc<RecordingProcessor<ProposerSlashing>>,
    pub attester_slashings: Arc<RecordingProcessor<AttesterSlashing>>,
    pub ctx: GossipContext,
    pub processors: OperationProcessors,
    pub chain: Arc<dyn ChainView>,
    pub controller: GossipForkSubscriptions,
}

impl Harness {
    /// Controller for `FORK` with a known genesis. Needs a tokio runtime.
    pub fn new() -> Self {
        Self::with(Arc::new(ForkSchedule::new(vec![GENESIS_FORK, FORK], Some(ZERO_ROOT))), config::Gossip::default())
    }

    pub fn with(chain: Arc<dyn ChainView>, settings: config::Gossip) -> Self {
        let net = RecordingNetwork::new();
        let metrics = GossipMetrics::new().expect("metrics");
        let dumper = Arc::new(RecordingDumper::default());
        let blocks = RecordingProcessor::new(ValidationResult::Accept);
        let attestations = RecordingProcessor::new(ValidationResult::Accept);
        let aggregates = RecordingProcessor::new(ValidationResult::Accept);
        let exits = RecordingProcessor::new(ValidationResult::Reject);
        let proposer_slashings = RecordingProcessor::new(ValidationResult::Accept);
        let attester_slashings = RecordingProcessor::new(ValidationResult::Ignore);

        let ctx = GossipContext {
            runtime: tokio::runtime::Handle::current(),
            network: net.clone(),
            metrics: metrics.clone(),
            debug_dumper: dumper.clone(),
            settings,
        };
        let processors = OperationProcessors {
            block: blocks.clone(),
            attestation: attestations.clone(),
            aggregate: aggregates.clone(),
            attester_slashing: attester_slashings.clone(),
            proposer_slashing: proposer_slashings.clone(),
            voluntary_exit: exits.clone(),
        };
        let controller =
            GossipForkSubscriptions::new(FORK, Arc::clone(&chain), ctx.clone(), processors.clone());
        Self {
            net,
            metrics,
            dumper,
            blocks,
            attestations,
            aggregates,
            exits,
            proposer_slashings,
            attester_slashings,
            ctx,
            processors,
            chain,
            controller,
        }
    }

    /// Another fork's controller on the same overlay, metrics and processors.
    pub fn controller_for(&self, fork: Fork) -> GossipForkSubscriptions {
        GossipForkSubscriptions::new(fork, Arc::clone(&self.chain), self.ctx.clone(), self.processors.clone())
    }

    /// Requested subnets counted for `fork`'s digest.
    pub fn requested_subnets(&self, fork: Fork) -> i64 {
        let digest = forkgossip::compute_fork_digest(fork.current_version, ZERO_ROOT);
        self.metrics.active_subnets.with_label_values(&[digest.to_string().as_str()]).get()
    }

    pub fn namer(&self) -> TopicNamer {
        TopicNamer::new("eth2", forkgossip::compute_fork_digest(FORK.current_version, ZERO_ROOT), GossipEncoding::SszSnappy)
    }

    pub fn topic(&self, class: MessageClass) -> String {
        self.namer().class_topic(class)
    }

    pub fn subnet_topic(&self, id: u64) -> String {
        self.namer().subnet_topic(SubnetId::new(id, ATTESTATION_SUBNET_COUNT).unwrap())
    }

    pub fn publish_requests(&self, class: MessageClass) -> u64 {
        self.metrics.publish_requests.with_label_values(&[class.as_str()]).get()
    }

    pub fn publish_failures(&self, class: MessageClass) -> u64 {
        self.metrics.publish_failures.with_label_values(&[class.as_str()]).get()
    }

    pub async fn start(&self, optimistic: bool) {
        self.controller.start_gossip(ZERO_ROOT, optimistic).expect("start gossip");
        self.controller.settled().await;
    }
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// -----------------------------------------------------------------------------
// Sample messages
// -----------------------------------------------------------------------------

pub fn block(slot: Slot) -> SignedBeaconBlock {
    SignedBeaconBlock {
        message: BeaconBlock {
            slot,
            proposer_index: 7,
            parent_root: [1u8; 32],
            state_root: [2u8; 32],
            body: vec![0xab; 64],
        },
        signature: vec![0x11; 96],
    }
}

pub fn attestation_data(slot: Slot, index: u64) -> AttestationData {
    AttestationData {
        slot,
        index,
        beacon_block_root: [3u8; 32],
        source: Checkpoint { epoch: 0, root: [4u8; 32] },
        target: Checkpoint { epoch: slot / SLOTS_PER_EPOCH, root: [5u8; 32] },
    }
}

pub fn attestation(slot: Slot, index: u64) -> Attestation {
    Attestation {
        aggregation_bits: vec![false, true, false, false],
        data: attestation_data(slot, index),
        signature: vec![0x22; 96],
    }
}

pub fn aggregate(slot: Slot, index: u64) -> SignedAggregateAndProof {
    SignedAggregateAndProof {
        message: AggregateAndProof {
            aggregator_index: 11,
            aggregate: Attestation { aggregation_bits: vec![true, true, true, false], ..attestation(slot, index) },
            selection_proof: vec![0x33; 96],
        },
        signature: vec![0x44; 96],
    }
}

pub fn header(slot: Slot, body_root: u8) -> SignedBeaconBlockHeader {
    SignedBeaconBlockHeader {
        message: BeaconBlockHeader {
            slot,
            proposer_index: 9,
            parent_root: [1u8; 32],
            state_root: [2u8; 32],
            body_root: [body_root; 32],
        },
        signature: vec![0x55; 96],
    }
}

pub fn proposer_slashing() -> ProposerSlashing {
    ProposerSlashing { signed_header_1: header(100, 1), signed_header_2: header(100, 2) }
}

pub fn attester_slashing() -> AttesterSlashing {
    let indexed = |root: u8| IndexedAttestation {
        attesting_indices: vec![1, 2, 3],
        data: AttestationData { beacon_block_root: [root; 32], ..attestation_data(64, 0) },
        signature: vec![0x66; 96],
    };
    AttesterSlashing { attestation_1: indexed(1), attestation_2: indexed(2) }
}

pub fn voluntary_exit() -> SignedVoluntaryExit {
    SignedVoluntaryExit { message: VoluntaryExit { epoch: 74240, validator_index: 42 }, signature: vec![0x77; 96] }
}
