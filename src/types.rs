//! Consensus containers carried over gossip, plus the fork and subnet
//! primitives that scope topic names.
//!
//! Payloads are opaque to the gossip layer: they are serialised with bincode
//! and handed to the per-class operation processors untouched.

use crate::error::{GossipError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

pub type Epoch = u64;
pub type Slot = u64;
pub type Root = [u8; 32];
pub type Version = [u8; 4];
pub type ValidatorIndex = u64;

pub const SLOTS_PER_EPOCH: u64 = 32;
pub const ATTESTATION_SUBNET_COUNT: u64 = 64;

/// A protocol upgrade boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fork {
    pub previous_version: Version,
    pub current_version: Version,
    pub epoch: Epoch,
}

impl Fork {
    pub const UNSCHEDULED_EPOCH: Epoch = u64::MAX;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkInfo {
    pub fork: Fork,
    pub genesis_validators_root: Root,
}

impl ForkInfo {
    pub fn new(fork: Fork, genesis_validators_root: Root) -> Self {
        Self { fork, genesis_validators_root }
    }
}

/// Four byte namespace prefix for every topic of a fork.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForkDigest([u8; 4]);

impl ForkDigest {
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for ForkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ForkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForkDigest(0x{})", hex::encode(self.0))
    }
}

impl FromStr for ForkDigest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0u8; 4];
        hex::decode_to_slice(s.trim_start_matches("0x"), &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Index of an attestation subnet, always below the subnet count it was
/// checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubnetId(u64);

impl SubnetId {
    pub fn new(id: u64, subnet_count: u64) -> Result<Self> {
        if id >= subnet_count {
            return Err(GossipError::InvalidSubnet { id, count: subnet_count });
        }
        Ok(Self(id))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subnet an attestation belongs on, following the committee layout of the
/// attestation's slot.
pub fn compute_subnet_for_attestation(
    committees_per_slot: u64,
    slot: Slot,
    committee_index: u64,
    subnet_count: u64,
) -> SubnetId {
    let slots_since_epoch_start = slot % SLOTS_PER_EPOCH;
    let committees_since_epoch_start = committees_per_slot.saturating_mul(slots_since_epoch_start);
    SubnetId(committees_since_epoch_start.wrapping_add(committee_index) % subnet_count.max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageClass {
    Attestation,
    Block,
    Aggregate,
    VoluntaryExit,
    ProposerSlashing,
    AttesterSlashing,
}

impl MessageClass {
    /// Every class in manager construction order.
    pub const ALL: [MessageClass; 6] = [
        MessageClass::Attestation,
        MessageClass::Block,
        MessageClass::Aggregate,
        MessageClass::VoluntaryExit,
        MessageClass::ProposerSlashing,
        MessageClass::AttesterSlashing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageClass::Attestation => "beacon_attestation",
            MessageClass::Block => "beacon_block",
            MessageClass::Aggregate => "beacon_aggregate_and_proof",
            MessageClass::VoluntaryExit => "voluntary_exit",
            MessageClass::ProposerSlashing => "proposer_slashing",
            MessageClass::AttesterSlashing => "attester_slashing",
        }
    }

    /// Whether the class keeps gossiping while the head is optimistic.
    /// Fixed by protocol semantics.
    pub fn is_enabled_during_optimistic_sync(&self) -> bool {
        matches!(self, MessageClass::Block | MessageClass::Aggregate)
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -----------------------------------------------------------------------------
// Payload containers
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconBlock {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub parent_root: Root,
    pub state_root: Root,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBeaconBlock {
    pub message: BeaconBlock,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconBlockHeader {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub parent_root: Root,
    pub state_root: Root,
    pub body_root: Root,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBeaconBlockHeader {
    pub message: BeaconBlockHeader,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: Root,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationData {
    pub slot: Slot,
    /// Committee index within the slot.
    pub index: u64,
    pub beacon_block_root: Root,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub aggregation_bits: Vec<bool>,
    pub data: AttestationData,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedAttestation {
    pub attesting_indices: Vec<ValidatorIndex>,
    pub data: AttestationData,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateAndProof {
    pub aggregator_index: ValidatorIndex,
    pub aggregate: Attestation,
    pub selection_proof: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAggregateAndProof {
    pub message: AggregateAndProof,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposerSlashing {
    pub signed_header_1: SignedBeaconBlockHeader,
    pub signed_header_2: SignedBeaconBlockHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttesterSlashing {
    pub attestation_1: IndexedAttestation,
    pub attestation_2: IndexedAttestation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoluntaryExit {
    pub epoch: Epoch,
    pub validator_index: ValidatorIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVoluntaryExit {
    pub message: VoluntaryExit,
    pub signature: Vec<u8>,
}

/// An attestation on its way through gossip, either produced locally or
/// received from a peer.
#[derive(Debug)]
pub struct ValidatableAttestation {
    attestation: Attestation,
    aggregate_and_proof: Option<SignedAggregateAndProof>,
    received_subnet_id: Option<SubnetId>,
    committees_per_slot: u64,
    gossiped: AtomicBool,
}

impl ValidatableAttestation {
    pub fn from_validator(attestation: Attestation, committees_per_slot: u64) -> Self {
        Self {
            attestation,
            aggregate_and_proof: None,
            received_subnet_id: None,
            committees_per_slot,
            gossiped: AtomicBool::new(false),
        }
    }

    pub fn aggregate_from_validator(aggregate: SignedAggregateAndProof, committees_per_slot: u64) -> Self {
        Self {
            attestation: aggregate.message.aggregate.clone(),
            aggregate_and_proof: Some(aggregate),
            received_subnet_id: None,
            committees_per_slot,
            gossiped: AtomicBool::new(false),
        }
    }

    /// Messages that arrived over gossip were already seen by the mesh.
    pub fn from_network(attestation: Attestation, subnet_id: Option<SubnetId>) -> Self {
        Self {
            attestation,
            aggregate_and_proof: None,
            received_subnet_id: subnet_id,
            committees_per_slot: 0,
            gossiped: AtomicBool::new(true),
        }
    }

    pub fn aggregate_from_network(aggregate: SignedAggregateAndProof) -> Self {
        Self {
            attestation: aggregate.message.aggregate.clone(),
            aggregate_and_proof: Some(aggregate),
            received_subnet_id: None,
            committees_per_slot: 0,
            gossiped: AtomicBool::new(true),
        }
    }

    pub fn attestation(&self) -> &Attestation {
        &self.attestation
    }

    pub fn aggregate_and_proof(&self) -> Option<&SignedAggregateAndProof> {
        self.aggregate_and_proof.as_ref()
    }

    pub fn is_aggregate(&self) -> bool {
        self.aggregate_and_proof.is_some()
    }

    pub fn received_subnet_id(&self) -> Option<SubnetId> {
        self.received_subnet_id
    }

    pub fn subnet_id(&self, subnet_count: u64) -> SubnetId {
        self.received_subnet_id.unwrap_or_else(|| {
            let data = &self.attestation.data;
            compute_subnet_for_attestation(self.committees_per_slot, data.slot, data.index, subnet_count)
        })
    }

    /// Returns true the first time only.
    pub fn mark_gossiped(&self) -> bool {
        !self.gossiped.swap(true, Ordering::AcqRel)
    }
}

/// Binds a wire container to the message class whose topic carries it.
pub trait GossipPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const CLASS: MessageClass;

    /// What the operation processor receives once the payload is decoded.
    type Operation: Send + 'static;

    fn into_operation(self, subnet_id: Option<SubnetId>) -> Self::Operation;

    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| GossipError::Encode {
            context: Self::CLASS.as_str(),
            reason: e.to_string(),
        })
    }

    fn decode(topic: &str, bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| GossipError::Decode {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }
}

macro_rules! plain_payload {
    ($ty:ty, $class:expr) => {
        impl GossipPayload for $ty {
            const CLASS: MessageClass = $class;
            type Operation = $ty;

            fn into_operation(self, _subnet_id: Option<SubnetId>) -> Self::Operation {
                self
            }
        }
    };
}

plain_payload!(SignedBeaconBlock, MessageClass::Block);
plain_payload!(ProposerSlashing, MessageClass::ProposerSlashing);
plain_payload!(AttesterSlashing, MessageClass::AttesterSlashing);
plain_payload!(SignedVoluntaryExit, MessageClass::VoluntaryExit);

impl GossipPayload for Attestation {
    const CLASS: MessageClass = MessageClass::Attestation;
    type Operation = ValidatableAttestation;

    fn into_operation(self, subnet_id: Option<SubnetId>) -> Self::Operation {
        ValidatableAttestation::from_network(self, subnet_id)
    }
}

impl GossipPayload for SignedAggregateAndProof {
    const CLASS: MessageClass = MessageClass::Aggregate;
    type Operation = ValidatableAttestation;

    fn into_operation(self, _subnet_id: Option<SubnetId>) -> Self::Operation {
        ValidatableAttestation::aggregate_from_network(self)
    }
}
