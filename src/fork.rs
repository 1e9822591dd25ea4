//! Fork schedule and fork digest derivation.

use crate::error::{GossipError, Result};
use crate::types::{Epoch, Fork, ForkDigest, Root, Version};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Chain state queries the gossip layer depends on.
pub trait ChainView: Send + Sync {
    /// Digest of the fork active at `epoch`. Must be deterministic.
    fn fork_digest(&self, epoch: Epoch) -> Result<ForkDigest>;
}

/// Hash tree root of the two-field `ForkData` container: both fields are
/// single chunks, so the root is `sha256(version padded to 32 ‖ root)`.
pub fn compute_fork_data_root(current_version: Version, genesis_validators_root: Root) -> Root {
    let mut version_chunk = [0u8; 32];
    version_chunk[..4].copy_from_slice(&current_version);

    let mut hasher = Sha256::new();
    hasher.update(version_chunk);
    hasher.update(genesis_validators_root);
    hasher.finalize().into()
}

pub fn compute_fork_digest(current_version: Version, genesis_validators_root: Root) -> ForkDigest {
    let root = compute_fork_data_root(current_version, genesis_validators_root);
    ForkDigest::new([root[0], root[1], root[2], root[3]])
}

/// Ordered fork list plus the genesis validators root, once known.
pub struct ForkSchedule {
    forks: Vec<Fork>,
    genesis_validators_root: Mutex<Option<Root>>,
    digests: Mutex<HashMap<(Version, Root), ForkDigest>>,
}

impl ForkSchedule {
    /// Forks are sorted by activation epoch; unscheduled ones are dropped.
    pub fn new(mut forks: Vec<Fork>, genesis_validators_root: Option<Root>) -> Self {
        forks.retain(|f| f.epoch != Fork::UNSCHEDULED_EPOCH);
        forks.sort_by_key(|f| f.epoch);
        Self {
            forks,
            genesis_validators_root: Mutex::new(genesis_validators_root),
            digests: Mutex::new(HashMap::new()),
        }
    }

    pub fn forks(&self) -> &[Fork] {
        &self.forks
    }

    pub fn set_genesis_validators_root(&self, root: Root) {
        *self.genesis_validators_root.lock().unwrap_or_else(PoisonError::into_inner) = Some(root);
    }

    pub fn genesis_validators_root(&self) -> Option<Root> {
        *self.genesis_validators_root.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fork_at_epoch(&self, epoch: Epoch) -> Result<Fork> {
        self.forks
            .iter()
            .rev()
            .find(|f| f.epoch <= epoch)
            .copied()
            .ok_or(GossipError::UnknownFork(epoch))
    }

    /// Epoch at which the fork following the one active at `epoch` starts.
    pub fn next_fork_epoch(&self, epoch: Epoch) -> Option<Epoch> {
        self.forks.iter().map(|f| f.epoch).find(|e| *e > epoch)
    }
}

impl ChainView for ForkSchedule {
    fn fork_digest(&self, epoch: Epoch) -> Result<ForkDigest> {
        let fork = self.fork_at_epoch(epoch)?;
        let root = self.genesis_validators_root().ok_or_else(|| {
            GossipError::ChainUnavailable("genesis validators root not yet known".into())
        })?;
        let mut cache = self.digests.lock().unwrap_or_else(PoisonError::into_inner);
        let digest = *cache
            .entry((fork.current_version, root))
            .or_insert_with(|| compute_fork_digest(fork.current_version, root));
        Ok(digest)
    }
}
