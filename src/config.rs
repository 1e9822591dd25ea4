use crate::types::{Epoch, Fork, Root, ATTESTATION_SUBNET_COUNT};
use crate::topics::{GossipEncoding, DEFAULT_TOPIC_PREFIX};
use serde::Deserialize;
use std::{fs, path::Path};
use anyhow::{Context, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub net: Net,
    #[serde(default)]
    pub gossip: Gossip,
    pub chain: Chain,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Net {
    pub listen_port: u16,
    #[serde(default)]
    pub bootstrap: Vec<String>,          // multiaddrs
    /// Where the libp2p key lives; a fresh key is generated per run when unset.
    #[serde(default)]
    pub identity_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Gossip {
    #[serde(default = "default_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub encoding: GossipEncoding,
    #[serde(default = "default_subnet_count")]
    pub attestation_subnet_count: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Directory for rejected payloads; dumping is off when unset.
    #[serde(default)]
    pub debug_dump_dir: Option<String>,
}

impl Default for Gossip {
    fn default() -> Self {
        Self {
            topic_prefix: default_prefix(),
            encoding: GossipEncoding::default(),
            attestation_subnet_count: default_subnet_count(),
            max_message_size: default_max_message_size(),
            debug_dump_dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Chain {
    /// Hex encoded, `0x` prefix optional. Unset until genesis is known.
    #[serde(default)]
    pub genesis_validators_root: Option<String>,
    /// Epoch the node starts gossiping at.
    #[serde(default)]
    pub current_epoch: Epoch,
    pub forks: Vec<ForkEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForkEntry {
    pub previous_version: String,
    pub current_version: String,
    pub epoch: Epoch,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_prefix() -> String { DEFAULT_TOPIC_PREFIX.into() }
fn default_subnet_count() -> u64 { ATTESTATION_SUBNET_COUNT }
fn default_max_message_size() -> usize { 10 * 1024 * 1024 }   // 10 MiB
fn default_bind() -> String { "0.0.0.0:9100".into() }

impl Chain {
    pub fn forks(&self) -> Result<Vec<Fork>> {
        self.forks
            .iter()
            .map(|f| -> Result<Fork> {
                Ok(Fork {
                    previous_version: decode_hex(&f.previous_version).context("previous_version")?,
                    current_version: decode_hex(&f.current_version).context("current_version")?,
                    epoch: f.epoch,
                })
            })
            .collect()
    }

    pub fn genesis_validators_root(&self) -> Result<Option<Root>> {
        self.genesis_validators_root
            .as_deref()
            .map(|s| decode_hex::<32>(s).context("genesis_validators_root"))
            .transpose()
    }
}

fn decode_hex<const N: usize>(s: &str) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    hex::decode_to_slice(s.trim_start_matches("0x"), &mut out)
        .with_context(|| format!("expected {} hex bytes, got '{}'", N, s))?;
    Ok(out)
}

/// Read the TOML file at `p` and deserialize into `Config`.
/// *Adds context* so user errors print a friendlier message.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("couldn't read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    toml::from_str(text).with_context(|| "invalid TOML in config file".to_string())
}
