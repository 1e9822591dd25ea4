use anyhow::Result;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::thread;
use tracing::{error, info};

/// Gossip counters shared by every manager of a node.
#[derive(Clone)]
pub struct GossipMetrics {
    registry: Registry,
    pub published: IntCounterVec,
    pub publish_failures: IntCounterVec,
    pub subscribe_failures: IntCounterVec,
    pub inbound: IntCounterVec,
    pub publish_requests: IntCounterVec,
    /// Labelled by fork digest, so overlapping forks are counted apart.
    pub active_subnets: IntGaugeVec,
}

impl GossipMetrics {
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Self> {
        let published = IntCounterVec::new(
            Opts::new("gossip_published_total", "Messages published to gossip").namespace("forkgossip"),
            &["class"],
        )?;
        let publish_failures = IntCounterVec::new(
            Opts::new("gossip_publish_failures_total", "Gossip publishes the network refused").namespace("forkgossip"),
            &["class"],
        )?;
        let subscribe_failures = IntCounterVec::new(
            Opts::new("gossip_subscribe_failures_total", "Topic subscribe/unsubscribe errors").namespace("forkgossip"),
            &["class"],
        )?;
        let inbound = IntCounterVec::new(
            Opts::new("gossip_inbound_total", "Inbound gossip messages by validation result").namespace("forkgossip"),
            &["class", "result"],
        )?;
        let publish_requests = IntCounterVec::new(
            Opts::new("gossip_publish_requests_total", "Local messages offered to a topic manager").namespace("forkgossip"),
            &["class"],
        )?;
        let active_subnets = IntGaugeVec::new(
            Opts::new("gossip_attestation_subnets", "Attestation subnets currently requested").namespace("forkgossip"),
            &["fork_digest"],
        )?;

        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(publish_failures.clone()))?;
        registry.register(Box::new(subscribe_failures.clone()))?;
        registry.register(Box::new(inbound.clone()))?;
        registry.register(Box::new(publish_requests.clone()))?;
        registry.register(Box::new(active_subnets.clone()))?;

        Ok(Self {
            registry,
            published,
            publish_failures,
            subscribe_failures,
            inbound,
            publish_requests,
            active_subnets,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Serves the registry in text exposition format on `bind`.
pub fn serve(cfg: crate::config::Metrics, registry: Registry) -> Result<()> {
    let server = tiny_http::Server::http(&cfg.bind)
        .map_err(|e| anyhow::anyhow!("could not start metrics server on {}: {}", cfg.bind, e))?;
    let content_type: tiny_http::Header = "Content-Type: text/plain; version=0.0.4; charset=utf-8"
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid metrics content type header"))?;
    info!(bind = %cfg.bind, "Metrics endpoint listening");

    thread::spawn(move || {
        for request in server.incoming_requests() {
            let mut buffer = vec![];
            let encoder = TextEncoder::new();
            if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
                error!(error = %e, "Could not encode metrics");
                continue;
            }
            let response = tiny_http::Response::from_data(buffer).with_header(content_type.clone());
            let _ = request.respond(response);
        }
    });

    Ok(())
}
