// Attestation subnet duties and fork digest derivation.

mod common;

use common::*;
use forkgossip::{
    compute_fork_digest, types::ATTESTATION_SUBNET_COUNT, ChainView, ForkSchedule, GossipError,
    MessageClass,
};
use std::sync::Arc;

fn subscribed_ids(h: &Harness) -> Vec<u64> {
    h.controller.subscribed_subnet_ids().iter().map(|id| id.as_u64()).collect()
}

#[tokio::test]
async fn test_subnet_churn_matches_net_effect() {
    let h = Harness::new();
    h.start(false).await;

    let c = &h.controller;
    c.subscribe_to_attestation_subnet_id(0).unwrap();
    c.subscribe_to_attestation_subnet_id(1).unwrap();
    c.subscribe_to_attestation_subnet_id(1).unwrap();
    c.unsubscribe_from_attestation_subnet_id(0).unwrap();
    c.subscribe_to_attestation_subnet_id(2).unwrap();
    c.unsubscribe_from_attestation_subnet_id(5).unwrap();
    c.settled().await;

    assert_eq!(subscribed_ids(&h), vec![1, 2]);
    for id in [1, 2] {
        assert!(h.net.is_subscribed(&h.subnet_topic(id)));
        assert_eq!(h.net.subscribe_count(&h.subnet_topic(id)), 1, "subnet {id}");
    }
    assert!(!h.net.is_subscribed(&h.subnet_topic(0)));
    assert_eq!(h.net.unsubscribe_count(&h.subnet_topic(5)), 0);
    assert_eq!(h.requested_subnets(FORK), 2);
}

#[tokio::test]
async fn test_requests_before_start_are_applied_on_start() {
    let h = Harness::new();
    h.controller.subscribe_to_attestation_subnet_id(4).unwrap();
    h.controller.subscribe_to_attestation_subnet_id(9).unwrap();
    h.controller.unsubscribe_from_attestation_subnet_id(9).unwrap();
    assert_eq!(h.net.total_subscribe_calls(), 0);

    h.start(false).await;
    assert_eq!(subscribed_ids(&h), vec![4]);
    assert!(h.net.is_subscribed(&h.subnet_topic(4)));
}

#[tokio::test]
async fn test_subnets_follow_attestation_manager_state() {
    let h = Harness::new();
    h.start(true).await;
    h.controller.subscribe_to_attestation_subnet_id(8).unwrap();
    h.controller.settled().await;
    // duty recorded, but single attestations are off on an optimistic head
    assert!(subscribed_ids(&h).is_empty());
    assert!(!h.controller.manager(MessageClass::Attestation).unwrap().is_subscribed());

    h.start(false).await;
    assert_eq!(subscribed_ids(&h), vec![8]);

    h.controller.stop_gossip_for_optimistic_sync();
    h.controller.settled().await;
    assert!(!h.net.is_subscribed(&h.subnet_topic(8)));
}

#[tokio::test]
async fn test_out_of_range_subnet_is_refused() {
    let h = Harness::new();
    let err = h.controller.subscribe_to_attestation_subnet_id(ATTESTATION_SUBNET_COUNT).unwrap_err();
    assert_eq!(err, GossipError::InvalidSubnet { id: 64, count: 64 });

    h.start(false).await;
    assert!(h.controller.unsubscribe_from_attestation_subnet_id(1_000).is_err());
    assert_eq!(h.requested_subnets(FORK), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_subnet_churn() {
    let h = Arc::new(Harness::new());
    h.start(false).await;

    let mut tasks = Vec::new();
    for worker in 0..8u64 {
        let h = Arc::clone(&h);
        tasks.push(tokio::spawn(async move {
            for round in 0..50u64 {
                let id = (worker * 7 + round) % 16;
                h.controller.subscribe_to_attestation_subnet_id(id).unwrap();
                if round % 3 == 0 {
                    h.controller.unsubscribe_from_attestation_subnet_id(id).unwrap();
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    // a final deterministic state on top of whatever interleaving happened
    for id in 0..16 {
        h.controller.unsubscribe_from_attestation_subnet_id(id).unwrap();
    }
    for id in [3, 11] {
        h.controller.subscribe_to_attestation_subnet_id(id).unwrap();
    }
    h.controller.settled().await;

    assert_eq!(subscribed_ids(&h), vec![3, 11]);
    let live: Vec<_> = h
        .net
        .subscribed_topics()
        .into_iter()
        .filter(|t| t.contains("beacon_attestation_"))
        .collect();
    assert_eq!(live.len(), 2, "{live:?}");
    assert_eq!(h.requested_subnets(FORK), 2);
}

#[test]
fn test_fork_digest_depends_on_version_and_root() {
    for _ in 0..16 {
        let root: [u8; 32] = rand::random();
        let digest = compute_fork_digest(FORK.current_version, root);
        assert_eq!(digest, compute_fork_digest(FORK.current_version, root));
        assert_ne!(digest, compute_fork_digest(GENESIS_FORK.current_version, root));

        let schedule = ForkSchedule::new(vec![GENESIS_FORK, FORK], Some(root));
        assert_eq!(schedule.fork_digest(FORK.epoch).unwrap(), digest);
        assert_eq!(schedule.fork_digest(FORK.epoch + 1000).unwrap(), digest);
        assert_eq!(
            schedule.fork_digest(FORK.epoch - 1).unwrap(),
            compute_fork_digest(GENESIS_FORK.current_version, root)
        );
    }
}

#[tokio::test]
async fn test_attestation_manager_reports_confirmed_subnets() {
    let h = Harness::new();
    h.net.fail_subscribe(&h.subnet_topic(2));
    h.start(false).await;
    let manager = h.controller.manager(MessageClass::Attestation).unwrap();
    assert!(manager.is_subscribed(), "no duties yet, nothing to confirm");

    h.controller.subscribe_to_attestation_subnet_id(1).unwrap();
    h.controller.subscribe_to_attestation_subnet_id(2).unwrap();
    h.controller.settled().await;
    assert_eq!(subscribed_ids(&h), vec![1]);
    assert!(!manager.is_subscribed(), "subnet 2 was never joined");

    h.controller.unsubscribe_from_attestation_subnet_id(2).unwrap();
    h.controller.settled().await;
    assert!(manager.is_subscribed());
}

#[tokio::test]
async fn test_requested_subnets_counted_per_fork() {
    let h = Harness::new();
    let previous = h.controller_for(GENESIS_FORK);
    previous.start_gossip(ZERO_ROOT, false).unwrap();
    h.start(false).await;

    // both forks serve the same duties across the transition
    for id in [1, 2] {
        previous.subscribe_to_attestation_subnet_id(id).unwrap();
        h.controller.subscribe_to_attestation_subnet_id(id).unwrap();
    }
    h.controller.subscribe_to_attestation_subnet_id(3).unwrap();
    previous.settled().await;
    h.controller.settled().await;

    assert_eq!(h.requested_subnets(GENESIS_FORK), 2);
    assert_eq!(h.requested_subnets(FORK), 3);

    previous.unsubscribe_from_attestation_subnet_id(1).unwrap();
    assert_eq!(h.requested_subnets(GENESIS_FORK), 1);
    assert_eq!(h.requested_subnets(FORK), 3);
}
