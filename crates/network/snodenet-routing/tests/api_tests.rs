//! Storage API operations against the simulated swarm.

mod common;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::json;
use snodenet_routing::crypto::ons;
use snodenet_routing::{RoutingError, SnodeMessage, SnodeNetwork};
use std::sync::Arc;

const RECIPIENT: &str = "05a1b2c3d4";

fn network_with_identity(sim: &Arc<SimulatedNetwork>) -> SnodeNetwork {
    build_network_with_identity(
        sim,
        test_config(),
        sim.store_with_pool(20, ChronoDuration::minutes(1)),
        test_identity(),
    )
}

#[tokio::test]
async fn test_get_messages_tracks_last_hash_and_duplicates() {
    init_test_logging();
    let sim = SimulatedNetwork::new(20);
    let network = build_network(&sim, test_config(), sim.store_with_pool(20, ChronoDuration::minutes(1)));
    let api = network.api();
    let swarm = sim.swarm();
    sim.add_message(b"one");
    sim.add_message(b"two");

    let messages = api.get_messages(&swarm[0], RECIPIENT, 0, false).await.unwrap();
    let data: Vec<_> = messages.iter().map(|message| message.data.clone()).collect();
    assert_eq!(data, vec![b"one".to_vec(), b"two".to_vec()]);
    assert!(messages.iter().all(|message| message.expiration_ms.is_some()));

    // Only messages after the last hash come back from the same snode.
    assert!(api.get_messages(&swarm[0], RECIPIENT, 0, false).await.unwrap().is_empty());
    let hash = sim.add_message(b"three");
    let messages = api.get_messages(&swarm[0], RECIPIENT, 0, false).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].hash, hash);

    // Another swarm member returns everything, but all of it was already seen.
    assert!(api.get_messages(&swarm[1], RECIPIENT, 0, false).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_authenticated_retrieval_needs_identity() {
    let sim = SimulatedNetwork::new(20);
    let network = build_network(&sim, test_config(), sim.store_with_pool(20, ChronoDuration::minutes(1)));

    let result = network.api().get_messages(&sim.swarm()[0], RECIPIENT, -10, true).await;

    assert_eq!(result, Err(RoutingError::MissingKeyMaterial));
    assert_eq!(sim.onion_requests.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_authenticated_retrieval() {
    let sim = SimulatedNetwork::new(20);
    let network = network_with_identity(&sim);
    sim.add_message(b"config");

    let messages = network
        .api()
        .get_messages(&sim.swarm()[2], RECIPIENT, 2, true)
        .await
        .unwrap();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data, b"config".to_vec());
}

#[tokio::test]
async fn test_send_message_reaches_target_snodes() {
    let sim = SimulatedNetwork::new(20);
    let network = build_network(&sim, test_config(), sim.store_with_pool(20, ChronoDuration::minutes(1)));
    let message = SnodeMessage {
        recipient: RECIPIENT.to_string(),
        data: STANDARD.encode(b"hello"),
        ttl: 86_400_000,
        timestamp_ms: Utc::now().timestamp_millis() as u64,
    };

    let results = network.api().send_message(&message, 0).await.unwrap();

    assert_eq!(results.len(), 2);
    for result in results {
        let body: serde_json::Value = serde_json::from_slice(&result.unwrap()).unwrap();
        assert!(body["hash"].as_str().is_some());
    }
    assert_eq!(sim.message_count(), 2);
    let stores = sim
        .rpc_log()
        .iter()
        .filter(|(_, method)| method == "store")
        .count();
    assert_eq!(stores, 2);
}

#[tokio::test]
async fn test_send_message_retries_failing_snode() {
    let sim = SimulatedNetwork::new(20);
    let failures = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = failures.clone();
    sim.set_override(move |_, method, _| {
        if method == "store" && counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2 {
            Some((503, json!({ "error": "busy" })))
        } else {
            None
        }
    });
    let network = build_network(&sim, test_config(), sim.store_with_pool(20, ChronoDuration::minutes(1)));
    let message = SnodeMessage {
        recipient: RECIPIENT.to_string(),
        data: STANDARD.encode(b"retry me"),
        ttl: 60_000,
        timestamp_ms: Utc::now().timestamp_millis() as u64,
    };

    let results = network.api().send_message(&message, 0).await.unwrap();

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(sim.message_count(), 2);
}

#[tokio::test]
async fn test_delete_messages_verifies_every_member() {
    init_test_logging();
    let sim = SimulatedNetwork::new(20);
    let network = network_with_identity(&sim);
    let first = sim.add_message(b"one");
    sim.add_message(b"two");

    let confirmations = network.api().delete_messages(&[first]).await.unwrap();

    assert_eq!(confirmations.len(), SWARM_SIZE);
    assert!(confirmations.values().all(|verified| *verified));
    for snode in sim.swarm() {
        assert!(confirmations.contains_key(&snode.ed25519_public_key));
    }
    assert_eq!(sim.message_count(), 1);
}

#[tokio::test]
async fn test_delete_messages_flags_bad_signature() {
    let sim = SimulatedNetwork::new(20);
    let network = network_with_identity(&sim);
    let liar = sim.swarm()[3].clone();
    sim.set_bad_signer(&liar);
    let hash = sim.add_message(b"one");

    let confirmations = network.api().delete_messages(&[hash]).await.unwrap();

    assert_eq!(confirmations.get(&liar.ed25519_public_key), Some(&false));
    assert_eq!(confirmations.values().filter(|verified| **verified).count(), SWARM_SIZE - 1);
}

#[tokio::test]
async fn test_delete_requires_identity() {
    let sim = SimulatedNetwork::new(20);
    let network = build_network(&sim, test_config(), sim.store_with_pool(20, ChronoDuration::minutes(1)));

    assert_eq!(
        network.api().clear_all_data().await,
        Err(RoutingError::MissingKeyMaterial)
    );
}

#[tokio::test]
async fn test_clear_all_data() {
    let sim = SimulatedNetwork::new(20);
    let network = network_with_identity(&sim);
    sim.add_message(b"one");
    sim.add_message(b"two");

    let confirmations = network.api().clear_all_data().await.unwrap();

    assert_eq!(confirmations.len(), SWARM_SIZE);
    assert!(confirmations.values().all(|verified| *verified));
    assert_eq!(sim.message_count(), 0);
    let methods: Vec<_> = sim.rpc_log().into_iter().map(|(_, method)| method).collect();
    let info = methods.iter().position(|method| method == "info").unwrap();
    let delete_all = methods.iter().position(|method| method == "delete_all").unwrap();
    assert!(info < delete_all);
}

fn session_id() -> Vec<u8> {
    let mut id = vec![0x05];
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    id.extend_from_slice(&key);
    id
}

#[tokio::test]
async fn test_resolve_ons_name() {
    let sim = SimulatedNetwork::new(20);
    let network = build_network(&sim, test_config(), sim.store_with_pool(20, ChronoDuration::minutes(1)));
    let id = session_id();
    sim.register_ons_name("alice", &id);

    let resolved = network.api().resolve_ons_name("Alice").await.unwrap();

    assert_eq!(resolved, hex::encode(&id));
    let lookups = sim
        .rpc_log()
        .iter()
        .filter(|(_, method)| method == "oxend_request")
        .count();
    assert_eq!(lookups, 3);
}

#[tokio::test]
async fn test_ons_disagreement_fails_validation() {
    let sim = SimulatedNetwork::new(20);
    let id = session_id();
    sim.register_ons_name("bob", &id);

    let mut nonce = [0u8; 24];
    OsRng.fill_bytes(&mut nonce);
    let (ciphertext, nonce) = ons::encrypt_value("bob", &session_id(), &nonce).unwrap();
    let liar = sim.snodes()[0].clone();
    sim.set_override(move |snode, method, _| {
        (snode == &liar && method == "oxend_request").then(|| {
            (200, json!({ "result": { "encrypted_value": ciphertext, "nonce": nonce } }))
        })
    });
    // Three snodes in the pool, so every one of them is asked. Too few for paths.
    let network = build_network(
        &sim,
        test_config().with_min_pool_size(3).with_onion_requests(false),
        sim.store_with_pool(3, ChronoDuration::minutes(1)),
    );

    assert_eq!(
        network.api().resolve_ons_name("bob").await,
        Err(RoutingError::ValidationFailed)
    );
}

#[tokio::test]
async fn test_undecryptable_ons_answer_fails_lookup() {
    let sim = SimulatedNetwork::new(20);
    let id = session_id();
    sim.register_ons_name("carol", &id);

    let garbled = sim.snodes()[0].clone();
    let answered = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = answered.clone();
    sim.set_override(move |snode, method, _| {
        if snode != &garbled || method != "oxend_request" {
            return None;
        }
        // Only the first answer is garbage; a retry would get a valid one.
        (!flag.swap(true, std::sync::atomic::Ordering::SeqCst)).then(|| {
            (
                200,
                json!({ "result": { "encrypted_value": "00".repeat(49), "nonce": "00".repeat(24) } }),
            )
        })
    });
    let network = build_network(
        &sim,
        test_config().with_min_pool_size(3).with_onion_requests(false),
        sim.store_with_pool(3, ChronoDuration::minutes(1)),
    );

    assert_eq!(
        network.api().resolve_ons_name("carol").await,
        Err(RoutingError::DecryptionFailed)
    );
    assert!(answered.load(std::sync::atomic::Ordering::SeqCst));
    let lookups = sim
        .rpc_log()
        .iter()
        .filter(|(_, method)| method == "oxend_request")
        .count();
    assert_eq!(lookups, 3);
}

#[tokio::test]
async fn test_unknown_ons_name() {
    let sim = SimulatedNetwork::new(20);
    let network = build_network(&sim, test_config(), sim.store_with_pool(20, ChronoDuration::minutes(1)));

    let result = network.api().resolve_ons_name("nobody").await;

    assert!(matches!(
        result,
        Err(RoutingError::RequestFailedAtDestination { status_code: 404, .. })
    ));
}
