use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::assembler::{begin_commit, finish_commit, load_prior};
use crate::attestation::{Attestor, Report, TrustedServices, sign_report, verify_report};
use crate::chain::{chain_of, is_valid_chain, luck, valid_block, valid_chain, validate_payload};
use crate::config::ConsensusConfig;
use crate::consensus::Consensus;
use crate::crypto;
use crate::enclave::{
    Boundary, BoundaryClient, Enclave, EnclaveCall, EnclaveReply, RoundPhase, RoundStateMachine,
    RoundStatus,
};
use crate::error::LuckError;
use crate::fork_choice::{Decision, ForkChoice, Origin};
use crate::mempool::Mempool;
use crate::node::Node;
use crate::nonce::{self, MAX_HASH_LEN, NONCE_SIZE, NONCE_VERSION};
use crate::persist::{JsonFileState, MemoryState, Snapshot, StateStore};
use crate::platform::{ManualPlatform, SystemPlatform};
use crate::store::{FileStore, MemoryStore, ObjectStore, get_object, put_object};
use crate::transport::{LocalBus, Topic, Transport};
use crate::types::{
    Block, ChainBlock, ContentHash, ObjectRef, Payload, PriorBlock, PriorPayload, Transaction,
};

const ROUND: Duration = Duration::from_secs(10);

fn service_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

fn attestor() -> Attestor {
    Attestor::new(service_key())
}

fn verifier() -> TrustedServices {
    TrustedServices::for_attestor(&attestor())
}

fn memory_store() -> Arc<dyn ObjectStore> {
    Arc::new(MemoryStore::new())
}

fn test_enclave(seed: u64) -> (Enclave<ManualPlatform>, ManualPlatform) {
    let platform = ManualPlatform::new();
    let enclave = Enclave::new(platform.clone(), ROUND).with_rng(StdRng::seed_from_u64(seed));
    (enclave, platform)
}

fn empty_genesis_payload() -> Payload {
    Payload::new(ObjectRef::Genesis, [])
}

fn store_tx(store: &dyn ObjectStore, data: &[u8]) -> ContentHash {
    put_object(
        store,
        &Transaction {
            data: data.to_vec(),
        },
    )
    .expect("put transaction")
}

/// Run a whole round against `head` and store the resulting block.
fn commit_block(
    enclave: &mut Enclave<ManualPlatform>,
    platform: &ManualPlatform,
    store: &dyn ObjectStore,
    head: ObjectRef,
    transactions: Vec<ContentHash>,
) -> ContentHash {
    let (_, prior_payload) = load_prior(store, head).expect("load prior");
    enclave.start_round(&prior_payload).expect("start_round");
    platform.advance(ROUND);
    let pending = begin_commit(enclave, store, head, transactions, true).expect("begin_commit");
    platform.advance(pending.sleep.duration);
    finish_commit(enclave, &attestor(), store, &pending).expect("finish_commit")
}

/// Store a properly attested block with a chosen luck.
fn attested_block(
    store: &dyn ObjectStore,
    parent: ObjectRef,
    transactions: Vec<ContentHash>,
    luck: f64,
) -> ContentHash {
    let payload_hash =
        put_object(store, &Payload::new(parent, transactions)).expect("put payload");
    let nonce = nonce::encode(
        NONCE_VERSION,
        luck,
        &ObjectRef::Content(payload_hash).to_nonce_bytes(),
    )
    .expect("nonce");
    let signed = sign_report(
        Report {
            nonce: nonce.to_vec(),
            luck,
        },
        &SigningKey::from_bytes(&[9u8; 32]),
    )
    .expect("sign report");
    let attestation = attestor().attest(&signed).expect("attest");
    put_object(store, &Block::new(luck, attestation, payload_hash)).expect("put block")
}

fn test_consensus(
    store: &Arc<dyn ObjectStore>,
    seed: u64,
    state: Box<dyn StateStore>,
) -> (Consensus, ManualPlatform) {
    let (enclave, platform) = test_enclave(seed);
    let attestor = attestor();
    let verifier = TrustedServices::for_attestor(&attestor);
    let config = ConsensusConfig {
        round_time: ROUND,
        ..ConsensusConfig::default()
    };
    let mut consensus = Consensus::new(
        config,
        Box::new(BoundaryClient::new(enclave)),
        attestor,
        Box::new(verifier),
        Arc::clone(store),
        state,
    );
    consensus.bootstrap().expect("bootstrap");
    (consensus, platform)
}

/// Let a round elapse, mine, wait out the luck delay, and finish.
fn mine_one(consensus: &mut Consensus, platform: &ManualPlatform) -> Option<ObjectRef> {
    platform.advance(ROUND);
    let pending = consensus.on_tick().expect("commit should begin");
    platform.advance(pending.sleep.duration);
    consensus.finish_commit(&pending).expect("finish_commit")
}

// --- Nonce tests ---------------------------------------------------------

#[test]
fn nonce_round_trips_luck_and_hash() {
    for (luck, len) in [(0.0, 0), (0.25, 7), (0.5, 32), (0.999_999, MAX_HASH_LEN)] {
        let hash: Vec<u8> = (0..len).map(|i| u8::try_from(i).expect("small")).collect();
        let bytes = nonce::encode(NONCE_VERSION, luck, &hash).expect("encode");
        assert_eq!(bytes.len(), NONCE_SIZE);

        let decoded = nonce::decode(&bytes).expect("decode");
        assert_eq!(decoded.version, NONCE_VERSION);
        assert!((decoded.luck - luck).abs() < f64::EPSILON);
        assert_eq!(decoded.hash, hash);
    }
}

#[test]
fn nonce_rejects_unknown_version() {
    let mut bytes = nonce::encode(NONCE_VERSION, 0.5, b"GENESIS").expect("encode");
    bytes[0] = 2;

    match nonce::decode(&bytes) {
        Err(LuckError::UnsupportedNonceVersion(2)) => {}
        other => panic!("expected UnsupportedNonceVersion, got: {other:?}"),
    }
}

#[test]
fn nonce_rejects_overlong_hash_length() {
    let mut bytes = nonce::encode(NONCE_VERSION, 0.5, &[1u8; 32]).expect("encode");
    bytes[9] = 60;

    match nonce::decode(&bytes) {
        Err(LuckError::MalformedNonce(_)) => {}
        other => panic!("expected MalformedNonce, got: {other:?}"),
    }
    assert!(nonce::encode(NONCE_VERSION, 0.5, &[0u8; MAX_HASH_LEN + 1]).is_err());
    assert!(nonce::decode(&[1u8; 10]).is_err());
}

#[test]
fn nonce_genesis_sentinel_resolves_to_genesis() {
    let bytes =
        nonce::encode(NONCE_VERSION, 0.1, &ObjectRef::Genesis.to_nonce_bytes()).expect("encode");
    let decoded = nonce::decode(&bytes).expect("decode");
    assert_eq!(decoded.payload_ref().expect("ref"), ObjectRef::Genesis);
}

// --- Data model tests ----------------------------------------------------

#[test]
fn validate_payload_requires_a_transaction() {
    assert!(!validate_payload(&empty_genesis_payload()));

    let tx = crypto::content_hash(&Transaction { data: vec![1] }).expect("hash");
    assert!(validate_payload(&Payload::new(ObjectRef::Genesis, [tx])));
}

#[test]
fn payload_with_two_parents_does_not_deserialize() {
    let json = serde_json::json!({
        "links": [
            { "name": "parent", "hash": "GENESIS" },
            { "name": "parent", "hash": "GENESIS" },
        ]
    });
    assert!(serde_json::from_value::<Payload>(json).is_err());

    let json = serde_json::json!({ "links": [{ "name": "parent", "hash": "GENESIS" }] });
    let payload: Payload = serde_json::from_value(json).expect("single parent is valid");
    assert_eq!(payload.parent(), ObjectRef::Genesis);
    assert!(payload.is_empty());
}

#[test]
fn object_ref_text_form_round_trips() {
    let hash = crypto::content_hash(&Transaction { data: vec![3] }).expect("hash");
    let text = ObjectRef::Content(hash).to_string();
    assert_eq!(text.parse::<ObjectRef>().expect("parse"), ObjectRef::Content(hash));
    assert_eq!("GENESIS".parse::<ObjectRef>().expect("parse"), ObjectRef::Genesis);
    assert!("not-a-hash".parse::<ObjectRef>().is_err());
}

// --- Round state machine tests -------------------------------------------

#[test]
fn mine_before_start_round_is_invalid_state() {
    let (mut enclave, _platform) = test_enclave(1);

    match enclave.mine(
        &empty_genesis_payload(),
        &PriorBlock::Genesis,
        &PriorPayload::Genesis,
    ) {
        Err(LuckError::InvalidState {
            phase: RoundPhase::Idle,
            ..
        }) => {}
        other => panic!("expected InvalidState, got: {other:?}"),
    }
}

#[test]
fn second_start_round_is_invalid_state() {
    let (mut enclave, _platform) = test_enclave(1);
    enclave
        .start_round(&PriorPayload::Genesis)
        .expect("first start_round");

    match enclave.start_round(&PriorPayload::Genesis) {
        Err(LuckError::InvalidState {
            phase: RoundPhase::RoundStarted,
            ..
        }) => {}
        other => panic!("expected InvalidState, got: {other:?}"),
    }
}

#[test]
fn mine_waits_for_round_time() {
    let (mut enclave, platform) = test_enclave(2);
    enclave.start_round(&PriorPayload::Genesis).expect("start");
    platform.advance(Duration::from_secs(4));

    let payload = empty_genesis_payload();
    match enclave.mine(&payload, &PriorBlock::Genesis, &PriorPayload::Genesis) {
        Err(LuckError::RoundNotElapsed { remaining_ms: 6000 }) => {}
        other => panic!("expected RoundNotElapsed, got: {other:?}"),
    }
    assert_eq!(enclave.phase(), RoundPhase::RoundStarted);

    platform.advance(Duration::from_secs(6));
    let sleep = enclave
        .mine(&payload, &PriorBlock::Genesis, &PriorPayload::Genesis)
        .expect("mine after round time");
    assert!(sleep.duration > Duration::ZERO);
    assert!(sleep.duration <= ROUND);
    assert_eq!(enclave.phase(), RoundPhase::Sleeping);

    platform.advance(sleep.duration);
    let signed = enclave.resume_from_sleep(sleep.token).expect("resume");
    let expected = ROUND.as_secs_f64() * (1.0 - signed.report.luck);
    assert!((sleep.duration.as_secs_f64() - expected).abs() < 1e-6);
    assert_eq!(enclave.phase(), RoundPhase::Idle);
}

#[test]
fn resume_before_wake_time_keeps_sleeping() {
    let (mut enclave, platform) = test_enclave(3);
    enclave.start_round(&PriorPayload::Genesis).expect("start");
    platform.advance(ROUND);
    let sleep = enclave
        .mine(
            &empty_genesis_payload(),
            &PriorBlock::Genesis,
            &PriorPayload::Genesis,
        )
        .expect("mine");

    match enclave.resume_from_sleep(sleep.token) {
        Err(LuckError::RoundNotElapsed { .. }) => {}
        other => panic!("expected RoundNotElapsed, got: {other:?}"),
    }
    assert_eq!(enclave.phase(), RoundPhase::Sleeping);

    platform.advance(sleep.duration);
    enclave.resume_from_sleep(sleep.token).expect("resume");
}

#[test]
fn resume_detects_counter_change() {
    let (mut enclave, platform) = test_enclave(4);
    enclave.start_round(&PriorPayload::Genesis).expect("start");
    platform.advance(ROUND);
    let sleep = enclave
        .mine(
            &empty_genesis_payload(),
            &PriorBlock::Genesis,
            &PriorPayload::Genesis,
        )
        .expect("mine");

    platform.set_counter(99);
    platform.advance(sleep.duration);

    match enclave.resume_from_sleep(sleep.token) {
        Err(LuckError::CounterMismatch {
            expected: 1,
            got: 99,
        }) => {}
        other => panic!("expected CounterMismatch, got: {other:?}"),
    }
    // The enclave stays stuck until an operator reset.
    assert_eq!(enclave.phase(), RoundPhase::Sleeping);
    assert!(enclave.start_round(&PriorPayload::Genesis).is_err());

    enclave.reset().expect("reset");
    assert_eq!(enclave.phase(), RoundPhase::Idle);
}

#[test]
fn mine_rejects_payload_not_extending_previous_block() {
    let store = memory_store();
    let (mut enclave, platform) = test_enclave(5);
    let first = commit_block(&mut enclave, &platform, store.as_ref(), ObjectRef::Genesis, vec![]);

    enclave.start_round(&PriorPayload::Genesis).expect("start");
    platform.advance(ROUND);
    let (prior_block, prior_payload) =
        load_prior(store.as_ref(), ObjectRef::Content(first)).expect("load prior");

    // Claims genesis as parent but is mined against `first`.
    match enclave.mine(&empty_genesis_payload(), &prior_block, &prior_payload) {
        Err(LuckError::InvalidPayload(_)) => {}
        other => panic!("expected InvalidPayload, got: {other:?}"),
    }
}

#[test]
fn mine_rejects_previous_block_from_another_lineage() {
    let store = memory_store();
    let (mut enclave, platform) = test_enclave(6);
    let first = commit_block(&mut enclave, &platform, store.as_ref(), ObjectRef::Genesis, vec![]);

    // Round raced against genesis, then a block on top of `first` is offered.
    enclave.start_round(&PriorPayload::Genesis).expect("start");
    platform.advance(ROUND);
    let head = ObjectRef::Content(first);
    let (prior_block, prior_payload) = load_prior(store.as_ref(), head).expect("load prior");

    match enclave.mine(&Payload::new(head, []), &prior_block, &prior_payload) {
        Err(LuckError::InvalidPayload(_)) => {}
        other => panic!("expected InvalidPayload, got: {other:?}"),
    }
}

#[test]
fn abandon_round_never_clears_a_sleep() {
    let (mut enclave, platform) = test_enclave(7);
    enclave.start_round(&PriorPayload::Genesis).expect("start");
    enclave.abandon_round().expect("abandon started round");
    assert_eq!(enclave.phase(), RoundPhase::Idle);

    enclave.start_round(&PriorPayload::Genesis).expect("start");
    platform.advance(ROUND);
    enclave
        .mine(
            &empty_genesis_payload(),
            &PriorBlock::Genesis,
            &PriorPayload::Genesis,
        )
        .expect("mine");
    assert!(enclave.abandon_round().is_err());
    assert_eq!(enclave.phase(), RoundPhase::Sleeping);
}

// --- Boundary tests ------------------------------------------------------

#[test]
fn boundary_round_trips_errors() {
    let (enclave, _platform) = test_enclave(8);
    let mut boundary = Boundary::new(enclave);

    let call = EnclaveCall::ResumeFromSleep {
        token: serde_json::from_str("1").expect("token"),
    };
    let reply = boundary
        .call(&crypto::encode(&call).expect("encode"))
        .expect("call");
    let result: Result<EnclaveReply, LuckError> = crypto::decode(&reply).expect("decode");

    match result {
        Err(LuckError::InvalidState {
            phase: RoundPhase::Idle,
            operation,
        }) => assert_eq!(operation, "resume_from_sleep"),
        other => panic!("expected InvalidState, got: {other:?}"),
    }
}

#[test]
fn boundary_maps_garbage_to_invalid_payload() {
    let (enclave, _platform) = test_enclave(8);
    let mut boundary = Boundary::new(enclave);

    let reply = boundary.call(&[0xff, 0xfe, 0xfd]).expect("call");
    let result: Result<EnclaveReply, LuckError> = crypto::decode(&reply).expect("decode");
    match result {
        Err(LuckError::InvalidPayload(_)) => {}
        other => panic!("expected InvalidPayload, got: {other:?}"),
    }
}

#[test]
fn boundary_client_preserves_report_bytes() {
    let store = memory_store();
    let (enclave, platform) = test_enclave(9);
    let mut client = BoundaryClient::new(enclave);

    client.start_round(&PriorPayload::Genesis).expect("start");
    assert_eq!(
        client.status().expect("status"),
        RoundStatus::RoundStarted { lineage: None }
    );
    platform.advance(ROUND);

    let pending = begin_commit(&mut client, store.as_ref(), ObjectRef::Genesis, vec![], true)
        .expect("begin_commit");
    platform.advance(pending.sleep.duration);
    let signed = client
        .resume_from_sleep(pending.sleep.token)
        .expect("resume");

    assert_eq!(signed.report.nonce.len(), NONCE_SIZE);
    verify_report(&signed).expect("enclave signature survives the boundary");
    let mined = signed
        .report
        .decode_nonce()
        .and_then(|n| n.payload_ref())
        .expect("nonce");
    assert_eq!(mined, ObjectRef::Content(pending.payload_hash));
}

// --- Attestation tests ---------------------------------------------------

#[test]
fn attestation_from_untrusted_service_is_rejected() {
    let store = memory_store();
    let (mut enclave, platform) = test_enclave(10);
    let hash = commit_block(&mut enclave, &platform, store.as_ref(), ObjectRef::Genesis, vec![]);
    let chain = chain_of(ObjectRef::Content(hash), store.as_ref()).expect("chain");

    assert!(is_valid_chain(&chain, &verifier()));

    let stranger = TrustedServices::new(vec![SigningKey::from_bytes(&[1u8; 32]).verifying_key()]);
    match valid_chain(&chain, &stranger) {
        Err(LuckError::ChainValidationFailure(_)) => {}
        other => panic!("expected ChainValidationFailure, got: {other:?}"),
    }
}

#[test]
fn tampered_report_fails_verification() {
    let (mut enclave, platform) = test_enclave(11);
    enclave.start_round(&PriorPayload::Genesis).expect("start");
    platform.advance(ROUND);
    let sleep = enclave
        .mine(
            &empty_genesis_payload(),
            &PriorBlock::Genesis,
            &PriorPayload::Genesis,
        )
        .expect("mine");
    platform.advance(sleep.duration);
    let mut signed = enclave.resume_from_sleep(sleep.token).expect("resume");

    signed.report.luck = 0.999;
    assert!(verify_report(&signed).is_err());
    assert!(attestor().attest(&signed).is_err());
}

// --- Chain validation tests ----------------------------------------------

#[test]
fn luck_sums_non_genesis_blocks() {
    let store = memory_store();
    let a = attested_block(store.as_ref(), ObjectRef::Genesis, vec![], 0.3);
    let b = attested_block(store.as_ref(), ObjectRef::Content(a), vec![], 0.5);

    let chain = chain_of(ObjectRef::Content(b), store.as_ref()).expect("chain");
    assert_eq!(chain.len(), 3);
    assert_eq!(chain[0], ChainBlock::genesis());
    assert!((luck(&chain, 0.0) - 0.8).abs() < 1e-9);

    // Blocks under the threshold carry no weight.
    assert!((luck(&chain, 0.4) - 0.5).abs() < 1e-9);
}

#[test]
fn valid_chain_rejects_broken_linkage() {
    let store = memory_store();
    let a = attested_block(store.as_ref(), ObjectRef::Genesis, vec![], 0.3);
    let b = attested_block(store.as_ref(), ObjectRef::Content(a), vec![], 0.5);
    let mut chain = chain_of(ObjectRef::Content(b), store.as_ref()).expect("chain");
    valid_chain(&chain, &verifier()).expect("valid before tampering");

    chain[2].parent_hash = ObjectRef::Genesis;
    match valid_chain(&chain, &verifier()) {
        Err(LuckError::ChainValidationFailure(_)) => {}
        other => panic!("expected ChainValidationFailure, got: {other:?}"),
    }

    chain.remove(0);
    assert!(!is_valid_chain(&chain, &verifier()));
    assert!(!is_valid_chain(&[], &verifier()));
}

#[test]
fn valid_chain_rejects_grafted_attestation() {
    let store = memory_store();
    let honest = attested_block(store.as_ref(), ObjectRef::Genesis, vec![], 0.9);
    let honest_block: Block = get_object(store.as_ref(), &honest).expect("get block");

    // Reuse a lucky attestation for a different payload.
    let tx = store_tx(store.as_ref(), b"graft");
    let other_payload =
        put_object(store.as_ref(), &Payload::new(ObjectRef::Genesis, [tx])).expect("put");
    let grafted = Block::new(
        honest_block.luck(),
        honest_block.attestation().clone(),
        other_payload,
    );
    valid_block(&grafted).expect("the block alone looks consistent");
    let grafted = put_object(store.as_ref(), &grafted).expect("put grafted");

    let chain = chain_of(ObjectRef::Content(grafted), store.as_ref()).expect("chain");
    match valid_chain(&chain, &verifier()) {
        Err(LuckError::ChainValidationFailure(msg)) => assert!(msg.contains("attested over")),
        other => panic!("expected ChainValidationFailure, got: {other:?}"),
    }
}

#[test]
fn valid_block_rejects_luck_disagreeing_with_report() {
    let store = memory_store();
    let hash = attested_block(store.as_ref(), ObjectRef::Genesis, vec![], 0.4);
    let block: Block = get_object(store.as_ref(), &hash).expect("get block");

    let lying = Block::new(0.95, block.attestation().clone(), block.payload_hash());
    match valid_block(&lying) {
        Err(LuckError::InvalidBlock(_)) => {}
        other => panic!("expected InvalidBlock, got: {other:?}"),
    }
}

#[test]
fn chain_of_missing_object_fails() {
    let store = memory_store();
    let missing = ContentHash([0xab; 32]);

    match chain_of(ObjectRef::Content(missing), store.as_ref()) {
        Err(LuckError::NotFound(r)) => assert_eq!(r, ObjectRef::Content(missing)),
        other => panic!("expected NotFound, got: {other:?}"),
    }
    assert_eq!(
        chain_of(ObjectRef::Genesis, store.as_ref()).expect("genesis chain"),
        vec![ChainBlock::genesis()]
    );
}

// --- Fork choice tests ---------------------------------------------------

#[test]
fn fork_choice_adopts_only_strictly_luckier_chains() {
    let store = memory_store();
    let verifier = verifier();
    let mut fork_choice = ForkChoice::new(0.0);

    let first = ObjectRef::Content(attested_block(store.as_ref(), ObjectRef::Genesis, vec![], 0.5));
    match fork_choice.consider(first, store.as_ref(), &verifier) {
        Ok(Decision::Adopted(adoption)) => {
            assert_eq!(adoption.previous_head, ObjectRef::Genesis);
            assert_eq!(adoption.height, 1);
        }
        other => panic!("expected Adopted, got: {other:?}"),
    }

    // Equal luck keeps the current head.
    let tx = store_tx(store.as_ref(), b"sibling");
    let sibling = ObjectRef::Content(attested_block(store.as_ref(), ObjectRef::Genesis, vec![tx], 0.5));
    match fork_choice.consider(sibling, store.as_ref(), &verifier) {
        Ok(Decision::Kept { .. }) => {}
        other => panic!("expected Kept, got: {other:?}"),
    }
    assert_eq!(fork_choice.head(), first);

    let luckier = ObjectRef::Content(attested_block(store.as_ref(), ObjectRef::Genesis, vec![], 0.6));
    match fork_choice.consider(luckier, store.as_ref(), &verifier) {
        Ok(Decision::Adopted(adoption)) => assert_eq!(adoption.previous_head, first),
        other => panic!("expected Adopted, got: {other:?}"),
    }
    assert_eq!(fork_choice.head(), luckier);
    assert_eq!(fork_choice.head_lineage(), Some(ObjectRef::Genesis));

    // Candidates are evaluated once.
    assert_eq!(
        fork_choice
            .consider(sibling, store.as_ref(), &verifier)
            .expect("consider"),
        Decision::Ignored
    );
}

#[test]
fn fork_choice_prefers_luck_over_length() {
    let store = memory_store();
    let verifier = verifier();
    let mut fork_choice = ForkChoice::new(0.0);

    let a = attested_block(store.as_ref(), ObjectRef::Genesis, vec![], 0.2);
    let b = attested_block(store.as_ref(), ObjectRef::Content(a), vec![], 0.2);
    fork_choice
        .consider(ObjectRef::Content(b), store.as_ref(), &verifier)
        .expect("consider long chain");
    assert_eq!(fork_choice.height(), 2);

    let lucky = ObjectRef::Content(attested_block(store.as_ref(), ObjectRef::Genesis, vec![], 0.7));
    match fork_choice.consider(lucky, store.as_ref(), &verifier) {
        Ok(Decision::Adopted(adoption)) => assert_eq!(adoption.height, 1),
        other => panic!("expected Adopted, got: {other:?}"),
    }
}

#[test]
fn fork_choice_rejects_invalid_candidate() {
    let store = memory_store();
    let mut fork_choice = ForkChoice::new(0.0);
    let candidate =
        ObjectRef::Content(attested_block(store.as_ref(), ObjectRef::Genesis, vec![], 0.9));

    let stranger = TrustedServices::new(vec![SigningKey::from_bytes(&[2u8; 32]).verifying_key()]);
    match fork_choice.consider(candidate, store.as_ref(), &stranger) {
        Err(LuckError::ChainValidationFailure(_)) => {}
        other => panic!("expected ChainValidationFailure, got: {other:?}"),
    }
    assert_eq!(fork_choice.head(), ObjectRef::Genesis);

    // Invalid chains are not retried.
    assert_eq!(
        fork_choice
            .consider(candidate, store.as_ref(), &verifier())
            .expect("consider"),
        Decision::Ignored
    );
}

#[test]
fn fork_choice_retries_head_whose_objects_arrive_late() {
    let store = memory_store();
    let empty = memory_store();
    let verifier = verifier();
    let mut fork_choice = ForkChoice::new(0.0);
    let candidate =
        ObjectRef::Content(attested_block(store.as_ref(), ObjectRef::Genesis, vec![], 0.4));

    match fork_choice.consider(candidate, empty.as_ref(), &verifier) {
        Err(LuckError::NotFound(r)) => assert_eq!(r, candidate),
        other => panic!("expected NotFound, got: {other:?}"),
    }
    assert_eq!(fork_choice.head(), ObjectRef::Genesis);

    match fork_choice.consider(candidate, store.as_ref(), &verifier) {
        Ok(Decision::Adopted(adoption)) => assert_eq!(adoption.head, candidate),
        other => panic!("expected Adopted, got: {other:?}"),
    }
    assert_eq!(fork_choice.head(), candidate);
}

// --- Mempool tests -------------------------------------------------------

#[test]
fn mempool_deduplicates_and_respects_capacity() {
    let mut mempool = Mempool::new(2);
    let a = ContentHash([1; 32]);
    let b = ContentHash([2; 32]);
    let c = ContentHash([3; 32]);

    assert!(mempool.insert(b));
    assert!(!mempool.insert(b));
    assert!(mempool.insert(a));
    assert!(!mempool.insert(c));
    assert_eq!(mempool.snapshot(), vec![a, b]);

    assert_eq!(mempool.remove_all(&[a, c]), 1);
    assert!(!mempool.contains(&a));
    assert_eq!(mempool.len(), 1);
}

// --- Consensus tests -----------------------------------------------------

#[test]
fn empty_block_from_genesis_end_to_end() {
    let store = memory_store();
    let (mut miner, platform) = test_consensus(&store, 20, Box::new(MemoryState::new()));

    let head = mine_one(&mut miner, &platform).expect("own block adopted");
    assert_eq!(miner.head(), head);
    assert_eq!(miner.chain().len(), 2);
    assert!((miner.luck() - miner.chain()[1].luck).abs() < 1e-12);

    let (mut peer, _) = test_consensus(&store, 21, Box::new(MemoryState::new()));
    assert_eq!(peer.on_block(head, Origin::Peer), Some(head));
    assert_eq!(peer.head(), head);
}

#[test]
fn tick_before_round_time_does_not_mine() {
    let store = memory_store();
    let (mut consensus, platform) = test_consensus(&store, 22, Box::new(MemoryState::new()));

    platform.advance(Duration::from_secs(3));
    assert!(consensus.on_tick().is_none());
    assert_eq!(
        consensus.round_status().expect("status"),
        RoundStatus::RoundStarted { lineage: None }
    );
}

#[test]
fn no_empty_blocks_waits_for_transactions() {
    let store = memory_store();
    let (enclave, platform) = test_enclave(23);
    let attestor = attestor();
    let verifier = TrustedServices::for_attestor(&attestor);
    let config = ConsensusConfig {
        round_time: ROUND,
        allow_empty_blocks: false,
        ..ConsensusConfig::default()
    };
    let mut consensus = Consensus::new(
        config,
        Box::new(enclave),
        attestor,
        Box::new(verifier),
        Arc::clone(&store),
        Box::new(MemoryState::new()),
    );
    consensus.bootstrap().expect("bootstrap");

    platform.advance(ROUND);
    assert!(consensus.on_tick().is_none());

    consensus
        .submit_transaction(&Transaction { data: vec![42] })
        .expect("submit");
    let pending = consensus.on_tick().expect("commit with a transaction");
    assert_eq!(pending.transactions.len(), 1);
}

#[test]
fn committed_transactions_leave_the_mempool() {
    let store = memory_store();
    let (mut miner, miner_platform) = test_consensus(&store, 24, Box::new(MemoryState::new()));
    let (mut peer, _) = test_consensus(&store, 25, Box::new(MemoryState::new()));

    let tx = miner
        .submit_transaction(&Transaction { data: vec![1, 2, 3] })
        .expect("submit")
        .expect("new transaction");
    assert!(peer.on_transaction(tx));
    assert_eq!(peer.mempool().len(), 1);

    let head = mine_one(&mut miner, &miner_platform).expect("adopted");
    assert!(miner.mempool().is_empty());
    assert_eq!(miner.chain()[1].transactions, vec![tx]);

    peer.on_block(head, Origin::Peer).expect("peer adopts");
    assert!(peer.mempool().is_empty());

    // Already committed, so not queued again.
    assert!(!peer.on_transaction(tx));
}

#[test]
fn peer_adoption_suppresses_local_commit_for_the_slot() {
    let store = memory_store();
    let (mut miner, miner_platform) = test_consensus(&store, 26, Box::new(MemoryState::new()));
    let (mut peer, peer_platform) = test_consensus(&store, 27, Box::new(MemoryState::new()));

    let head = mine_one(&mut miner, &miner_platform).expect("adopted");
    peer.on_block(head, Origin::Peer).expect("peer adopts");
    assert_eq!(
        peer.round_status().expect("status"),
        RoundStatus::RoundStarted {
            lineage: Some(ObjectRef::Genesis)
        }
    );

    peer_platform.advance(ROUND);
    assert!(peer.on_tick().is_none());

    let pending = peer.on_tick().expect("next slot mines");
    assert_eq!(pending.parent, head);
}

#[test]
fn local_block_that_loses_is_kept_out() {
    let store = memory_store();
    let (mut miner, platform) = test_consensus(&store, 28, Box::new(MemoryState::new()));
    let tx = miner
        .submit_transaction(&Transaction { data: vec![8] })
        .expect("submit")
        .expect("new transaction");

    platform.advance(ROUND);
    let pending = miner.on_tick().expect("commit begins");
    assert_eq!(pending.transactions, vec![tx]);

    // A luckier sibling arrives while we sleep.
    let sibling = ObjectRef::Content(attested_block(store.as_ref(), ObjectRef::Genesis, vec![], 0.999_9));
    assert_eq!(miner.on_block(sibling, Origin::Peer), Some(sibling));

    platform.advance(pending.sleep.duration);
    assert_eq!(miner.finish_commit(&pending).expect("finish"), None);
    assert_eq!(miner.head(), sibling);

    // The losing block's transaction waits for the next round.
    assert!(miner.mempool().contains(&tx));
    assert!(!miner.chain().iter().any(|b| b.transactions.contains(&tx)));
    assert_eq!(
        miner.round_status().expect("status"),
        RoundStatus::RoundStarted {
            lineage: Some(ObjectRef::Genesis)
        }
    );
}

#[test]
fn cancelled_commit_leaves_enclave_stuck_until_reset() {
    let store = memory_store();
    let (mut consensus, platform) = test_consensus(&store, 29, Box::new(MemoryState::new()));

    platform.advance(ROUND);
    let pending = consensus.on_tick().expect("commit begins");
    consensus.cancel_commit(&pending);

    assert_eq!(consensus.round_status().expect("status"), RoundStatus::Sleeping);
    platform.advance(ROUND);
    assert!(consensus.on_tick().is_none());
    assert_eq!(consensus.round_status().expect("status"), RoundStatus::Sleeping);

    consensus.reset_enclave().expect("reset");
    assert_eq!(
        consensus.round_status().expect("status"),
        RoundStatus::RoundStarted { lineage: None }
    );
}

#[test]
fn restart_restores_head_and_mempool() {
    let store = memory_store();
    let state = MemoryState::new();
    let (mut consensus, platform) = test_consensus(&store, 30, Box::new(state.clone()));

    let head = mine_one(&mut consensus, &platform).expect("adopted");
    let tx = consensus
        .submit_transaction(&Transaction { data: vec![5] })
        .expect("submit")
        .expect("new");
    drop(consensus);

    let saved = state.load().expect("load").expect("snapshot");
    assert_eq!(saved.head, head);

    let (restarted, _) = test_consensus(&store, 31, Box::new(state));
    assert_eq!(restarted.head(), head);
    assert_eq!(restarted.chain().len(), 2);
    assert!(restarted.mempool().contains(&tx));
}

#[test]
fn unusable_persisted_head_falls_back_to_genesis() {
    let store = memory_store();
    let state = MemoryState::new();
    state
        .save(&Snapshot {
            head: ObjectRef::Content(ContentHash([0x11; 32])),
            mempool: vec![],
        })
        .expect("save");

    let (consensus, _) = test_consensus(&store, 32, Box::new(state));
    assert_eq!(consensus.head(), ObjectRef::Genesis);
}

// --- Storage tests -------------------------------------------------------

#[test]
fn file_store_persists_across_instances() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tx = Transaction { data: vec![9, 9] };

    let hash = {
        let store = FileStore::open(dir.path().join("objects")).expect("open");
        put_object(&store, &tx).expect("put")
    };

    let store = FileStore::open(dir.path().join("objects")).expect("reopen");
    let back: Transaction = get_object(&store, &hash).expect("get");
    assert_eq!(back, tx);

    match store.get(&ContentHash([0; 32])) {
        Err(LuckError::NotFound(_)) => {}
        other => panic!("expected NotFound, got: {other:?}"),
    }
}

#[test]
fn json_state_persists_across_instances() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.json");
    assert_eq!(JsonFileState::new(&path).load().expect("load"), None);

    let snapshot = Snapshot {
        head: ObjectRef::Content(ContentHash([4; 32])),
        mempool: vec![ContentHash([5; 32])],
    };
    JsonFileState::new(&path).save(&snapshot).expect("save");
    assert_eq!(
        JsonFileState::new(&path).load().expect("load"),
        Some(snapshot)
    );
}

#[test]
fn get_object_rejects_mismatched_content() {
    struct Corrupt;
    impl ObjectStore for Corrupt {
        fn put(&self, bytes: &[u8]) -> Result<ContentHash, LuckError> {
            Ok(ContentHash(crypto::hash_bytes(bytes)))
        }
        fn get(&self, _hash: &ContentHash) -> Result<Vec<u8>, LuckError> {
            Ok(vec![0])
        }
    }

    match get_object::<Transaction>(&Corrupt, &ContentHash([1; 32])) {
        Err(LuckError::Storage(_)) => {}
        other => panic!("expected Storage, got: {other:?}"),
    }
}

// --- Node tests ----------------------------------------------------------

#[tokio::test]
async fn local_bus_does_not_echo_to_sender() {
    let bus = LocalBus::new(16);
    let mut a = bus.join();
    let mut b = bus.join();

    a.publish(Topic::Block, b"GENESIS".to_vec()).expect("publish");
    let gossip = b.next().await.expect("message");
    assert_eq!(gossip.topic, Topic::Block);
    assert_eq!(gossip.data, b"GENESIS");

    b.publish(Topic::Transaction, b"ab".to_vec()).expect("publish");
    let gossip = a.next().await.expect("message");
    assert_eq!(gossip.topic, Topic::Transaction);
}

#[tokio::test]
async fn node_reset_unsticks_a_sleeping_enclave() {
    let store = memory_store();
    let (mut consensus, platform) = test_consensus(&store, 32, Box::new(MemoryState::new()));

    platform.advance(ROUND);
    let pending = consensus.on_tick().expect("commit begins");
    consensus.cancel_commit(&pending);
    assert_eq!(consensus.round_status().expect("status"), RoundStatus::Sleeping);

    let bus = LocalBus::new(16);
    let (mut node, handle) = Node::new(consensus, bus.join());
    let task = tokio::spawn(async move { node.run().await });

    assert_eq!(
        handle.reset_enclave().await.expect("reset"),
        RoundStatus::RoundStarted { lineage: None }
    );
    task.abort();
}

#[tokio::test(start_paused = true)]
async fn nodes_on_a_local_bus_converge() {
    let store = memory_store();
    let bus = LocalBus::new(256);

    let mut handles = Vec::new();
    for seed in [40, 41] {
        let enclave = Enclave::new(SystemPlatform::new(), ROUND).with_rng(StdRng::seed_from_u64(seed));
        let attestor = attestor();
        let verifier = TrustedServices::for_attestor(&attestor);
        let mut consensus = Consensus::new(
            ConsensusConfig {
                round_time: ROUND,
                ..ConsensusConfig::default()
            },
            Box::new(BoundaryClient::new(enclave)),
            attestor,
            Box::new(verifier),
            Arc::clone(&store),
            Box::new(MemoryState::new()),
        );
        consensus.bootstrap().expect("bootstrap");

        let (mut node, handle) = Node::new(consensus, bus.join());
        tokio::spawn(async move { node.run().await });
        handles.push(handle);
    }

    handles[0]
        .transactions
        .send(Transaction { data: vec![7] })
        .await
        .expect("submit");

    let mut converged = false;
    for _ in 0..300 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let a = handles[0].view.borrow().clone();
        let b = handles[1].view.borrow().clone();
        if a.height >= 3 && a.head == b.head {
            assert!(
                a.chain
                    .iter()
                    .any(|block| !block.transactions.is_empty()),
                "submitted transaction was committed"
            );
            converged = true;
            break;
        }
    }
    assert!(converged, "nodes did not agree on a head");
}
