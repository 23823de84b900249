//! Gather over three peers with real stores: one malformed, one on time,
//! one late. Also pins the inclusive publish-window boundaries and the
//! shared fetch deadline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use swarmgrad_core::fakes::FixedLedger;
use swarmgrad_core::{
    gather, resolve_time_window, ArtifactValidator, GatherPhase, GatherRequest, GradientArtifact,
    PeerDirectory, PeerId, SkipReason, SparseParam, TransformDct, ValidationError,
};
use swarmgrad_store::fakes::MemoryBackend;
use swarmgrad_store::{ArtifactKind, ObjectStore, RetryPolicy};

const WINDOW: u64 = 4821;

fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
}

fn validator() -> ArtifactValidator {
    let dct = TransformDct::new(4);
    let mut geometries = BTreeMap::new();
    geometries.insert("w".to_string(), dct.geometry(&[8]));
    ArtifactValidator::new(geometries, 2)
}

fn artifact(idxs: Vec<u32>) -> GradientArtifact {
    let vals = idxs.iter().map(|&i| 0.5 + i as f32).collect();
    let mut params = BTreeMap::new();
    params.insert("w".to_string(), SparseParam { idxs, vals });
    GradientArtifact { params }
}

struct Swarm {
    directory: PeerDirectory,
    backends: BTreeMap<PeerId, Arc<MemoryBackend>>,
}

impl Swarm {
    fn new(peers: &[u16]) -> Self {
        let mut directory = PeerDirectory::new();
        let mut backends = BTreeMap::new();
        for &p in peers {
            let backend = Arc::new(MemoryBackend::new());
            let store = ObjectStore::new(backend.clone(), "3", 5)
                .with_retry(RetryPolicy::fixed(1, Duration::from_millis(1)));
            directory.register(PeerId(p), Arc::new(store));
            backends.insert(PeerId(p), backend);
        }
        Self {
            directory,
            backends,
        }
    }

    async fn publish_at(&self, peer: u16, at: DateTime<Utc>, payload: &[u8]) {
        let peer = PeerId(peer);
        self.backends[&peer].set_time(Some(at));
        self.directory
            .endpoint(peer)
            .unwrap()
            .publish(&peer.role_id(), WINDOW, ArtifactKind::Gradient, payload)
            .await
            .unwrap();
    }
}

async fn time_window() -> swarmgrad_core::TimeWindow {
    let ledger = FixedLedger::new();
    ledger.set_anchor(WINDOW, anchor());
    resolve_time_window(&ledger, WINDOW, 30, &RetryPolicy::default())
        .await
        .unwrap()
}

fn request(tw: swarmgrad_core::TimeWindow) -> GatherRequest {
    GatherRequest {
        window: WINDOW,
        time_window: Some(tw),
        timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn malformed_on_time_and_late() {
    let swarm = Swarm::new(&[1, 2, 3]);
    let seconds = chrono::Duration::seconds;

    // Index 9 is outside the 4-coefficient chunk.
    let malformed = artifact(vec![0, 9, 0, 1]).to_bytes().unwrap();
    let valid = artifact(vec![0, 1, 2, 3]).to_bytes().unwrap();
    swarm.publish_at(1, anchor() + seconds(5), &malformed).await;
    swarm.publish_at(2, anchor() + seconds(10), &valid).await;
    swarm.publish_at(3, anchor() + seconds(31), &valid).await;

    let peers = [PeerId(1), PeerId(2), PeerId(3)];
    let outcome = gather(&swarm.directory, &peers, &request(time_window().await), &validator()).await;

    assert_eq!(outcome.phase(), GatherPhase::Aggregated);
    let result = outcome.into_result();
    assert_eq!(result.contributing, vec![PeerId(2)]);
    assert_eq!(result.skipped_ids(), vec![PeerId(1), PeerId(3)]);
    assert!((result.success_rate - 1.0 / 3.0).abs() < 1e-12);

    assert!(matches!(
        &result.skipped[0].reason,
        SkipReason::Invalid(ValidationError::IndexOutOfRange { index: 9, total_k: 4, .. })
    ));
    assert_eq!(result.skipped[1].reason, SkipReason::TooLate);
}

#[tokio::test]
async fn window_bounds_are_inclusive() {
    let swarm = Swarm::new(&[1, 2, 3, 4]);
    let tw = time_window().await;
    let one = chrono::Duration::seconds(1);
    let valid = artifact(vec![0, 1, 0, 1]).to_bytes().unwrap();

    swarm.publish_at(1, tw.time_min, &valid).await;
    swarm.publish_at(2, tw.time_max, &valid).await;
    swarm.publish_at(3, tw.time_max + one, &valid).await;
    swarm.publish_at(4, tw.time_min - one, &valid).await;

    let peers = [PeerId(1), PeerId(2), PeerId(3), PeerId(4)];
    let result = gather(&swarm.directory, &peers, &request(tw), &validator())
        .await
        .into_result();
    assert_eq!(result.contributing, vec![PeerId(1), PeerId(2)]);
    assert_eq!(result.skipped[0].reason, SkipReason::TooLate);
    assert_eq!(result.skipped[1].reason, SkipReason::TooEarly);
}

#[tokio::test]
async fn all_invalid_fails_without_update() {
    let swarm = Swarm::new(&[1, 2]);
    let tw = time_window().await;
    // Three entries across two chunks cannot be split evenly.
    let misaligned = artifact(vec![0, 1, 2]).to_bytes().unwrap();
    swarm.publish_at(1, tw.time_min, &misaligned).await;
    swarm.publish_at(2, tw.time_min, b"not json").await;

    let outcome = gather(&swarm.directory, &[PeerId(1), PeerId(2)], &request(tw), &validator()).await;
    assert_eq!(outcome.phase(), GatherPhase::Failed);
    let result = outcome.result();
    assert!(result.contributing.is_empty());
    assert_eq!(result.success_rate, 0.0);
    assert!(outcome.aggregated().is_err());
}

#[tokio::test]
async fn merged_result_ignores_contribution_order() {
    let swarm = Swarm::new(&[1, 2]);
    let tw = time_window().await;
    swarm
        .publish_at(1, tw.time_min, &artifact(vec![0, 1, 2, 3]).to_bytes().unwrap())
        .await;
    swarm
        .publish_at(2, tw.time_min, &artifact(vec![3, 0, 1, 0]).to_bytes().unwrap())
        .await;

    let v = validator();
    let mut dct = TransformDct::new(4);
    let a = gather(&swarm.directory, &[PeerId(1), PeerId(2)], &request(tw), &v)
        .await
        .into_result()
        .merge(&mut dct, &v)
        .unwrap();
    let b = gather(&swarm.directory, &[PeerId(2), PeerId(1)], &request(tw), &v)
        .await
        .into_result()
        .merge(&mut dct, &v)
        .unwrap();
    assert_eq!(a, b);
}

#[tokio::test(start_paused = true)]
async fn slow_peer_times_out_while_others_contribute() {
    let swarm = Swarm::new(&[1, 2, 3]);
    let tw = time_window().await;
    for p in [1, 2, 3] {
        swarm
            .publish_at(p, tw.time_min, &artifact(vec![0, 1, 2, 3]).to_bytes().unwrap())
            .await;
    }
    swarm.backends[&PeerId(2)].set_read_delay(Some(Duration::from_secs(60)));

    let started = tokio::time::Instant::now();
    let outcome = gather(
        &swarm.directory,
        &[PeerId(1), PeerId(2), PeerId(3)],
        &request(tw),
        &validator(),
    )
    .await;

    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(outcome.phase(), GatherPhase::Aggregated);
    let result = outcome.into_result();
    assert_eq!(result.contributing, vec![PeerId(1), PeerId(3)]);
    assert_eq!(result.skipped_ids(), vec![PeerId(2)]);
    assert_eq!(result.skipped[0].reason, SkipReason::TimedOut);
}
