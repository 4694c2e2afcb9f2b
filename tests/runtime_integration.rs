//! Async hosting: feed adapters through the normalizer into a spawned
//! session, cycle outputs over the channel, and cycle-boundary shutdown.

use std::sync::atomic::Ordering;

use chrono::{Duration, Utc};
use trackfuse::{
    FusionSession, GeoPosition, Normalizer, ObservationBatch, RawDetection, SessionConfig,
    SessionRegistry, SessionRunner, SourceType, TrackDeltaKind, TrackStatus,
};
use uuid::Uuid;

fn session() -> FusionSession {
    let origin = GeoPosition::new(48.0, 11.0, 500.0).unwrap();
    FusionSession::new(SessionConfig::new(origin)).unwrap()
}

fn raw(lat: f64, lon: f64, at: chrono::DateTime<chrono::Utc>) -> RawDetection {
    RawDetection {
        id: Uuid::new_v4(),
        source_id: "radar-01".into(),
        source_type: SourceType::Radar,
        observed_at: at,
        latitude_deg: lat,
        longitude_deg: lon,
        altitude_m: 500.0,
        velocity_enu_mps: None,
        horizontal_accuracy_m: None,
        vertical_accuracy_m: None,
        confidence: Some(0.9),
        entity_type: None,
        marking: None,
    }
}

#[tokio::test]
async fn feed_to_picture_end_to_end() {
    let mut normalizer = Normalizer::new();
    let (handle, mut outputs) = SessionRunner::spawn(session());
    let t0 = Utc::now();

    // Three cycles of the same entity, through the raw-record path.
    let mut last_status = TrackStatus::Candidate;
    for i in 0..3 {
        let t = t0 + Duration::seconds(i);
        let observations =
            normalizer.normalize_batch(vec![raw(48.01 + i as f64 * 1e-4, 11.01, t)]);
        handle
            .submit(ObservationBatch::new(observations))
            .await
            .unwrap();
        let out = outputs.recv().await.expect("cycle output");
        last_status = out.deltas[0].status;
    }

    assert_eq!(last_status, TrackStatus::Confirmed);
    assert_eq!(normalizer.accepted(), 3);
    assert_eq!(handle.stats().tracks_confirmed.load(Ordering::Relaxed), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn malformed_feed_records_never_reach_the_session() {
    let mut normalizer = Normalizer::new();
    let (handle, mut outputs) = SessionRunner::spawn(session());
    let t0 = Utc::now();

    let mut bad = raw(48.01, 11.01, t0);
    bad.latitude_deg = 120.0;
    let observations = normalizer.normalize_batch(vec![bad, raw(48.02, 11.02, t0)]);
    assert_eq!(observations.len(), 1);
    assert_eq!(normalizer.rejected(), 1);

    handle
        .submit(ObservationBatch::new(observations))
        .await
        .unwrap();
    let out = outputs.recv().await.unwrap();
    assert_eq!(out.deltas.len(), 1);
    assert_eq!(out.deltas[0].kind, TrackDeltaKind::Created);

    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_finishes_the_submitted_cycle_first() {
    let (handle, mut outputs) = SessionRunner::spawn(session());
    let t0 = Utc::now();

    let mut normalizer = Normalizer::new();
    let observations = normalizer.normalize_batch(vec![raw(48.01, 11.01, t0)]);
    handle
        .submit(ObservationBatch::new(observations))
        .await
        .unwrap();

    // The batch already queued completes before the task stops.
    let out = outputs.recv().await.expect("in-flight cycle completes");
    assert_eq!(out.deltas.len(), 1);

    handle.shutdown().await;
    assert!(handle
        .submit(ObservationBatch::new(Vec::new()))
        .await
        .is_err());
}

#[tokio::test]
async fn registry_manages_multiple_regions() {
    let registry = SessionRegistry::new();
    let (north, mut north_out) = SessionRunner::spawn(session());
    let (south, _south_out) = SessionRunner::spawn(session());

    registry.register("sector-north", north);
    registry.register("sector-south", south);
    let mut names = registry.names();
    names.sort();
    assert_eq!(names, vec!["sector-north", "sector-south"]);

    let t0 = Utc::now();
    let mut normalizer = Normalizer::new();
    let observations = normalizer.normalize_batch(vec![raw(48.01, 11.01, t0)]);
    registry
        .get("sector-north")
        .unwrap()
        .submit(ObservationBatch::new(observations))
        .await
        .unwrap();
    assert!(north_out.recv().await.is_some());

    for name in ["sector-north", "sector-south"] {
        let handle = registry.remove(name).unwrap();
        handle.shutdown().await;
    }
    assert!(registry.names().is_empty());
}

#[tokio::test]
async fn stats_flow_through_the_shared_handle() {
    let (handle, mut outputs) = SessionRunner::spawn(session());
    let t0 = Utc::now();
    let mut normalizer = Normalizer::new();

    // Same record twice in one batch: the second copy is an idempotent
    // no-op inside the session.
    let record = raw(48.01, 11.01, t0);
    let obs = normalizer
        .normalize_batch(vec![record.clone(), record])
        .into_iter()
        .collect::<Vec<_>>();
    handle.submit(ObservationBatch::new(obs)).await.unwrap();
    outputs.recv().await.unwrap();

    let stats = handle.stats().snapshot();
    assert_eq!(stats.duplicates_dropped, 1);
    assert_eq!(stats.tracks_created, 1);
    assert_eq!(stats.cycles, 1);

    handle.shutdown().await;
}
