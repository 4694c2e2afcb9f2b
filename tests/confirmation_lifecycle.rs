//! Track lifecycle end-to-end: birth, M-of-N confirmation, coasting on
//! lost contact, and deletion after the coast timeout.

use chrono::{DateTime, Duration, Utc};
use trackfuse::{
    FusionSession, GeoPosition, Observation, ObservationBatch, SessionConfig, SourceId,
    SourceType, TrackDeltaKind, TrackStatus,
};

fn origin() -> GeoPosition {
    GeoPosition::new(48.0, 11.0, 500.0).unwrap()
}

fn session() -> FusionSession {
    FusionSession::new(SessionConfig::new(origin())).unwrap()
}

fn radar(lat: f64, lon: f64, at: DateTime<Utc>) -> Observation {
    Observation::builder(SourceType::Radar, SourceId::new("radar-01"))
        .observed_at(at)
        .position(lat, lon, 500.0)
        .confidence(0.9)
        .build()
        .unwrap()
}

/// Run one cycle that either sights the entity or reports nothing.
fn cycle(s: &mut FusionSession, sighting: Option<Observation>, at: DateTime<Utc>) -> TrackStatus {
    let batch = match sighting {
        Some(obs) => ObservationBatch::new(vec![obs]),
        None => ObservationBatch::new(Vec::new()).at(at),
    };
    let out = s.run_cycle(batch).unwrap();
    out.deltas
        .first()
        .map(|d| d.status)
        .unwrap_or(TrackStatus::Deleted)
}

#[test]
fn new_entity_walks_candidate_tentative_confirmed() {
    let mut s = session();
    let t0 = Utc::now();

    let first = s
        .run_cycle(ObservationBatch::new(vec![radar(48.01, 11.01, t0)]))
        .unwrap();
    assert_eq!(first.deltas.len(), 1);
    assert_eq!(first.deltas[0].kind, TrackDeltaKind::Created);
    assert_eq!(first.deltas[0].status, TrackStatus::Candidate);
    let early_confidence = first.deltas[0].confidence;

    let second = cycle(
        &mut s,
        Some(radar(48.0101, 11.01, t0 + Duration::seconds(1))),
        t0,
    );
    assert_eq!(second, TrackStatus::Tentative);

    let third = cycle(
        &mut s,
        Some(radar(48.0102, 11.01, t0 + Duration::seconds(2))),
        t0,
    );
    assert_eq!(third, TrackStatus::Confirmed);

    // Repeated sightings tighten the state and raise confidence.
    let track = &s.tracks()[0];
    assert!(track.confidence > early_confidence);
    assert_eq!(s.picture().len(), 1);
}

#[test]
fn confirmation_happens_exactly_when_m_hits_accumulate() {
    // Default rule: 3 of 5. Pattern hit-miss-hit-hit confirms on the
    // fourth cycle and not before.
    let mut s = session();
    let t0 = Utc::now();

    let s1 = cycle(&mut s, Some(radar(48.01, 11.01, t0)), t0);
    assert_eq!(s1, TrackStatus::Candidate);

    let t1 = t0 + Duration::seconds(1);
    let s2 = cycle(&mut s, None, t1);
    assert_eq!(s2, TrackStatus::Candidate);

    let t2 = t0 + Duration::seconds(2);
    let s3 = cycle(&mut s, Some(radar(48.0101, 11.01, t2)), t2);
    assert_eq!(s3, TrackStatus::Tentative, "two hits are not enough");

    let t3 = t0 + Duration::seconds(3);
    let s4 = cycle(&mut s, Some(radar(48.0102, 11.01, t3)), t3);
    assert_eq!(s4, TrackStatus::Confirmed, "third hit inside N=5 confirms");
}

#[test]
fn hopeless_candidate_is_pruned_before_the_window_closes() {
    let mut s = session();
    let t0 = Utc::now();
    cycle(&mut s, Some(radar(48.01, 11.01, t0)), t0);

    // With N=5 and the birth hit spent, three straight misses make three
    // hits unreachable.
    for i in 1..=2 {
        let t = t0 + Duration::seconds(i);
        let status = cycle(&mut s, None, t);
        assert_eq!(status, TrackStatus::Candidate);
    }
    let t = t0 + Duration::seconds(3);
    let out = s.run_cycle(ObservationBatch::new(Vec::new()).at(t)).unwrap();
    assert_eq!(out.deltas[0].kind, TrackDeltaKind::Deleted);
    assert!(s.tracks().is_empty());
}

#[test]
fn lost_contact_coasts_then_deletes_on_exact_timeout() {
    let mut s = session();
    let config = s.config().clone();
    let t0 = Utc::now();

    // Confirm.
    for i in 0..3 {
        let t = t0 + Duration::seconds(i);
        cycle(&mut s, Some(radar(48.01, 11.01, t)), t);
    }
    assert_eq!(s.tracks()[0].status, TrackStatus::Confirmed);
    let trace_at_confirmation = s.tracks()[0].position_trace();

    // Contact lost. Confirmed survives idle_to_coast - 1 misses.
    let mut t = t0 + Duration::seconds(3);
    for miss in 1..config.idle_to_coast_cycles {
        let status = cycle(&mut s, None, t);
        assert_eq!(status, TrackStatus::Confirmed, "miss {miss} too early to coast");
        t = t + Duration::seconds(1);
    }
    let status = cycle(&mut s, None, t);
    assert_eq!(status, TrackStatus::Coasting);
    t = t + Duration::seconds(1);

    // Coasting is predicted-only: uncertainty must grow.
    assert!(s.tracks()[0].position_trace() > trace_at_confirmation);

    // Exactly coast_timeout_cycles more misses delete the track.
    for c in 1..config.coast_timeout_cycles {
        let status = cycle(&mut s, None, t);
        assert_eq!(status, TrackStatus::Coasting, "coast cycle {c} deleted early");
        t = t + Duration::seconds(1);
    }
    let out = s.run_cycle(ObservationBatch::new(Vec::new()).at(t)).unwrap();
    assert_eq!(out.deltas[0].kind, TrackDeltaKind::Deleted);
    assert!(s.tracks().is_empty());
}

#[test]
fn coast_timing_follows_configured_thresholds() {
    // Slow-decay configuration: 11 idle cycles before coasting, 10 more
    // before deletion. Silence deletes at exactly miss 21.
    let config = SessionConfig::builder(origin())
        .idle_to_coast_cycles(11)
        .coast_timeout_cycles(10)
        .build()
        .unwrap();
    let mut s = FusionSession::new(config).unwrap();
    let t0 = Utc::now();

    for i in 0..3 {
        let t = t0 + Duration::seconds(i);
        cycle(&mut s, Some(radar(48.01, 11.01, t)), t);
    }
    assert_eq!(s.tracks()[0].status, TrackStatus::Confirmed);

    let mut t = t0 + Duration::seconds(3);
    for miss in 1..=21u32 {
        let status = cycle(&mut s, None, t);
        match miss {
            m if m < 11 => assert_eq!(status, TrackStatus::Confirmed, "miss {m}"),
            m if m < 21 => assert_eq!(status, TrackStatus::Coasting, "miss {m}"),
            _ => assert_eq!(status, TrackStatus::Deleted),
        }
        t = t + Duration::seconds(1);
    }
    assert!(s.tracks().is_empty());
}

#[test]
fn coasting_track_reacquires_and_keeps_its_id() {
    let mut s = session();
    let t0 = Utc::now();

    for i in 0..3 {
        let t = t0 + Duration::seconds(i);
        cycle(&mut s, Some(radar(48.01, 11.01, t)), t);
    }
    let id = s.tracks()[0].id;

    let mut t = t0 + Duration::seconds(3);
    for _ in 0..3 {
        cycle(&mut s, None, t);
        t = t + Duration::seconds(1);
    }
    assert_eq!(s.tracks()[0].status, TrackStatus::Coasting);

    // The entity shows up again near the predicted position.
    let status = cycle(&mut s, Some(radar(48.0101, 11.0101, t)), t);
    assert_eq!(status, TrackStatus::Confirmed);
    assert_eq!(s.tracks()[0].id, id, "reacquisition must not mint a new id");
}

#[test]
fn confidence_is_always_in_unit_range() {
    let mut s = session();
    let t0 = Utc::now();
    for i in 0..12 {
        let t = t0 + Duration::seconds(i);
        let sighting = (i % 3 != 2).then(|| radar(48.01 + i as f64 * 1e-4, 11.01, t));
        let batch = match sighting {
            Some(obs) => ObservationBatch::new(vec![obs]),
            None => ObservationBatch::new(Vec::new()).at(t),
        };
        let out = s.run_cycle(batch).unwrap();
        for delta in &out.deltas {
            assert!(
                (0.0..=1.0).contains(&delta.confidence),
                "confidence {} out of range",
                delta.confidence
            );
        }
    }
}

#[test]
fn deleted_tracks_never_reappear() {
    let mut s = session();
    let t0 = Utc::now();
    cycle(&mut s, Some(radar(48.01, 11.01, t0)), t0);
    let id = s.tracks()[0].id;

    // Prune the candidate.
    for i in 1..=3 {
        let t = t0 + Duration::seconds(i);
        cycle(&mut s, None, t);
    }
    assert!(s.tracks().is_empty());

    // A fresh sighting at the same spot creates a new identity.
    let t = t0 + Duration::seconds(4);
    cycle(&mut s, Some(radar(48.01, 11.01, t)), t);
    assert_eq!(s.tracks().len(), 1);
    assert_ne!(s.tracks()[0].id, id);
}
