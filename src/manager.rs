//! Track lifecycle management: M-of-N confirmation, coasting, deletion,
//! confidence scoring, and the merge pass over the live track set.
//!
//! The manager mutates tracks in place and reports what changed; the
//! session owns the track vector and turns the reports into output
//! deltas.

use crate::config::SessionConfig;
use crate::domain::{Track, TrackId, TrackStatus};

/// What the lifecycle step did to the track set in one cycle.
#[derive(Debug, Clone, Default)]
pub struct LifecycleReport {
    /// Tracks that reached `Confirmed` this cycle
    pub newly_confirmed: Vec<TrackId>,
    /// Tracks that entered `Coasting` this cycle
    pub newly_coasting: Vec<TrackId>,
    /// Tracks deleted by coast timeout
    pub timed_out: Vec<TrackId>,
    /// Candidates pruned because M hits became unreachable
    pub pruned_candidates: Vec<TrackId>,
}

/// One committed merge.
#[derive(Debug, Clone, Copy)]
pub struct MergeRecord {
    /// Surviving (canonical) track
    pub kept: TrackId,
    /// Track absorbed and deleted
    pub absorbed: TrackId,
}

/// Result of the merge pass.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Merges committed this cycle
    pub merges: Vec<MergeRecord>,
    /// Pairs inside the merge gate that could not be merged (confidence
    /// floor, incompatible entity types, or non-invertible covariance)
    pub conflicts: u32,
}

/// Stateless lifecycle engine; all tuning comes from the session config
/// per call.
#[derive(Debug, Default)]
pub struct TrackManager;

impl TrackManager {
    /// Apply one cycle's hit/miss outcome to every track.
    ///
    /// `hits[i]` states whether `tracks[i]` received an association this
    /// cycle. Status transitions follow the M-of-N rule going up and the
    /// miss counters going down; `Deleted` is terminal and the session
    /// removes those entries after emitting deltas.
    pub fn apply_cycle(
        &self,
        tracks: &mut [Track],
        hits: &[bool],
        config: &SessionConfig,
    ) -> LifecycleReport {
        let mut report = LifecycleReport::default();

        for (track, &hit) in tracks.iter_mut().zip(hits) {
            if track.status == TrackStatus::Deleted {
                continue;
            }
            track.window.record(hit);

            if hit {
                track.consecutive_misses = 0;
                track.coasting_cycles = 0;
                match track.status {
                    TrackStatus::Candidate => {
                        // Second supporting cycle promotes to tentative.
                        if track.window.hits() >= 2 {
                            track.status = TrackStatus::Tentative;
                        }
                        if track.window.hits() >= config.confirm_m {
                            track.status = TrackStatus::Confirmed;
                            report.newly_confirmed.push(track.id);
                        }
                    }
                    TrackStatus::Tentative => {
                        if track.window.hits() >= config.confirm_m {
                            track.status = TrackStatus::Confirmed;
                            report.newly_confirmed.push(track.id);
                        }
                    }
                    TrackStatus::Coasting => {
                        track.status = TrackStatus::Confirmed;
                        tracing::debug!(track = %track.id, "coasting track reacquired");
                    }
                    TrackStatus::Confirmed | TrackStatus::Deleted => {}
                }
            } else {
                track.consecutive_misses += 1;
                match track.status {
                    TrackStatus::Candidate | TrackStatus::Tentative => {
                        if !track.window.can_still_reach(config.confirm_m) {
                            track.status = TrackStatus::Deleted;
                            report.pruned_candidates.push(track.id);
                        }
                    }
                    TrackStatus::Confirmed => {
                        if track.consecutive_misses >= config.idle_to_coast_cycles {
                            track.status = TrackStatus::Coasting;
                            track.coasting_cycles = 0;
                            report.newly_coasting.push(track.id);
                        }
                    }
                    TrackStatus::Coasting => {
                        track.coasting_cycles += 1;
                        if track.coasting_cycles >= config.coast_timeout_cycles {
                            track.status = TrackStatus::Deleted;
                            report.timed_out.push(track.id);
                        }
                    }
                    TrackStatus::Deleted => {}
                }
            }
        }
        report
    }

    /// Recompute a track's aggregate confidence.
    ///
    /// Independent-source combination over the contributing sources,
    /// discounted by state uncertainty, with a multiplicative penalty
    /// per covariance reset this cycle:
    ///
    /// ```text
    /// source_term = 1 - prod_s (1 - min(weight_s, 0.95))
    /// confidence  = source_term / (1 + trace / scale) * penalty^resets
    /// ```
    pub fn score_confidence(&self, track: &mut Track, resets: u32, config: &SessionConfig) {
        let miss_term: f64 = 1.0
            - track
                .sources
                .iter()
                .map(|s| 1.0 - s.weight.min(0.95))
                .product::<f64>();

        let trace_discount = 1.0 + track.position_trace() / config.estimator.confidence_trace_scale;
        let penalty = config.estimator.instability_penalty.powi(resets as i32);

        track.set_confidence(miss_term / trace_discount * penalty);
    }

    /// Merge pass over confirmed and coasting tracks.
    ///
    /// Pairs within the spatial merge gate are fused
    /// information-weighted into the older partner, whose id stays
    /// canonical; the newer track is deleted and its id retained as an
    /// alias. A pair inside the gate
    /// that fails the confidence floor, has incompatible entity types, or
    /// whose covariances cannot be inverted is counted as a conflict and
    /// left alone.
    pub fn merge_pass(&self, tracks: &mut [Track], config: &SessionConfig) -> MergeReport {
        let mut report = MergeReport::default();
        let n = tracks.len();

        for i in 0..n {
            for j in (i + 1)..n {
                let (a, b) = {
                    let (head, tail) = tracks.split_at_mut(j);
                    (&mut head[i], &mut tail[0])
                };
                if !is_mergeable_status(a.status) || !is_mergeable_status(b.status) {
                    continue;
                }
                let distance = (a.position() - b.position()).norm();
                if distance > config.merge_distance_m {
                    continue;
                }

                if a.confidence < config.merge_min_confidence
                    || b.confidence < config.merge_min_confidence
                    || !a.entity_type.compatible_with(&b.entity_type)
                {
                    report.conflicts += 1;
                    continue;
                }

                // The older id stays canonical; confidence only breaks
                // exact birth-time ties.
                let a_keeps = match a.created_at.cmp(&b.created_at) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Greater => false,
                    std::cmp::Ordering::Equal => a.confidence >= b.confidence,
                };
                let (keeper, absorbed) = if a_keeps { (a, b) } else { (b, a) };

                if !keeper.imm.fuse_with(&absorbed.imm) {
                    report.conflicts += 1;
                    continue;
                }

                absorb_metadata(keeper, absorbed);
                absorbed.status = TrackStatus::Deleted;
                tracing::info!(
                    kept = %keeper.id,
                    absorbed = %absorbed.id,
                    distance_m = distance,
                    "merged duplicate tracks"
                );
                report.merges.push(MergeRecord {
                    kept: keeper.id,
                    absorbed: absorbed.id,
                });
            }
        }
        report
    }
}

fn is_mergeable_status(status: TrackStatus) -> bool {
    matches!(status, TrackStatus::Confirmed | TrackStatus::Coasting)
}

/// Fold the absorbed track's identity and provenance into the keeper.
fn absorb_metadata(keeper: &mut Track, absorbed: &Track) {
    keeper.aliases.push(absorbed.id);
    keeper.aliases.extend(absorbed.aliases.iter().copied());

    for src in &absorbed.sources {
        match keeper
            .sources
            .iter_mut()
            .find(|s| s.source_id == src.source_id)
        {
            Some(existing) => {
                existing.weight += src.weight;
                existing.last_contribution = existing.last_contribution.max(src.last_contribution);
            }
            None => keeper.sources.push(src.clone()),
        }
    }

    keeper.marking = keeper.marking.max(absorbed.marking);
    if absorbed.entity_confidence > keeper.entity_confidence {
        keeper.entity_type = absorbed.entity_type;
        keeper.entity_confidence = absorbed.entity_confidence;
    }
    keeper.advance_time(absorbed.last_update);
    if keeper.status == TrackStatus::Coasting && absorbed.status == TrackStatus::Confirmed {
        keeper.status = TrackStatus::Confirmed;
    }
    keeper.confidence = keeper.confidence.max(absorbed.confidence);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EstimatorConfig;
    use crate::domain::{
        EntityType, GeoPosition, MeasurementCovariance, Observation, SourceId, SourceType,
    };
    use crate::estimation::imm::ImmState;
    use crate::estimation::EnuMeasurement;
    use chrono::Utc;
    use nalgebra::Vector3;

    fn config() -> SessionConfig {
        SessionConfig::new(GeoPosition::new(48.0, 11.0, 500.0).unwrap())
    }

    fn track_at(east: f64, north: f64, confidence: f64) -> Track {
        let obs = Observation::builder(SourceType::Radar, SourceId::new("radar-01"))
            .observed_at(Utc::now())
            .position(48.0, 11.0, 500.0)
            .confidence(0.9)
            .build()
            .unwrap();
        let meas = EnuMeasurement {
            position: Vector3::new(east, north, 0.0),
            velocity: None,
            covariance: MeasurementCovariance::from_accuracy(10.0, 10.0),
        };
        let imm = ImmState::from_measurement(&meas, &EstimatorConfig::default());
        let mut track = Track::born_from(&obs, imm, 5, 8);
        track.set_confidence(confidence);
        track
    }

    fn cycle_hits(manager: &TrackManager, track: &mut Track, pattern: &[bool]) -> LifecycleReport {
        let cfg = config();
        let mut last = LifecycleReport::default();
        for &hit in pattern {
            last = manager.apply_cycle(std::slice::from_mut(track), &[hit], &cfg);
        }
        last
    }

    #[test]
    fn confirmation_requires_m_of_n() {
        let manager = TrackManager;
        // Birth counted as the first hit; two more reach M = 3.
        let mut track = track_at(0.0, 0.0, 0.8);
        cycle_hits(&manager, &mut track, &[true]);
        assert_eq!(track.status, TrackStatus::Tentative);
        cycle_hits(&manager, &mut track, &[true]);
        assert_eq!(track.status, TrackStatus::Confirmed);
    }

    #[test]
    fn hopeless_candidate_is_pruned_early() {
        let manager = TrackManager;
        let mut track = track_at(0.0, 0.0, 0.5);
        // Window N = 5, birth hit used one slot. After misses leave fewer
        // than M - 1 open slots the candidate is dropped.
        let report = cycle_hits(&manager, &mut track, &[false, false, false]);
        assert_eq!(track.status, TrackStatus::Deleted);
        assert_eq!(report.pruned_candidates, vec![track.id]);
    }

    #[test]
    fn confirmed_coasts_after_idle_then_times_out() {
        let manager = TrackManager;
        let cfg = config();
        let mut track = track_at(0.0, 0.0, 0.8);
        track.status = TrackStatus::Confirmed;

        // idle_to_coast_cycles consecutive misses start the coast.
        for _ in 0..cfg.idle_to_coast_cycles {
            manager.apply_cycle(std::slice::from_mut(&mut track), &[false], &cfg);
        }
        assert_eq!(track.status, TrackStatus::Coasting);

        for _ in 0..cfg.coast_timeout_cycles {
            manager.apply_cycle(std::slice::from_mut(&mut track), &[false], &cfg);
        }
        assert_eq!(track.status, TrackStatus::Deleted);
    }

    #[test]
    fn coasting_track_reacquires_to_confirmed() {
        let manager = TrackManager;
        let cfg = config();
        let mut track = track_at(0.0, 0.0, 0.8);
        track.status = TrackStatus::Coasting;
        track.coasting_cycles = 4;

        manager.apply_cycle(std::slice::from_mut(&mut track), &[true], &cfg);
        assert_eq!(track.status, TrackStatus::Confirmed);
        assert_eq!(track.coasting_cycles, 0);
    }

    #[test]
    fn confidence_rises_with_sources_falls_with_uncertainty() {
        let manager = TrackManager;
        let cfg = config();
        let mut one_source = track_at(0.0, 0.0, 0.5);
        manager.score_confidence(&mut one_source, 0, &cfg);
        let single = one_source.confidence;

        let mut two_sources = track_at(0.0, 0.0, 0.5);
        let second = Observation::builder(SourceType::Satellite, SourceId::new("sat-09"))
            .observed_at(Utc::now())
            .position(48.0, 11.0, 500.0)
            .confidence(0.9)
            .build()
            .unwrap();
        two_sources.record_contribution(&second);
        manager.score_confidence(&mut two_sources, 0, &cfg);
        assert!(two_sources.confidence > single);

        // Instability penalty halves confidence per reset by default.
        let mut unstable = track_at(0.0, 0.0, 0.5);
        manager.score_confidence(&mut unstable, 1, &cfg);
        assert!(unstable.confidence < single);
    }

    #[test]
    fn merge_absorbs_near_duplicate() {
        let manager = TrackManager;
        let cfg = config();
        let mut a = track_at(0.0, 0.0, 0.9);
        let mut b = track_at(10.0, 0.0, 0.6);
        a.status = TrackStatus::Confirmed;
        b.status = TrackStatus::Confirmed;
        let (a_id, b_id) = (a.id, b.id);

        let mut tracks = vec![a, b];
        let report = manager.merge_pass(&mut tracks, &cfg);

        assert_eq!(report.merges.len(), 1);
        assert_eq!(report.merges[0].kept, a_id);
        assert_eq!(report.merges[0].absorbed, b_id);
        assert_eq!(tracks[0].status, TrackStatus::Confirmed);
        assert_eq!(tracks[1].status, TrackStatus::Deleted);
        assert!(tracks[0].aliases.contains(&b_id));
    }

    #[test]
    fn older_id_stays_canonical_even_against_higher_confidence() {
        let manager = TrackManager;
        let cfg = config();
        let mut a = track_at(0.0, 0.0, 0.6);
        let mut b = track_at(10.0, 0.0, 0.95);
        a.status = TrackStatus::Confirmed;
        b.status = TrackStatus::Confirmed;
        b.created_at = a.created_at + chrono::Duration::seconds(5);
        let (a_id, b_id) = (a.id, b.id);

        let mut tracks = vec![a, b];
        let report = manager.merge_pass(&mut tracks, &cfg);

        assert_eq!(report.merges.len(), 1);
        assert_eq!(report.merges[0].kept, a_id);
        assert_eq!(report.merges[0].absorbed, b_id);
        // The keeper still inherits the better confidence.
        assert!(tracks[0].confidence >= 0.95);
    }

    #[test]
    fn distant_tracks_do_not_merge() {
        let manager = TrackManager;
        let cfg = config();
        let mut a = track_at(0.0, 0.0, 0.9);
        let mut b = track_at(500.0, 0.0, 0.9);
        a.status = TrackStatus::Confirmed;
        b.status = TrackStatus::Confirmed;

        let mut tracks = vec![a, b];
        let report = manager.merge_pass(&mut tracks, &cfg);
        assert!(report.merges.is_empty());
        assert_eq!(report.conflicts, 0);
    }

    #[test]
    fn incompatible_entity_types_conflict_instead_of_merging() {
        let manager = TrackManager;
        let cfg = config();
        let mut a = track_at(0.0, 0.0, 0.9);
        let mut b = track_at(10.0, 0.0, 0.9);
        a.status = TrackStatus::Confirmed;
        b.status = TrackStatus::Confirmed;
        a.entity_type = EntityType::Aircraft;
        b.entity_type = EntityType::Vessel;

        let mut tracks = vec![a, b];
        let report = manager.merge_pass(&mut tracks, &cfg);
        assert!(report.merges.is_empty());
        assert_eq!(report.conflicts, 1);
    }

    #[test]
    fn low_confidence_pair_is_a_conflict() {
        let manager = TrackManager;
        let cfg = config();
        let mut a = track_at(0.0, 0.0, 0.9);
        let mut b = track_at(10.0, 0.0, 0.1);
        a.status = TrackStatus::Confirmed;
        b.status = TrackStatus::Coasting;

        let mut tracks = vec![a, b];
        let report = manager.merge_pass(&mut tracks, &cfg);
        assert!(report.merges.is_empty());
        assert_eq!(report.conflicts, 1);
    }
}
