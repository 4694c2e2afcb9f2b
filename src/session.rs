//! The fusion session: one region, one ENU frame, one track set.
//!
//! [`FusionSession::run_cycle`] drives the whole pipeline for one
//! observation batch: dedup, lateness handling, per-track prediction,
//! gating, association, estimator updates, lifecycle management, the
//! merge pass, and delta emission. The session is single-threaded by
//! construction; concurrency lives in [`runtime`](crate::runtime).

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::association::{
    make_strategy, Assignment, AssociationStrategy, CandidatePair,
};
use crate::config::SessionConfig;
use crate::domain::{
    EnuFrame, GeoPosition, Observation, ObservationId, Track, TrackDelta, TrackDeltaKind,
    TrackId, TrackStatus,
};
use crate::estimation::imm::ImmState;
use crate::estimation::EnuMeasurement;
use crate::manager::TrackManager;
use crate::Result;

/// Bound on the remembered-observation set used for idempotent ingestion.
const SEEN_CAPACITY: usize = 8_192;
/// Floor on the attachment radius of a confirmed-track digest entry (m).
const MIN_ATTACH_RADIUS_M: f64 = 500.0;

// ---------------------------------------------------------------------------
// Input batch
// ---------------------------------------------------------------------------

/// One cycle's worth of observations.
#[derive(Debug, Clone)]
pub struct ObservationBatch {
    /// The observations, any order
    pub observations: Vec<Observation>,
    /// Nominal time of the cycle; defaults to the newest observation
    pub batch_time: DateTime<Utc>,
    /// When set, the batch is treated as one simultaneous multi-sensor
    /// snapshot: leftover observations that gate unambiguously to an
    /// already-updated track are fused into it instead of spawning
    /// duplicate candidates.
    pub simultaneous: bool,
}

impl ObservationBatch {
    /// Batch with `batch_time` = the newest observation time (now when
    /// empty).
    pub fn new(observations: Vec<Observation>) -> Self {
        let batch_time = observations
            .iter()
            .map(|o| o.observed_at)
            .max()
            .unwrap_or_else(Utc::now);
        Self {
            observations,
            batch_time,
            simultaneous: false,
        }
    }

    /// Mark the batch as a simultaneous multi-sensor snapshot.
    pub fn simultaneous(mut self) -> Self {
        self.simultaneous = true;
        self
    }

    /// Override the batch time.
    pub fn at(mut self, t: DateTime<Utc>) -> Self {
        self.batch_time = t;
        self
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Lock-free session counters, shared with the runtime handle.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Observations accepted into a cycle
    pub observations_ingested: AtomicU64,
    /// Re-delivered observation ids ignored
    pub duplicates_dropped: AtomicU64,
    /// Late observations beyond the lateness window (or beyond checkpoint
    /// retention) dropped
    pub late_dropped: AtomicU64,
    /// Late observations folded in via checkpoint replay
    pub late_replayed: AtomicU64,
    /// Cycles re-run by checkpoint replay
    pub cycles_replayed: AtomicU64,
    /// Candidate pairs rejected by the association gate
    pub gate_rejections: AtomicU64,
    /// Tracks created
    pub tracks_created: AtomicU64,
    /// Tracks that reached `Confirmed`
    pub tracks_confirmed: AtomicU64,
    /// Tracks deleted (pruned, timed out, or absorbed)
    pub tracks_deleted: AtomicU64,
    /// Merges committed
    pub tracks_merged: AtomicU64,
    /// Merge candidates skipped as conflicts
    pub merge_conflicts: AtomicU64,
    /// Covariance resets forced by the feasibility check
    pub covariance_resets: AtomicU64,
    /// Observations dropped by the runner's back-pressure policy
    pub overload_dropped: AtomicU64,
    /// Cycles processed
    pub cycles: AtomicU64,
    /// Mean confidence over live tracks, stored as f64 bits
    mean_confidence_bits: AtomicU64,
}

impl SessionStats {
    fn set_mean_confidence(&self, c: f64) {
        self.mean_confidence_bits
            .store(c.to_bits(), Ordering::Relaxed);
    }

    /// Mean confidence over live tracks after the latest cycle.
    pub fn mean_confidence(&self) -> f64 {
        f64::from_bits(self.mean_confidence_bits.load(Ordering::Relaxed))
    }

    /// Copy the counters into a serializable snapshot.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        StatsSnapshot {
            observations_ingested: load(&self.observations_ingested),
            duplicates_dropped: load(&self.duplicates_dropped),
            late_dropped: load(&self.late_dropped),
            late_replayed: load(&self.late_replayed),
            cycles_replayed: load(&self.cycles_replayed),
            gate_rejections: load(&self.gate_rejections),
            tracks_created: load(&self.tracks_created),
            tracks_confirmed: load(&self.tracks_confirmed),
            tracks_deleted: load(&self.tracks_deleted),
            tracks_merged: load(&self.tracks_merged),
            merge_conflicts: load(&self.merge_conflicts),
            covariance_resets: load(&self.covariance_resets),
            overload_dropped: load(&self.overload_dropped),
            cycles: load(&self.cycles),
            mean_confidence: self.mean_confidence(),
        }
    }
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Serialize)]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub observations_ingested: u64,
    pub duplicates_dropped: u64,
    pub late_dropped: u64,
    pub late_replayed: u64,
    pub cycles_replayed: u64,
    pub gate_rejections: u64,
    pub tracks_created: u64,
    pub tracks_confirmed: u64,
    pub tracks_deleted: u64,
    pub tracks_merged: u64,
    pub merge_conflicts: u64,
    pub covariance_resets: u64,
    pub overload_dropped: u64,
    pub cycles: u64,
    pub mean_confidence: f64,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Result of one processing cycle.
#[derive(Debug, Clone)]
pub struct CycleOutput {
    /// The (monotonic) time stamped onto this cycle's states
    pub cycle_time: DateTime<Utc>,
    /// What changed, for downstream picture consumers
    pub deltas: Vec<TrackDelta>,
}

/// One entry of the confirmed-track digest the runner consults for its
/// back-pressure drop policy.
#[derive(Debug, Clone, Copy)]
pub struct DigestEntry {
    /// Track position lifted back to WGS84
    pub position: GeoPosition,
    /// Attachment radius (m): observations within it count as attached
    pub radius_m: f64,
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// State snapshot taken before a batch was applied, kept for
/// late-observation replay.
struct Checkpoint {
    tracks: Vec<Track>,
    last_cycle_time: Option<DateTime<Utc>>,
    batch: ObservationBatch,
    /// Ids minted when this batch ran, keyed by the founding observation.
    /// Re-running the batch reissues them so published ids stay stable.
    minted: Vec<(ObservationId, TrackId)>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A single-region fusion session.
pub struct FusionSession {
    config: SessionConfig,
    frame: EnuFrame,
    tracks: Vec<Track>,
    strategy: Box<dyn AssociationStrategy>,
    manager: TrackManager,
    stats: Arc<SessionStats>,
    seen_ids: HashSet<ObservationId>,
    seen_order: VecDeque<ObservationId>,
    last_cycle_time: Option<DateTime<Utc>>,
    checkpoints: VecDeque<Checkpoint>,
    digest: Arc<RwLock<Vec<DigestEntry>>>,
    /// Set while re-running checkpointed cycles; suppresses the event
    /// counters those cycles already incremented on their first run.
    in_replay: bool,
    /// Ids to reissue during a replayed cycle, keyed by founding
    /// observation id.
    reissue: Vec<(ObservationId, TrackId)>,
}

impl FusionSession {
    /// Create a session; fails fast on an invalid configuration.
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let frame = EnuFrame::new(config.origin);
        let strategy = make_strategy(&config);
        Ok(Self {
            config,
            frame,
            tracks: Vec::new(),
            strategy,
            manager: TrackManager,
            stats: Arc::new(SessionStats::default()),
            seen_ids: HashSet::new(),
            seen_order: VecDeque::new(),
            last_cycle_time: None,
            checkpoints: VecDeque::new(),
            digest: Arc::new(RwLock::new(Vec::new())),
            in_replay: false,
            reissue: Vec::new(),
        })
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The session's ENU frame.
    pub fn frame(&self) -> &EnuFrame {
        &self.frame
    }

    /// Shared statistics handle.
    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    /// Shared confirmed-track digest handle (for the runner's drop
    /// policy).
    pub fn digest(&self) -> Arc<RwLock<Vec<DigestEntry>>> {
        Arc::clone(&self.digest)
    }

    /// Live tracks (no `Deleted` entries).
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Current Common Operational Picture: one delta per confirmed or
    /// coasting track.
    pub fn picture(&self) -> Vec<TrackDelta> {
        self.tracks
            .iter()
            .filter(|t| matches!(t.status, TrackStatus::Confirmed | TrackStatus::Coasting))
            .map(|t| TrackDelta::from_track(TrackDeltaKind::Updated, t))
            .collect()
    }

    /// Run one full processing cycle over a batch.
    pub fn run_cycle(&mut self, batch: ObservationBatch) -> Result<CycleOutput> {
        let ObservationBatch {
            observations,
            batch_time,
            simultaneous,
        } = batch;

        // Idempotent ingestion: a re-delivered id is a no-op.
        let mut fresh = Vec::with_capacity(observations.len());
        for obs in observations {
            if self.seen_ids.contains(&obs.id) {
                self.stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.remember(obs.id);
            fresh.push(obs);
        }

        // Lateness partition relative to the batch time and the last
        // processed cycle.
        let window = Duration::milliseconds((self.config.lateness_window_secs * 1_000.0) as i64);
        let cutoff = batch_time - window;
        let mut current = Vec::with_capacity(fresh.len());
        let mut late = Vec::new();
        for obs in fresh {
            if obs.observed_at < cutoff {
                self.stats.late_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(obs = %obs.id, "dropped observation beyond lateness window");
            } else if self
                .last_cycle_time
                .is_some_and(|last| obs.observed_at <= last)
            {
                late.push(obs);
            } else {
                current.push(obs);
            }
        }

        if !late.is_empty() {
            self.replay_late(late);
        }

        self.process_batch(ObservationBatch {
            observations: current,
            batch_time,
            simultaneous,
        })
    }

    /// Fold late-but-in-window observations in by restoring the newest
    /// checkpoint that precedes them and re-running the affected cycles.
    fn replay_late(&mut self, late: Vec<Observation>) {
        let t_min = late
            .iter()
            .map(|o| o.observed_at)
            .min()
            .expect("late set is non-empty");

        let Some(restore_at) = self
            .checkpoints
            .iter()
            .position(|c| c.batch.batch_time >= t_min)
        else {
            // Older than everything we retained; nothing to replay into.
            self.stats
                .late_dropped
                .fetch_add(late.len() as u64, Ordering::Relaxed);
            tracing::warn!(
                count = late.len(),
                "late observations beyond checkpoint retention dropped"
            );
            return;
        };

        let checkpoint = &self.checkpoints[restore_at];
        self.tracks = checkpoint.tracks.clone();
        self.last_cycle_time = checkpoint.last_cycle_time;
        let mut replay: Vec<(ObservationBatch, Vec<(ObservationId, TrackId)>)> = self
            .checkpoints
            .drain(restore_at..)
            .map(|c| (c.batch, c.minted))
            .collect();

        // Slot each late observation into the earliest replayed batch
        // that covers its time.
        self.stats
            .late_replayed
            .fetch_add(late.len() as u64, Ordering::Relaxed);
        self.stats
            .observations_ingested
            .fetch_add(late.len() as u64, Ordering::Relaxed);
        for obs in late {
            let slot = replay
                .iter()
                .position(|(b, _)| b.batch_time >= obs.observed_at)
                .unwrap_or(replay.len() - 1);
            replay[slot].0.observations.push(obs);
        }

        let replayed = replay.len() as u64;
        self.in_replay = true;
        for (batch, minted) in replay {
            self.reissue = minted;
            // Replay failures would mean a corrupted checkpoint; surface
            // them loudly but keep the session alive.
            if let Err(err) = self.process_batch(batch) {
                tracing::error!(error = %err, "checkpoint replay cycle failed");
            }
        }
        self.reissue.clear();
        self.in_replay = false;
        self.stats
            .cycles_replayed
            .fetch_add(replayed, Ordering::Relaxed);
        tracing::info!(cycles = replayed, "replayed cycles for late observations");
    }

    /// The core pipeline for one batch. Checkpoints the pre-batch state,
    /// then predicts, gates, associates, updates, manages lifecycle,
    /// merges, and emits deltas.
    fn process_batch(&mut self, batch: ObservationBatch) -> Result<CycleOutput> {
        // Replayed cycles already incremented the event counters on their
        // first run; only the replay-specific counters move again.
        let counting = !self.in_replay;
        if counting {
            self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        }
        self.push_checkpoint(&batch);

        let ObservationBatch {
            observations,
            batch_time,
            simultaneous,
        } = batch;

        // Strictly increasing cycle time even when a producer repeats or
        // rewinds its batch clock.
        let cycle_time = match self.last_cycle_time {
            Some(last) if batch_time <= last => last + Duration::milliseconds(1),
            _ => batch_time,
        };
        let dt = self
            .last_cycle_time
            .map(|last| (cycle_time - last).num_milliseconds() as f64 / 1_000.0)
            .unwrap_or(0.0);

        if counting {
            self.stats
                .observations_ingested
                .fetch_add(observations.len() as u64, Ordering::Relaxed);
        }

        // Interaction + prediction for every live track.
        if dt > 0.0 {
            for track in &mut self.tracks {
                track.imm.mix(&self.config.estimator);
                track.imm.predict(dt, &self.config.estimator);
            }
        }

        let measurements: Vec<EnuMeasurement> = observations
            .iter()
            .map(|obs| EnuMeasurement::from_observation(obs, &self.frame))
            .collect();

        let pairs = self.gate(&observations, &measurements);
        let n_pre_existing = self.tracks.len();
        let outcome = self
            .strategy
            .associate(&pairs, n_pre_existing, observations.len());

        let mut hits = vec![false; n_pre_existing];
        let mut resets = vec![0u32; n_pre_existing];

        for assignment in &outcome.assignments {
            match assignment {
                Assignment::Hard { track_idx, obs_idx } => {
                    let track = &mut self.tracks[*track_idx];
                    let report = track
                        .imm
                        .update(&measurements[*obs_idx], &self.config.estimator);
                    resets[*track_idx] += report.covariance_resets;
                    track.record_contribution(&observations[*obs_idx]);
                    hits[*track_idx] = true;
                }
                Assignment::Soft {
                    track_idx,
                    weights,
                    beta_none,
                } => {
                    if weights.is_empty() {
                        continue;
                    }
                    let weighted: Vec<(&EnuMeasurement, f64)> = weights
                        .iter()
                        .map(|(o, b)| (&measurements[*o], *b))
                        .collect();
                    let track = &mut self.tracks[*track_idx];
                    let report =
                        track
                            .imm
                            .update_weighted(&weighted, *beta_none, &self.config.estimator);
                    resets[*track_idx] += report.covariance_resets;
                    for (o, _) in weights {
                        track.record_contribution(&observations[*o]);
                    }
                    hits[*track_idx] = true;
                }
            }
        }

        // A simultaneous multi-sensor snapshot: fold leftover observations
        // into the single already-updated track they gate to, rather than
        // spawning a duplicate candidate next to it. Sequential updates to
        // the same track run in descending source-reliability order.
        let mut initiations = outcome.unassigned_observations;
        if simultaneous {
            initiations.sort_by(|&a, &b| {
                observations[b]
                    .reliability()
                    .total_cmp(&observations[a].reliability())
            });
            initiations.retain(|&o| {
                let gated: Vec<usize> = pairs
                    .iter()
                    .filter(|p| p.obs_idx == o && hits[p.track_idx])
                    .map(|p| p.track_idx)
                    .collect();
                match gated.as_slice() {
                    [only] => {
                        let track = &mut self.tracks[*only];
                        let report = track
                            .imm
                            .update(&measurements[o], &self.config.estimator);
                        resets[*only] += report.covariance_resets;
                        track.record_contribution(&observations[o]);
                        false
                    }
                    _ => true,
                }
            });
        }

        // Remaining unassociated observations each start a candidate. A
        // replayed cycle reissues the id the same founding observation
        // minted on its first run, so published ids survive the rollback.
        let mut created: Vec<(ObservationId, TrackId)> = Vec::new();
        for o in initiations {
            let imm = ImmState::from_measurement(&measurements[o], &self.config.estimator);
            let mut track = Track::born_from(
                &observations[o],
                imm,
                self.config.confirm_n,
                self.config.history_capacity,
            );
            if let Some(pos) = self
                .reissue
                .iter()
                .position(|(obs_id, _)| *obs_id == observations[o].id)
            {
                track.id = self.reissue.swap_remove(pos).1;
            }
            created.push((observations[o].id, track.id));
            self.tracks.push(track);
            if counting {
                self.stats.tracks_created.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(checkpoint) = self.checkpoints.back_mut() {
            checkpoint.minted = created.clone();
        }

        // Lifecycle transitions for pre-existing tracks only; newborns
        // already counted their birth cycle.
        let lifecycle = self
            .manager
            .apply_cycle(&mut self.tracks, &hits, &self.config);
        if counting {
            self.stats
                .tracks_confirmed
                .fetch_add(lifecycle.newly_confirmed.len() as u64, Ordering::Relaxed);
            let total_resets: u32 = resets.iter().sum();
            self.stats
                .covariance_resets
                .fetch_add(u64::from(total_resets), Ordering::Relaxed);
        }

        for (i, track) in self.tracks.iter_mut().enumerate() {
            if track.status == TrackStatus::Deleted {
                continue;
            }
            track.advance_time(cycle_time);
            let track_resets = resets.get(i).copied().unwrap_or(0);
            self.manager
                .score_confidence(track, track_resets, &self.config);
        }

        let merges = self.manager.merge_pass(&mut self.tracks, &self.config);
        if counting {
            self.stats
                .tracks_merged
                .fetch_add(merges.merges.len() as u64, Ordering::Relaxed);
            self.stats
                .merge_conflicts
                .fetch_add(u64::from(merges.conflicts), Ordering::Relaxed);
        }

        for track in &mut self.tracks {
            if track.status != TrackStatus::Deleted {
                track.push_snapshot();
            }
        }

        // Deltas: creations, merges, deletions, then plain updates.
        let mut deltas = Vec::new();
        for track in &self.tracks {
            if track.status == TrackStatus::Deleted {
                deltas.push(TrackDelta::from_track(TrackDeltaKind::Deleted, track));
                if counting {
                    self.stats.tracks_deleted.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            }
            if created.iter().any(|(_, id)| *id == track.id) {
                deltas.push(TrackDelta::from_track(TrackDeltaKind::Created, track));
            } else if let Some(merge) = merges.merges.iter().find(|m| m.kept == track.id) {
                let mut delta = TrackDelta::from_track(TrackDeltaKind::Merged, track);
                delta.absorbed_id = Some(merge.absorbed);
                deltas.push(delta);
            } else {
                deltas.push(TrackDelta::from_track(TrackDeltaKind::Updated, track));
            }
        }

        self.tracks.retain(|t| t.status != TrackStatus::Deleted);
        self.refresh_digest();

        let live = self.tracks.len();
        let mean = if live > 0 {
            self.tracks.iter().map(|t| t.confidence).sum::<f64>() / live as f64
        } else {
            0.0
        };
        self.stats.set_mean_confidence(mean);

        self.last_cycle_time = Some(cycle_time);
        tracing::debug!(
            cycle_time = %cycle_time,
            tracks = live,
            deltas = deltas.len(),
            "cycle complete"
        );
        Ok(CycleOutput { cycle_time, deltas })
    }

    /// Chi-square gating over every (track, observation) pairing.
    fn gate(
        &self,
        observations: &[Observation],
        measurements: &[EnuMeasurement],
    ) -> Vec<CandidatePair> {
        let mut pairs = Vec::new();
        for (t, track) in self.tracks.iter().enumerate() {
            if !track.status.is_associable() {
                continue;
            }
            for (o, meas) in measurements.iter().enumerate() {
                let Some(d) = track.imm.distance_sq(meas) else {
                    continue;
                };
                if d > self.config.gate_threshold(meas.dim()) {
                    if !self.in_replay {
                        self.stats.gate_rejections.fetch_add(1, Ordering::Relaxed);
                    }
                    continue;
                }
                pairs.push(CandidatePair {
                    track_idx: t,
                    obs_idx: o,
                    track_id: track.id,
                    obs_id: observations[o].id,
                    distance_sq: d,
                    likelihood: track.imm.likelihood(meas),
                    reliability: observations[o].reliability(),
                    observed_at: observations[o].observed_at,
                });
            }
        }
        pairs
    }

    fn remember(&mut self, id: ObservationId) {
        if self.seen_order.len() == SEEN_CAPACITY {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen_ids.remove(&old);
            }
        }
        self.seen_order.push_back(id);
        self.seen_ids.insert(id);
    }

    fn push_checkpoint(&mut self, batch: &ObservationBatch) {
        if self.checkpoints.len() == self.config.max_checkpoints {
            self.checkpoints.pop_front();
        }
        self.checkpoints.push_back(Checkpoint {
            tracks: self.tracks.clone(),
            last_cycle_time: self.last_cycle_time,
            batch: batch.clone(),
            minted: Vec::new(),
        });
    }

    fn refresh_digest(&self) {
        let entries: Vec<DigestEntry> = self
            .tracks
            .iter()
            .filter(|t| t.status == TrackStatus::Confirmed)
            .map(|t| {
                let p = t.position();
                let enu = crate::domain::EnuPosition::new(p[0], p[1], p[2]);
                DigestEntry {
                    position: self.frame.to_geo(&enu),
                    radius_m: (t.position_trace().sqrt() * 3.0).max(MIN_ATTACH_RADIUS_M),
                }
            })
            .collect();
        *self.digest.write() = entries;
    }
}
