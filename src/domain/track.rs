//! Track entity, lifecycle status, history, and output deltas.
//!
//! A [`Track`] is the mutable estimate of one physical entity, owned
//! exclusively by its fusion session. Components other than the session
//! mutate track *contents* only; creation and removal of entries is the
//! session's job.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::observation::{
    ClassificationMarking, EntityType, Observation, SourceId, SourceType,
};
use crate::estimation::imm::ImmState;
use crate::estimation::{StateCovariance, StateVector};

// ---------------------------------------------------------------------------
// TrackId
// ---------------------------------------------------------------------------

/// Stable identifier for a track. Survives merges: the absorbed track's id
/// is retained as an alias of the canonical id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TrackId(Uuid);

impl TrackId {
    /// Allocate a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Borrow the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a track.
///
/// `Candidate -> Tentative -> Confirmed -> Coasting -> Deleted`, with
/// `Coasting -> Confirmed` on reacquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TrackStatus {
    /// Born from a single unassociated observation this cycle.
    Candidate,
    /// Received a second association; awaiting M-of-N confirmation.
    Tentative,
    /// Confirmed by the M-of-N rule.
    Confirmed,
    /// No recent associations; predicted-only, covariance growing.
    Coasting,
    /// Coast timeout expired. Logically destroyed; terminal.
    Deleted,
}

impl TrackStatus {
    /// Tracks in these states take part in gating and association.
    pub fn is_associable(&self) -> bool {
        !matches!(self, TrackStatus::Deleted)
    }
}

// ---------------------------------------------------------------------------
// Contributing sources and history
// ---------------------------------------------------------------------------

/// Record of one source's contribution to a track.
#[derive(Debug, Clone, Serialize)]
pub struct ContributingSource {
    /// The concrete sensor / collection source
    pub source_id: SourceId,
    /// Sensor category
    pub source_type: SourceType,
    /// Accumulated contribution weight
    pub weight: f64,
    /// Last time this source contributed an association
    pub last_contribution: DateTime<Utc>,
}

/// One entry of the bounded state history kept per track.
#[derive(Debug, Clone)]
pub struct TrackSnapshot {
    /// State timestamp
    pub timestamp: DateTime<Utc>,
    /// Combined state vector at that time
    pub state: StateVector,
    /// Position covariance trace at that time (m^2)
    pub position_trace: f64,
    /// Status at that time
    pub status: TrackStatus,
    /// Confidence at that time
    pub confidence: f64,
}

/// Bounded record of recent cycles used by the M-of-N confirmation rule:
/// one bit per cycle since birth, capped at the window length N.
#[derive(Debug, Clone)]
pub struct AssociationWindow {
    cycles: VecDeque<bool>,
    capacity: usize,
}

impl AssociationWindow {
    /// Create a window over the last `n` cycles.
    pub fn new(n: usize) -> Self {
        Self {
            cycles: VecDeque::with_capacity(n),
            capacity: n.max(1),
        }
    }

    /// Record whether the current cycle produced an association.
    pub fn record(&mut self, associated: bool) {
        if self.cycles.len() == self.capacity {
            self.cycles.pop_front();
        }
        self.cycles.push_back(associated);
    }

    /// Number of associated cycles in the window.
    pub fn hits(&self) -> usize {
        self.cycles.iter().filter(|&&b| b).count()
    }

    /// Number of cycles recorded (<= N).
    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    /// True when no cycles are recorded yet.
    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }

    /// Whether reaching `m` hits is still possible given the remaining
    /// room in the window. Used to prune hopeless candidates early.
    pub fn can_still_reach(&self, m: usize) -> bool {
        let remaining = self.capacity.saturating_sub(self.cycles.len());
        self.hits() + remaining >= m
    }
}

// ---------------------------------------------------------------------------
// Track
// ---------------------------------------------------------------------------

/// A maintained estimate of one physical entity's state over time.
#[derive(Debug, Clone)]
pub struct Track {
    /// Unique id
    pub id: TrackId,
    /// Birth time (the founding observation's time); the older partner
    /// of a merge keeps the canonical id
    pub created_at: DateTime<Utc>,
    /// Lifecycle status
    pub status: TrackStatus,
    /// Multi-model estimator state (per-model states + probabilities
    /// + combined output)
    pub imm: ImmState,
    /// Timestamp of the published state; strictly increasing
    pub last_update: DateTime<Utc>,
    /// Aggregate confidence in [0, 1]
    pub confidence: f64,
    /// Entity-type classification (best contributing hypothesis)
    pub entity_type: EntityType,
    /// Confidence of the winning entity-type hypothesis
    pub entity_confidence: f64,
    /// Highest classification marking among contributors
    pub marking: ClassificationMarking,
    /// Bounded history of past state snapshots
    pub history: VecDeque<TrackSnapshot>,
    /// Contributing sources, in first-contribution order
    pub sources: Vec<ContributingSource>,
    /// Hit/miss record for M-of-N confirmation
    pub window: AssociationWindow,
    /// Consecutive cycles without association (drives coasting)
    pub consecutive_misses: u32,
    /// Cycles spent coasting since the last association
    pub coasting_cycles: u32,
    /// Ids absorbed into this track by merges
    pub aliases: Vec<TrackId>,
    history_capacity: usize,
}

impl Track {
    /// Create a candidate track born from an unassociated observation.
    ///
    /// The initial estimator state comes from the observation; the first
    /// association window entry is the birth observation itself.
    pub fn born_from(
        obs: &Observation,
        imm: ImmState,
        window_n: usize,
        history_capacity: usize,
    ) -> Self {
        let mut window = AssociationWindow::new(window_n);
        window.record(true);

        let mut track = Self {
            id: TrackId::new(),
            created_at: obs.observed_at,
            status: TrackStatus::Candidate,
            imm,
            last_update: obs.observed_at,
            confidence: obs.confidence.clamp(0.0, 1.0),
            entity_type: obs.entity_type.unwrap_or(EntityType::Unknown),
            entity_confidence: if obs.entity_type.is_some() {
                obs.confidence
            } else {
                0.0
            },
            marking: obs.marking,
            history: VecDeque::with_capacity(history_capacity),
            sources: Vec::new(),
            window,
            consecutive_misses: 0,
            coasting_cycles: 0,
            aliases: Vec::new(),
            history_capacity: history_capacity.max(1),
        };
        track.record_contribution(obs);
        track
    }

    /// Published (combined) state vector.
    pub fn state(&self) -> &StateVector {
        &self.imm.combined_state
    }

    /// Published (combined) covariance.
    pub fn covariance(&self) -> &StateCovariance {
        &self.imm.combined_covariance
    }

    /// ENU position estimate (m).
    pub fn position(&self) -> nalgebra::Vector3<f64> {
        self.imm.combined_state.fixed_rows::<3>(0).into()
    }

    /// ENU velocity estimate (m/s).
    pub fn velocity(&self) -> nalgebra::Vector3<f64> {
        self.imm.combined_state.fixed_rows::<3>(3).into()
    }

    /// Trace of the position covariance block (m^2).
    pub fn position_trace(&self) -> f64 {
        let p = self.imm.combined_covariance;
        p[(0, 0)] + p[(1, 1)] + p[(2, 2)]
    }

    /// Advance the state timestamp, enforcing strict monotonicity.
    pub fn advance_time(&mut self, t: DateTime<Utc>) {
        if t > self.last_update {
            self.last_update = t;
        }
    }

    /// Set confidence, clamped to [0, 1].
    pub fn set_confidence(&mut self, c: f64) {
        self.confidence = if c.is_finite() { c.clamp(0.0, 1.0) } else { 0.0 };
    }

    /// Account an associated observation's source and metadata.
    pub fn record_contribution(&mut self, obs: &Observation) {
        let weight = obs.reliability() * obs.confidence.max(0.05);
        match self
            .sources
            .iter_mut()
            .find(|s| s.source_id == obs.source_id)
        {
            Some(existing) => {
                existing.weight += weight;
                existing.last_contribution = obs.observed_at;
            }
            None => self.sources.push(ContributingSource {
                source_id: obs.source_id.clone(),
                source_type: obs.source_type,
                weight,
                last_contribution: obs.observed_at,
            }),
        }

        self.marking = self.marking.max(obs.marking);

        // Most-confident entity hypothesis wins; earlier reporter keeps
        // the slot on an exact tie.
        if let Some(hint) = obs.entity_type {
            if obs.confidence > self.entity_confidence {
                self.entity_type = hint;
                self.entity_confidence = obs.confidence;
            }
        }
    }

    /// Push the current published state onto the bounded history.
    pub fn push_snapshot(&mut self) {
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(TrackSnapshot {
            timestamp: self.last_update,
            state: self.imm.combined_state,
            position_trace: self.position_trace(),
            status: self.status,
            confidence: self.confidence,
        });
    }

    /// Number of distinct contributing sources.
    pub fn source_diversity(&self) -> usize {
        self.sources.len()
    }

    /// Sum of reliability-scaled contribution weights, saturating.
    pub fn source_weight(&self) -> f64 {
        self.sources.iter().map(|s| s.weight).sum()
    }
}

// ---------------------------------------------------------------------------
// Output deltas
// ---------------------------------------------------------------------------

/// What happened to a track during one cycle, for downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackDeltaKind {
    /// Track created this cycle
    Created,
    /// Track state/lifecycle updated this cycle
    Updated,
    /// Track absorbed another track this cycle
    Merged,
    /// Track transitioned to `Deleted` this cycle
    Deleted,
}

/// Compact covariance description carried on the output contract.
#[derive(Debug, Clone, Serialize)]
pub struct CovarianceSummary {
    /// Trace of the position block (m^2)
    pub position_trace: f64,
    /// Full covariance diagonal (9 entries)
    pub diagonal: Vec<f64>,
}

/// One element of the per-cycle output delta set.
#[derive(Debug, Clone, Serialize)]
pub struct TrackDelta {
    /// What happened
    pub kind: TrackDeltaKind,
    /// Track id
    pub track_id: TrackId,
    /// Id of the track absorbed by a merge, if `kind == Merged`
    pub absorbed_id: Option<TrackId>,
    /// Lifecycle status after the cycle
    pub status: TrackStatus,
    /// State vector [pE, pN, pU, vE, vN, vU, aE, aN, aU]
    pub state: Vec<f64>,
    /// Covariance summary
    pub covariance: CovarianceSummary,
    /// Aggregate confidence
    pub confidence: f64,
    /// Entity-type classification
    pub entity_type: EntityType,
    /// Contributing sources with weights, first-contribution order
    pub sources: Vec<ContributingSource>,
    /// Last state update time
    pub last_update: DateTime<Utc>,
    /// Classification marking
    pub marking: ClassificationMarking,
}

impl TrackDelta {
    /// Build a delta describing the track's current published state.
    pub fn from_track(kind: TrackDeltaKind, track: &Track) -> Self {
        let cov = track.covariance();
        Self {
            kind,
            track_id: track.id,
            absorbed_id: None,
            status: track.status,
            state: track.state().iter().copied().collect(),
            covariance: CovarianceSummary {
                position_trace: track.position_trace(),
                diagonal: (0..9).map(|i| cov[(i, i)]).collect(),
            },
            confidence: track.confidence,
            entity_type: track.entity_type,
            sources: track.sources.clone(),
            last_update: track.last_update,
            marking: track.marking,
        }
    }
}
