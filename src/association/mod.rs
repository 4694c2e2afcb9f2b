//! Gating and data association.
//!
//! The session builds gated [`CandidatePair`]s (Mahalanobis distance under
//! the chi-square gate), and a per-session [`AssociationStrategy`] resolves
//! them into hard or soft [`Assignment`]s. The strategy object is selected
//! once at session construction from
//! [`AssociationStrategyKind`](crate::config::AssociationStrategyKind).

pub mod gnn;
pub mod jpda;
pub mod mht;

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::config::{AssociationStrategyKind, SessionConfig};
use crate::domain::{ObservationId, TrackId};

/// A gated, scored (track, observation) pairing. Transient: lives for one
/// cycle and is discarded once the cycle resolves.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    /// Index into the cycle's associable-track list
    pub track_idx: usize,
    /// Index into the cycle's observation batch
    pub obs_idx: usize,
    /// Track id (stable across cycles, used by MHT)
    pub track_id: TrackId,
    /// Observation id
    pub obs_id: ObservationId,
    /// Squared Mahalanobis distance
    pub distance_sq: f64,
    /// Gaussian measurement likelihood
    pub likelihood: f64,
    /// Source reliability weight of the observation
    pub reliability: f64,
    /// Observation time
    pub observed_at: DateTime<Utc>,
}

/// Deterministic candidate ordering: ascending distance, ties broken by
/// higher source reliability, then earlier observation time, then
/// observation id for a total order.
pub fn candidate_order(a: &CandidatePair, b: &CandidatePair) -> Ordering {
    a.distance_sq
        .partial_cmp(&b.distance_sq)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.reliability
                .partial_cmp(&a.reliability)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.observed_at.cmp(&b.observed_at))
        .then_with(|| a.obs_id.cmp(&b.obs_id))
}

/// Resolution of one track for one cycle.
#[derive(Debug, Clone)]
pub enum Assignment {
    /// Exclusive pairing of one observation to one track.
    Hard {
        /// Track index
        track_idx: usize,
        /// Observation index
        obs_idx: usize,
    },
    /// Probability-weighted pseudo-measurement over several observations
    /// (JPDA inside an ambiguous cluster).
    Soft {
        /// Track index
        track_idx: usize,
        /// `(obs_idx, beta)` association probabilities
        weights: Vec<(usize, f64)>,
        /// Probability that the track has no observation this cycle
        beta_none: f64,
    },
}

impl Assignment {
    /// The track this assignment applies to.
    pub fn track_idx(&self) -> usize {
        match self {
            Assignment::Hard { track_idx, .. } | Assignment::Soft { track_idx, .. } => *track_idx,
        }
    }
}

/// Result of resolving one cycle's candidates.
#[derive(Debug, Clone, Default)]
pub struct AssociationOutcome {
    /// Per-track resolutions (at most one entry per track)
    pub assignments: Vec<Assignment>,
    /// Observation indices left unassociated (new-track candidates)
    pub unassigned_observations: Vec<usize>,
    /// Track indices left unassociated (proceed to coasting checks)
    pub unassigned_tracks: Vec<usize>,
}

impl AssociationOutcome {
    /// Derive the unassigned lists from the assignments.
    pub fn finish(mut self, n_tracks: usize, n_obs: usize) -> Self {
        let mut track_used = vec![false; n_tracks];
        let mut obs_used = vec![false; n_obs];
        for a in &self.assignments {
            track_used[a.track_idx()] = true;
            match a {
                Assignment::Hard { obs_idx, .. } => obs_used[*obs_idx] = true,
                Assignment::Soft { weights, .. } => {
                    for (obs_idx, _) in weights {
                        obs_used[*obs_idx] = true;
                    }
                }
            }
        }
        self.unassigned_tracks = (0..n_tracks).filter(|&i| !track_used[i]).collect();
        self.unassigned_observations = (0..n_obs).filter(|&i| !obs_used[i]).collect();
        self
    }
}

/// A data-association strategy, fixed per session.
pub trait AssociationStrategy: Send {
    /// Resolve one cycle's gated candidates.
    fn associate(
        &mut self,
        candidates: &[CandidatePair],
        n_tracks: usize,
        n_obs: usize,
    ) -> AssociationOutcome;
}

/// Construct the strategy selected by the session configuration.
pub fn make_strategy(config: &SessionConfig) -> Box<dyn AssociationStrategy> {
    match config.strategy {
        AssociationStrategyKind::Gnn => Box::new(gnn::GlobalNearestNeighbor),
        AssociationStrategyKind::Jpda => Box::new(jpda::JointProbabilistic::default()),
        AssociationStrategyKind::Mht => Box::new(mht::MultipleHypothesis::new(
            config.mht_horizon_cycles as usize,
            config.mht_max_branches,
        )),
    }
}

/// Group candidates into connected components of mutual ambiguity
/// (bipartite connectivity over shared tracks/observations). Returns, per
/// component, the indices into `candidates`.
pub fn connected_components(
    candidates: &[CandidatePair],
    n_tracks: usize,
    n_obs: usize,
) -> Vec<Vec<usize>> {
    // Union-find over track nodes [0, n_tracks) and observation nodes
    // [n_tracks, n_tracks + n_obs).
    let mut parent: Vec<usize> = (0..n_tracks + n_obs).collect();

    fn find(parent: &mut Vec<usize>, mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for pair in candidates {
        let a = find(&mut parent, pair.track_idx);
        let b = find(&mut parent, n_tracks + pair.obs_idx);
        parent[a] = b;
    }

    let mut groups: std::collections::HashMap<usize, Vec<usize>> =
        std::collections::HashMap::new();
    for (ci, pair) in candidates.iter().enumerate() {
        let root = find(&mut parent, pair.track_idx);
        groups.entry(root).or_default().push(ci);
    }

    let mut components: Vec<Vec<usize>> = groups.into_values().collect();
    // Deterministic component order: by smallest candidate index
    components.sort_by_key(|c| c.iter().copied().min().unwrap_or(usize::MAX));
    components
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn pair(track_idx: usize, obs_idx: usize, d: f64) -> CandidatePair {
        CandidatePair {
            track_idx,
            obs_idx,
            track_id: TrackId::new(),
            obs_id: ObservationId::new(),
            distance_sq: d,
            likelihood: (-0.5 * d).exp(),
            reliability: 0.8,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn components_split_disjoint_clusters() {
        // Cluster A: track0 <-> obs0, obs1; Cluster B: track1 <-> obs2
        let candidates = vec![pair(0, 0, 1.0), pair(0, 1, 2.0), pair(1, 2, 1.0)];
        let components = connected_components(&candidates, 2, 3);
        assert_eq!(components.len(), 2);
        assert_eq!(components[0], vec![0, 1]);
        assert_eq!(components[1], vec![2]);
    }

    #[test]
    fn components_chain_through_shared_observation() {
        // track0-obs0, track1-obs0 -> one component
        let candidates = vec![pair(0, 0, 1.0), pair(1, 0, 1.5)];
        let components = connected_components(&candidates, 2, 1);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].len(), 2);
    }

    #[test]
    fn order_prefers_distance_then_reliability() {
        let a = pair(0, 0, 1.0);
        let mut b = pair(1, 1, 1.0);
        b.reliability = 0.9;
        // Equal distance: higher reliability first
        assert_eq!(candidate_order(&b, &a), Ordering::Less);

        let near = pair(0, 0, 0.5);
        let far = pair(1, 1, 3.0);
        assert_eq!(candidate_order(&near, &far), Ordering::Less);
    }

    #[test]
    fn finish_computes_unassigned() {
        let outcome = AssociationOutcome {
            assignments: vec![Assignment::Hard {
                track_idx: 0,
                obs_idx: 1,
            }],
            ..Default::default()
        }
        .finish(2, 3);
        assert_eq!(outcome.unassigned_tracks, vec![1]);
        assert_eq!(outcome.unassigned_observations, vec![0, 2]);
    }
}
