//! Track-oriented multiple hypothesis association with a bounded horizon.
//!
//! Ambiguous clusters spawn a hypothesis tree instead of being resolved
//! immediately. Each cycle extends every surviving hypothesis with every
//! feasible joint event, prunes to the configured branch bound, and emits
//! the current best hypothesis's event as this cycle's (provisional)
//! assignment. The tree is committed and discarded when the ambiguity
//! resolves or the horizon expires, whichever comes first.

use std::collections::BTreeSet;

use super::jpda::enumerate;
use super::{
    connected_components, Assignment, AssociationOutcome, AssociationStrategy, CandidatePair,
};
use crate::domain::TrackId;

/// One surviving global hypothesis for a cluster: cumulative
/// log-likelihood plus the joint event it chose this cycle.
#[derive(Debug, Clone)]
struct Hypothesis {
    log_likelihood: f64,
    /// Per cluster-observation slot: the chosen cluster-track slot, or
    /// `None` for the clutter hypothesis.
    event: Vec<Option<usize>>,
}

/// A pending ambiguity: the set of contested tracks and the surviving
/// hypotheses about them.
#[derive(Debug, Clone)]
struct Cluster {
    tracks: BTreeSet<TrackId>,
    age: usize,
    hypotheses: Vec<Hypothesis>,
}

/// Deferred-decision resolver. Carries cluster state between cycles.
#[derive(Debug)]
pub struct MultipleHypothesis {
    horizon: usize,
    max_branches: usize,
    clusters: Vec<Cluster>,
}

impl MultipleHypothesis {
    /// `horizon` cycles of deferral, at most `max_branches` hypotheses
    /// kept per cluster.
    pub fn new(horizon: usize, max_branches: usize) -> Self {
        Self {
            horizon: horizon.max(1),
            max_branches: max_branches.max(1),
            clusters: Vec::new(),
        }
    }

    /// Number of clusters still deferring a decision.
    pub fn pending_clusters(&self) -> usize {
        self.clusters.len()
    }

    fn take_matching_cluster(&mut self, tracks: &BTreeSet<TrackId>) -> Option<Cluster> {
        let pos = self
            .clusters
            .iter()
            .position(|c| !c.tracks.is_disjoint(tracks))?;
        Some(self.clusters.remove(pos))
    }
}

impl AssociationStrategy for MultipleHypothesis {
    fn associate(
        &mut self,
        candidates: &[CandidatePair],
        n_tracks: usize,
        n_obs: usize,
    ) -> AssociationOutcome {
        let mut assignments = Vec::new();
        let mut kept_clusters = Vec::new();

        for component in connected_components(candidates, n_tracks, n_obs) {
            let pairs: Vec<&CandidatePair> = component.iter().map(|&ci| &candidates[ci]).collect();
            let obs_slots: Vec<usize> = pairs
                .iter()
                .map(|p| p.obs_idx)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let track_slots: Vec<usize> = pairs
                .iter()
                .map(|p| p.track_idx)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let track_set: BTreeSet<TrackId> = pairs.iter().map(|p| p.track_id).collect();

            if !is_ambiguous(&pairs, &track_slots, &obs_slots) {
                // One-to-one geometry: decide now and retire any deferred
                // hypotheses about these tracks.
                self.take_matching_cluster(&track_set);
                for p in &pairs {
                    assignments.push(Assignment::Hard {
                        track_idx: p.track_idx,
                        obs_idx: p.obs_idx,
                    });
                }
                continue;
            }

            let events = enumerate_events(&pairs, &track_slots, &obs_slots);
            if events.is_empty() {
                continue;
            }

            let mut cluster = self
                .take_matching_cluster(&track_set)
                .unwrap_or_else(|| Cluster {
                    tracks: BTreeSet::new(),
                    age: 0,
                    hypotheses: vec![Hypothesis {
                        log_likelihood: 0.0,
                        event: Vec::new(),
                    }],
                });
            cluster.tracks = track_set;
            cluster.age += 1;

            // Branch every surviving hypothesis with every joint event.
            let mut children: Vec<Hypothesis> = Vec::new();
            for parent in &cluster.hypotheses {
                for (event, log_weight) in &events {
                    children.push(Hypothesis {
                        log_likelihood: parent.log_likelihood + log_weight,
                        event: event.clone(),
                    });
                }
            }
            children.sort_by(|a, b| {
                b.log_likelihood
                    .partial_cmp(&a.log_likelihood)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            children.truncate(self.max_branches);
            // Keep log-likelihoods bounded across cycles.
            let best_ll = children[0].log_likelihood;
            for h in &mut children {
                h.log_likelihood -= best_ll;
            }

            let distinct_events: BTreeSet<&Vec<Option<usize>>> =
                children.iter().map(|h| &h.event).collect();
            let resolved = distinct_events.len() == 1;

            // Best hypothesis drives this cycle's updates either way.
            for (o_slot, chosen) in children[0].event.iter().enumerate() {
                if let Some(t_slot) = chosen {
                    assignments.push(Assignment::Hard {
                        track_idx: track_slots[*t_slot],
                        obs_idx: obs_slots[o_slot],
                    });
                }
            }

            if resolved || cluster.age >= self.horizon {
                tracing::debug!(
                    tracks = cluster.tracks.len(),
                    age = cluster.age,
                    resolved,
                    "hypothesis cluster committed"
                );
            } else {
                cluster.hypotheses = children;
                kept_clusters.push(cluster);
            }
        }

        // Clusters whose tracks produced no gated pairs this cycle have
        // nothing left to disambiguate.
        self.clusters = kept_clusters;

        AssociationOutcome {
            assignments,
            ..Default::default()
        }
        .finish(n_tracks, n_obs)
    }
}

/// A component is ambiguous when any observation gates to several tracks
/// or any track gates to several observations.
fn is_ambiguous(pairs: &[&CandidatePair], track_slots: &[usize], obs_slots: &[usize]) -> bool {
    pairs.len() > track_slots.len() || pairs.len() > obs_slots.len()
}

/// All feasible joint events for a cluster with their log-weights.
fn enumerate_events(
    pairs: &[&CandidatePair],
    track_slots: &[usize],
    obs_slots: &[usize],
) -> Vec<(Vec<Option<usize>>, f64)> {
    let nt = track_slots.len();
    let no = obs_slots.len();

    let mut likelihood = vec![vec![0.0f64; nt]; no];
    for p in pairs {
        let o = obs_slots.iter().position(|&i| i == p.obs_idx).unwrap_or(0);
        let t = track_slots
            .iter()
            .position(|&i| i == p.track_idx)
            .unwrap_or(0);
        likelihood[o][t] = p.likelihood.max(f64::MIN_POSITIVE);
    }

    let mut events = Vec::new();
    let mut track_taken = vec![false; nt];
    let mut event = vec![usize::MAX; no];
    enumerate(
        0,
        1.0,
        &likelihood,
        &mut track_taken,
        &mut event,
        &mut |event, weight| {
            if weight <= 0.0 {
                return;
            }
            let choices = event
                .iter()
                .map(|&t| (t != usize::MAX).then_some(t))
                .collect();
            events.push((choices, weight.ln()));
        },
    );
    events
}

#[cfg(test)]
mod tests {
    use super::super::tests::pair;
    use super::*;

    #[test]
    fn unambiguous_component_commits_immediately() {
        let mut mht = MultipleHypothesis::new(5, 16);
        let candidates = vec![pair(0, 0, 1.0), pair(1, 1, 2.0)];
        let outcome = mht.associate(&candidates, 2, 2);
        assert_eq!(outcome.assignments.len(), 2);
        assert_eq!(mht.pending_clusters(), 0);
    }

    #[test]
    fn ambiguity_defers_but_still_updates_best_branch() {
        let mut mht = MultipleHypothesis::new(5, 16);
        // One observation contested by two tracks.
        let mut near = pair(0, 0, 0.5);
        near.likelihood = 0.1;
        let mut far = pair(1, 0, 3.0);
        far.likelihood = 0.02;

        let outcome = mht.associate(&[near, far], 2, 1);
        assert_eq!(mht.pending_clusters(), 1, "ambiguity should be deferred");
        // Best branch pairs the observation with the nearer track.
        assert_eq!(outcome.assignments.len(), 1);
        match outcome.assignments[0] {
            Assignment::Hard { track_idx, obs_idx } => {
                assert_eq!((track_idx, obs_idx), (0, 0));
            }
            _ => panic!("expected hard assignment"),
        }
    }

    #[test]
    fn horizon_expiry_commits_the_cluster() {
        let mut mht = MultipleHypothesis::new(2, 16);
        let id_a = TrackId::new();
        let id_b = TrackId::new();
        let make = || {
            let mut near = pair(0, 0, 0.5);
            near.track_id = id_a;
            near.likelihood = 0.1;
            let mut far = pair(1, 0, 3.0);
            far.track_id = id_b;
            far.likelihood = 0.02;
            vec![near, far]
        };

        mht.associate(&make(), 2, 1);
        assert_eq!(mht.pending_clusters(), 1);
        mht.associate(&make(), 2, 1);
        assert_eq!(mht.pending_clusters(), 0, "horizon of 2 must commit");
    }

    #[test]
    fn stale_cluster_is_dropped_when_contention_disappears() {
        let mut mht = MultipleHypothesis::new(5, 16);
        let mut near = pair(0, 0, 0.5);
        near.likelihood = 0.1;
        let mut far = pair(1, 0, 3.0);
        far.likelihood = 0.02;
        mht.associate(&[near.clone(), far], 2, 1);
        assert_eq!(mht.pending_clusters(), 1);

        // Next cycle the same tracks separate into one-to-one pairs.
        let a = pair(0, 0, 1.0);
        let mut b = pair(1, 1, 1.0);
        b.track_id = near.track_id; // overlap so the cluster is matched
        let outcome = mht.associate(&[a, b], 2, 2);
        assert_eq!(outcome.assignments.len(), 2);
        assert_eq!(mht.pending_clusters(), 0);
    }

    #[test]
    fn branch_bound_is_enforced() {
        let mut mht = MultipleHypothesis::new(8, 4);
        let id_a = TrackId::new();
        let id_b = TrackId::new();
        // 2 tracks x 2 shared observations: 7 joint events per cycle.
        let mk = || {
            let mut ps = vec![
                pair(0, 0, 0.5),
                pair(0, 1, 1.0),
                pair(1, 0, 1.5),
                pair(1, 1, 0.8),
            ];
            ps[0].track_id = id_a;
            ps[1].track_id = id_a;
            ps[2].track_id = id_b;
            ps[3].track_id = id_b;
            ps
        };
        mht.associate(&mk(), 2, 2);
        mht.associate(&mk(), 2, 2);
        for c in &mht.clusters {
            assert!(c.hypotheses.len() <= 4);
        }
    }
}
