//! Joint probabilistic data association.
//!
//! Ambiguous clusters are resolved by enumerating all feasible joint
//! events (each observation paired to at most one track or declared
//! clutter, each track receiving at most one observation) and
//! marginalizing into per-track association probabilities. Tracks in a
//! cluster receive a soft assignment; the estimator folds the weighted
//! observations into one update.

use std::collections::BTreeSet;

use super::{
    connected_components, gnn::GlobalNearestNeighbor, Assignment, AssociationOutcome,
    AssociationStrategy, CandidatePair,
};

/// Probability that a real object produces an observation in a cycle.
pub(super) const DETECTION_PROB: f64 = 0.9;
/// Spatial density of clutter-origin observations.
pub(super) const CLUTTER_DENSITY: f64 = 1e-4;
/// Enumeration is exponential in cluster size; larger clusters fall back
/// to greedy exclusive assignment.
const MAX_ENUMERATED_OBSERVATIONS: usize = 8;
/// Marginals below this are dropped from the soft weight list.
const BETA_FLOOR: f64 = 1e-6;

/// JPDA resolver. Stateless across cycles; enumeration state is per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct JointProbabilistic;

impl AssociationStrategy for JointProbabilistic {
    fn associate(
        &mut self,
        candidates: &[CandidatePair],
        n_tracks: usize,
        n_obs: usize,
    ) -> AssociationOutcome {
        let mut assignments = Vec::new();

        for component in connected_components(candidates, n_tracks, n_obs) {
            let pairs: Vec<&CandidatePair> = component.iter().map(|&ci| &candidates[ci]).collect();
            let obs_ids: Vec<usize> = pairs
                .iter()
                .map(|p| p.obs_idx)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let track_ids: Vec<usize> = pairs
                .iter()
                .map(|p| p.track_idx)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();

            if obs_ids.len() > MAX_ENUMERATED_OBSERVATIONS {
                // Too wide to enumerate: exclusive greedy within the cluster.
                let owned: Vec<CandidatePair> = pairs.iter().map(|p| (*p).clone()).collect();
                let fallback = GlobalNearestNeighbor.associate(&owned, n_tracks, n_obs);
                assignments.extend(fallback.assignments);
                continue;
            }

            assignments.extend(marginalize(&pairs, &track_ids, &obs_ids));
        }

        AssociationOutcome {
            assignments,
            ..Default::default()
        }
        .finish(n_tracks, n_obs)
    }
}

/// Enumerate joint events over one cluster and return a soft assignment
/// per track.
fn marginalize(
    pairs: &[&CandidatePair],
    track_ids: &[usize],
    obs_ids: &[usize],
) -> Vec<Assignment> {
    let nt = track_ids.len();
    let no = obs_ids.len();

    // likelihood[o][t], 0.0 when the pair is not gated
    let mut likelihood = vec![vec![0.0f64; nt]; no];
    for p in pairs {
        let o = obs_ids.iter().position(|&i| i == p.obs_idx).unwrap_or(0);
        let t = track_ids.iter().position(|&i| i == p.track_idx).unwrap_or(0);
        likelihood[o][t] = p.likelihood.max(f64::MIN_POSITIVE);
    }

    // beta[t][o] accumulates event weights where obs o is paired to
    // track t; miss[t] where track t receives nothing.
    let mut beta = vec![vec![0.0f64; no]; nt];
    let mut miss = vec![0.0f64; nt];
    let mut total = 0.0f64;

    let mut track_taken = vec![false; nt];
    let mut event = vec![usize::MAX; no];
    enumerate(
        0,
        1.0,
        &likelihood,
        &mut track_taken,
        &mut event,
        &mut |event, weight| {
            total += weight;
            let mut assigned = vec![false; nt];
            for (o, &t) in event.iter().enumerate() {
                if t != usize::MAX {
                    beta[t][o] += weight;
                    assigned[t] = true;
                }
            }
            for t in 0..nt {
                if !assigned[t] {
                    miss[t] += weight;
                }
            }
        },
    );

    if total <= 0.0 {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(nt);
    for t in 0..nt {
        let mut weights: Vec<(usize, f64)> = (0..no)
            .filter_map(|o| {
                let b = beta[t][o] / total;
                (b >= BETA_FLOOR).then_some((obs_ids[o], b))
            })
            .collect();
        let beta_none = miss[t] / total;

        // Renormalize against the floor truncation.
        let sum: f64 = weights.iter().map(|(_, b)| b).sum::<f64>() + beta_none;
        if sum > 0.0 {
            for (_, b) in &mut weights {
                *b /= sum;
            }
        }
        out.push(Assignment::Soft {
            track_idx: track_ids[t],
            weights,
            beta_none: if sum > 0.0 { beta_none / sum } else { 1.0 },
        });
    }
    out
}

/// Depth-first enumeration of joint events: observation `o` is paired to
/// one free gated track or declared clutter. Shared with the hypothesis
/// tree, which scores the same event space without marginalizing.
pub(super) fn enumerate(
    o: usize,
    weight: f64,
    likelihood: &[Vec<f64>],
    track_taken: &mut [bool],
    event: &mut [usize],
    visit: &mut impl FnMut(&[usize], f64),
) {
    if o == likelihood.len() {
        visit(event, weight);
        return;
    }
    // Clutter hypothesis
    event[o] = usize::MAX;
    enumerate(
        o + 1,
        weight * CLUTTER_DENSITY,
        likelihood,
        track_taken,
        event,
        visit,
    );
    // Pair with each free gated track
    for t in 0..track_taken.len() {
        if track_taken[t] || likelihood[o][t] <= 0.0 {
            continue;
        }
        track_taken[t] = true;
        event[o] = t;
        enumerate(
            o + 1,
            weight * DETECTION_PROB * likelihood[o][t],
            likelihood,
            track_taken,
            event,
            visit,
        );
        track_taken[t] = false;
        event[o] = usize::MAX;
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::pair;
    use super::*;

    fn soft_for(outcome: &AssociationOutcome, track_idx: usize) -> (Vec<(usize, f64)>, f64) {
        for a in &outcome.assignments {
            if let Assignment::Soft {
                track_idx: t,
                weights,
                beta_none,
            } = a
            {
                if *t == track_idx {
                    return (weights.clone(), *beta_none);
                }
            }
        }
        panic!("no soft assignment for track {track_idx}");
    }

    #[test]
    fn shared_observation_splits_probability() {
        // One observation gated to two tracks, nearer to track 0.
        let mut near = pair(0, 0, 0.5);
        near.likelihood = 0.08;
        let mut far = pair(1, 0, 4.0);
        far.likelihood = 0.01;

        let mut jpda = JointProbabilistic;
        let outcome = jpda.associate(&[near, far], 2, 1);

        let (w0, _) = soft_for(&outcome, 0);
        let (w1, _) = soft_for(&outcome, 1);
        assert_eq!(w0.len(), 1);
        assert_eq!(w1.len(), 1);
        assert!(
            w0[0].1 > w1[0].1,
            "nearer track should carry the larger marginal"
        );
        // The observation is consumed by the cluster.
        assert!(outcome.unassigned_observations.is_empty());
    }

    #[test]
    fn marginals_and_miss_sum_to_one() {
        let a = pair(0, 0, 1.0);
        let b = pair(0, 1, 2.0);
        let mut jpda = JointProbabilistic;
        let outcome = jpda.associate(&[a, b], 1, 2);

        let (weights, beta_none) = soft_for(&outcome, 0);
        let sum: f64 = weights.iter().map(|(_, w)| w).sum::<f64>() + beta_none;
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(beta_none > 0.0, "miss event must keep nonzero probability");
    }

    #[test]
    fn disjoint_clusters_resolve_independently() {
        let candidates = vec![pair(0, 0, 1.0), pair(1, 1, 1.0)];
        let mut jpda = JointProbabilistic;
        let outcome = jpda.associate(&candidates, 2, 2);
        assert_eq!(outcome.assignments.len(), 2);
        assert!(outcome.unassigned_tracks.is_empty());
        assert!(outcome.unassigned_observations.is_empty());
    }

    #[test]
    fn ungated_observation_stays_unassigned() {
        let candidates = vec![pair(0, 0, 1.0)];
        let mut jpda = JointProbabilistic;
        let outcome = jpda.associate(&candidates, 1, 2);
        assert_eq!(outcome.unassigned_observations, vec![1]);
    }
}
