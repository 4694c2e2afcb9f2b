//! Global nearest neighbor: greedy exclusive assignment by ascending
//! Mahalanobis distance.

use super::{candidate_order, Assignment, AssociationOutcome, AssociationStrategy, CandidatePair};

/// Greedy one-to-one resolver. Stateless across cycles.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalNearestNeighbor;

impl AssociationStrategy for GlobalNearestNeighbor {
    fn associate(
        &mut self,
        candidates: &[CandidatePair],
        n_tracks: usize,
        n_obs: usize,
    ) -> AssociationOutcome {
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by(|&a, &b| candidate_order(&candidates[a], &candidates[b]));

        let mut track_used = vec![false; n_tracks];
        let mut obs_used = vec![false; n_obs];
        let mut assignments = Vec::new();

        for ci in order {
            let pair = &candidates[ci];
            if track_used[pair.track_idx] || obs_used[pair.obs_idx] {
                continue;
            }
            track_used[pair.track_idx] = true;
            obs_used[pair.obs_idx] = true;
            assignments.push(Assignment::Hard {
                track_idx: pair.track_idx,
                obs_idx: pair.obs_idx,
            });
        }

        AssociationOutcome {
            assignments,
            ..Default::default()
        }
        .finish(n_tracks, n_obs)
    }
}
