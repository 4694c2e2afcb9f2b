//! Interacting Multiple Model estimator.
//!
//! Each track carries an [`ImmState`]: one (state, covariance) pair per
//! motion model, a model-probability vector propagated through the
//! configured Markov transition matrix, and the moment-matched combined
//! estimate that the rest of the pipeline reads.
//!
//! Covariance hygiene after every update: re-symmetrize, then Cholesky
//! feasibility check; an infeasible covariance is reset to the configured
//! prior and counted, never treated as fatal.

use nalgebra::{Matrix3, SVector, Vector3};

use super::kalman::{
    self, position_observation_matrix, position_velocity_observation_matrix, NoiseMatrix,
};
use super::{EnuMeasurement, StateCovariance, StateVector, MODEL_COUNT};
use crate::config::EstimatorConfig;
use crate::domain::MeasurementCovariance;
use crate::estimation::motion::MODEL_BANK;

/// Model-probability vector.
pub type ModelProbabilities = SVector<f64, MODEL_COUNT>;

/// Probability floor that keeps dormant models revivable.
const PROB_FLOOR: f64 = 1e-6;
/// Likelihood assigned to a model whose update was numerically skipped.
const DEGENERATE_LIKELIHOOD: f64 = 1e-12;

/// Per-model state estimate.
#[derive(Debug, Clone)]
pub struct ModelEstimate {
    /// Model-conditioned state
    pub x: StateVector,
    /// Model-conditioned covariance
    pub p: StateCovariance,
}

/// Outcome of one estimator operation, for session statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateReport {
    /// Covariance resets forced by the feasibility check
    pub covariance_resets: u32,
}

/// Full estimator state of one track.
#[derive(Debug, Clone)]
pub struct ImmState {
    /// One estimate per motion model, ordered as
    /// [`MODEL_BANK`](crate::estimation::motion::MODEL_BANK)
    pub models: [ModelEstimate; MODEL_COUNT],
    /// Model probabilities (sums to 1)
    pub probabilities: ModelProbabilities,
    /// Moment-matched combined state
    pub combined_state: StateVector,
    /// Moment-matched combined covariance
    pub combined_covariance: StateCovariance,
}

impl ImmState {
    /// Initialize from a first measurement. All models start identical;
    /// constant velocity gets the probability head start.
    pub fn from_measurement(meas: &EnuMeasurement, cfg: &EstimatorConfig) -> Self {
        let mut x = StateVector::zeros();
        x.fixed_rows_mut::<3>(0).copy_from(&meas.position);
        if let Some(v) = &meas.velocity {
            x.fixed_rows_mut::<3>(3).copy_from(v);
        }

        let mut p = StateCovariance::zeros();
        p.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&meas.covariance.position_block());
        let vel_block = match (&meas.velocity, &meas.covariance) {
            (Some(_), MeasurementCovariance::PositionVelocity(pv)) => {
                pv.fixed_view::<3, 3>(3, 3).into()
            }
            _ => Matrix3::identity() * cfg.init_velocity_var,
        };
        p.fixed_view_mut::<3, 3>(3, 3).copy_from(&vel_block);
        for i in 6..9 {
            p[(i, i)] = cfg.init_accel_var;
        }

        let estimate = ModelEstimate { x, p };
        let probabilities = ModelProbabilities::from_column_slice(&[0.8, 0.1, 0.1]);

        let mut state = Self {
            models: [estimate.clone(), estimate.clone(), estimate],
            probabilities,
            combined_state: x,
            combined_covariance: p,
        };
        state.combine();
        state
    }

    /// IMM interaction step: blend model states under the Markov prior
    /// before each model predicts independently.
    pub fn mix(&mut self, cfg: &EstimatorConfig) {
        let mu = self.probabilities;

        // Predicted model probabilities c_j = sum_i pi_ij * mu_i
        let mut c = [0.0f64; MODEL_COUNT];
        for j in 0..MODEL_COUNT {
            for i in 0..MODEL_COUNT {
                c[j] += cfg.markov[i][j] * mu[i];
            }
            c[j] = c[j].max(PROB_FLOOR);
        }

        let mut mixed: Vec<ModelEstimate> = Vec::with_capacity(MODEL_COUNT);
        for j in 0..MODEL_COUNT {
            let mut x0 = StateVector::zeros();
            for i in 0..MODEL_COUNT {
                let w = cfg.markov[i][j] * mu[i] / c[j];
                x0 += self.models[i].x * w;
            }
            let mut p0 = StateCovariance::zeros();
            for i in 0..MODEL_COUNT {
                let w = cfg.markov[i][j] * mu[i] / c[j];
                let dx = self.models[i].x - x0;
                p0 += (self.models[i].p + dx * dx.transpose()) * w;
            }
            mixed.push(ModelEstimate {
                x: x0,
                p: kalman::symmetrize(&p0),
            });
        }

        for (j, m) in mixed.into_iter().enumerate() {
            self.models[j] = m;
        }
        self.probabilities = ModelProbabilities::from_column_slice(&c);
        normalize(&mut self.probabilities);
    }

    /// Per-model prediction over `dt` seconds, then recombine.
    pub fn predict(&mut self, dt: f64, cfg: &EstimatorConfig) {
        for (model, est) in MODEL_BANK.iter().zip(self.models.iter_mut()) {
            let f = model.transition_matrix(dt, cfg);
            let q = model.process_noise(dt, cfg);
            let (x, p) = kalman::predict(&est.x, &est.p, &f, &q);
            est.x = x;
            est.p = kalman::symmetrize(&p);
        }
        self.combine();
    }

    /// Hard-association update with a single measurement.
    pub fn update(&mut self, meas: &EnuMeasurement, cfg: &EstimatorConfig) -> UpdateReport {
        let mut report = UpdateReport::default();
        let mut likelihoods = [DEGENERATE_LIKELIHOOD; MODEL_COUNT];

        for (j, est) in self.models.iter_mut().enumerate() {
            let applied = apply_measurement(est, meas);
            if let Some(likelihood) = applied {
                likelihoods[j] = likelihood.max(DEGENERATE_LIKELIHOOD);
            }
            report.covariance_resets += enforce_feasibility(est, cfg);
        }

        self.reweight(&likelihoods);
        self.combine();
        report
    }

    /// Sequential fusion of several observations associated to the same
    /// track in one cycle, in the caller's (reliability-descending)
    /// order. For independent measurement errors this is algebraically
    /// identical to the single stacked combined-innovation update.
    pub fn update_sequential(
        &mut self,
        measurements: &[&EnuMeasurement],
        cfg: &EstimatorConfig,
    ) -> UpdateReport {
        let mut report = UpdateReport::default();
        for meas in measurements {
            let r = self.update(meas, cfg);
            report.covariance_resets += r.covariance_resets;
        }
        report
    }

    /// JPDA-style soft update: probability-weighted composite of several
    /// gated measurements plus the no-association event `beta_none`.
    ///
    /// Measurements are projected to position space so the composite
    /// innovation is homogeneous across sources.
    pub fn update_weighted(
        &mut self,
        weighted: &[(&EnuMeasurement, f64)],
        beta_none: f64,
        cfg: &EstimatorConfig,
    ) -> UpdateReport {
        let mut report = UpdateReport::default();
        if weighted.is_empty() {
            return report;
        }
        let beta_sum: f64 = weighted.iter().map(|(_, b)| b).sum();
        if beta_sum <= 0.0 {
            return report;
        }

        let h = position_observation_matrix();
        let mut likelihoods = [DEGENERATE_LIKELIHOOD; MODEL_COUNT];

        for (j, est) in self.models.iter_mut().enumerate() {
            // Probability-weighted average measurement noise.
            let mut r_bar = Matrix3::zeros();
            for (meas, beta) in weighted {
                r_bar += meas.covariance.position_block() * (*beta / beta_sum);
            }

            let s = h * est.p * h.transpose() + r_bar;
            let Some(chol) = nalgebra::Cholesky::new(s) else {
                report.covariance_resets += enforce_feasibility(est, cfg);
                continue;
            };
            let k = est.p * h.transpose() * chol.inverse();

            // Composite innovation and innovation spread.
            let hx: Vector3<f64> = h * est.x;
            let mut nu_bar = Vector3::zeros();
            let mut spread = Matrix3::zeros();
            let mut density = 0.0;
            for (meas, beta) in weighted {
                let nu = meas.position - hx;
                nu_bar += nu * *beta;
                spread += nu * nu.transpose() * *beta;
                density += *beta * kalman::gaussian_likelihood(&nu, &chol);
            }
            spread -= nu_bar * nu_bar.transpose();
            likelihoods[j] = density.max(DEGENERATE_LIKELIHOOD);

            est.x += k * nu_bar;

            // P = beta0 * P_pred + (1 - beta0) * P_updated + spread term
            let i_kh = StateCovariance::identity() - k * h;
            let p_updated = i_kh * est.p * i_kh.transpose() + k * r_bar * k.transpose();
            let p_spread = k * spread * k.transpose();
            est.p = est.p * beta_none + p_updated * (1.0 - beta_none) + p_spread;

            report.covariance_resets += enforce_feasibility(est, cfg);
        }

        self.reweight(&likelihoods);
        self.combine();
        report
    }

    /// Squared Mahalanobis distance from the combined predicted state to
    /// a measurement, in the measurement's own space (3 or 6 dim).
    pub fn distance_sq(&self, meas: &EnuMeasurement) -> Option<f64> {
        match (&meas.velocity, &meas.covariance) {
            (Some(vel), MeasurementCovariance::PositionVelocity(r)) => {
                let mut z = SVector::<f64, 6>::zeros();
                z.fixed_rows_mut::<3>(0).copy_from(&meas.position);
                z.fixed_rows_mut::<3>(3).copy_from(vel);
                kalman::mahalanobis_sq(
                    &self.combined_state,
                    &self.combined_covariance,
                    &z,
                    &position_velocity_observation_matrix(),
                    r,
                )
            }
            _ => kalman::mahalanobis_sq(
                &self.combined_state,
                &self.combined_covariance,
                &meas.position,
                &position_observation_matrix(),
                &meas.covariance.position_block(),
            ),
        }
    }

    /// Gaussian likelihood of a measurement under the combined estimate.
    pub fn likelihood(&self, meas: &EnuMeasurement) -> f64 {
        let h = position_observation_matrix();
        let r = meas.covariance.position_block();
        let s = h * self.combined_covariance * h.transpose() + r;
        match nalgebra::Cholesky::new(s) {
            Some(chol) => {
                let nu = meas.position - h * self.combined_state;
                kalman::gaussian_likelihood(&nu, &chol)
            }
            None => 0.0,
        }
    }

    /// Information-weighted fusion with another estimator state (track
    /// merge). Returns `false` without mutating when either covariance is
    /// not invertible.
    pub fn fuse_with(&mut self, other: &ImmState) -> bool {
        let jitter = StateCovariance::identity() * 1e-9;
        let Some(info_a) = (self.combined_covariance + jitter).try_inverse() else {
            return false;
        };
        let Some(info_b) = (other.combined_covariance + jitter).try_inverse() else {
            return false;
        };
        let Some(fused_cov) = (info_a + info_b).try_inverse() else {
            return false;
        };
        let fused_cov = kalman::symmetrize(&fused_cov);
        let fused_state =
            fused_cov * (info_a * self.combined_state + info_b * other.combined_state);

        for est in self.models.iter_mut() {
            est.x = fused_state;
            est.p = fused_cov;
        }
        self.probabilities = (self.probabilities + other.probabilities) * 0.5;
        normalize(&mut self.probabilities);
        self.combined_state = fused_state;
        self.combined_covariance = fused_cov;
        true
    }

    /// Re-weight model probabilities by innovation likelihood.
    fn reweight(&mut self, likelihoods: &[f64; MODEL_COUNT]) {
        for j in 0..MODEL_COUNT {
            self.probabilities[j] =
                (self.probabilities[j] * likelihoods[j]).max(PROB_FLOOR);
        }
        normalize(&mut self.probabilities);
    }

    /// Moment-matched combination across the bank.
    fn combine(&mut self) {
        let mut x = StateVector::zeros();
        for j in 0..MODEL_COUNT {
            x += self.models[j].x * self.probabilities[j];
        }
        let mut p = StateCovariance::zeros();
        for j in 0..MODEL_COUNT {
            let dx = self.models[j].x - x;
            p += (self.models[j].p + dx * dx.transpose()) * self.probabilities[j];
        }
        self.combined_state = x;
        self.combined_covariance = kalman::symmetrize(&p);
    }
}

/// Apply one measurement to one model estimate. Returns the innovation
/// likelihood, or `None` when the update was skipped (singular S).
fn apply_measurement(est: &mut ModelEstimate, meas: &EnuMeasurement) -> Option<f64> {
    match (&meas.velocity, &meas.covariance) {
        (Some(vel), MeasurementCovariance::PositionVelocity(r)) => {
            let mut z = SVector::<f64, 6>::zeros();
            z.fixed_rows_mut::<3>(0).copy_from(&meas.position);
            z.fixed_rows_mut::<3>(3).copy_from(vel);
            let result = kalman::update(
                &est.x,
                &est.p,
                &z,
                &position_velocity_observation_matrix(),
                r,
            )?;
            est.x = result.state;
            est.p = result.covariance;
            Some(result.likelihood)
        }
        _ => {
            let r: NoiseMatrix<3> = meas.covariance.position_block();
            let result = kalman::update(
                &est.x,
                &est.p,
                &meas.position,
                &position_observation_matrix(),
                &r,
            )?;
            est.x = result.state;
            est.p = result.covariance;
            Some(result.likelihood)
        }
    }
}

/// Re-symmetrize and verify Cholesky feasibility; reset to the configured
/// prior when the check fails. Returns the number of resets (0 or 1).
fn enforce_feasibility(est: &mut ModelEstimate, cfg: &EstimatorConfig) -> u32 {
    est.p = kalman::symmetrize(&est.p);
    if kalman::is_feasible(&est.p) {
        return 0;
    }
    let (pos, vel, acc) = cfg.reset_prior_var;
    let mut p = StateCovariance::zeros();
    for i in 0..3 {
        p[(i, i)] = pos;
        p[(i + 3, i + 3)] = vel;
        p[(i + 6, i + 6)] = acc;
    }
    est.p = p;
    tracing::debug!("covariance reset to prior after failed feasibility check");
    1
}

fn normalize(mu: &mut ModelProbabilities) {
    let sum: f64 = mu.iter().sum();
    if sum > 0.0 {
        *mu /= sum;
    } else {
        mu.fill(1.0 / MODEL_COUNT as f64);
    }
}
