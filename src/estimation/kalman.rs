//! Shared Kalman math on the 9-dimensional state.
//!
//! Generic over the measurement dimension so position-only (3) and
//! position+velocity (6) observations go through the same code path.
//! Covariance updates use the Joseph form; feasibility is checked via
//! Cholesky decomposition.

use nalgebra::{Cholesky, SMatrix, SVector};

use super::{StateCovariance, StateVector};

/// Observation matrix mapping the 9-dim state to an M-dim measurement.
pub type ObservationMatrix<const M: usize> = SMatrix<f64, M, 9>;
/// M x M measurement-noise covariance.
pub type NoiseMatrix<const M: usize> = SMatrix<f64, M, M>;

/// H for position-only measurements: selects [pE, pN, pU].
pub fn position_observation_matrix() -> ObservationMatrix<3> {
    let mut h = ObservationMatrix::<3>::zeros();
    for i in 0..3 {
        h[(i, i)] = 1.0;
    }
    h
}

/// H for position+velocity measurements: selects the first six states.
pub fn position_velocity_observation_matrix() -> ObservationMatrix<6> {
    let mut h = ObservationMatrix::<6>::zeros();
    for i in 0..6 {
        h[(i, i)] = 1.0;
    }
    h
}

/// Result of a successful measurement update.
#[derive(Debug, Clone)]
pub struct UpdateResult<const M: usize> {
    /// Posterior state
    pub state: StateVector,
    /// Posterior covariance (Joseph form, re-symmetrized by the caller)
    pub covariance: StateCovariance,
    /// Innovation z - Hx
    pub innovation: SVector<f64, M>,
    /// Gaussian likelihood of the innovation under S
    pub likelihood: f64,
}

/// Prediction step: x <- F x, P <- F P F^T + Q.
pub fn predict(
    x: &StateVector,
    p: &StateCovariance,
    f: &SMatrix<f64, 9, 9>,
    q: &StateCovariance,
) -> (StateVector, StateCovariance) {
    let x_pred = f * x;
    let p_pred = f * p * f.transpose() + q;
    (x_pred, p_pred)
}

/// Measurement update with Joseph-form covariance.
///
/// Returns `None` when the innovation covariance S = H P H^T + R is not
/// positive definite (degenerate geometry); callers treat that as a
/// skipped update, not a fatal error.
pub fn update<const M: usize>(
    x: &StateVector,
    p: &StateCovariance,
    z: &SVector<f64, M>,
    h: &ObservationMatrix<M>,
    r: &NoiseMatrix<M>,
) -> Option<UpdateResult<M>> {
    let innovation = z - h * x;
    let s = h * p * h.transpose() + r;

    let chol = Cholesky::new(s)?;
    let s_inv = chol.inverse();

    // K = P H^T S^-1
    let k = p * h.transpose() * s_inv;

    let state = x + k * innovation;

    // Joseph form: (I - KH) P (I - KH)^T + K R K^T
    let i_kh = StateCovariance::identity() - k * h;
    let covariance = i_kh * p * i_kh.transpose() + k * r * k.transpose();

    let likelihood = gaussian_likelihood(&innovation, &chol);

    Some(UpdateResult {
        state,
        covariance,
        innovation,
        likelihood,
    })
}

/// Squared Mahalanobis distance of `z` to the predicted measurement,
/// `None` when S is singular.
pub fn mahalanobis_sq<const M: usize>(
    x: &StateVector,
    p: &StateCovariance,
    z: &SVector<f64, M>,
    h: &ObservationMatrix<M>,
    r: &NoiseMatrix<M>,
) -> Option<f64> {
    let innovation = z - h * x;
    let s = h * p * h.transpose() + r;
    let chol = Cholesky::new(s)?;
    let weighted = chol.solve(&innovation);
    Some(innovation.dot(&weighted))
}

/// Gaussian density of an innovation given the Cholesky factor of S.
pub fn gaussian_likelihood<const M: usize>(
    innovation: &SVector<f64, M>,
    s_chol: &Cholesky<f64, nalgebra::Const<M>>,
) -> f64 {
    let weighted = s_chol.solve(innovation);
    let d_sq = innovation.dot(&weighted);
    let det = s_chol.determinant();
    if det <= 0.0 {
        return 0.0;
    }
    let norm = ((2.0 * std::f64::consts::PI).powi(M as i32) * det).sqrt();
    (-0.5 * d_sq).exp() / norm
}

/// Force exact symmetry: P <- (P + P^T) / 2.
pub fn symmetrize(p: &StateCovariance) -> StateCovariance {
    (p + p.transpose()) * 0.5
}

/// Cholesky feasibility check (positive semi-definite within tolerance).
pub fn is_feasible(p: &StateCovariance) -> bool {
    // Tiny jitter tolerates exact-zero eigenvalues from inert states.
    Cholesky::new(p + StateCovariance::identity() * 1e-9).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn diag_cov(pos: f64, vel: f64, acc: f64) -> StateCovariance {
        let mut p = StateCovariance::zeros();
        for i in 0..3 {
            p[(i, i)] = pos;
            p[(i + 3, i + 3)] = vel;
            p[(i + 6, i + 6)] = acc;
        }
        p
    }

    #[test]
    fn update_pulls_state_toward_measurement() {
        let x = StateVector::zeros();
        let p = diag_cov(100.0, 10.0, 1.0);
        let z = Vector3::new(10.0, 5.0, 0.0);
        let h = position_observation_matrix();
        let r = NoiseMatrix::<3>::identity();

        let result = update(&x, &p, &z, &h, &r).unwrap();
        assert!(result.state[0] > 5.0);
        assert!(result.state[1] > 2.0);
        // Uncertainty shrinks
        assert!(result.covariance.trace() < p.trace());
    }

    #[test]
    fn update_preserves_feasibility() {
        let x = StateVector::zeros();
        let p = diag_cov(50.0, 25.0, 4.0);
        let z = Vector3::new(3.0, -2.0, 1.0);
        let h = position_observation_matrix();
        let r = NoiseMatrix::<3>::identity() * 4.0;

        let result = update(&x, &p, &z, &h, &r).unwrap();
        let sym = symmetrize(&result.covariance);
        assert!(is_feasible(&sym));
    }

    #[test]
    fn mahalanobis_orders_by_distance() {
        let x = StateVector::zeros();
        let p = diag_cov(4.0, 1.0, 1.0);
        let h = position_observation_matrix();
        let r = NoiseMatrix::<3>::identity();

        let near = mahalanobis_sq(&x, &p, &Vector3::new(1.0, 0.0, 0.0), &h, &r).unwrap();
        let far = mahalanobis_sq(&x, &p, &Vector3::new(20.0, 0.0, 0.0), &h, &r).unwrap();
        assert!(near < far);
        assert!(near < 1.0);
    }

    #[test]
    fn likelihood_decreases_with_distance() {
        let x = StateVector::zeros();
        let p = diag_cov(4.0, 1.0, 1.0);
        let h = position_observation_matrix();
        let r = NoiseMatrix::<3>::identity();

        let near = update(&x, &p, &Vector3::new(0.5, 0.0, 0.0), &h, &r).unwrap();
        let far = update(&x, &p, &Vector3::new(8.0, 0.0, 0.0), &h, &r).unwrap();
        assert!(near.likelihood > far.likelihood);
    }

    #[test]
    fn six_dim_update_uses_velocity() {
        let x = StateVector::zeros();
        let p = diag_cov(100.0, 100.0, 1.0);
        let mut z = nalgebra::SVector::<f64, 6>::zeros();
        z[0] = 10.0;
        z[3] = 5.0; // vE
        let h = position_velocity_observation_matrix();
        let r = NoiseMatrix::<6>::identity();

        let result = update(&x, &p, &z, &h, &r).unwrap();
        assert!(result.state[3] > 2.0, "velocity should move toward report");
    }

    #[test]
    fn symmetrize_is_exact() {
        let mut p = diag_cov(1.0, 1.0, 1.0);
        p[(0, 1)] = 0.5;
        let s = symmetrize(&p);
        assert_relative_eq!(s[(0, 1)], s[(1, 0)]);
        assert_relative_eq!(s[(0, 1)], 0.25);
    }
}
