//! Motion-model bank: constant velocity, constant acceleration, and
//! coordinated turn as a tagged variant with per-model transition and
//! process-noise builders, so the bank can be iterated and blended
//! uniformly by the IMM mixer.

use nalgebra::SMatrix;

use super::{StateCovariance, MODEL_COUNT};
use crate::config::EstimatorConfig;

/// Transition matrix type (9x9).
pub type TransitionMatrix = SMatrix<f64, 9, 9>;

/// One motion hypothesis of the model bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionModel {
    /// Nearly-constant velocity; acceleration states are inert.
    ConstantVelocity,
    /// Constant acceleration (white-noise jerk).
    ConstantAcceleration,
    /// Coordinated turn at the configured nominal rate, horizontal plane.
    CoordinatedTurn,
}

/// Bank order used everywhere a model-probability vector is indexed.
pub const MODEL_BANK: [MotionModel; MODEL_COUNT] = [
    MotionModel::ConstantVelocity,
    MotionModel::ConstantAcceleration,
    MotionModel::CoordinatedTurn,
];

impl MotionModel {
    /// State-transition matrix F for a step of `dt` seconds.
    pub fn transition_matrix(&self, dt: f64, cfg: &EstimatorConfig) -> TransitionMatrix {
        match self {
            MotionModel::ConstantVelocity => cv_transition(dt),
            MotionModel::ConstantAcceleration => ca_transition(dt),
            MotionModel::CoordinatedTurn => ct_transition(dt, cfg.turn_rate_rad_s),
        }
    }

    /// Discrete process-noise matrix Q for a step of `dt` seconds.
    pub fn process_noise(&self, dt: f64, cfg: &EstimatorConfig) -> StateCovariance {
        match self {
            MotionModel::ConstantVelocity => wna_process_noise(dt, cfg.q_cv),
            MotionModel::ConstantAcceleration => wnj_process_noise(dt, cfg.q_ca),
            MotionModel::CoordinatedTurn => wna_process_noise(dt, cfg.q_ct),
        }
    }
}

/// Constant velocity: p += v dt, velocity and vertical as-is,
/// acceleration states decay to zero (inert under this hypothesis).
fn cv_transition(dt: f64) -> TransitionMatrix {
    let mut f = TransitionMatrix::identity();
    for i in 0..3 {
        f[(i, i + 3)] = dt;
        f[(i + 6, i + 6)] = 0.0;
    }
    f
}

/// Constant acceleration: p += v dt + a dt^2/2, v += a dt.
fn ca_transition(dt: f64) -> TransitionMatrix {
    let mut f = TransitionMatrix::identity();
    let half_dt2 = 0.5 * dt * dt;
    for i in 0..3 {
        f[(i, i + 3)] = dt;
        f[(i, i + 6)] = half_dt2;
        f[(i + 3, i + 6)] = dt;
    }
    f
}

/// Coordinated turn at known rate `omega` in the horizontal (E, N)
/// plane; vertical channel is constant velocity; acceleration states are
/// inert. Standard known-turn-rate kinematics:
///
/// ```text
/// pE += ( vE sin(w dt) - vN (1 - cos(w dt)) ) / w
/// pN += ( vE (1 - cos(w dt)) + vN sin(w dt) ) / w
/// vE' = vE cos(w dt) - vN sin(w dt)
/// vN' = vE sin(w dt) + vN cos(w dt)
/// ```
fn ct_transition(dt: f64, omega: f64) -> TransitionMatrix {
    // Degenerate turn rate collapses to constant velocity.
    if omega.abs() < 1e-9 {
        return cv_transition(dt);
    }
    let wt = omega * dt;
    let (sin_wt, cos_wt) = wt.sin_cos();
    let s_w = sin_wt / omega;
    let c_w = (1.0 - cos_wt) / omega;

    let mut f = TransitionMatrix::identity();
    // East/north position from rotating velocity
    f[(0, 3)] = s_w;
    f[(0, 4)] = -c_w;
    f[(1, 3)] = c_w;
    f[(1, 4)] = s_w;
    // Vertical position: plain integration
    f[(2, 5)] = dt;
    // Rotated horizontal velocity
    f[(3, 3)] = cos_wt;
    f[(3, 4)] = -sin_wt;
    f[(4, 3)] = sin_wt;
    f[(4, 4)] = cos_wt;
    // Acceleration states inert
    for i in 6..9 {
        f[(i, i)] = 0.0;
    }
    f
}

/// White-noise-acceleration process noise on the (p, v) blocks:
///
/// ```text
///          | dt^4/4  dt^3/2 |
/// Q = q *  |                |   per axis
///          | dt^3/2  dt^2   |
/// ```
///
/// A small floor on the acceleration diagonal keeps Q positive definite
/// for models whose transition zeroes the acceleration states.
fn wna_process_noise(dt: f64, q: f64) -> StateCovariance {
    let dt2 = dt * dt;
    let dt3 = dt2 * dt;
    let dt4 = dt3 * dt;

    let qpp = q * dt4 / 4.0;
    let qpv = q * dt3 / 2.0;
    let qvv = q * dt2;
    let qa_floor = (q * dt2).max(1e-9) * 1e-3;

    let mut m = StateCovariance::zeros();
    for i in 0..3 {
        m[(i, i)] = qpp;
        m[(i + 3, i + 3)] = qvv;
        m[(i, i + 3)] = qpv;
        m[(i + 3, i)] = qpv;
        m[(i + 6, i + 6)] = qa_floor;
    }
    m
}

/// White-noise-jerk process noise over (p, v, a) per axis:
///
/// ```text
///         | dt^5/20  dt^4/8  dt^3/6 |
/// Q = q * | dt^4/8   dt^3/3  dt^2/2 |
///         | dt^3/6   dt^2/2  dt     |
/// ```
fn wnj_process_noise(dt: f64, q: f64) -> StateCovariance {
    let dt2 = dt * dt;
    let dt3 = dt2 * dt;
    let dt4 = dt3 * dt;
    let dt5 = dt4 * dt;

    let blocks = [
        [q * dt5 / 20.0, q * dt4 / 8.0, q * dt3 / 6.0],
        [q * dt4 / 8.0, q * dt3 / 3.0, q * dt2 / 2.0],
        [q * dt3 / 6.0, q * dt2 / 2.0, q * dt],
    ];

    let mut m = StateCovariance::zeros();
    for axis in 0..3 {
        for bi in 0..3 {
            for bj in 0..3 {
                m[(axis + 3 * bi, axis + 3 * bj)] = blocks[bi][bj];
            }
        }
    }
    m
}
