//! Recursive state estimation: motion models, Kalman math, and the
//! interacting-multiple-model (IMM) estimator.
//!
//! All estimation runs on a shared 9-dimensional state in the session ENU
//! frame so the model bank can be mixed uniformly:
//!
//! ```text
//! x = [pE, pN, pU, vE, vN, vU, aE, aN, aU]
//! ```

pub mod imm;
pub mod kalman;
pub mod motion;

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};

use crate::domain::{EnuFrame, MeasurementCovariance, Observation};

/// State dimension of the shared model bank.
pub const STATE_DIM: usize = 9;
/// Number of motion models in the bank.
pub const MODEL_COUNT: usize = 3;

/// 9-dimensional state vector.
pub type StateVector = SVector<f64, STATE_DIM>;
/// 9x9 state covariance.
pub type StateCovariance = SMatrix<f64, STATE_DIM, STATE_DIM>;

/// An observation projected into the session ENU frame, ready for gating
/// and filtering.
#[derive(Debug, Clone)]
pub struct EnuMeasurement {
    /// Measured ENU position (m)
    pub position: Vector3<f64>,
    /// Measured ENU velocity, when the source reported one (m/s)
    pub velocity: Option<Vector3<f64>>,
    /// Measurement covariance (3x3 or 6x6 matching `velocity`)
    pub covariance: MeasurementCovariance,
}

impl EnuMeasurement {
    /// Project an observation into `frame`.
    ///
    /// A position-velocity covariance on a velocity-less observation is
    /// narrowed to its position block so dimensions always agree.
    pub fn from_observation(obs: &Observation, frame: &EnuFrame) -> Self {
        let enu = frame.to_enu(&obs.position);
        let position = Vector3::new(enu.east, enu.north, enu.up);
        let covariance = match (&obs.velocity, &obs.covariance) {
            (Some(_), MeasurementCovariance::PositionVelocity(pv)) => {
                MeasurementCovariance::PositionVelocity(*pv)
            }
            (Some(_), MeasurementCovariance::Position(p)) => {
                // Velocity reported without a velocity covariance: pad with
                // the source's position variance scaled to a nominal rate.
                let mut pv = SMatrix::<f64, 6, 6>::zeros();
                pv.fixed_view_mut::<3, 3>(0, 0).copy_from(p);
                let vel_var = p.trace() / 3.0;
                pv.fixed_view_mut::<3, 3>(3, 3)
                    .copy_from(&(Matrix3::identity() * vel_var));
                MeasurementCovariance::PositionVelocity(pv)
            }
            (None, cov) => MeasurementCovariance::Position(cov.position_block()),
        };
        Self {
            position,
            velocity: obs.velocity,
            covariance,
        }
    }

    /// Measurement dimension (3 or 6).
    pub fn dim(&self) -> usize {
        if self.velocity.is_some() {
            6
        } else {
            3
        }
    }
}
