//! Session configuration.
//!
//! All numeric thresholds of the fusion pipeline live here with the
//! documented defaults; nothing in the pipeline hardcodes them.

use serde::{Deserialize, Serialize};

use crate::domain::GeoPosition;
use crate::{FusionError, Result};

/// Data-association strategy, fixed per session at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AssociationStrategyKind {
    /// Global Nearest Neighbor: greedy exclusive assignment (default).
    #[default]
    Gnn,
    /// Joint Probabilistic Data Association: soft probability-weighted
    /// updates inside ambiguous clusters.
    Jpda,
    /// Multiple Hypothesis Tracking over a bounded horizon.
    Mht,
}

/// Estimator (IMM) tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Markov model-transition matrix, rows = from-model, columns =
    /// to-model, order [CV, CA, CT]. Each row must sum to 1.
    pub markov: [[f64; 3]; 3],
    /// Process-noise intensity for the constant-velocity model
    /// (white-noise acceleration, (m/s^2)^2)
    pub q_cv: f64,
    /// Process-noise intensity for the constant-acceleration model
    /// (white-noise jerk, (m/s^3)^2)
    pub q_ca: f64,
    /// Process-noise intensity for the coordinated-turn model ((m/s^2)^2)
    pub q_ct: f64,
    /// Nominal turn rate of the coordinated-turn model (rad/s)
    pub turn_rate_rad_s: f64,
    /// Initial velocity variance for tracks born without a velocity
    /// report ((m/s)^2)
    pub init_velocity_var: f64,
    /// Initial acceleration variance ((m/s^2)^2)
    pub init_accel_var: f64,
    /// Diagonal of the reset prior used when a covariance fails the
    /// Cholesky feasibility check: (position, velocity, acceleration)
    pub reset_prior_var: (f64, f64, f64),
    /// Multiplicative confidence penalty applied on a covariance reset
    pub instability_penalty: f64,
    /// Position-trace scale for the confidence score (m^2); larger traces
    /// reduce confidence more slowly with a larger scale
    pub confidence_trace_scale: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            // Sticky diagonal keeps model switching deliberate.
            markov: [
                [0.90, 0.05, 0.05],
                [0.05, 0.90, 0.05],
                [0.05, 0.05, 0.90],
            ],
            q_cv: 0.5,
            q_ca: 0.1,
            q_ct: 0.5,
            turn_rate_rad_s: 0.1,
            init_velocity_var: 100.0,
            init_accel_var: 4.0,
            reset_prior_var: (1_000.0, 400.0, 25.0),
            instability_penalty: 0.5,
            confidence_trace_scale: 500.0,
        }
    }
}

/// Configuration for one fusion session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Reference origin of the session's ENU frame
    pub origin: GeoPosition,
    /// Radius of the session's spatial scope (m); informational for
    /// region partitioning by the hosting application
    pub region_radius_m: f64,
    /// Association strategy, chosen once per session
    pub strategy: AssociationStrategyKind,
    /// Gate probability for the chi-square association gate
    /// (0.99 = 99%-confidence ellipse)
    pub gate_probability: f64,
    /// Explicit gate threshold override (squared Mahalanobis distance);
    /// when set, replaces the chi-square lookup
    pub gate_threshold_override: Option<f64>,
    /// M of the M-of-N confirmation rule
    pub confirm_m: usize,
    /// N of the M-of-N confirmation rule
    pub confirm_n: usize,
    /// Consecutive missed cycles before a confirmed track starts coasting
    pub idle_to_coast_cycles: u32,
    /// Coasting cycles without reacquisition before deletion
    pub coast_timeout_cycles: u32,
    /// Spatial state distance below which confirmed/coasting track pairs
    /// are merge candidates (m)
    pub merge_distance_m: f64,
    /// Minimum confidence both merge partners must have; below it the
    /// merge is skipped as a conflict
    pub merge_min_confidence: f64,
    /// Bounded per-track state history length
    pub history_capacity: usize,
    /// Lateness window: observations older than the current batch time by
    /// more than this are dropped (seconds)
    pub lateness_window_secs: f64,
    /// Number of cycle checkpoints retained for late-observation replay
    pub max_checkpoints: usize,
    /// MHT only: hypothesis horizon in cycles
    pub mht_horizon_cycles: u32,
    /// MHT only: maximum retained hypotheses per ambiguous cluster
    pub mht_max_branches: usize,
    /// Bounded input-queue capacity of the session runner (batches)
    pub queue_capacity: usize,
    /// Back-pressure drop policy: unattached observations below this
    /// confidence are dropped first under overload
    pub overload_min_confidence: f64,
    /// Estimator tuning
    pub estimator: EstimatorConfig,
}

impl SessionConfig {
    /// Configuration with the standard defaults, anchored at `origin`.
    pub fn new(origin: GeoPosition) -> Self {
        Self {
            origin,
            region_radius_m: 50_000.0,
            strategy: AssociationStrategyKind::default(),
            gate_probability: 0.99,
            gate_threshold_override: None,
            confirm_m: 3,
            confirm_n: 5,
            idle_to_coast_cycles: 3,
            coast_timeout_cycles: 10,
            merge_distance_m: 50.0,
            merge_min_confidence: 0.3,
            history_capacity: 32,
            lateness_window_secs: 5.0,
            max_checkpoints: 16,
            mht_horizon_cycles: 5,
            mht_max_branches: 16,
            queue_capacity: 64,
            overload_min_confidence: 0.3,
            estimator: EstimatorConfig::default(),
        }
    }

    /// Start a builder anchored at `origin`.
    pub fn builder(origin: GeoPosition) -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: Self::new(origin),
        }
    }

    /// Squared-Mahalanobis gate threshold for a measurement of dimension
    /// `dim` (chi-square quantile at `gate_probability`).
    pub fn gate_threshold(&self, dim: usize) -> f64 {
        if let Some(t) = self.gate_threshold_override {
            return t;
        }
        // Chi-square quantiles for the supported measurement dimensions.
        match (dim, self.gate_probability >= 0.99) {
            (3, true) => 11.345,
            (3, false) => 7.815,
            (6, true) => 16.812,
            (6, false) => 12.592,
            // Unsupported dimension: fall back to the 3-D gate.
            (_, true) => 11.345,
            (_, false) => 7.815,
        }
    }

    /// Validate invariants that would corrupt a session if violated.
    pub fn validate(&self) -> Result<()> {
        let fatal = |message: &str| FusionError::SessionFatal {
            message: message.to_string(),
        };
        if self.confirm_m == 0 || self.confirm_m > self.confirm_n {
            return Err(fatal("confirmation rule requires 0 < M <= N"));
        }
        if !(0.0..=1.0).contains(&self.gate_probability) {
            return Err(fatal("gate probability outside [0, 1]"));
        }
        if self.coast_timeout_cycles == 0 {
            return Err(fatal("coast timeout must be at least one cycle"));
        }
        if self.lateness_window_secs < 0.0 {
            return Err(fatal("lateness window must be non-negative"));
        }
        if self.max_checkpoints == 0 {
            return Err(fatal("checkpoint retention must cover at least one cycle"));
        }
        for row in &self.estimator.markov {
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > 1e-6 || row.iter().any(|p| *p < 0.0) {
                return Err(fatal("markov transition rows must be stochastic"));
            }
        }
        Ok(())
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Association strategy.
    pub fn strategy(mut self, s: AssociationStrategyKind) -> Self {
        self.config.strategy = s;
        self
    }

    /// Gate probability (clamped to [0, 1]).
    pub fn gate_probability(mut self, p: f64) -> Self {
        self.config.gate_probability = p.clamp(0.0, 1.0);
        self
    }

    /// M-of-N confirmation parameters.
    pub fn confirmation(mut self, m: usize, n: usize) -> Self {
        self.config.confirm_m = m;
        self.config.confirm_n = n;
        self
    }

    /// Idle cycles before coasting.
    pub fn idle_to_coast_cycles(mut self, c: u32) -> Self {
        self.config.idle_to_coast_cycles = c;
        self
    }

    /// Coast timeout in cycles.
    pub fn coast_timeout_cycles(mut self, c: u32) -> Self {
        self.config.coast_timeout_cycles = c;
        self
    }

    /// Merge distance threshold in metres.
    pub fn merge_distance_m(mut self, d: f64) -> Self {
        self.config.merge_distance_m = d.max(0.0);
        self
    }

    /// Minimum confidence for merges.
    pub fn merge_min_confidence(mut self, c: f64) -> Self {
        self.config.merge_min_confidence = c.clamp(0.0, 1.0);
        self
    }

    /// Lateness window in seconds.
    pub fn lateness_window_secs(mut self, s: f64) -> Self {
        self.config.lateness_window_secs = s.max(0.0);
        self
    }

    /// Input queue capacity of the runner.
    pub fn queue_capacity(mut self, c: usize) -> Self {
        self.config.queue_capacity = c.max(1);
        self
    }

    /// Estimator tuning.
    pub fn estimator(mut self, e: EstimatorConfig) -> Self {
        self.config.estimator = e;
        self
    }

    /// Validate and finish.
    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
