//! Canonical sensor observation and its source/entity vocabulary.
//!
//! An [`Observation`] is the immutable unit of input to the fusion
//! pipeline: one georeferenced detection from one sensor at one time,
//! already normalized to SI units / WGS84 / UTC by the
//! [`Normalizer`](crate::normalize::Normalizer).

use chrono::{DateTime, Utc};
use nalgebra::{Matrix3, Matrix6, Vector3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::geo::GeoPosition;
use crate::{FusionError, Result};

/// Upper bound on physically plausible entity speed (m/s). Reports above
/// this are rejected as malformed rather than fed to the estimator.
pub const MAX_SPEED_MPS: f64 = 3_000.0;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable identifier for a single observation.
///
/// Producers that re-deliver a record must reuse the id; the session uses
/// it to guarantee idempotent ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObservationId(Uuid);

impl ObservationId {
    /// Allocate a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an externally supplied id.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Borrow the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ObservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a concrete sensor or collection source (e.g. one
/// satellite, one UAV payload, one SIGINT site).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(String);

impl SourceId {
    /// Wrap a source name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The source name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Source taxonomy
// ---------------------------------------------------------------------------

/// Category of sensor that produced an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    /// Satellite-derived object detection
    Satellite,
    /// UAV electro-optical / infrared track
    UavEoIr,
    /// Radar plot
    Radar,
    /// SIGINT-derived position report
    Sigint,
    /// HUMINT-derived position report
    Humint,
}

impl SourceType {
    /// Default 1-sigma accuracy in metres `(horizontal, vertical)` used to
    /// derive a measurement covariance when the producer supplies none.
    pub fn accuracy_model(&self) -> (f64, f64) {
        match self {
            SourceType::Satellite => (10.0, 20.0),
            SourceType::UavEoIr => (5.0, 8.0),
            SourceType::Radar => (15.0, 25.0),
            SourceType::Sigint => (500.0, 1_000.0),
            SourceType::Humint => (1_000.0, 2_000.0),
        }
    }

    /// Relative reliability weight in [0, 1], used for update ordering,
    /// association tie-breaks, and confidence scoring.
    pub fn reliability(&self) -> f64 {
        match self {
            SourceType::Radar => 0.90,
            SourceType::Satellite => 0.85,
            SourceType::UavEoIr => 0.80,
            SourceType::Sigint => 0.60,
            SourceType::Humint => 0.40,
        }
    }
}

// ---------------------------------------------------------------------------
// Entity taxonomy
// ---------------------------------------------------------------------------

/// Hypothesized type of the observed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    /// Tracked or wheeled ground vehicle
    GroundVehicle,
    /// Fixed- or rotary-wing aircraft
    Aircraft,
    /// Surface vessel
    Vessel,
    /// Dismounted person or group
    Personnel,
    /// Static installation or emitter site
    Installation,
    /// Type could not be determined
    Unknown,
}

impl EntityType {
    /// Coarse category used for merge compatibility checks.
    pub fn category(&self) -> EntityCategory {
        match self {
            EntityType::GroundVehicle | EntityType::Personnel => EntityCategory::Ground,
            EntityType::Aircraft => EntityCategory::Air,
            EntityType::Vessel => EntityCategory::Maritime,
            EntityType::Installation => EntityCategory::Fixed,
            EntityType::Unknown => EntityCategory::Unknown,
        }
    }

    /// Whether two hypotheses may describe the same physical entity.
    /// `Unknown` is compatible with everything.
    pub fn compatible_with(&self, other: &EntityType) -> bool {
        let (a, b) = (self.category(), other.category());
        a == EntityCategory::Unknown || b == EntityCategory::Unknown || a == b
    }
}

/// Coarse entity category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityCategory {
    /// Ground-domain entities (vehicles, personnel)
    Ground,
    /// Air-domain entities
    Air,
    /// Maritime-domain entities
    Maritime,
    /// Fixed sites
    Fixed,
    /// Undetermined
    Unknown,
}

// ---------------------------------------------------------------------------
// Classification marking
// ---------------------------------------------------------------------------

/// Classification marking attached to observations and propagated to
/// tracks (a track carries the highest marking among its contributors).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum ClassificationMarking {
    /// No classification
    #[default]
    Unclassified,
    /// Restricted distribution
    Restricted,
    /// Confidential
    Confidential,
    /// Secret
    Secret,
    /// Top secret
    TopSecret,
}

// ---------------------------------------------------------------------------
// Measurement covariance
// ---------------------------------------------------------------------------

/// Measurement covariance for an observation, in the session ENU frame.
///
/// Position-only observations carry a 3x3 block; observations that also
/// report velocity carry the full 6x6 (pos+vel) covariance.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementCovariance {
    /// 3x3 position covariance (m^2)
    Position(Matrix3<f64>),
    /// 6x6 position+velocity covariance (m^2, m^2/s^2)
    PositionVelocity(Matrix6<f64>),
}

impl MeasurementCovariance {
    /// Derive a position covariance from 1-sigma horizontal/vertical
    /// accuracy values, treating horizontal error as isotropic.
    pub fn from_accuracy(horizontal_sigma_m: f64, vertical_sigma_m: f64) -> Self {
        let h2 = horizontal_sigma_m * horizontal_sigma_m;
        let v2 = vertical_sigma_m * vertical_sigma_m;
        Self::Position(Matrix3::from_diagonal(&Vector3::new(h2, h2, v2)))
    }

    /// The position (top-left 3x3) block.
    pub fn position_block(&self) -> Matrix3<f64> {
        match self {
            MeasurementCovariance::Position(p) => *p,
            MeasurementCovariance::PositionVelocity(pv) => pv.fixed_view::<3, 3>(0, 0).into(),
        }
    }

    /// Measurement dimension (3 or 6).
    pub fn dim(&self) -> usize {
        match self {
            MeasurementCovariance::Position(_) => 3,
            MeasurementCovariance::PositionVelocity(_) => 6,
        }
    }
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// A single normalized detection from one sensor at one time.
///
/// Immutable after construction; all fields are validated by
/// [`Observation::builder`]. Physically or geographically invalid values
/// are rejected with [`FusionError::MalformedObservation`].
#[derive(Debug, Clone)]
pub struct Observation {
    /// Unique, producer-stable id
    pub id: ObservationId,
    /// Sensor category
    pub source_type: SourceType,
    /// Concrete sensor / collection source
    pub source_id: SourceId,
    /// When the entity was observed (UTC)
    pub observed_at: DateTime<Utc>,
    /// When this engine ingested the record (UTC)
    pub ingested_at: DateTime<Utc>,
    /// Georeferenced position
    pub position: GeoPosition,
    /// 1-sigma horizontal accuracy (m)
    pub horizontal_accuracy_m: f64,
    /// 1-sigma vertical accuracy (m)
    pub vertical_accuracy_m: f64,
    /// Optional ENU velocity report (m/s, east/north/up)
    pub velocity: Option<Vector3<f64>>,
    /// Entity-type hypothesis from the producing detector
    pub entity_type: Option<EntityType>,
    /// Detector quality/confidence in [0, 1]
    pub confidence: f64,
    /// Classification marking of the source report
    pub marking: ClassificationMarking,
    /// Measurement covariance (supplied or derived from the accuracy model)
    pub covariance: MeasurementCovariance,
}

impl Observation {
    /// Start building a validated observation.
    pub fn builder(source_type: SourceType, source_id: SourceId) -> ObservationBuilder {
        ObservationBuilder {
            id: None,
            source_type,
            source_id,
            observed_at: None,
            position: None,
            accuracy: None,
            velocity: None,
            entity_type: None,
            confidence: 0.5,
            marking: ClassificationMarking::default(),
            covariance: None,
        }
    }

    /// Reliability weight of the producing source type.
    pub fn reliability(&self) -> f64 {
        self.source_type.reliability()
    }
}

/// Builder for [`Observation`] with validation at `build`.
#[derive(Debug, Clone)]
pub struct ObservationBuilder {
    id: Option<ObservationId>,
    source_type: SourceType,
    source_id: SourceId,
    observed_at: Option<DateTime<Utc>>,
    position: Option<GeoPosition>,
    accuracy: Option<(f64, f64)>,
    velocity: Option<Vector3<f64>>,
    entity_type: Option<EntityType>,
    confidence: f64,
    marking: ClassificationMarking,
    covariance: Option<MeasurementCovariance>,
}

impl ObservationBuilder {
    /// Use a producer-supplied id (required for idempotent re-delivery).
    pub fn id(mut self, id: ObservationId) -> Self {
        self.id = Some(id);
        self
    }

    /// Observation time (required).
    pub fn observed_at(mut self, t: DateTime<Utc>) -> Self {
        self.observed_at = Some(t);
        self
    }

    /// Geographic position (required); validated on `build`.
    pub fn position(mut self, lat_deg: f64, lon_deg: f64, alt_m: f64) -> Self {
        // Deliberately unvalidated here so build() can report the reason.
        self.position = Some(GeoPosition {
            lat_deg,
            lon_deg,
            alt_m,
        });
        self
    }

    /// 1-sigma accuracy override (horizontal, vertical) in metres.
    pub fn accuracy(mut self, horizontal_m: f64, vertical_m: f64) -> Self {
        self.accuracy = Some((horizontal_m, vertical_m));
        self
    }

    /// ENU velocity report in m/s.
    pub fn velocity(mut self, east: f64, north: f64, up: f64) -> Self {
        self.velocity = Some(Vector3::new(east, north, up));
        self
    }

    /// Entity-type hypothesis.
    pub fn entity_type(mut self, t: EntityType) -> Self {
        self.entity_type = Some(t);
        self
    }

    /// Detector confidence in [0, 1].
    pub fn confidence(mut self, c: f64) -> Self {
        self.confidence = c;
        self
    }

    /// Classification marking.
    pub fn marking(mut self, m: ClassificationMarking) -> Self {
        self.marking = m;
        self
    }

    /// Producer-supplied measurement covariance, overriding the per-source
    /// accuracy model.
    pub fn covariance(mut self, cov: MeasurementCovariance) -> Self {
        self.covariance = Some(cov);
        self
    }

    /// Validate and construct the observation.
    pub fn build(self) -> Result<Observation> {
        let malformed = |reason: &str| FusionError::MalformedObservation {
            reason: reason.to_string(),
        };

        let observed_at = self
            .observed_at
            .ok_or_else(|| malformed("missing observation time"))?;

        let raw = self
            .position
            .ok_or_else(|| malformed("missing position"))?;
        let position = GeoPosition::new(raw.lat_deg, raw.lon_deg, raw.alt_m)
            .ok_or_else(|| malformed("position outside WGS84 bounds or non-finite"))?;

        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(malformed("confidence outside [0, 1]"));
        }

        if let Some(v) = &self.velocity {
            if !v.iter().all(|c| c.is_finite()) {
                return Err(malformed("non-finite velocity component"));
            }
            if v.norm() > MAX_SPEED_MPS {
                return Err(malformed("speed exceeds physical bound"));
            }
        }

        let (h_sigma, v_sigma) = match self.accuracy {
            Some((h, v)) => {
                if !(h.is_finite() && v.is_finite()) || h <= 0.0 || v <= 0.0 {
                    return Err(malformed("non-positive accuracy"));
                }
                (h, v)
            }
            None => self.source_type.accuracy_model(),
        };

        let covariance = self
            .covariance
            .unwrap_or_else(|| MeasurementCovariance::from_accuracy(h_sigma, v_sigma));

        Ok(Observation {
            id: self.id.unwrap_or_default(),
            source_type: self.source_type,
            source_id: self.source_id,
            observed_at,
            ingested_at: Utc::now(),
            position,
            horizontal_accuracy_m: h_sigma,
            vertical_accuracy_m: v_sigma,
            velocity: self.velocity,
            entity_type: self.entity_type,
            confidence: self.confidence,
            marking: self.marking,
            covariance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_builder() -> ObservationBuilder {
        Observation::builder(SourceType::Radar, SourceId::new("radar-01"))
            .observed_at(Utc::now())
            .position(48.0, 11.0, 500.0)
    }

    #[test]
    fn builds_with_derived_covariance() {
        let obs = base_builder().confidence(0.9).build().unwrap();
        let (h, v) = SourceType::Radar.accuracy_model();
        assert_eq!(obs.horizontal_accuracy_m, h);
        assert_eq!(obs.vertical_accuracy_m, v);
        let p = obs.covariance.position_block();
        assert!((p[(0, 0)] - h * h).abs() < 1e-9);
        assert!((p[(2, 2)] - v * v).abs() < 1e-9);
    }

    #[test]
    fn rejects_bad_latitude() {
        let err = Observation::builder(SourceType::Sigint, SourceId::new("s"))
            .observed_at(Utc::now())
            .position(95.0, 0.0, 0.0)
            .build()
            .unwrap_err();
        assert!(matches!(err, FusionError::MalformedObservation { .. }));
    }

    #[test]
    fn rejects_missing_time() {
        let err = Observation::builder(SourceType::Radar, SourceId::new("r"))
            .position(0.0, 0.0, 0.0)
            .build()
            .unwrap_err();
        assert!(matches!(err, FusionError::MalformedObservation { .. }));
    }

    #[test]
    fn rejects_implausible_speed() {
        let err = base_builder()
            .velocity(5_000.0, 0.0, 0.0)
            .build()
            .unwrap_err();
        assert!(matches!(err, FusionError::MalformedObservation { .. }));
    }

    #[test]
    fn rejects_confidence_out_of_range() {
        assert!(base_builder().confidence(1.2).build().is_err());
        assert!(base_builder().confidence(-0.1).build().is_err());
    }

    #[test]
    fn marking_order_is_ascending() {
        assert!(ClassificationMarking::TopSecret > ClassificationMarking::Secret);
        assert!(ClassificationMarking::Confidential > ClassificationMarking::Unclassified);
    }

    #[test]
    fn entity_compatibility() {
        assert!(EntityType::GroundVehicle.compatible_with(&EntityType::Personnel));
        assert!(EntityType::Unknown.compatible_with(&EntityType::Aircraft));
        assert!(!EntityType::Aircraft.compatible_with(&EntityType::Vessel));
    }
}
