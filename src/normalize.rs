//! Source-report normalization.
//!
//! Upstream feed adapters deliver [`RawDetection`] records in a common
//! serialized shape; the [`Normalizer`] validates each record and turns
//! it into a canonical [`Observation`], deriving a measurement covariance
//! from the per-source accuracy model when the producer supplies none.
//! Malformed records are rejected with a reason and counted, never fed to
//! the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    ClassificationMarking, EntityType, Observation, ObservationId, SourceId, SourceType,
};
use crate::Result;

/// One detection as delivered by a feed adapter, prior to validation.
///
/// Optional fields default from the source-type model during
/// normalization. `id` must be stable across re-deliveries of the same
/// record so ingestion stays idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDetection {
    /// Producer-stable record id
    pub id: Uuid,
    /// Concrete source name (e.g. "radar-07")
    pub source_id: String,
    /// Sensor category
    pub source_type: SourceType,
    /// Observation time (UTC)
    pub observed_at: DateTime<Utc>,
    /// Latitude in degrees
    pub latitude_deg: f64,
    /// Longitude in degrees
    pub longitude_deg: f64,
    /// Altitude above the WGS84 ellipsoid (m)
    #[serde(default)]
    pub altitude_m: f64,
    /// Reported ENU velocity [east, north, up] (m/s)
    #[serde(default)]
    pub velocity_enu_mps: Option<[f64; 3]>,
    /// 1-sigma horizontal accuracy (m); source model when absent
    #[serde(default)]
    pub horizontal_accuracy_m: Option<f64>,
    /// 1-sigma vertical accuracy (m); source model when absent
    #[serde(default)]
    pub vertical_accuracy_m: Option<f64>,
    /// Detector confidence in [0, 1]; source reliability when absent
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Entity-type hypothesis
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    /// Classification marking; `Unclassified` when absent
    #[serde(default)]
    pub marking: Option<ClassificationMarking>,
}

/// Stateful normalizer front-end. One per session input path.
#[derive(Debug, Default)]
pub struct Normalizer {
    accepted: u64,
    rejected: u64,
}

impl Normalizer {
    /// Create a normalizer with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate one raw record into a canonical observation.
    ///
    /// Errors are [`FusionError::MalformedObservation`] naming the
    /// offending field.
    ///
    /// [`FusionError::MalformedObservation`]: crate::FusionError::MalformedObservation
    pub fn normalize(&mut self, raw: RawDetection) -> Result<Observation> {
        let mut builder = Observation::builder(raw.source_type, SourceId::new(raw.source_id))
            .id(ObservationId::from_uuid(raw.id))
            .observed_at(raw.observed_at)
            .position(raw.latitude_deg, raw.longitude_deg, raw.altitude_m)
            .confidence(
                raw.confidence
                    .unwrap_or_else(|| raw.source_type.reliability()),
            )
            .marking(raw.marking.unwrap_or_default());

        if let Some([e, n, u]) = raw.velocity_enu_mps {
            builder = builder.velocity(e, n, u);
        }
        if let Some(t) = raw.entity_type {
            builder = builder.entity_type(t);
        }
        if let (Some(h), Some(v)) = (raw.horizontal_accuracy_m, raw.vertical_accuracy_m) {
            builder = builder.accuracy(h, v);
        }

        match builder.build() {
            Ok(obs) => {
                self.accepted += 1;
                Ok(obs)
            }
            Err(err) => {
                self.rejected += 1;
                tracing::warn!(source = ?raw.source_type, error = %err, "rejected detection");
                Err(err)
            }
        }
    }

    /// Normalize a batch, dropping malformed records.
    pub fn normalize_batch(&mut self, raws: Vec<RawDetection>) -> Vec<Observation> {
        raws.into_iter()
            .filter_map(|raw| self.normalize(raw).ok())
            .collect()
    }

    /// Records accepted so far.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Records rejected so far.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}
