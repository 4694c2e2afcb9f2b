//! Domain model: geographic frames, observations, tracks, and deltas.

pub mod geo;
pub mod observation;
pub mod track;

pub use geo::{EnuFrame, EnuPosition, GeoPosition};
pub use observation::{
    ClassificationMarking, EntityCategory, EntityType, MeasurementCovariance, Observation,
    ObservationBuilder, ObservationId, SourceId, SourceType, MAX_SPEED_MPS,
};
pub use track::{
    AssociationWindow, ContributingSource, CovarianceSummary, Track, TrackDelta, TrackDeltaKind,
    TrackId, TrackSnapshot, TrackStatus,
};
