//! # trackfuse
//!
//! A multi-sensor track-fusion engine producing a Common Operational
//! Picture (COP) from heterogeneous detection feeds.
//!
//! Observations from satellites, UAV EO/IR payloads, radar, SIGINT, and
//! HUMINT reporting are normalized into a canonical form, associated to
//! maintained tracks, filtered through an interacting-multiple-model
//! (IMM) estimator, and managed through an M-of-N confirmation and
//! coasting lifecycle. Each processing cycle emits a delta set that
//! downstream consumers fold into their picture.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        trackfuse                          │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌───────────┐  ┌─────────────┐  ┌──────────────────┐   │
//! │  │ Normalize │  │ Association │  │    Estimation     │   │
//! │  │  (feeds)  │  │ GNN/JPDA/MHT│  │  (IMM: CV/CA/CT)  │   │
//! │  └─────┬─────┘  └──────┬──────┘  └────────┬─────────┘   │
//! │        └───────────────┼──────────────────┘              │
//! │                ┌───────▼────────┐                        │
//! │                │ FusionSession  │──► track deltas (COP)  │
//! │                │  + lifecycle   │                        │
//! │                └───────┬────────┘                        │
//! │                ┌───────▼────────┐                        │
//! │                │ SessionRunner  │  (async, bounded queue)│
//! │                └────────────────┘                        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use trackfuse::{
//!     FusionSession, ObservationBatch, SessionConfig,
//!     domain::{GeoPosition, Observation, SourceId, SourceType},
//! };
//!
//! fn main() -> trackfuse::Result<()> {
//!     let origin = GeoPosition::new(48.10, 11.50, 500.0).expect("valid origin");
//!     let config = SessionConfig::builder(origin).build()?;
//!     let mut session = FusionSession::new(config)?;
//!
//!     let obs = Observation::builder(SourceType::Radar, SourceId::new("radar-07"))
//!         .observed_at(chrono::Utc::now())
//!         .position(48.11, 11.52, 540.0)
//!         .confidence(0.9)
//!         .build()?;
//!
//!     let output = session.run_cycle(ObservationBatch::new(vec![obs]))?;
//!     for delta in &output.deltas {
//!         println!("{:?} {}", delta.kind, delta.track_id);
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod association;
pub mod config;
pub mod domain;
pub mod estimation;
pub mod manager;
pub mod normalize;
pub mod runtime;
pub mod session;

// Re-export main types
pub use config::{AssociationStrategyKind, EstimatorConfig, SessionConfig, SessionConfigBuilder};
pub use domain::{
    ClassificationMarking, EntityType, EnuFrame, EnuPosition, GeoPosition, Observation,
    ObservationBuilder, ObservationId, SourceId, SourceType, Track, TrackDelta, TrackDeltaKind,
    TrackId, TrackStatus,
};
pub use normalize::{Normalizer, RawDetection};
pub use runtime::{SessionHandle, SessionRegistry, SessionRunner};
pub use session::{CycleOutput, FusionSession, ObservationBatch, SessionStats, StatsSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common result type for fusion operations
pub type Result<T> = std::result::Result<T, FusionError>;

/// Unified error type for fusion operations
#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    /// An input record failed validation and was rejected.
    #[error("malformed observation: {reason}")]
    MalformedObservation {
        /// Which validation failed
        reason: String,
    },

    /// The session is in a state it cannot recover from (invalid
    /// configuration, corrupted internal invariant).
    #[error("session fatal: {message}")]
    SessionFatal {
        /// What went wrong
        message: String,
    },

    /// The session runner's channel closed while the peer still needed it.
    #[error("session channel closed")]
    ChannelClosed,
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        // Errors
        FusionError,
        Result,
        // Configuration
        AssociationStrategyKind,
        EstimatorConfig,
        SessionConfig,
        // Domain types
        ClassificationMarking,
        EntityType,
        GeoPosition,
        Observation,
        ObservationId,
        SourceId,
        SourceType,
        Track,
        TrackDelta,
        TrackDeltaKind,
        TrackId,
        TrackStatus,
        // Pipeline
        CycleOutput,
        FusionSession,
        Normalizer,
        ObservationBatch,
        RawDetection,
        // Runtime
        SessionHandle,
        SessionRegistry,
        SessionRunner,
    };
}
