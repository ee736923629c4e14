//! facegate-core: attendance decision engine.
//!
//! Decides whether a captured photo matches an identity's stored reference
//! photo, whether the capture location lies inside the identity's geofence,
//! and which shift window applies to a date. Face embeddings come from SCRFD
//! detection and ArcFace recognition running on ONNX Runtime; persistence is
//! reached through the traits in [`store`].

pub mod alignment;
pub mod detector;
pub mod encoder;
pub mod geofence;
pub mod history;
pub mod lifecycle;
pub mod matcher;
pub mod normalizer;
pub mod onnx;
pub mod recognizer;
pub mod shift;
pub mod store;
pub mod types;
pub mod verify;

#[cfg(test)]
mod testing;

use std::path::PathBuf;

pub use encoder::{EmbedderError, FaceEmbedder, FaceEncoder};
pub use lifecycle::{LifecycleError, ReferenceManager, ResetOutcome};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher, MATCH_THRESHOLD};
pub use onnx::OnnxFaceEmbedder;
pub use store::{CheckinSink, IdentityStore, LocationHistory, ReferenceStore, StoreError};
pub use types::{
    CheckinEvent, Embedding, GeoPoint, Identity, LocationPoint, ReferenceImage, Shift,
    ShiftWindow,
};
pub use verify::{CheckinStatus, Verification, VerifyError, VerifyRequest, Verifier};

/// `$XDG_DATA_HOME/facegate`, falling back to `~/.local/share/facegate`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

/// Where the ONNX model files live unless configured otherwise.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}
