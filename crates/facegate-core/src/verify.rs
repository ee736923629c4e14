//! Verification: face match against the stored reference, then geofenced check-in.

use crate::encoder::{EmbedderError, EncodeError, FaceEmbedder, FaceEncoder};
use crate::geofence::{validate, GeofenceTarget};
use crate::lifecycle::check_flag;
use crate::matcher::{EuclideanMatcher, MatchResult, Matcher};
use crate::normalizer::{normalize, NormalizeError};
use crate::store::{CheckinSink, IdentityStore, ReferenceStore, StoreError};
use crate::types::{CheckinEvent, Embedding, GeoPoint, Identity, ReferenceImage};
use chrono::NaiveDateTime;
use serde::Serialize;
use thiserror::Error;

/// One verification attempt, consumed by [`Verifier::verify`].
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub identity_id: String,
    pub image: Vec<u8>,
    pub location: Option<GeoPoint>,
    pub device_id: Option<String>,
    pub captured_at: NaiveDateTime,
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("unknown identity: {0}")]
    InvalidIdentity(String),
    #[error("identity has no reference image")]
    ReferenceMissing,
    #[error("captured image corrupt: {0}")]
    ImageCorrupt(String),
    #[error("no face in captured image")]
    NoFaceInCapture,
    #[error("stored reference image corrupt: {0}")]
    ReferenceImageCorruption(String),
    #[error("no face in stored reference image")]
    ReferenceImageHasNoFace,
    #[error("embedding dimensions differ: probe {probe}, reference {reference}")]
    DimensionMismatch { probe: usize, reference: usize },
    #[error(transparent)]
    Encoder(#[from] EmbedderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl VerifyError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            VerifyError::InvalidIdentity(_) => "invalid_identity",
            VerifyError::ReferenceMissing => "reference_image_missing",
            VerifyError::ImageCorrupt(_) => "image_corrupt",
            VerifyError::NoFaceInCapture => "no_face_in_uploaded_image",
            VerifyError::ReferenceImageCorruption(_) => "reference_image_corruption",
            VerifyError::ReferenceImageHasNoFace => "reference_image_has_no_face",
            VerifyError::DimensionMismatch { .. }
            | VerifyError::Encoder(_)
            | VerifyError::Store(_) => "transient_io_failure",
        }
    }
}

/// What happened to the check-in after the face decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckinStatus {
    /// No match, or no location claimed.
    NotAttempted,
    /// The claimed location is not a valid coordinate; nothing was saved.
    InvalidCoordinates,
    AnchorNotConfigured,
    OutsideGeofence { distance_km: f64, radius_km: f64 },
    Saved { checkin_id: String, distance_km: f64 },
    /// The sink rejected the event; the match itself stands.
    SinkFailed { distance_km: f64, error: String },
}

impl CheckinStatus {
    pub fn saved(&self) -> bool {
        matches!(self, CheckinStatus::Saved { .. })
    }

    pub fn reason_code(&self) -> Option<&'static str> {
        match self {
            CheckinStatus::NotAttempted | CheckinStatus::Saved { .. } => None,
            CheckinStatus::InvalidCoordinates => Some("invalid_coordinates"),
            CheckinStatus::AnchorNotConfigured => Some("anchor_not_configured"),
            CheckinStatus::OutsideGeofence { .. } => Some("outside_geofence_radius"),
            CheckinStatus::SinkFailed { .. } => Some("checkin_save_failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verification {
    #[serde(flatten)]
    pub result: MatchResult,
    pub checkin: CheckinStatus,
}

pub struct Verifier<'a, S: ?Sized, E> {
    store: &'a S,
    encoder: &'a mut FaceEncoder<E>,
}

impl<'a, S, E> Verifier<'a, S, E>
where
    S: IdentityStore + ReferenceStore + CheckinSink + ?Sized,
    E: FaceEmbedder,
{
    pub fn new(store: &'a S, encoder: &'a mut FaceEncoder<E>) -> Self {
        Self { store, encoder }
    }

    pub fn verify(&mut self, request: VerifyRequest) -> Result<Verification, VerifyError> {
        let VerifyRequest {
            identity_id,
            image,
            location,
            device_id,
            captured_at,
        } = request;

        // Reference existence is settled before the capture is decoded.
        let identity = self
            .store
            .identity(&identity_id)?
            .ok_or_else(|| VerifyError::InvalidIdentity(identity_id.clone()))?;
        let reference = current_reference(&identity, self.store.attachments(&identity_id)?)?;

        let probe = self.encode_capture(image)?;
        let stored = self.encode_reference(reference)?;
        if probe.dim() != stored.dim() {
            return Err(VerifyError::DimensionMismatch {
                probe: probe.dim(),
                reference: stored.dim(),
            });
        }

        let result = EuclideanMatcher.evaluate(&probe, &stored);
        tracing::info!(
            identity = %identity_id,
            matched = result.matched,
            distance = result.distance,
            confidence = result.confidence,
            "face compared"
        );

        if !result.matched {
            return Ok(Verification {
                result,
                checkin: CheckinStatus::NotAttempted,
            });
        }

        let checkin = match GeofenceTarget::resolve(location, &identity) {
            GeofenceTarget::NoLocationClaimed => CheckinStatus::NotAttempted,
            GeofenceTarget::InvalidCoordinates(claimed) => {
                tracing::warn!(
                    identity = %identity_id,
                    latitude = claimed.latitude,
                    longitude = claimed.longitude,
                    "claimed location out of range; check-in skipped"
                );
                CheckinStatus::InvalidCoordinates
            }
            GeofenceTarget::AnchorNotConfigured => {
                tracing::info!(identity = %identity_id, "no anchor configured; check-in skipped");
                CheckinStatus::AnchorNotConfigured
            }
            GeofenceTarget::Located {
                claimed,
                anchor,
                radius_km,
            } => {
                let check = validate(claimed, anchor, radius_km);
                if check.within_radius {
                    let event = CheckinEvent {
                        identity_id: identity_id.clone(),
                        timestamp: captured_at,
                        device_id,
                        location: claimed,
                        distance_km: check.distance_km,
                        confidence: result.confidence,
                    };
                    self.emit(event)
                } else {
                    tracing::info!(
                        identity = %identity_id,
                        distance_km = check.distance_km,
                        radius_km,
                        "outside geofence; check-in skipped"
                    );
                    CheckinStatus::OutsideGeofence {
                        distance_km: check.distance_km,
                        radius_km,
                    }
                }
            }
        };

        Ok(Verification { result, checkin })
    }

    fn encode_capture(&mut self, image: Vec<u8>) -> Result<Embedding, VerifyError> {
        let normalized = normalize(image).map_err(|NormalizeError::ImageCorrupt(msg)| {
            VerifyError::ImageCorrupt(msg)
        })?;
        self.encoder.encode(&normalized).map_err(|e| match e {
            EncodeError::NoFaceDetected => VerifyError::NoFaceInCapture,
            EncodeError::Backend(e) => VerifyError::Encoder(e),
        })
    }

    /// Re-encode the stored reference; nothing is cached between attempts.
    fn encode_reference(&mut self, reference: ReferenceImage) -> Result<Embedding, VerifyError> {
        let normalized = normalize(reference.content).map_err(|NormalizeError::ImageCorrupt(msg)| {
            tracing::error!(attachment = %reference.id, error = %msg, "stored reference image unreadable");
            VerifyError::ReferenceImageCorruption(msg)
        })?;
        self.encoder.encode(&normalized).map_err(|e| match e {
            EncodeError::NoFaceDetected => VerifyError::ReferenceImageHasNoFace,
            EncodeError::Backend(e) => VerifyError::Encoder(e),
        })
    }

    fn emit(&self, event: CheckinEvent) -> CheckinStatus {
        let distance_km = event.distance_km;
        match self.store.record(&event) {
            Ok(record) => {
                tracing::info!(
                    identity = %event.identity_id,
                    checkin = %record.id,
                    distance_km,
                    "check-in recorded"
                );
                CheckinStatus::Saved {
                    checkin_id: record.id,
                    distance_km,
                }
            }
            Err(err) => {
                tracing::error!(identity = %event.identity_id, error = %err, "check-in sink failed");
                CheckinStatus::SinkFailed {
                    distance_km,
                    error: err.to_string(),
                }
            }
        }
    }
}

/// The single current reference image, or the newest one if several exist.
fn current_reference(
    identity: &Identity,
    attachments: Vec<ReferenceImage>,
) -> Result<ReferenceImage, VerifyError> {
    check_flag(identity, attachments.len());
    if attachments.len() > 1 {
        tracing::warn!(
            identity = %identity.id,
            attachments = attachments.len(),
            "data integrity: multiple reference images; using the most recent"
        );
    }
    attachments
        .into_iter()
        .max_by_key(|a| a.created_at)
        .ok_or(VerifyError::ReferenceMissing)
}
