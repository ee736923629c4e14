//! Reference-image lifecycle: register, update, reset.
//!
//! An identity owns zero or one current reference image. Every new image is
//! normalized and must contain a detectable face before the store is touched;
//! the store then swaps attachments and the registration flag in one step.

use crate::encoder::{EmbedderError, EncodeError, FaceEmbedder, FaceEncoder};
use crate::normalizer::{normalize, NormalizeError};
use crate::store::{IdentityStore, ReferenceStore, StoreError};
use crate::types::{Identity, ReferenceImage};
use chrono::NaiveDateTime;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("unknown identity: {0}")]
    InvalidIdentity(String),
    #[error("identity already has a reference image")]
    AlreadyRegistered,
    #[error("identity has no reference image")]
    ReferenceMissing,
    #[error("image corrupt: {0}")]
    ImageCorrupt(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error(transparent)]
    Encoder(#[from] EmbedderError),
    #[error(transparent)]
    Store(StoreError),
}

impl LifecycleError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            LifecycleError::InvalidIdentity(_) => "invalid_identity",
            LifecycleError::AlreadyRegistered => "already_registered",
            LifecycleError::ReferenceMissing => "reference_image_missing",
            LifecycleError::ImageCorrupt(_) => "image_corrupt",
            LifecycleError::NoFaceDetected => "no_face_detected",
            LifecycleError::Encoder(_) | LifecycleError::Store(_) => "transient_io_failure",
        }
    }
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownIdentity(id) => LifecycleError::InvalidIdentity(id),
            StoreError::Conflict(_) => LifecycleError::AlreadyRegistered,
            other => LifecycleError::Store(other),
        }
    }
}

impl From<NormalizeError> for LifecycleError {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::ImageCorrupt(msg) => LifecycleError::ImageCorrupt(msg),
        }
    }
}

impl From<EncodeError> for LifecycleError {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::NoFaceDetected => LifecycleError::NoFaceDetected,
            EncodeError::Backend(e) => LifecycleError::Encoder(e),
        }
    }
}

/// Result of a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResetOutcome {
    Cleared { removed: usize },
    /// No attachments were found.
    NothingToClear,
}

pub struct ReferenceManager<'a, S: ?Sized, E> {
    store: &'a S,
    encoder: &'a mut FaceEncoder<E>,
}

impl<'a, S, E> ReferenceManager<'a, S, E>
where
    S: IdentityStore + ReferenceStore + ?Sized,
    E: FaceEmbedder,
{
    pub fn new(store: &'a S, encoder: &'a mut FaceEncoder<E>) -> Self {
        Self { store, encoder }
    }

    /// Install the first reference image of an identity.
    pub fn register(
        &mut self,
        identity_id: &str,
        image: Vec<u8>,
        at: NaiveDateTime,
    ) -> Result<ReferenceImage, LifecycleError> {
        let identity = self.identity(identity_id)?;
        let current = self.store.attachments(identity_id)?;
        check_flag(&identity, current.len());
        if identity.face_registered || !current.is_empty() {
            return Err(LifecycleError::AlreadyRegistered);
        }

        let content = self.validated(image)?;
        let reference = self.store.install(identity_id, &content, at)?;

        tracing::info!(
            identity = identity_id,
            attachment = %reference.id,
            digest = %reference.digest,
            "reference image registered"
        );
        Ok(reference)
    }

    /// Replace the current reference image; the old one survives any failure.
    pub fn update(
        &mut self,
        identity_id: &str,
        image: Vec<u8>,
        at: NaiveDateTime,
    ) -> Result<ReferenceImage, LifecycleError> {
        let identity = self.identity(identity_id)?;
        let current = self.store.attachments(identity_id)?;
        check_flag(&identity, current.len());
        if current.is_empty() {
            return Err(LifecycleError::ReferenceMissing);
        }

        let content = self.validated(image)?;
        let reference = self.store.replace(identity_id, &content, at)?;

        tracing::info!(
            identity = identity_id,
            replaced = current.len(),
            attachment = %reference.id,
            digest = %reference.digest,
            "reference image updated"
        );
        Ok(reference)
    }

    /// Remove every reference image and clear the flag. Idempotent.
    pub fn reset(&mut self, identity_id: &str) -> Result<ResetOutcome, LifecycleError> {
        self.identity(identity_id)?;
        let removed = self.store.clear(identity_id)?;

        tracing::info!(identity = identity_id, removed, "reference image reset");
        Ok(if removed == 0 {
            ResetOutcome::NothingToClear
        } else {
            ResetOutcome::Cleared { removed }
        })
    }

    fn identity(&self, identity_id: &str) -> Result<Identity, LifecycleError> {
        self.store
            .identity(identity_id)?
            .ok_or_else(|| LifecycleError::InvalidIdentity(identity_id.to_string()))
    }

    /// Normalize, prove a face is present, and return the bytes to store.
    /// The embedding computed here is discarded.
    fn validated(&mut self, image: Vec<u8>) -> Result<Vec<u8>, LifecycleError> {
        let normalized = normalize(image)?;
        self.encoder.encode(&normalized)?;
        Ok(normalized.to_jpeg()?)
    }
}

pub(crate) fn check_flag(identity: &Identity, attachments: usize) {
    if identity.face_registered != (attachments > 0) || attachments > 1 {
        tracing::warn!(
            identity = %identity.id,
            flag = identity.face_registered,
            attachments,
            "reference image state inconsistent with registration flag"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, face_png, no_face_png, MemoryStore, ToneEmbedder};

    fn setup() -> (MemoryStore, FaceEncoder<ToneEmbedder>) {
        let store = MemoryStore::default();
        store.add_identity(Identity::new("emp-1"));
        (store, FaceEncoder::new(ToneEmbedder))
    }

    #[test]
    fn test_register_sets_flag_and_single_image() {
        let (store, mut encoder) = setup();
        let mut manager = ReferenceManager::new(&store, &mut encoder);

        manager.register("emp-1", face_png(100), at(9, 0)).unwrap();

        assert!(store.identity("emp-1").unwrap().unwrap().face_registered);
        assert_eq!(store.attachments("emp-1").unwrap().len(), 1);
    }

    #[test]
    fn test_register_twice_is_rejected_and_keeps_original() {
        let (store, mut encoder) = setup();
        let mut manager = ReferenceManager::new(&store, &mut encoder);
        manager.register("emp-1", face_png(100), at(9, 0)).unwrap();
        let before = store.attachments("emp-1").unwrap();

        let err = manager
            .register("emp-1", face_png(200), at(10, 0))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyRegistered));
        assert_eq!(err.reason_code(), "already_registered");
        assert_eq!(store.attachments("emp-1").unwrap(), before);
    }

    #[test]
    fn test_register_without_face_stores_nothing() {
        let (store, mut encoder) = setup();
        let mut manager = ReferenceManager::new(&store, &mut encoder);

        let err = manager
            .register("emp-1", no_face_png(), at(9, 0))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NoFaceDetected));
        assert!(store.attachments("emp-1").unwrap().is_empty());
        assert!(!store.identity("emp-1").unwrap().unwrap().face_registered);
    }

    #[test]
    fn test_register_refused_when_flag_set_without_attachment() {
        let (store, mut encoder) = setup();
        let mut flagged = Identity::new("emp-2");
        flagged.face_registered = true;
        store.add_identity(flagged);

        let mut manager = ReferenceManager::new(&store, &mut encoder);
        let err = manager
            .register("emp-2", face_png(100), at(9, 0))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyRegistered));

        assert_eq!(manager.reset("emp-2").unwrap(), ResetOutcome::NothingToClear);
        manager.register("emp-2", face_png(100), at(9, 5)).unwrap();
    }

    #[test]
    fn test_register_unknown_identity() {
        let (store, mut encoder) = setup();
        let mut manager = ReferenceManager::new(&store, &mut encoder);
        let err = manager
            .register("ghost", face_png(100), at(9, 0))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidIdentity(_)));
    }

    #[test]
    fn test_register_corrupt_image() {
        let (store, mut encoder) = setup();
        let mut manager = ReferenceManager::new(&store, &mut encoder);
        let err = manager
            .register("emp-1", b"not a photo".to_vec(), at(9, 0))
            .unwrap_err();
        assert_eq!(err.reason_code(), "image_corrupt");
    }

    #[test]
    fn test_update_replaces_image() {
        let (store, mut encoder) = setup();
        let mut manager = ReferenceManager::new(&store, &mut encoder);
        let first = manager.register("emp-1", face_png(100), at(9, 0)).unwrap();
        let second = manager.update("emp-1", face_png(180), at(10, 0)).unwrap();

        let current = store.attachments("emp-1").unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].id, second.id);
        assert_ne!(first.id, second.id);
        assert!(store.identity("emp-1").unwrap().unwrap().face_registered);
    }

    #[test]
    fn test_update_without_face_leaves_reference_untouched() {
        let (store, mut encoder) = setup();
        let mut manager = ReferenceManager::new(&store, &mut encoder);
        manager.register("emp-1", face_png(100), at(9, 0)).unwrap();
        let before = store.attachments("emp-1").unwrap();

        let err = manager
            .update("emp-1", no_face_png(), at(10, 0))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NoFaceDetected));

        let after = store.attachments("emp-1").unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].content, before[0].content);
        assert_eq!(after[0].id, before[0].id);
    }

    #[test]
    fn test_update_requires_existing_reference() {
        let (store, mut encoder) = setup();
        let mut manager = ReferenceManager::new(&store, &mut encoder);
        let err = manager
            .update("emp-1", face_png(100), at(9, 0))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ReferenceMissing));
        assert_eq!(err.reason_code(), "reference_image_missing");
    }

    #[test]
    fn test_reset_is_idempotent() {
        let (store, mut encoder) = setup();
        let mut manager = ReferenceManager::new(&store, &mut encoder);
        manager.register("emp-1", face_png(100), at(9, 0)).unwrap();

        assert_eq!(
            manager.reset("emp-1").unwrap(),
            ResetOutcome::Cleared { removed: 1 }
        );
        assert_eq!(
            manager.reset("emp-1").unwrap(),
            ResetOutcome::NothingToClear
        );
        assert!(!store.identity("emp-1").unwrap().unwrap().face_registered);
        assert!(store.attachments("emp-1").unwrap().is_empty());
    }

    #[test]
    fn test_reset_then_register_again() {
        let (store, mut encoder) = setup();
        let mut manager = ReferenceManager::new(&store, &mut encoder);
        manager.register("emp-1", face_png(100), at(9, 0)).unwrap();
        manager.reset("emp-1").unwrap();
        manager.register("emp-1", face_png(120), at(11, 0)).unwrap();
        assert_eq!(store.attachments("emp-1").unwrap().len(), 1);
    }

    #[test]
    fn test_reset_unknown_identity() {
        let (store, mut encoder) = setup();
        let mut manager = ReferenceManager::new(&store, &mut encoder);
        assert!(matches!(
            manager.reset("ghost"),
            Err(LifecycleError::InvalidIdentity(_))
        ));
    }
}
