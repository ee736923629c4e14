//! Contracts of the external collaborators the engine reads from and writes to.
//!
//! Implementations must be safe to share between engine workers. The
//! reference-image operations are the only writes that touch the
//! registration flag, and each one must be atomic per identity.

use crate::types::{CheckinEvent, Identity, LocationPoint, ReferenceImage, Shift, ShiftWindow};
use chrono::NaiveDateTime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("identity {0} already has a reference image")]
    Conflict(String),
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Read access to identities and shift metadata.
pub trait IdentityStore {
    fn identity(&self, id: &str) -> Result<Option<Identity>, StoreError>;
    fn shift(&self, id: &str) -> Result<Option<Shift>, StoreError>;
}

/// Reference-image attachments and the registration flag that mirrors them.
pub trait ReferenceStore {
    /// Current attachments of an identity, newest first.
    fn attachments(&self, identity_id: &str) -> Result<Vec<ReferenceImage>, StoreError>;

    /// Store the first reference image and set the flag.
    ///
    /// Fails with [`StoreError::Conflict`] when any attachment already exists.
    fn install(
        &self,
        identity_id: &str,
        content: &[u8],
        at: NaiveDateTime,
    ) -> Result<ReferenceImage, StoreError>;

    /// Delete every attachment, store `content`, keep the flag set.
    fn replace(
        &self,
        identity_id: &str,
        content: &[u8],
        at: NaiveDateTime,
    ) -> Result<ReferenceImage, StoreError>;

    /// Delete every attachment and clear the flag. Returns how many were removed.
    fn clear(&self, identity_id: &str) -> Result<usize, StoreError>;
}

/// Durable receipt for a recorded check-in.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckinRecord {
    pub id: String,
}

pub trait CheckinSink {
    fn record(&self, event: &CheckinEvent) -> Result<CheckinRecord, StoreError>;
}

/// Tracked positions.
pub trait LocationHistory {
    fn track(&self, point: &LocationPoint) -> Result<(), StoreError>;

    /// Points of one identity inside the half-open window, oldest first.
    fn points_between(
        &self,
        identity_id: &str,
        window: &ShiftWindow,
    ) -> Result<Vec<LocationPoint>, StoreError>;

    /// Most recent point of every identity that has one, ordered by identity.
    fn latest_per_identity(&self) -> Result<Vec<LocationPoint>, StoreError>;
}
