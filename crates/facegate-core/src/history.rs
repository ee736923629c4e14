//! Location tracking and shift-scoped path queries.

use crate::shift::{resolve_shift_window, ShiftError};
use crate::store::{IdentityStore, LocationHistory, StoreError};
use crate::types::{GeoPoint, LocationPoint, ShiftWindow};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("unknown identity: {0}")]
    InvalidIdentity(String),
    #[error("coordinates out of range: ({latitude}, {longitude})")]
    InvalidCoordinates { latitude: f64, longitude: f64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HistoryError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            HistoryError::InvalidIdentity(_) => "invalid_identity",
            HistoryError::InvalidCoordinates { .. } => "invalid_coordinates",
            HistoryError::Store(_) => "transient_io_failure",
        }
    }
}

impl From<ShiftError> for HistoryError {
    fn from(err: ShiftError) -> Self {
        match err {
            ShiftError::InvalidIdentity(id) => HistoryError::InvalidIdentity(id),
            ShiftError::Store(e) => HistoryError::Store(e),
        }
    }
}

/// The path of one identity during its shift on one date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShiftPath {
    pub identity_id: String,
    pub window: ShiftWindow,
    pub points: Vec<LocationPoint>,
}

/// Append a tracked position for an existing identity.
pub fn track_location<S>(
    store: &S,
    identity_id: &str,
    location: GeoPoint,
    at: NaiveDateTime,
) -> Result<LocationPoint, HistoryError>
where
    S: IdentityStore + LocationHistory + ?Sized,
{
    if !location.is_valid() {
        return Err(HistoryError::InvalidCoordinates {
            latitude: location.latitude,
            longitude: location.longitude,
        });
    }
    if store.identity(identity_id)?.is_none() {
        return Err(HistoryError::InvalidIdentity(identity_id.to_string()));
    }

    let point = LocationPoint {
        identity_id: identity_id.to_string(),
        location,
        recorded_at: at,
    };
    store.track(&point)?;
    tracing::debug!(identity = identity_id, %at, "location tracked");
    Ok(point)
}

pub fn latest_locations<S>(store: &S) -> Result<Vec<LocationPoint>, HistoryError>
where
    S: LocationHistory + ?Sized,
{
    Ok(store.latest_per_identity()?)
}

/// Points recorded inside the identity's shift window for `date`.
pub fn historical_path<S>(
    store: &S,
    identity_id: &str,
    date: NaiveDate,
) -> Result<ShiftPath, HistoryError>
where
    S: IdentityStore + LocationHistory + ?Sized,
{
    let window = resolve_shift_window(store, identity_id, date)?;
    let points = store.points_between(identity_id, &window)?;
    Ok(ShiftPath {
        identity_id: identity_id.to_string(),
        window,
        points,
    })
}

/// [`historical_path`] for several identities; unknown ids are skipped.
pub fn filtered_historical_paths<S>(
    store: &S,
    identity_ids: &[String],
    date: NaiveDate,
) -> Result<Vec<ShiftPath>, HistoryError>
where
    S: IdentityStore + LocationHistory + ?Sized,
{
    let mut paths = Vec::with_capacity(identity_ids.len());
    for id in identity_ids {
        match historical_path(store, id, date) {
            Ok(path) => paths.push(path),
            Err(HistoryError::InvalidIdentity(_)) => {
                tracing::warn!(identity = %id, "skipping unknown identity in path query");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(paths)
}
