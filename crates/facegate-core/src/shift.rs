//! Shift-window derivation for location-history queries.

use crate::store::{IdentityStore, StoreError};
use crate::types::{Identity, Shift, ShiftWindow};
use chrono::{Days, NaiveDate, NaiveTime};
use thiserror::Error;

/// Default working day used when an identity has no shift: 09:00–18:00.
pub const DEFAULT_SHIFT_START: (u32, u32) = (9, 0);
pub const DEFAULT_SHIFT_END: (u32, u32) = (18, 0);

#[derive(Error, Debug)]
pub enum ShiftError {
    #[error("unknown identity: {0}")]
    InvalidIdentity(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ShiftError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ShiftError::InvalidIdentity(_) => "invalid_identity",
            ShiftError::Store(_) => "transient_io_failure",
        }
    }
}

/// Work period for `date` under `shift`, or the default day when `None`.
///
/// An overnight flag, or an end time earlier than the start, moves the end
/// onto the following day. No timezone conversion happens here.
pub fn resolve(shift: Option<&Shift>, date: NaiveDate) -> ShiftWindow {
    let Some(shift) = shift else {
        return ShiftWindow {
            start: date.and_time(hm(DEFAULT_SHIFT_START)),
            end: date.and_time(hm(DEFAULT_SHIFT_END)),
        };
    };

    let crosses_midnight = shift.overnight || shift.end < shift.start;
    let end_date = if crosses_midnight {
        date.checked_add_days(Days::new(1)).unwrap_or(date)
    } else {
        date
    };

    ShiftWindow {
        start: date.and_time(shift.start),
        end: end_date.and_time(shift.end),
    }
}

/// Look up the identity and its shift, then derive the window for `date`.
pub fn resolve_shift_window<S: IdentityStore + ?Sized>(
    store: &S,
    identity_id: &str,
    date: NaiveDate,
) -> Result<ShiftWindow, ShiftError> {
    let identity = store
        .identity(identity_id)?
        .ok_or_else(|| ShiftError::InvalidIdentity(identity_id.to_string()))?;
    let shift = shift_of(store, &identity)?;
    Ok(resolve(shift.as_ref(), date))
}

fn shift_of<S: IdentityStore + ?Sized>(
    store: &S,
    identity: &Identity,
) -> Result<Option<Shift>, StoreError> {
    let Some(shift_id) = identity.shift_id.as_deref() else {
        return Ok(None);
    };
    let shift = store.shift(shift_id)?;
    if shift.is_none() {
        tracing::warn!(
            identity = %identity.id,
            shift = shift_id,
            "identity references a missing shift; using the default window"
        );
    }
    Ok(shift)
}

fn hm((hour, minute): (u32, u32)) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}
