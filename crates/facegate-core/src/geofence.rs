//! Great-circle geofence validation.

use crate::types::{GeoPoint, Identity};
use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the haversine formula, in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Result of comparing a claimed position against an anchor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeofenceCheck {
    pub within_radius: bool,
    pub distance_km: f64,
}

/// Haversine distance between two points, in kilometers.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

pub fn validate(claimed: GeoPoint, anchor: GeoPoint, radius_km: f64) -> GeofenceCheck {
    let distance_km = haversine_km(claimed, anchor);
    GeofenceCheck {
        within_radius: distance_km <= radius_km,
        distance_km,
    }
}

/// What geofencing can do for one verification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeofenceTarget {
    NoLocationClaimed,
    /// Claimed point is not finite or out of range.
    InvalidCoordinates(GeoPoint),
    AnchorNotConfigured,
    Located {
        claimed: GeoPoint,
        anchor: GeoPoint,
        radius_km: f64,
    },
}

impl GeofenceTarget {
    pub fn resolve(claimed: Option<GeoPoint>, identity: &Identity) -> Self {
        match (claimed, identity.anchor) {
            (None, _) => GeofenceTarget::NoLocationClaimed,
            (Some(claimed), _) if !claimed.is_valid() => {
                GeofenceTarget::InvalidCoordinates(claimed)
            }
            (Some(_), None) => GeofenceTarget::AnchorNotConfigured,
            (Some(claimed), Some(anchor)) => GeofenceTarget::Located {
                claimed,
                anchor,
                radius_km: identity.radius_km(),
            },
        }
    }
}
