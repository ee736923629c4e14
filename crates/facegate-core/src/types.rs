use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Default geofence radius applied when an identity has none configured.
pub const DEFAULT_GEOFENCE_RADIUS_KM: f64 = 0.5;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings, accumulated in f64.
    pub fn euclidean_distance(&self, other: &Embedding) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (f64::from(*a) - f64::from(*b)).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

/// A WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// True when latitude is within [-90, 90] and longitude within [-180, 180].
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A person enrolled in the identity store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    /// Registered anchor location; geofencing is impossible without it.
    pub anchor: Option<GeoPoint>,
    pub geofence_radius_km: Option<f64>,
    pub shift_id: Option<String>,
    /// Set while the identity owns a current reference image.
    pub face_registered: bool,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            anchor: None,
            geofence_radius_km: None,
            shift_id: None,
            face_registered: false,
        }
    }

    /// Configured radius, or the 0.5 km default.
    pub fn radius_km(&self) -> f64 {
        self.geofence_radius_km.unwrap_or(DEFAULT_GEOFENCE_RADIUS_KM)
    }
}

/// Shift metadata: time-of-day bounds and the overnight flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shift {
    pub id: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub overnight: bool,
}

/// The stored canonical face image of one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceImage {
    pub id: String,
    pub identity_id: String,
    /// Normalized image bytes (JPEG).
    pub content: Vec<u8>,
    /// Hex SHA-256 of `content`.
    pub digest: String,
    pub created_at: NaiveDateTime,
}

/// Attendance record emitted after a matched, in-radius verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckinEvent {
    pub identity_id: String,
    pub timestamp: NaiveDateTime,
    pub device_id: Option<String>,
    pub location: GeoPoint,
    pub distance_km: f64,
    pub confidence: f64,
}

/// Half-open [start, end) work period of one identity on one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl ShiftWindow {
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        self.start <= at && at < self.end
    }
}

/// One tracked position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPoint {
    pub identity_id: String,
    pub location: GeoPoint,
    pub recorded_at: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.3, -0.2, 0.9]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_euclidean_distance_unit_axes() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!((a.euclidean_distance(&b) - 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_radius_defaults_to_half_km() {
        let mut identity = Identity::new("emp-1");
        assert_eq!(identity.radius_km(), 0.5);
        identity.geofence_radius_km = Some(2.0);
        assert_eq!(identity.radius_km(), 2.0);
    }

    #[test]
    fn test_geo_point_validation() {
        assert!(GeoPoint::new(12.9716, 77.5946).is_valid());
        assert!(GeoPoint::new(-90.0, 180.0).is_valid());
        assert!(!GeoPoint::new(90.5, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -181.0).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_shift_window_is_half_open() {
        let day = chrono::NaiveDate::from_ymd_opt(2025, 6, 17).unwrap();
        let window = ShiftWindow {
            start: day.and_hms_opt(9, 0, 0).unwrap(),
            end: day.and_hms_opt(18, 0, 0).unwrap(),
        };
        assert!(window.contains(day.and_hms_opt(9, 0, 0).unwrap()));
        assert!(window.contains(day.and_hms_opt(17, 59, 59).unwrap()));
        assert!(!window.contains(day.and_hms_opt(18, 0, 0).unwrap()));
    }
}
