//! In-memory collaborators and synthetic images for unit tests.

use crate::encoder::{EmbedderError, EncodeOptions, FaceEmbedder};
use crate::store::{
    CheckinRecord, CheckinSink, IdentityStore, LocationHistory, ReferenceStore, StoreError,
};
use crate::types::{
    CheckinEvent, Embedding, Identity, LocationPoint, ReferenceImage, Shift, ShiftWindow,
};
use chrono::{NaiveDate, NaiveDateTime};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use std::sync::Mutex;

pub fn at(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 6, 17)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

/// Uniform gray PNG; [`ToneEmbedder`] sees a face whose embedding is the tone.
pub fn face_png(tone: u8) -> Vec<u8> {
    png(RgbImage::from_pixel(32, 32, Rgb([tone, tone, tone])))
}

/// Black PNG; [`ToneEmbedder`] finds no face in it.
pub fn no_face_png() -> Vec<u8> {
    png(RgbImage::new(32, 32))
}

fn png(rgb: RgbImage) -> Vec<u8> {
    let mut buffer = Vec::new();
    DynamicImage::ImageRgb8(rgb)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .unwrap();
    buffer
}

/// Deterministic stand-in for the face model.
///
/// Dark images contain no face; otherwise a single face whose embedding is
/// the mean RGB scaled to [0, 1]. Tones 74 apart land just past the match
/// threshold.
pub struct ToneEmbedder;

impl FaceEmbedder for ToneEmbedder {
    fn embed(
        &mut self,
        image: &RgbImage,
        _options: &EncodeOptions,
    ) -> Result<Vec<Embedding>, EmbedderError> {
        let pixels = (image.width() * image.height()).max(1) as f32;
        let mut sum = [0f32; 3];
        for pixel in image.pixels() {
            for (acc, channel) in sum.iter_mut().zip(pixel.0) {
                *acc += f32::from(channel);
            }
        }
        let mean = sum.map(|s| s / pixels / 255.0);
        if mean.iter().all(|&c| c < 0.05) {
            return Ok(Vec::new());
        }
        Ok(vec![Embedding::new(mean.to_vec())])
    }
}

/// Fails the test if the model is ever consulted.
pub struct UnreachableEmbedder;

impl FaceEmbedder for UnreachableEmbedder {
    fn embed(
        &mut self,
        _image: &RgbImage,
        _options: &EncodeOptions,
    ) -> Result<Vec<Embedding>, EmbedderError> {
        panic!("encoder must not be called");
    }
}

#[derive(Default)]
struct Inner {
    identities: HashMap<String, Identity>,
    shifts: HashMap<String, Shift>,
    attachments: Vec<ReferenceImage>,
    checkins: Vec<CheckinEvent>,
    points: Vec<LocationPoint>,
    next_id: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pub fail_checkins: bool,
}

impl MemoryStore {
    pub fn add_identity(&self, identity: Identity) {
        let mut inner = self.inner.lock().unwrap();
        inner.identities.insert(identity.id.clone(), identity);
    }

    pub fn add_shift(&self, shift: Shift) {
        let mut inner = self.inner.lock().unwrap();
        inner.shifts.insert(shift.id.clone(), shift);
    }

    /// Attach bytes directly, skipping normalization and face validation.
    pub fn add_raw_attachment(&self, identity_id: &str, content: Vec<u8>, at: NaiveDateTime) {
        let mut inner = self.inner.lock().unwrap();
        let reference = new_reference(&mut inner, identity_id, content, at);
        inner.attachments.push(reference);
        if let Some(identity) = inner.identities.get_mut(identity_id) {
            identity.face_registered = true;
        }
    }

    pub fn checkins(&self) -> Vec<CheckinEvent> {
        self.inner.lock().unwrap().checkins.clone()
    }
}

fn new_reference(
    inner: &mut Inner,
    identity_id: &str,
    content: Vec<u8>,
    at: NaiveDateTime,
) -> ReferenceImage {
    inner.next_id += 1;
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    ReferenceImage {
        id: format!("ref-{}", inner.next_id),
        identity_id: identity_id.to_string(),
        content,
        digest: format!("{:016x}", hasher.finish()),
        created_at: at,
    }
}

fn set_flag(inner: &mut Inner, identity_id: &str, value: bool) -> Result<(), StoreError> {
    let identity = inner
        .identities
        .get_mut(identity_id)
        .ok_or_else(|| StoreError::UnknownIdentity(identity_id.to_string()))?;
    identity.face_registered = value;
    Ok(())
}

impl IdentityStore for MemoryStore {
    fn identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self.inner.lock().unwrap().identities.get(id).cloned())
    }

    fn shift(&self, id: &str) -> Result<Option<Shift>, StoreError> {
        Ok(self.inner.lock().unwrap().shifts.get(id).cloned())
    }
}

impl ReferenceStore for MemoryStore {
    fn attachments(&self, identity_id: &str) -> Result<Vec<ReferenceImage>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut found: Vec<_> = inner
            .attachments
            .iter()
            .filter(|a| a.identity_id == identity_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    fn install(
        &self,
        identity_id: &str,
        content: &[u8],
        at: NaiveDateTime,
    ) -> Result<ReferenceImage, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.attachments.iter().any(|a| a.identity_id == identity_id) {
            return Err(StoreError::Conflict(identity_id.to_string()));
        }
        set_flag(&mut inner, identity_id, true)?;
        let reference = new_reference(&mut inner, identity_id, content.to_vec(), at);
        inner.attachments.push(reference.clone());
        Ok(reference)
    }

    fn replace(
        &self,
        identity_id: &str,
        content: &[u8],
        at: NaiveDateTime,
    ) -> Result<ReferenceImage, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        set_flag(&mut inner, identity_id, true)?;
        inner.attachments.retain(|a| a.identity_id != identity_id);
        let reference = new_reference(&mut inner, identity_id, content.to_vec(), at);
        inner.attachments.push(reference.clone());
        Ok(reference)
    }

    fn clear(&self, identity_id: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        set_flag(&mut inner, identity_id, false)?;
        let before = inner.attachments.len();
        inner.attachments.retain(|a| a.identity_id != identity_id);
        Ok(before - inner.attachments.len())
    }
}

impl CheckinSink for MemoryStore {
    fn record(&self, event: &CheckinEvent) -> Result<CheckinRecord, StoreError> {
        if self.fail_checkins {
            return Err(StoreError::Backend("disk full".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.checkins.push(event.clone());
        Ok(CheckinRecord {
            id: format!("checkin-{}", inner.checkins.len()),
        })
    }
}

impl LocationHistory for MemoryStore {
    fn track(&self, point: &LocationPoint) -> Result<(), StoreError> {
        self.inner.lock().unwrap().points.push(point.clone());
        Ok(())
    }

    fn points_between(
        &self,
        identity_id: &str,
        window: &ShiftWindow,
    ) -> Result<Vec<LocationPoint>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut found: Vec<_> = inner
            .points
            .iter()
            .filter(|p| p.identity_id == identity_id && window.contains(p.recorded_at))
            .cloned()
            .collect();
        found.sort_by_key(|p| p.recorded_at);
        Ok(found)
    }

    fn latest_per_identity(&self) -> Result<Vec<LocationPoint>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut latest: HashMap<&str, &LocationPoint> = HashMap::new();
        for point in &inner.points {
            let entry = latest.entry(point.identity_id.as_str()).or_insert(point);
            if point.recorded_at > entry.recorded_at {
                *entry = point;
            }
        }
        let mut found: Vec<_> = latest.into_values().cloned().collect();
        found.sort_by(|a, b| a.identity_id.cmp(&b.identity_id));
        Ok(found)
    }
}
