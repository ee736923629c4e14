//! Adapter over the external face-embedding model.

use crate::normalizer::NormalizedImage;
use crate::types::Embedding;
use image::RgbImage;
use thiserror::Error;

/// Re-sampling passes requested from the model on top of the base sample.
pub const ENCODER_JITTERS: u32 = 1;

/// Accuracy/speed trade-off offered by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Small,
    Large,
}

/// Options passed to the model on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub variant: ModelVariant,
    pub jitters: u32,
}

impl EncodeOptions {
    /// The fixed configuration used for registration and verification.
    pub const ACCURATE: EncodeOptions = EncodeOptions {
        variant: ModelVariant::Large,
        jitters: ENCODER_JITTERS,
    };
}

#[derive(Error, Debug)]
#[error("face model failure: {0}")]
pub struct EmbedderError(pub String);

/// The external encoder: one embedding per detected face, in model order.
pub trait FaceEmbedder {
    fn embed(
        &mut self,
        image: &RgbImage,
        options: &EncodeOptions,
    ) -> Result<Vec<Embedding>, EmbedderError>;
}

impl<E: FaceEmbedder + ?Sized> FaceEmbedder for Box<E> {
    fn embed(
        &mut self,
        image: &RgbImage,
        options: &EncodeOptions,
    ) -> Result<Vec<Embedding>, EmbedderError> {
        (**self).embed(image, options)
    }
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error(transparent)]
    Backend(#[from] EmbedderError),
}

/// Encodes a normalized image into the embedding of its primary face.
///
/// The primary face is the first one the model returns; no ranking by size
/// or position is applied.
pub struct FaceEncoder<E> {
    embedder: E,
}

impl<E: FaceEmbedder> FaceEncoder<E> {
    pub fn new(embedder: E) -> Self {
        Self { embedder }
    }

    pub fn encode(&mut self, image: &NormalizedImage) -> Result<Embedding, EncodeError> {
        let faces = self.embedder.embed(image.rgb(), &EncodeOptions::ACCURATE)?;
        let count = faces.len();
        let primary = faces.into_iter().next().ok_or(EncodeError::NoFaceDetected)?;
        if count > 1 {
            tracing::debug!(faces = count, "multiple faces detected; using the first");
        }
        Ok(primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize;
    use image::{DynamicImage, ImageFormat, Rgb};
    use std::io::Cursor;

    struct Canned {
        faces: Vec<Embedding>,
        seen: Vec<EncodeOptions>,
    }

    impl FaceEmbedder for Canned {
        fn embed(
            &mut self,
            _image: &RgbImage,
            options: &EncodeOptions,
        ) -> Result<Vec<Embedding>, EmbedderError> {
            self.seen.push(*options);
            Ok(self.faces.clone())
        }
    }

    struct Broken;

    impl FaceEmbedder for Broken {
        fn embed(
            &mut self,
            _image: &RgbImage,
            _options: &EncodeOptions,
        ) -> Result<Vec<Embedding>, EmbedderError> {
            Err(EmbedderError("session closed".into()))
        }
    }

    fn image() -> NormalizedImage {
        let mut buffer = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])))
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        normalize(buffer).unwrap()
    }

    #[test]
    fn test_first_face_is_primary() {
        let mut encoder = FaceEncoder::new(Canned {
            faces: vec![Embedding::new(vec![1.0]), Embedding::new(vec![2.0])],
            seen: Vec::new(),
        });
        let embedding = encoder.encode(&image()).unwrap();
        assert_eq!(embedding.values, vec![1.0]);
    }

    #[test]
    fn test_no_faces_is_error() {
        let mut encoder = FaceEncoder::new(Canned {
            faces: Vec::new(),
            seen: Vec::new(),
        });
        assert!(matches!(
            encoder.encode(&image()),
            Err(EncodeError::NoFaceDetected)
        ));
    }

    #[test]
    fn test_requests_large_model_with_jitter() {
        let mut encoder = FaceEncoder::new(Canned {
            faces: vec![Embedding::new(vec![0.5])],
            seen: Vec::new(),
        });
        encoder.encode(&image()).unwrap();
        let seen = &encoder.embedder.seen;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].variant, ModelVariant::Large);
        assert!(seen[0].jitters >= 1);
    }

    #[test]
    fn test_backend_failure_is_distinct() {
        let mut encoder = FaceEncoder::new(Broken);
        assert!(matches!(encoder.encode(&image()), Err(EncodeError::Backend(_))));
    }
}
