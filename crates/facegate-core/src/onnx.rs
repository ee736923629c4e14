//! ONNX Runtime face embedder: SCRFD detection, landmark alignment, ArcFace.

use crate::alignment::{align_face, Jitter};
use crate::detector::{DetectorError, FaceDetector};
use crate::encoder::{EmbedderError, EncodeOptions, FaceEmbedder, ModelVariant};
use crate::recognizer::{l2_normalize, FaceRecognizer, RecognizerError, ARCFACE_MODEL_VERSION};
use crate::types::Embedding;
use image::RgbImage;
use std::path::Path;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

impl From<DetectorError> for EmbedderError {
    fn from(err: DetectorError) -> Self {
        EmbedderError(format!("detector: {err}"))
    }
}

impl From<RecognizerError> for EmbedderError {
    fn from(err: RecognizerError) -> Self {
        EmbedderError(format!("recognizer: {err}"))
    }
}

/// Detector input side for a model variant.
pub fn detector_input_size(variant: ModelVariant) -> usize {
    match variant {
        ModelVariant::Large => 640,
        ModelVariant::Small => 320,
    }
}

pub struct OnnxFaceEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceEmbedder {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, EmbedderError> {
        let det_path = model_dir.join(DETECTOR_MODEL_FILE);
        let rec_path = model_dir.join(RECOGNIZER_MODEL_FILE);

        let detector = FaceDetector::load(&det_path.to_string_lossy())?;
        let recognizer = FaceRecognizer::load(&rec_path.to_string_lossy())?;

        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceEmbedder for OnnxFaceEmbedder {
    fn embed(
        &mut self,
        image: &RgbImage,
        options: &EncodeOptions,
    ) -> Result<Vec<Embedding>, EmbedderError> {
        let faces = self
            .detector
            .detect(image, detector_input_size(options.variant))?;

        let mut embeddings = Vec::with_capacity(faces.len());
        for face in &faces {
            let Some(landmarks) = face.landmarks else {
                tracing::debug!(confidence = face.confidence, "skipping face without landmarks");
                continue;
            };

            let mut sum = self.pass(image, &landmarks, Jitter::NONE)?;
            for n in 0..options.jitters {
                let sample = self.pass(image, &landmarks, Jitter::pass(n))?;
                sum.iter_mut().zip(sample).for_each(|(acc, v)| *acc += v);
            }

            embeddings.push(Embedding {
                values: l2_normalize(sum),
                model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
            });
        }

        tracing::debug!(
            detected = faces.len(),
            embedded = embeddings.len(),
            jitters = options.jitters,
            "face embedding complete"
        );
        Ok(embeddings)
    }
}

impl OnnxFaceEmbedder {
    fn pass(
        &mut self,
        image: &RgbImage,
        landmarks: &[(f32, f32); 5],
        jitter: Jitter,
    ) -> Result<Vec<f32>, EmbedderError> {
        let aligned = align_face(image, landmarks, jitter);
        Ok(self.recognizer.extract(&aligned)?)
    }
}
