//! Face embedding model via ONNX Runtime (FaceNet-style, square gray input).

use crate::extractor::FaceEmbedder;
use crate::imaging;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_INPUT_SIZE: usize = 160;
const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 128.0;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model produced {actual}-dim embedding, expected {expected}")]
    WrongDimension { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct OnnxEmbedder {
    session: Session,
    input_size: usize,
    dimension: usize,
}

impl OnnxEmbedder {
    pub fn load(
        model_path: &str,
        input_size: usize,
        dimension: usize,
    ) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            input_size,
            dimension,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self {
            session,
            input_size,
            dimension,
        })
    }

    /// Resize a gray face crop to the model input and lay it out as NCHW,
    /// replicating the gray channel three times.
    fn preprocess(face: &[u8], width: usize, height: usize, size: usize) -> Array4<f32> {
        let resized = imaging::resize_bilinear(face, width, height, size, size);
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for y in 0..size {
            for x in 0..size {
                let v = (resized[y * size + x] as f32 - EMBED_MEAN) / EMBED_STD;
                tensor[[0, 0, y, x]] = v;
                tensor[[0, 1, y, x]] = v;
                tensor[[0, 2, y, x]] = v;
            }
        }
        tensor
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(
        &mut self,
        face: &[u8],
        width: usize,
        height: usize,
    ) -> Result<Vec<f32>, EmbedderError> {
        let input = Self::preprocess(face, width, height, self.input_size);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding output: {e}")))?;

        if self.dimension == 0 || raw.is_empty() || raw.len() % self.dimension != 0 {
            return Err(EmbedderError::WrongDimension {
                expected: self.dimension,
                actual: raw.len(),
            });
        }
        // Output is [batch, dim]; take the first embedding.
        Ok(raw[..self.dimension].to_vec())
    }
}
