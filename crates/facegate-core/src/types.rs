use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of components in a geometric descriptor:
/// `[x, y, width, height, aspect, mean, std_dev]`.
pub const GEOMETRIC_DIM: usize = 7;

/// Default dimensionality of a learned embedding (FaceNet).
pub const DEFAULT_LEARNED_DIM: usize = 128;

#[derive(Error, Debug, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor has {actual} components, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("descriptor contains a non-finite component")]
    NonFinite,
    #[error("descriptor kind {actual:?} cannot be compared against a {expected:?} store")]
    KindMismatch {
        expected: DescriptorKind,
        actual: DescriptorKind,
    },
}

/// Which extractor family produced a descriptor.
///
/// Scores from different kinds are not comparable, so one store only ever
/// holds a single kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    /// Face box position/size plus region intensity statistics.
    Geometric,
    /// Embedding produced by a pretrained face recognition model.
    Learned,
}

/// Variant tag carried by a descriptor store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreVariant {
    pub kind: DescriptorKind,
    pub dimension: usize,
}

impl StoreVariant {
    pub fn geometric() -> Self {
        Self {
            kind: DescriptorKind::Geometric,
            dimension: GEOMETRIC_DIM,
        }
    }

    pub fn learned(dimension: usize) -> Self {
        Self {
            kind: DescriptorKind::Learned,
            dimension,
        }
    }

    /// Check that an extractor produces descriptors this store can hold.
    pub fn accepts(&self, kind: DescriptorKind, dimension: usize) -> Result<(), DescriptorError> {
        if kind != self.kind {
            return Err(DescriptorError::KindMismatch {
                expected: self.kind,
                actual: kind,
            });
        }
        if dimension != self.dimension {
            return Err(DescriptorError::DimensionMismatch {
                expected: self.dimension,
                actual: dimension,
            });
        }
        Ok(())
    }

    /// Reject descriptors that could not have come from this variant's extractor.
    pub fn validate(&self, descriptor: &Descriptor) -> Result<(), DescriptorError> {
        if descriptor.len() != self.dimension {
            return Err(DescriptorError::DimensionMismatch {
                expected: self.dimension,
                actual: descriptor.len(),
            });
        }
        if descriptor.values().iter().any(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite);
        }
        Ok(())
    }
}

/// Fixed-length face descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Euclidean distance between two descriptors of equal length.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Cosine similarity in [-1, 1]. A zero vector on either side yields 0.0.
    pub fn cosine_similarity(&self, other: &Descriptor) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.0.iter().zip(other.0.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Descriptors captured for one user during a single enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub descriptors: Vec<Descriptor>,
    /// RFC 3339 timestamp of the enrollment that produced this record.
    pub enrolled_at: String,
}

/// Located face region in frame coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Score of one query descriptor against one user's references.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub username: String,
    pub score: f32,
}

/// A grayscale camera frame or decoded image.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            sequence: 0,
        }
    }

    /// Convert a decoded image to an 8-bit grayscale frame.
    pub fn from_image(image: &image::DynamicImage) -> Self {
        let gray = image.to_luma8();
        let (width, height) = gray.dimensions();
        Self::new(gray.into_raw(), width, height)
    }

    /// Decode an encoded image (PNG, JPEG, ...) into a frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let image = image::load_from_memory(bytes)?;
        Ok(Self::from_image(&image))
    }

    /// True when the pixel buffer matches the declared dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() >= (self.width as usize) * (self.height as usize)
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}
