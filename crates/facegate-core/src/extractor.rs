//! Frame → descriptor extraction.
//!
//! Two strategies share the [`DescriptorExtractor`] seam:
//!
//! - [`GeometricExtractor`]: box position/size plus intensity statistics of
//!   the first face region the locator reports.
//! - [`LearnedExtractor`]: an embedding model run on the located face, or on
//!   the whole frame when nothing is located (detection is not enforced).
//!
//! Extraction never fails loudly. Locator or model faults are logged and the
//! frame is reported as having no face.

use crate::detector::DetectorError;
use crate::embedder::EmbedderError;
use crate::imaging;
use crate::types::{BoundingBox, Descriptor, DescriptorKind, Frame, GEOMETRIC_DIM};

/// Turns one frame into a descriptor, or `None` when no face was found.
pub trait DescriptorExtractor: Send {
    fn kind(&self) -> DescriptorKind;
    fn dimension(&self) -> usize;
    fn extract(&mut self, frame: &Frame) -> Option<Descriptor>;
}

impl<E: DescriptorExtractor + ?Sized> DescriptorExtractor for Box<E> {
    fn kind(&self) -> DescriptorKind {
        (**self).kind()
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn extract(&mut self, frame: &Frame) -> Option<Descriptor> {
        (**self).extract(frame)
    }
}

/// Finds face regions in a frame, in the detector's own order.
pub trait FaceLocator: Send {
    fn locate(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Produces an embedding from a gray face crop.
pub trait FaceEmbedder: Send {
    fn dimension(&self) -> usize;
    fn embed(
        &mut self,
        face: &[u8],
        width: usize,
        height: usize,
    ) -> Result<Vec<f32>, EmbedderError>;
}

/// Geometric descriptor of a face region:
/// `[x, y, width, height, width / height, mean, std_dev]`.
///
/// The region is clipped to the frame first; an empty region gives `None`.
pub fn describe_region(frame: &Frame, face: &BoundingBox) -> Option<Descriptor> {
    let rect = imaging::clip_to_frame(face, frame)?;
    let pixels = imaging::crop(frame, rect);
    let (mean, std_dev) = imaging::intensity_stats(&pixels);

    let w = rect.width as f32;
    let h = rect.height as f32;
    Some(Descriptor::new(vec![
        rect.x as f32,
        rect.y as f32,
        w,
        h,
        w / h,
        mean,
        std_dev,
    ]))
}

pub struct GeometricExtractor<L> {
    locator: L,
}

impl<L: FaceLocator> GeometricExtractor<L> {
    pub fn new(locator: L) -> Self {
        Self { locator }
    }
}

impl<L: FaceLocator> DescriptorExtractor for GeometricExtractor<L> {
    fn kind(&self) -> DescriptorKind {
        DescriptorKind::Geometric
    }

    fn dimension(&self) -> usize {
        GEOMETRIC_DIM
    }

    fn extract(&mut self, frame: &Frame) -> Option<Descriptor> {
        if !frame.is_well_formed() {
            tracing::warn!(width = frame.width, height = frame.height, "malformed frame skipped");
            return None;
        }

        let faces = match self.locator.locate(frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, seq = frame.sequence, "face locator failed");
                return None;
            }
        };

        // First reported region wins; no largest/most-central preference.
        let face = faces.first()?;
        describe_region(frame, face)
    }
}

pub struct LearnedExtractor<L, E> {
    locator: L,
    embedder: E,
}

impl<L: FaceLocator, E: FaceEmbedder> LearnedExtractor<L, E> {
    pub fn new(locator: L, embedder: E) -> Self {
        Self { locator, embedder }
    }
}

impl<L: FaceLocator, E: FaceEmbedder> DescriptorExtractor for LearnedExtractor<L, E> {
    fn kind(&self) -> DescriptorKind {
        DescriptorKind::Learned
    }

    fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    fn extract(&mut self, frame: &Frame) -> Option<Descriptor> {
        if !frame.is_well_formed() {
            tracing::warn!(width = frame.width, height = frame.height, "malformed frame skipped");
            return None;
        }

        let region = match self.locator.locate(frame) {
            Ok(faces) => faces.first().and_then(|f| imaging::clip_to_frame(f, frame)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    seq = frame.sequence,
                    "face locator failed; embedding whole frame"
                );
                None
            }
        };

        let (pixels, width, height) = match region {
            Some(rect) => (imaging::crop(frame, rect), rect.width, rect.height),
            None => {
                let (w, h) = (frame.width as usize, frame.height as usize);
                tracing::debug!(seq = frame.sequence, "no face located; embedding whole frame");
                (frame.data[..w * h].to_vec(), w, h)
            }
        };

        match self.embedder.embed(&pixels, width, height) {
            Ok(values) if values.len() == self.embedder.dimension() => {
                Some(Descriptor::new(values))
            }
            Ok(values) => {
                tracing::warn!(
                    expected = self.embedder.dimension(),
                    actual = values.len(),
                    "embedding has wrong dimension"
                );
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, seq = frame.sequence, "embedding failed");
                None
            }
        }
    }
}
