//! Scripted collaborators for session tests.

use crate::extractor::DescriptorExtractor;
use crate::source::{CaptureError, FrameSource};
use crate::types::{Descriptor, DescriptorKind, Frame};
use std::collections::VecDeque;

/// What the scripted camera does on one call.
pub enum Shot {
    Frame,
    Hiccup,
    Fatal,
}

/// Frame source that replays a script, then keeps returning frames.
pub struct ScriptedSource {
    script: VecDeque<Shot>,
    pub calls: usize,
}

impl ScriptedSource {
    pub fn new(script: Vec<Shot>) -> Self {
        Self {
            script: script.into(),
            calls: 0,
        }
    }

    pub fn endless() -> Self {
        Self::new(Vec::new())
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        self.calls += 1;
        match self.script.pop_front().unwrap_or(Shot::Frame) {
            Shot::Frame => {
                let mut frame = Frame::new(vec![128; 16], 4, 4);
                frame.sequence = self.calls as u32;
                Ok(Some(frame))
            }
            Shot::Hiccup => Ok(None),
            Shot::Fatal => Err(CaptureError::DeviceUnavailable("scripted".into())),
        }
    }
}

/// Extractor that replays a script of outcomes, then repeats `fallback`.
pub struct ScriptedExtractor {
    pub kind: DescriptorKind,
    pub dimension: usize,
    script: VecDeque<Option<Descriptor>>,
    fallback: Option<Descriptor>,
    pub calls: usize,
}

impl ScriptedExtractor {
    pub fn new(
        kind: DescriptorKind,
        dimension: usize,
        script: Vec<Option<Descriptor>>,
        fallback: Option<Descriptor>,
    ) -> Self {
        Self {
            kind,
            dimension,
            script: script.into(),
            fallback,
            calls: 0,
        }
    }

    /// Geometric extractor that always returns `descriptor`.
    pub fn always(descriptor: Descriptor) -> Self {
        Self::new(DescriptorKind::Geometric, descriptor.len(), Vec::new(), Some(descriptor))
    }

    /// Geometric extractor that never finds a face.
    pub fn blind() -> Self {
        Self::new(DescriptorKind::Geometric, 7, Vec::new(), None)
    }
}

impl DescriptorExtractor for ScriptedExtractor {
    fn kind(&self) -> DescriptorKind {
        self.kind
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn extract(&mut self, _frame: &Frame) -> Option<Descriptor> {
        self.calls += 1;
        match self.script.pop_front() {
            Some(outcome) => outcome,
            None => self.fallback.clone(),
        }
    }
}

/// Geometric descriptor offset from a fixed base along the first axis.
pub fn geo(offset: f32) -> Descriptor {
    Descriptor::new(vec![100.0 + offset, 100.0, 120.0, 140.0, 120.0 / 140.0, 110.0, 30.0])
}
