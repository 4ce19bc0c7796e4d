//! facegate-core — face descriptor matching and enrollment/login decisions.
//!
//! Frames come in through [`FrameSource`], become descriptors through a
//! [`DescriptorExtractor`] (geometric or learned), and are scored against the
//! [`DescriptorStore`] by the [`Matcher`] paired with the store's variant.

pub mod auth;
pub mod detector;
pub mod embedder;
pub mod enroll;
pub mod extractor;
pub mod imaging;
pub mod matcher;
pub mod source;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{
    verify_descriptor, AuthConfig, AuthError, AuthOutcome, AuthState, AuthenticationSession,
    MatchPolicy, VerifyOutcome,
};
pub use detector::ScrfdDetector;
pub use embedder::OnnxEmbedder;
pub use enroll::{
    enroll_descriptors, EnrollConfig, EnrollError, EnrollOutcome, EnrollState, EnrollmentSession,
};
pub use extractor::{
    DescriptorExtractor, FaceEmbedder, FaceLocator, GeometricExtractor, LearnedExtractor,
};
pub use matcher::{matcher_for, CosineMatcher, DistanceMatcher, Matcher};
pub use source::{CaptureError, FrameSource, StopSignal};
pub use store::{DescriptorStore, StoreError, StoreStatus};
pub use types::{
    BoundingBox, Descriptor, DescriptorError, DescriptorKind, Frame, MatchResult, StoreVariant,
    UserRecord, DEFAULT_LEARNED_DIM, GEOMETRIC_DIM,
};
