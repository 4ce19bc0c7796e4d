//! Enrollment: multi-frame capture into a quality-gated descriptor set.
//!
//! `Warmup → Capturing → (Success | Failed)`. Only a successful session
//! touches the store, and it replaces whatever the user had before.

use crate::extractor::DescriptorExtractor;
use crate::source::{self, CaptureError, FrameSource, StopSignal};
use crate::store::{DescriptorStore, StoreError};
use crate::types::{Descriptor, DescriptorError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("capture: {0}")]
    Capture(#[from] CaptureError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("extractor does not match store: {0}")]
    Incompatible(#[from] DescriptorError),
    #[error("target frame count must be at least 1")]
    InvalidTarget,
    #[error("enrollment cancelled")]
    Cancelled,
}

/// Enrollment tunables. Delays are in milliseconds so tests can zero them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollConfig {
    /// Descriptors to collect before stopping.
    pub target_frames: usize,
    /// Frames discarded while the camera settles.
    pub warmup_frames: usize,
    pub warmup_delay_ms: u64,
    /// Pause after each accepted capture so samples differ in pose.
    pub pacing_delay_ms: u64,
    /// Consecutive no-face frames that abort the capture.
    pub max_consecutive_failures: usize,
    /// Fraction of `target_frames` that must be captured to succeed.
    pub min_capture_ratio: f32,
}

impl Default for EnrollConfig {
    fn default() -> Self {
        Self {
            target_frames: 30,
            warmup_frames: 10,
            warmup_delay_ms: 100,
            pacing_delay_ms: 200,
            max_consecutive_failures: 10,
            min_capture_ratio: 0.7,
        }
    }
}

impl EnrollConfig {
    pub fn warmup_delay(&self) -> Duration {
        Duration::from_millis(self.warmup_delay_ms)
    }

    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }

    /// Whether `captured` descriptors satisfy the quota for `target`.
    pub fn meets_quota(&self, captured: usize, target: usize) -> bool {
        captured as f64 >= target as f64 * self.min_capture_ratio as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollState {
    Warmup,
    Capturing,
    Success,
    Failed,
}

/// What an enrollment attempt achieved.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollOutcome {
    pub username: String,
    pub state: EnrollState,
    pub captured: usize,
    pub target: usize,
    /// Consecutive failures at the moment capturing stopped.
    pub consecutive_failures: usize,
    /// Capture ended on the consecutive-failure cap.
    pub aborted: bool,
}

impl EnrollOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == EnrollState::Success
    }
}

/// One live-capture enrollment for one user.
pub struct EnrollmentSession<'a> {
    username: String,
    target: usize,
    config: &'a EnrollConfig,
    store: &'a DescriptorStore,
    stop: StopSignal,
    state: EnrollState,
    captured: Vec<Descriptor>,
    consecutive_failures: usize,
}

impl<'a> EnrollmentSession<'a> {
    /// `target` overrides `config.target_frames` when given.
    pub fn new(
        username: &str,
        target: Option<usize>,
        config: &'a EnrollConfig,
        store: &'a DescriptorStore,
        stop: StopSignal,
    ) -> Self {
        Self {
            username: username.to_string(),
            target: target.unwrap_or(config.target_frames),
            config,
            store,
            stop,
            state: EnrollState::Warmup,
            captured: Vec::new(),
            consecutive_failures: 0,
        }
    }

    /// Drive the session to completion.
    pub fn run<S, E>(
        mut self,
        source: &mut S,
        extractor: &mut E,
    ) -> Result<EnrollOutcome, EnrollError>
    where
        S: FrameSource,
        E: DescriptorExtractor + ?Sized,
    {
        if self.username.trim().is_empty() {
            return Err(StoreError::EmptyUsername.into());
        }
        if self.target == 0 {
            return Err(EnrollError::InvalidTarget);
        }
        let variant = self.store.variant();
        variant.accepts(extractor.kind(), extractor.dimension())?;

        tracing::info!(user = %self.username, target = self.target, "enrollment started");

        let warmup_delay = self.config.warmup_delay();
        if !source::discard_warmup(source, self.config.warmup_frames, warmup_delay, &self.stop)? {
            return Err(EnrollError::Cancelled);
        }
        self.state = EnrollState::Capturing;

        let pacing = self.config.pacing_delay();
        while self.captured.len() < self.target
            && self.consecutive_failures < self.config.max_consecutive_failures
        {
            if self.stop.is_stopped() {
                tracing::info!(
                    user = %self.username,
                    captured = self.captured.len(),
                    "enrollment cancelled"
                );
                return Err(EnrollError::Cancelled);
            }

            let descriptor = match source.next_frame()? {
                Some(frame) => extractor.extract(&frame),
                None => {
                    tracing::warn!("frame acquisition hiccup");
                    None
                }
            };
            let descriptor = descriptor.filter(|d| match variant.validate(d) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "extractor produced an unusable descriptor");
                    false
                }
            });

            match descriptor {
                Some(d) => {
                    self.captured.push(d);
                    self.consecutive_failures = 0;
                    tracing::debug!(
                        user = %self.username,
                        captured = self.captured.len(),
                        target = self.target,
                        "descriptor captured"
                    );
                    if !pacing.is_zero() {
                        std::thread::sleep(pacing);
                    }
                }
                None => {
                    self.consecutive_failures += 1;
                    tracing::debug!(failures = self.consecutive_failures, "no face in frame");
                }
            }
        }

        let captured = self.captured.len();
        let aborted = captured < self.target;

        if self.config.meets_quota(captured, self.target) {
            self.store.put(&self.username, std::mem::take(&mut self.captured))?;
            self.state = EnrollState::Success;
            tracing::info!(
                user = %self.username,
                captured,
                target = self.target,
                "enrollment succeeded"
            );
        } else {
            self.state = EnrollState::Failed;
            tracing::warn!(
                user = %self.username,
                captured,
                target = self.target,
                consecutive_failures = self.consecutive_failures,
                "enrollment failed: too few usable frames"
            );
        }

        Ok(EnrollOutcome {
            username: self.username,
            state: self.state,
            captured,
            target: self.target,
            consecutive_failures: self.consecutive_failures,
            aborted,
        })
    }
}

/// Enroll descriptors computed elsewhere, bypassing capture.
///
/// Overwrites any previous record; an empty list writes nothing.
pub fn enroll_descriptors(
    store: &DescriptorStore,
    username: &str,
    descriptors: Vec<Descriptor>,
) -> Result<EnrollOutcome, EnrollError> {
    let count = descriptors.len();
    store.put(username, descriptors)?;
    Ok(EnrollOutcome {
        username: username.to_string(),
        state: EnrollState::Success,
        captured: count,
        target: count,
        consecutive_failures: 0,
        aborted: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{geo, ScriptedExtractor, ScriptedSource, Shot};
    use crate::types::{DescriptorKind, StoreVariant};

    fn fast_config() -> EnrollConfig {
        EnrollConfig {
            warmup_frames: 3,
            warmup_delay_ms: 0,
            pacing_delay_ms: 0,
            ..EnrollConfig::default()
        }
    }

    fn temp_store(dir: &tempfile::TempDir) -> DescriptorStore {
        DescriptorStore::open(dir.path().join("faces.json"), StoreVariant::geometric()).unwrap()
    }

    /// `good` descriptors, then `bad` misses, then endless misses.
    fn extractor_with(good: usize, bad: usize) -> ScriptedExtractor {
        let mut script: Vec<Option<Descriptor>> = (0..good).map(|i| Some(geo(i as f32))).collect();
        script.extend(std::iter::repeat(None).take(bad));
        ScriptedExtractor::new(DescriptorKind::Geometric, 7, script, None)
    }

    #[test]
    fn test_non_finite_descriptor_counts_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let config = fast_config();
        let mut nan = geo(0.0).values().to_vec();
        nan[5] = f32::NAN;

        let mut script: Vec<Option<Descriptor>> = (0..10).map(|i| Some(geo(i as f32))).collect();
        script.push(Some(Descriptor::new(nan)));
        script.extend((10..30).map(|i| Some(geo(i as f32))));
        let mut extractor = ScriptedExtractor::new(DescriptorKind::Geometric, 7, script, None);
        let mut source = ScriptedSource::endless();

        let outcome = EnrollmentSession::new("alice", None, &config, &store, StopSignal::new())
            .run(&mut source, &mut extractor)
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.captured, 30);
        assert_eq!(extractor.calls, 31);
        let record = store.get("alice").unwrap();
        assert_eq!(record.descriptors.len(), 30);
        assert!(record.descriptors.iter().all(|d| d.values().iter().all(|v| v.is_finite())));
    }

    #[test]
    fn test_wrong_length_descriptor_counts_toward_failure_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let config = fast_config();
        let short = Descriptor::new(vec![1.0, 2.0, 3.0]);
        let mut extractor =
            ScriptedExtractor::new(DescriptorKind::Geometric, 7, Vec::new(), Some(short));

        let outcome = EnrollmentSession::new("alice", None, &config, &store, StopSignal::new())
            .run(&mut ScriptedSource::endless(), &mut extractor)
            .unwrap();

        assert!(!outcome.succeeded());
        assert!(outcome.aborted);
        assert_eq!(outcome.captured, 0);
        assert_eq!(outcome.consecutive_failures, 10);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_full_capture_succeeds_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let config = fast_config();
        let mut source = ScriptedSource::endless();
        let mut extractor = extractor_with(30, 0);

        let outcome = EnrollmentSession::new("alice", None, &config, &store, StopSignal::new())
            .run(&mut source, &mut extractor)
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.captured, 30);
        assert!(!outcome.aborted);
        assert_eq!(store.get("alice").unwrap().descriptors.len(), 30);
        // 3 warmup frames are never handed to the extractor
        assert_eq!(source.calls, 33);
        assert_eq!(extractor.calls, 30);
    }

    #[test]
    fn test_twenty_one_of_thirty_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let config = fast_config();
        let mut extractor = extractor_with(21, 10);

        let outcome = EnrollmentSession::new("alice", Some(30), &config, &store, StopSignal::new())
            .run(&mut ScriptedSource::endless(), &mut extractor)
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.captured, 21);
        assert!(outcome.aborted);
        assert_eq!(store.get("alice").unwrap().descriptors.len(), 21);
    }

    #[test]
    fn test_twenty_of_thirty_fails_without_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let config = fast_config();
        let mut extractor = extractor_with(20, 10);

        let outcome = EnrollmentSession::new("alice", Some(30), &config, &store, StopSignal::new())
            .run(&mut ScriptedSource::endless(), &mut extractor)
            .unwrap();

        assert_eq!(outcome.state, EnrollState::Failed);
        assert_eq!(outcome.captured, 20);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_aborts_after_exactly_ten_consecutive_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let config = fast_config();
        // 5 good, 9 misses, 1 good, then misses forever
        let mut script: Vec<Option<Descriptor>> = (0..5).map(|i| Some(geo(i as f32))).collect();
        script.extend(std::iter::repeat(None).take(9));
        script.push(Some(geo(50.0)));
        let mut extractor = ScriptedExtractor::new(DescriptorKind::Geometric, 7, script, None);

        let outcome = EnrollmentSession::new("alice", Some(30), &config, &store, StopSignal::new())
            .run(&mut ScriptedSource::endless(), &mut extractor)
            .unwrap();

        assert_eq!(outcome.captured, 6);
        assert_eq!(outcome.consecutive_failures, 10);
        assert!(outcome.aborted);
        assert_eq!(extractor.calls, 5 + 9 + 1 + 10);
        assert_eq!(outcome.state, EnrollState::Failed);
    }

    #[test]
    fn test_hiccups_count_as_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let config = EnrollConfig { warmup_frames: 0, ..fast_config() };
        let script = (0..10).map(|_| Shot::Hiccup).collect();
        let mut extractor = ScriptedExtractor::always(geo(0.0));

        let outcome = EnrollmentSession::new("alice", Some(5), &config, &store, StopSignal::new())
            .run(&mut ScriptedSource::new(script), &mut extractor)
            .unwrap();

        assert_eq!(outcome.captured, 0);
        assert_eq!(extractor.calls, 0);
        assert_eq!(outcome.state, EnrollState::Failed);
    }

    #[test]
    fn test_success_overwrites_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        store.put("alice", vec![geo(900.0); 40]).unwrap();
        let config = fast_config();

        EnrollmentSession::new("alice", Some(5), &config, &store, StopSignal::new())
            .run(&mut ScriptedSource::endless(), &mut extractor_with(5, 0))
            .unwrap();

        let record = store.get("alice").unwrap();
        assert_eq!(record.descriptors.len(), 5);
        assert_eq!(record.descriptors[0], geo(0.0));
    }

    #[test]
    fn test_fatal_capture_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let config = fast_config();
        let script = vec![Shot::Frame, Shot::Frame, Shot::Frame, Shot::Frame, Shot::Fatal];

        let result = EnrollmentSession::new("alice", Some(5), &config, &store, StopSignal::new())
            .run(&mut ScriptedSource::new(script), &mut extractor_with(5, 0));

        assert!(matches!(result, Err(EnrollError::Capture(_))));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_cancelled_session_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let config = fast_config();
        let stop = StopSignal::new();
        stop.stop();

        let result = EnrollmentSession::new("alice", Some(5), &config, &store, stop)
            .run(&mut ScriptedSource::endless(), &mut extractor_with(5, 0));

        assert!(matches!(result, Err(EnrollError::Cancelled)));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_rejects_extractor_of_other_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let config = fast_config();
        let mut extractor = ScriptedExtractor::new(DescriptorKind::Learned, 7, vec![], None);

        let result = EnrollmentSession::new("alice", Some(5), &config, &store, StopSignal::new())
            .run(&mut ScriptedSource::endless(), &mut extractor);

        assert!(matches!(
            result,
            Err(EnrollError::Incompatible(DescriptorError::KindMismatch { .. }))
        ));
    }

    #[test]
    fn test_enroll_descriptors_direct() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);

        let outcome = enroll_descriptors(&store, "bob", vec![geo(1.0), geo(2.0)]).unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.captured, 2);
        assert_eq!(store.get("bob").unwrap().descriptors, vec![geo(1.0), geo(2.0)]);
    }

    #[test]
    fn test_enroll_descriptors_empty_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);

        let result = enroll_descriptors(&store, "bob", vec![]);
        assert!(matches!(result, Err(EnrollError::Store(StoreError::NoDescriptors))));
        assert!(matches!(store.get("bob"), Err(StoreError::UserNotFound(_))));
    }

    #[test]
    fn test_quota_boundary() {
        let config = EnrollConfig::default();
        assert!(config.meets_quota(21, 30));
        assert!(!config.meets_quota(20, 30));
        assert!(config.meets_quota(7, 10));
        assert!(!config.meets_quota(6, 10));
    }
}
