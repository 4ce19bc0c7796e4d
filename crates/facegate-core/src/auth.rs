//! Authentication: score live descriptors against every enrolled user.
//!
//! `Warmup → Verifying → (Accepted | Rejected)`. The running best match is
//! kept across frames; acceptance requires it to strictly exceed the
//! confidence threshold when the loop ends.

use crate::extractor::DescriptorExtractor;
use crate::matcher::{matcher_for, Matcher};
use crate::source::{self, CaptureError, FrameSource, StopSignal};
use crate::store::{DescriptorStore, StoreError};
use crate::types::{Descriptor, DescriptorError, MatchResult, UserRecord};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("no enrolled users")]
    NoEnrolledUsers,
    #[error("capture: {0}")]
    Capture(#[from] CaptureError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("descriptor does not match store: {0}")]
    Incompatible(#[from] DescriptorError),
    #[error("authentication cancelled")]
    Cancelled,
}

/// How users are scored within one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchPolicy {
    /// Score users in enrollment order and stop at the first one whose score
    /// exceeds the threshold. A better-scoring user later in the order is
    /// never seen for that frame.
    #[default]
    FirstOverThreshold,
    /// Score every user and take the true per-frame maximum.
    StrictMax,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Scores must be strictly greater than this to authenticate.
    pub confidence_threshold: f32,
    /// Frames pulled in total, with or without a face.
    pub max_attempts: usize,
    /// Frames with a face required before an early stop.
    pub verification_frames: usize,
    pub warmup_frames: usize,
    pub warmup_delay_ms: u64,
    pub policy: MatchPolicy,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.65,
            max_attempts: 50,
            verification_frames: 15,
            warmup_frames: 10,
            warmup_delay_ms: 100,
            policy: MatchPolicy::FirstOverThreshold,
        }
    }
}

impl AuthConfig {
    pub fn warmup_delay(&self) -> Duration {
        Duration::from_millis(self.warmup_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Warmup,
    Verifying,
    Accepted,
    Rejected,
}

/// Result of a login attempt. `best_*` is reported even on rejection so a
/// near miss can be diagnosed.
#[derive(Debug, Clone, Serialize)]
pub struct AuthOutcome {
    pub state: AuthState,
    pub user: Option<String>,
    pub best_user: Option<String>,
    pub best_score: f32,
    pub threshold: f32,
    pub attempts: usize,
    pub verified_frames: usize,
}

impl AuthOutcome {
    pub fn accepted(&self) -> bool {
        self.state == AuthState::Accepted
    }
}

/// Result of a one-shot descriptor check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifyOutcome {
    pub best_match: Option<String>,
    pub confidence: f32,
    pub threshold_met: bool,
}

/// Highest score seen so far. Starts at zero with no user, so a user must
/// score above zero to be recorded.
#[derive(Debug, Clone, Default)]
struct BestMatch {
    user: Option<String>,
    score: f32,
}

impl BestMatch {
    fn offer(&mut self, result: &MatchResult) {
        if result.score > self.score {
            self.score = result.score;
            self.user = Some(result.username.clone());
        }
    }
}

/// Score one query against `users` under `policy`, folding every computed
/// score into `best`. Returns the frame's over-threshold candidate, if any.
fn score_frame(
    query: &Descriptor,
    users: &[UserRecord],
    matcher: &dyn Matcher,
    threshold: f32,
    policy: MatchPolicy,
    best: &mut BestMatch,
) -> Option<MatchResult> {
    let mut candidate: Option<MatchResult> = None;

    for record in users {
        let result = MatchResult {
            username: record.username.clone(),
            score: matcher.score(query, &record.descriptors),
        };
        best.offer(&result);
        tracing::trace!(user = %result.username, score = result.score, "scored");

        if result.score > threshold {
            match policy {
                MatchPolicy::FirstOverThreshold => return Some(result),
                MatchPolicy::StrictMax => {
                    if candidate.as_ref().map_or(true, |c| result.score > c.score) {
                        candidate = Some(result);
                    }
                }
            }
        }
    }
    candidate
}

/// One live-capture login attempt against the whole store.
pub struct AuthenticationSession<'a> {
    config: &'a AuthConfig,
    store: &'a DescriptorStore,
    stop: StopSignal,
    state: AuthState,
    attempts: usize,
    verified_frames: usize,
    best: BestMatch,
}

impl<'a> AuthenticationSession<'a> {
    pub fn new(config: &'a AuthConfig, store: &'a DescriptorStore, stop: StopSignal) -> Self {
        Self {
            config,
            store,
            stop,
            state: AuthState::Warmup,
            attempts: 0,
            verified_frames: 0,
            best: BestMatch::default(),
        }
    }

    pub fn run<S, E>(mut self, source: &mut S, extractor: &mut E) -> Result<AuthOutcome, AuthError>
    where
        S: FrameSource,
        E: DescriptorExtractor + ?Sized,
    {
        let variant = self.store.variant();
        variant.accepts(extractor.kind(), extractor.dimension())?;

        let users = self.store.snapshot()?;
        if users.is_empty() {
            tracing::warn!("login attempted with no enrolled users");
            return Err(AuthError::NoEnrolledUsers);
        }
        let matcher = matcher_for(variant.kind);
        let threshold = self.config.confidence_threshold;

        tracing::info!(
            users = users.len(),
            threshold,
            max_attempts = self.config.max_attempts,
            policy = ?self.config.policy,
            "authentication started"
        );

        let warmup_delay = self.config.warmup_delay();
        if !source::discard_warmup(source, self.config.warmup_frames, warmup_delay, &self.stop)? {
            return Err(AuthError::Cancelled);
        }
        self.state = AuthState::Verifying;

        while self.attempts < self.config.max_attempts {
            if self.stop.is_stopped() {
                tracing::info!(attempts = self.attempts, "authentication cancelled");
                return Err(AuthError::Cancelled);
            }

            let frame = source.next_frame()?;
            self.attempts += 1;

            let Some(frame) = frame else {
                tracing::warn!(attempt = self.attempts, "frame acquisition hiccup");
                continue;
            };
            let Some(query) = extractor.extract(&frame) else {
                continue;
            };
            if let Err(e) = variant.validate(&query) {
                tracing::warn!(error = %e, "extractor produced an unusable descriptor");
                continue;
            }

            self.verified_frames += 1;
            let candidate = score_frame(
                &query,
                &users,
                matcher.as_ref(),
                threshold,
                self.config.policy,
                &mut self.best,
            );
            if let Some(c) = &candidate {
                tracing::info!(user = %c.username, score = c.score, "high confidence match");
            }

            tracing::debug!(
                frame = self.verified_frames,
                target = self.config.verification_frames,
                best_user = ?self.best.user,
                best_score = self.best.score,
                "frame processed"
            );

            if self.verified_frames >= self.config.verification_frames
                && self.best.score > threshold
            {
                break;
            }
        }

        let accepted = self.best.score > threshold && self.best.user.is_some();
        self.state = if accepted { AuthState::Accepted } else { AuthState::Rejected };

        if accepted {
            tracing::info!(user = ?self.best.user, score = self.best.score, "authenticated");
        } else {
            tracing::warn!(
                best_user = ?self.best.user,
                best_score = self.best.score,
                threshold,
                "authentication rejected"
            );
        }

        Ok(AuthOutcome {
            state: self.state,
            user: if accepted { self.best.user.clone() } else { None },
            best_user: self.best.user,
            best_score: self.best.score,
            threshold,
            attempts: self.attempts,
            verified_frames: self.verified_frames,
        })
    }
}

/// Stateless check of one descriptor against the whole store.
///
/// Every user is scored; an empty store yields no match at confidence 0.
pub fn verify_descriptor(
    store: &DescriptorStore,
    query: &Descriptor,
    threshold: f32,
) -> Result<VerifyOutcome, AuthError> {
    let variant = store.variant();
    variant.validate(query)?;

    let users = store.snapshot()?;
    let matcher = matcher_for(variant.kind);
    let mut best = BestMatch::default();
    score_frame(query, &users, matcher.as_ref(), threshold, MatchPolicy::StrictMax, &mut best);

    tracing::debug!(best_match = ?best.user, confidence = best.score, "descriptor verified");

    Ok(VerifyOutcome {
        threshold_met: best.score > threshold,
        best_match: best.user,
        confidence: best.score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{geo, ScriptedExtractor, ScriptedSource, Shot};
    use crate::types::{DescriptorKind, StoreVariant};

    fn fast_config() -> AuthConfig {
        AuthConfig {
            warmup_frames: 2,
            warmup_delay_ms: 0,
            ..AuthConfig::default()
        }
    }

    fn store_with(dir: &tempfile::TempDir, users: &[(&str, Vec<Descriptor>)]) -> DescriptorStore {
        let path = dir.path().join("faces.json");
        let store = DescriptorStore::open(path, StoreVariant::geometric()).unwrap();
        for (name, descriptors) in users {
            store.put(name, descriptors.clone()).unwrap();
        }
        store
    }

    // Relative to query geo(0.0): alice at distance 300 scores 0.7,
    // bob at distance 100 scores 0.9.
    fn alice_then_bob(dir: &tempfile::TempDir) -> DescriptorStore {
        store_with(dir, &[("alice", vec![geo(300.0)]), ("bob", vec![geo(100.0)])])
    }

    #[test]
    fn test_accepts_after_verification_frames() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[("alice", vec![geo(0.0), geo(40.0)])]);
        let config = fast_config();
        let mut source = ScriptedSource::endless();

        let outcome = AuthenticationSession::new(&config, &store, StopSignal::new())
            .run(&mut source, &mut ScriptedExtractor::always(geo(0.0)))
            .unwrap();

        assert!(outcome.accepted());
        assert_eq!(outcome.user.as_deref(), Some("alice"));
        assert_eq!(outcome.best_score, 1.0);
        assert_eq!(outcome.verified_frames, 15);
        assert_eq!(outcome.attempts, 15);
        assert_eq!(source.calls, 17);
    }

    #[test]
    fn test_first_over_threshold_hides_better_later_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = alice_then_bob(&dir);
        let config = fast_config();

        let outcome = AuthenticationSession::new(&config, &store, StopSignal::new())
            .run(&mut ScriptedSource::endless(), &mut ScriptedExtractor::always(geo(0.0)))
            .unwrap();

        // alice crosses 0.65 first every frame, so bob's 0.9 is never computed
        assert!(outcome.accepted());
        assert_eq!(outcome.user.as_deref(), Some("alice"));
        assert!((outcome.best_score - 0.7).abs() < 1e-5);
        assert_eq!(outcome.verified_frames, 15);
    }

    // bob is scored first each frame. Against geo(0.0) bob scores 0 and
    // alice 0.7; against geo(1100.0) bob scores 0.9.
    fn late_bob_session(verification_frames: usize) -> (AuthOutcome, usize) {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[("bob", vec![geo(1200.0)]), ("alice", vec![geo(300.0)])]);
        let config = AuthConfig {
            verification_frames,
            ..fast_config()
        };
        let mut extractor = ScriptedExtractor::new(
            DescriptorKind::Geometric,
            7,
            vec![Some(geo(0.0)); 15],
            Some(geo(1100.0)),
        );

        let outcome = AuthenticationSession::new(&config, &store, StopSignal::new())
            .run(&mut ScriptedSource::endless(), &mut extractor)
            .unwrap();
        (outcome, extractor.calls)
    }

    #[test]
    fn test_early_accept_ends_before_better_user_appears() {
        let (outcome, frames_seen) = late_bob_session(15);

        assert!(outcome.accepted());
        assert_eq!(outcome.user.as_deref(), Some("alice"));
        assert_eq!(outcome.best_user.as_deref(), Some("alice"));
        assert!((outcome.best_score - 0.7).abs() < 1e-5);
        assert_eq!(frames_seen, 15);
    }

    #[test]
    fn test_longer_session_sees_better_user() {
        let (outcome, frames_seen) = late_bob_session(20);

        assert_eq!(outcome.user.as_deref(), Some("bob"));
        assert!((outcome.best_score - 0.9).abs() < 1e-5);
        assert_eq!(frames_seen, 20);
    }

    #[test]
    fn test_strict_max_finds_better_later_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = alice_then_bob(&dir);
        let config = AuthConfig {
            policy: MatchPolicy::StrictMax,
            ..fast_config()
        };

        let outcome = AuthenticationSession::new(&config, &store, StopSignal::new())
            .run(&mut ScriptedSource::endless(), &mut ScriptedExtractor::always(geo(0.0)))
            .unwrap();

        assert_eq!(outcome.user.as_deref(), Some("bob"));
        assert!((outcome.best_score - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_below_threshold_runs_to_attempt_cap_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        // distance 500 → 0.5
        let store = store_with(&dir, &[("alice", vec![geo(500.0)])]);
        let config = fast_config();

        let outcome = AuthenticationSession::new(&config, &store, StopSignal::new())
            .run(&mut ScriptedSource::endless(), &mut ScriptedExtractor::always(geo(0.0)))
            .unwrap();

        assert_eq!(outcome.state, AuthState::Rejected);
        assert_eq!(outcome.user, None);
        assert_eq!(outcome.best_user.as_deref(), Some("alice"));
        assert!((outcome.best_score - 0.5).abs() < 1e-5);
        assert_eq!(outcome.attempts, 50);
    }

    #[test]
    fn test_failed_extractions_count_toward_cap_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[("alice", vec![geo(0.0)])]);
        let config = AuthConfig {
            max_attempts: 20,
            verification_frames: 5,
            ..fast_config()
        };
        // 10 misses, then faces forever
        let mut extractor = ScriptedExtractor::new(
            DescriptorKind::Geometric,
            7,
            vec![None; 10],
            Some(geo(0.0)),
        );

        let outcome = AuthenticationSession::new(&config, &store, StopSignal::new())
            .run(&mut ScriptedSource::endless(), &mut extractor)
            .unwrap();

        assert!(outcome.accepted());
        assert_eq!(outcome.attempts, 15);
        assert_eq!(outcome.verified_frames, 5);
    }

    #[test]
    fn test_no_face_ever_rejects_at_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[("alice", vec![geo(0.0)])]);
        let config = fast_config();
        let script = vec![Shot::Frame, Shot::Frame, Shot::Hiccup, Shot::Hiccup];

        let outcome = AuthenticationSession::new(&config, &store, StopSignal::new())
            .run(&mut ScriptedSource::new(script), &mut ScriptedExtractor::blind())
            .unwrap();

        assert_eq!(outcome.state, AuthState::Rejected);
        assert_eq!(outcome.best_user, None);
        assert_eq!(outcome.best_score, 0.0);
        assert_eq!(outcome.attempts, 50);
        assert_eq!(outcome.verified_frames, 0);
    }

    #[test]
    fn test_empty_store_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[]);
        let config = fast_config();
        let mut source = ScriptedSource::endless();

        let result = AuthenticationSession::new(&config, &store, StopSignal::new())
            .run(&mut source, &mut ScriptedExtractor::always(geo(0.0)));

        assert!(matches!(result, Err(AuthError::NoEnrolledUsers)));
        assert_eq!(source.calls, 0);
    }

    #[test]
    fn test_cancellation_stops_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[("alice", vec![geo(0.0)])]);
        let config = fast_config();
        let stop = StopSignal::new();
        stop.stop();

        let result = AuthenticationSession::new(&config, &store, stop)
            .run(&mut ScriptedSource::endless(), &mut ScriptedExtractor::always(geo(0.0)));
        assert!(matches!(result, Err(AuthError::Cancelled)));
    }

    #[test]
    fn test_rejects_learned_extractor_on_geometric_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[("alice", vec![geo(0.0)])]);
        let config = fast_config();
        let mut extractor = ScriptedExtractor::new(DescriptorKind::Learned, 7, vec![], None);

        let result = AuthenticationSession::new(&config, &store, StopSignal::new())
            .run(&mut ScriptedSource::endless(), &mut extractor);
        assert!(matches!(result, Err(AuthError::Incompatible(_))));
    }

    #[test]
    fn test_fatal_capture_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[("alice", vec![geo(0.0)])]);
        let config = fast_config();
        let script = vec![Shot::Frame, Shot::Frame, Shot::Frame, Shot::Fatal];

        let result = AuthenticationSession::new(&config, &store, StopSignal::new())
            .run(&mut ScriptedSource::new(script), &mut ScriptedExtractor::always(geo(0.0)));
        assert!(matches!(result, Err(AuthError::Capture(_))));
    }

    #[test]
    fn test_verify_descriptor_scores_all_users() {
        let dir = tempfile::tempdir().unwrap();
        let store = alice_then_bob(&dir);

        let outcome = verify_descriptor(&store, &geo(0.0), 0.65).unwrap();
        assert_eq!(outcome.best_match.as_deref(), Some("bob"));
        assert!((outcome.confidence - 0.9).abs() < 1e-5);
        assert!(outcome.threshold_met);
    }

    #[test]
    fn test_verify_descriptor_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[]);

        let outcome = verify_descriptor(&store, &geo(0.0), 0.65).unwrap();
        assert_eq!(
            outcome,
            VerifyOutcome {
                best_match: None,
                confidence: 0.0,
                threshold_met: false
            }
        );
    }

    #[test]
    fn test_verify_descriptor_rejects_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[("alice", vec![geo(0.0)])]);

        let result = verify_descriptor(&store, &Descriptor::new(vec![1.0; 3]), 0.65);
        assert!(matches!(
            result,
            Err(AuthError::Incompatible(DescriptorError::DimensionMismatch {
                expected: 7,
                actual: 3
            }))
        ));
    }

    #[test]
    fn test_score_frame_first_over_threshold_stops_scoring() {
        let users = vec![
            UserRecord {
                username: "a".into(),
                descriptors: vec![geo(300.0)],
                enrolled_at: String::new(),
            },
            UserRecord {
                username: "b".into(),
                descriptors: vec![geo(100.0)],
                enrolled_at: String::new(),
            },
        ];
        let mut best = BestMatch::default();
        let hit = score_frame(
            &geo(0.0),
            &users,
            &crate::matcher::DistanceMatcher,
            0.65,
            MatchPolicy::FirstOverThreshold,
            &mut best,
        );
        assert_eq!(hit.map(|m| m.username), Some("a".to_string()));
        assert_eq!(best.user.as_deref(), Some("a"));
    }
}
