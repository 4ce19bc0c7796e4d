use crate::config::Config;
use crate::engine::{run_blocking, EngineError, EngineHandle};
use facegate_core::{
    enroll_descriptors, verify_descriptor, AuthConfig, AuthOutcome, Descriptor, DescriptorStore,
    EnrollOutcome, StoreError, VerifyOutcome,
};
use serde_json::{json, Value};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.facegate.FaceGate1";
pub const OBJECT_PATH: &str = "/org/facegate/FaceGate1";

/// D-Bus interface for the FaceGate daemon.
///
/// Bus name: org.facegate.FaceGate1
/// Object path: /org/facegate/FaceGate1
///
/// Every method answers with a JSON object carrying `success` plus detail,
/// so callers never need to parse D-Bus error names for domain failures.
pub struct FaceGateService {
    engine: EngineHandle,
    store: Arc<DescriptorStore>,
    config: Arc<Config>,
}

impl FaceGateService {
    pub fn new(engine: EngineHandle, store: Arc<DescriptorStore>, config: Arc<Config>) -> Self {
        Self { engine, store, config }
    }

    /// Threshold from a caller, falling back to the configured one when
    /// the caller passes zero, a negative value or NaN.
    fn threshold_or_default(&self, threshold: f64) -> f32 {
        resolve_threshold(threshold, self.config.auth.confidence_threshold)
    }
}

#[interface(name = "org.facegate.FaceGate1")]
impl FaceGateService {
    /// Enroll `user` from live camera frames. `frames` of 0 uses the configured target.
    async fn enroll(&self, user: &str, frames: u32) -> String {
        tracing::info!(user, frames, "enroll requested");
        let frames = (frames > 0).then_some(frames as usize);
        enroll_response(user, self.engine.enroll(user, frames).await).to_string()
    }

    /// Enroll `user` from a JSON array of descriptors computed elsewhere.
    async fn enroll_descriptors(&self, user: &str, descriptors_json: &str) -> String {
        tracing::info!(user, "enroll_descriptors requested");
        ingest_descriptors(self.store.clone(), user, descriptors_json).await.to_string()
    }

    /// Live login against every enrolled user. Zero arguments use configured defaults.
    async fn login(&self, max_attempts: u32, threshold: f64) -> String {
        let mut config: AuthConfig = self.config.auth.clone();
        if max_attempts > 0 {
            config.max_attempts = max_attempts as usize;
        }
        config.confidence_threshold = self.threshold_or_default(threshold);
        tracing::info!(
            max_attempts = config.max_attempts,
            threshold = config.confidence_threshold,
            "login requested"
        );
        login_response(self.engine.login(config).await).to_string()
    }

    /// Score one descriptor (JSON array of numbers) against every user.
    async fn verify_descriptor(&self, descriptor_json: &str, threshold: f64) -> String {
        let threshold = self.threshold_or_default(threshold);
        score_descriptor(self.store.clone(), descriptor_json, threshold).await.to_string()
    }

    /// Decode an encoded image (PNG, JPEG, ...), extract a descriptor and score it.
    async fn verify_image(&self, image: Vec<u8>, threshold: f64) -> String {
        tracing::info!(bytes = image.len(), "verify_image requested");
        let threshold = self.threshold_or_default(threshold);
        verify_response(self.engine.verify_image(image, threshold).await).to_string()
    }

    /// Return daemon and store status.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.store.status().map_err(fdo_failed)?;
        Ok(json!({
            "success": true,
            "version": env!("CARGO_PKG_VERSION"),
            "status": if status.exists { "ready" } else { "no_database" },
            "database_exists": status.exists,
            "registered_users": status.users,
            "descriptor_kind": status.variant.kind,
            "dimension": status.variant.dimension,
            "store_path": self.store.path().display().to_string(),
        })
        .to_string())
    }

    /// List enrolled users with descriptor counts, in enrollment order.
    async fn list_users(&self) -> zbus::fdo::Result<String> {
        let users = self.store.snapshot().map_err(fdo_failed)?;
        let listed: Vec<Value> = users
            .iter()
            .map(|u| {
                json!({
                    "username": u.username,
                    "descriptors": u.descriptors.len(),
                    "enrolled_at": u.enrolled_at,
                })
            })
            .collect();
        Ok(Value::Array(listed).to_string())
    }

    /// Remove a user's record.
    async fn remove_user(&self, user: &str) -> String {
        tracing::info!(user, "remove_user requested");
        remove_record(self.store.clone(), user).await.to_string()
    }

    /// Stop the running enrollment or login at its next frame.
    async fn cancel(&self) -> bool {
        tracing::info!("cancel requested");
        self.engine.cancel();
        true
    }
}

async fn ingest_descriptors(
    store: Arc<DescriptorStore>,
    user: &str,
    descriptors_json: &str,
) -> Value {
    let descriptors: Vec<Vec<f32>> = match serde_json::from_str(descriptors_json) {
        Ok(d) => d,
        Err(e) => return failure(format!("malformed descriptor list: {e}")),
    };
    let descriptors = descriptors.into_iter().map(Descriptor::from).collect();
    let owned_user = user.to_string();
    let result =
        run_blocking(move || Ok(enroll_descriptors(&store, &owned_user, descriptors)?)).await;
    enroll_response(user, result)
}

async fn score_descriptor(
    store: Arc<DescriptorStore>,
    descriptor_json: &str,
    threshold: f32,
) -> Value {
    let values: Vec<f32> = match serde_json::from_str(descriptor_json) {
        Ok(v) => v,
        Err(e) => return failure(format!("malformed descriptor: {e}")),
    };
    let query = Descriptor::from(values);
    verify_response(run_blocking(move || Ok(verify_descriptor(&store, &query, threshold)?)).await)
}

async fn remove_record(store: Arc<DescriptorStore>, user: &str) -> Value {
    let owned_user = user.to_string();
    match run_blocking(move || Ok(store.remove(&owned_user)?)).await {
        Ok(()) => json!({ "success": true, "username": user }),
        Err(e @ EngineError::Store(StoreError::UserNotFound(_))) => failure(e.to_string()),
        Err(e) => {
            tracing::error!(user, error = %e, "remove_user failed");
            failure(e.to_string())
        }
    }
}

fn fdo_failed(e: StoreError) -> zbus::fdo::Error {
    tracing::error!(error = %e, "store unavailable");
    zbus::fdo::Error::Failed(e.to_string())
}

fn resolve_threshold(requested: f64, configured: f32) -> f32 {
    if requested.is_finite() && requested > 0.0 {
        requested as f32
    } else {
        configured
    }
}

fn failure(error: String) -> Value {
    json!({ "success": false, "error": error })
}

fn enroll_response(user: &str, result: Result<EnrollOutcome, EngineError>) -> Value {
    match result {
        Ok(outcome) => {
            let message = if outcome.succeeded() {
                format!("enrolled {} with {} descriptors", outcome.username, outcome.captured)
            } else {
                format!(
                    "captured {} of {} frames; not enough for enrollment",
                    outcome.captured, outcome.target
                )
            };
            json!({
                "success": outcome.succeeded(),
                "message": message,
                "username": outcome.username,
                "state": outcome.state,
                "captured": outcome.captured,
                "target": outcome.target,
                "aborted": outcome.aborted,
            })
        }
        Err(e) => {
            tracing::warn!(user, error = %e, "enroll failed");
            let mut value = failure(e.to_string());
            value["username"] = json!(user);
            value
        }
    }
}

fn login_response(result: Result<AuthOutcome, EngineError>) -> Value {
    match result {
        Ok(outcome) => json!({
            "success": outcome.accepted(),
            "user": outcome.user,
            "best_user": outcome.best_user,
            "confidence": outcome.best_score,
            "threshold": outcome.threshold,
            "attempts": outcome.attempts,
            "verified_frames": outcome.verified_frames,
        }),
        Err(e) => {
            tracing::warn!(error = %e, "login failed");
            failure(e.to_string())
        }
    }
}

fn verify_response(result: Result<VerifyOutcome, EngineError>) -> Value {
    match result {
        Ok(outcome) => json!({
            "success": true,
            "best_match": outcome.best_match,
            "confidence": outcome.confidence,
            "threshold_met": outcome.threshold_met,
        }),
        Err(e) => {
            tracing::warn!(error = %e, "verify failed");
            failure(e.to_string())
        }
    }
}
