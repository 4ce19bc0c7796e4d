use crate::config::Config;
use facegate_core::detector::DetectorError;
use facegate_core::embedder::EmbedderError;
use facegate_core::{
    verify_descriptor, AuthConfig, AuthError, AuthOutcome, AuthenticationSession, CaptureError,
    DescriptorExtractor, DescriptorKind, DescriptorStore, EnrollConfig, EnrollError, EnrollOutcome,
    EnrollmentSession, Frame, GeometricExtractor, LearnedExtractor, OnnxEmbedder, ScrfdDetector,
    StopSignal, StoreError, VerifyOutcome,
};
use facegate_hw::{Camera, CameraError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("{0}")]
    Enroll(#[from] EnrollError),
    #[error("{0}")]
    Auth(#[from] AuthError),
    #[error("extractor does not match store: {0}")]
    Incompatible(#[from] facegate_core::DescriptorError),
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("blocking task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
    #[error("could not decode image: {0}")]
    ImageDecode(String),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Camera settings the engine opens a device with at the start of each session.
#[derive(Debug, Clone)]
struct CameraSettings {
    device: String,
    width: u32,
    height: u32,
    mirror: bool,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        user: String,
        frames: Option<usize>,
        reply: oneshot::Sender<Result<EnrollOutcome, EngineError>>,
    },
    Login {
        config: AuthConfig,
        reply: oneshot::Sender<Result<AuthOutcome, EngineError>>,
    },
    VerifyImage {
        image: Vec<u8>,
        threshold: f32,
        reply: oneshot::Sender<Result<VerifyOutcome, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    stop: StopSignal,
}

impl EngineHandle {
    /// Run a live enrollment for `user`. `frames` overrides the configured target.
    pub async fn enroll(
        &self,
        user: &str,
        frames: Option<usize>,
    ) -> Result<EnrollOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                user: user.to_string(),
                frames,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Run a live login against every enrolled user.
    pub async fn login(&self, config: AuthConfig) -> Result<AuthOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Login { config, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Extract a descriptor from an encoded still image and score it.
    pub async fn verify_image(
        &self,
        image: Vec<u8>,
        threshold: f32,
    ) -> Result<VerifyOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::VerifyImage {
                image,
                threshold,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Ask the running capture session, if any, to stop at the next frame.
    pub fn cancel(&self) {
        self.stop.stop();
    }
}

/// Build the extractor the configuration asks for. Models are loaded here so
/// a missing file fails daemon startup rather than the first request.
pub fn build_extractor(config: &Config) -> Result<Box<dyn DescriptorExtractor>, EngineError> {
    let detector_path = config.detector_model_path();
    let detector = ScrfdDetector::load(&detector_path)?;
    tracing::info!(path = %detector_path, "face detector loaded");

    Ok(match config.descriptor_kind {
        DescriptorKind::Geometric => Box::new(GeometricExtractor::new(detector)),
        DescriptorKind::Learned => {
            let embedder_path = config.embedder_model_path();
            let embedder = OnnxEmbedder::load(
                &embedder_path,
                config.embedding_input_size,
                config.embedding_dim,
            )?;
            tracing::info!(
                path = %embedder_path,
                dimension = config.embedding_dim,
                "face embedder loaded"
            );
            Box::new(LearnedExtractor::new(detector, embedder))
        }
    })
}

/// Spawn the engine on a dedicated OS thread.
///
/// The extractor must agree with the store's variant. The camera is opened
/// per session and released when the session ends.
pub fn spawn_engine(
    config: &Config,
    store: Arc<DescriptorStore>,
    mut extractor: Box<dyn DescriptorExtractor>,
) -> Result<EngineHandle, EngineError> {
    store.variant().accepts(extractor.kind(), extractor.dimension())?;

    let camera = CameraSettings {
        device: config.camera_device.clone(),
        width: config.camera_width,
        height: config.camera_height,
        mirror: config.mirror,
    };
    let enroll_config = config.enroll.clone();
    let stop = StopSignal::new();
    let engine_stop = stop.clone();

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine_stop.reset();
                match req {
                    EngineRequest::Enroll { user, frames, reply } => {
                        let result = run_enroll(
                            &camera,
                            &enroll_config,
                            &store,
                            extractor.as_mut(),
                            &engine_stop,
                            &user,
                            frames,
                        );
                        let _ = reply.send(result);
                    }
                    EngineRequest::Login { config, reply } => {
                        let result =
                            run_login(&camera, &config, &store, extractor.as_mut(), &engine_stop);
                        let _ = reply.send(result);
                    }
                    EngineRequest::VerifyImage {
                        image,
                        threshold,
                        reply,
                    } => {
                        let result =
                            run_verify_image(&store, extractor.as_mut(), &image, threshold);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, stop })
}

/// Run store work that touches the disk off the async executor.
pub async fn run_blocking<T, F>(work: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

fn open_camera(settings: &CameraSettings) -> Result<Camera, EngineError> {
    Ok(Camera::open(
        &settings.device,
        settings.width,
        settings.height,
        settings.mirror,
    )?)
}

fn run_enroll(
    camera: &CameraSettings,
    config: &EnrollConfig,
    store: &DescriptorStore,
    extractor: &mut dyn DescriptorExtractor,
    stop: &StopSignal,
    user: &str,
    frames: Option<usize>,
) -> Result<EnrollOutcome, EngineError> {
    let camera = open_camera(camera)?;
    let mut stream = camera.stream()?;
    let session = EnrollmentSession::new(user, frames, config, store, stop.clone());
    let outcome = session.run(&mut stream, extractor)?;
    tracing::info!(
        user,
        captured = outcome.captured,
        target = outcome.target,
        success = outcome.succeeded(),
        "enroll: session finished"
    );
    Ok(outcome)
}

fn run_login(
    camera: &CameraSettings,
    config: &AuthConfig,
    store: &DescriptorStore,
    extractor: &mut dyn DescriptorExtractor,
    stop: &StopSignal,
) -> Result<AuthOutcome, EngineError> {
    // Fail before touching the camera when nobody is enrolled.
    if store.is_empty().map_err(AuthError::from)? {
        return Err(AuthError::NoEnrolledUsers.into());
    }
    let camera = open_camera(camera)?;
    let mut stream = camera.stream()?;
    let session = AuthenticationSession::new(config, store, stop.clone());
    let outcome = session.run(&mut stream, extractor)?;
    Ok(outcome)
}

fn run_verify_image(
    store: &DescriptorStore,
    extractor: &mut dyn DescriptorExtractor,
    image: &[u8],
    threshold: f32,
) -> Result<VerifyOutcome, EngineError> {
    let frame = Frame::decode(image).map_err(|e| EngineError::ImageDecode(e.to_string()))?;
    tracing::debug!(width = frame.width, height = frame.height, "verify: image decoded");
    let query = extractor.extract(&frame).ok_or(EngineError::NoFaceDetected)?;
    Ok(verify_descriptor(store, &query, threshold)?)
}
