use facegate_core::{
    AuthConfig, DescriptorKind, EnrollConfig, MatchPolicy, StoreVariant, DEFAULT_LEARNED_DIM,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file named by
/// `FACEGATE_CONFIG`, then `FACEGATE_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Flip frames horizontally before extraction.
    pub mirror: bool,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub embedder_model: String,
    /// Extractor/matcher family; must match the store on disk.
    pub descriptor_kind: DescriptorKind,
    pub embedding_dim: usize,
    pub embedding_input_size: usize,
    /// Descriptor store file.
    pub store_path: PathBuf,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
    pub auth: AuthConfig,
    pub enroll: EnrollConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir(&|k| std::env::var(k).ok());
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            mirror: true,
            model_dir: PathBuf::from("/usr/share/facegate/models"),
            detector_model: "det_10g.onnx".to_string(),
            embedder_model: "facenet.onnx".to_string(),
            descriptor_kind: DescriptorKind::Geometric,
            embedding_dim: DEFAULT_LEARNED_DIM,
            embedding_input_size: facegate_core::embedder::DEFAULT_INPUT_SIZE,
            store_path: data_dir.join("faces.json"),
            system_bus: false,
            auth: AuthConfig::default(),
            enroll: EnrollConfig::default(),
        }
    }
}

fn data_dir(lookup: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    lookup("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(&|k| std::env::var(k).ok())
    }

    /// Load using `lookup` in place of the environment.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("FACEGATE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!(path = %path.display(), "configuration file loaded");
        Ok(config)
    }

    fn apply_env(&mut self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("FACEGATE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_DESCRIPTOR_KIND") {
            self.descriptor_kind = match v.as_str() {
                "geometric" => DescriptorKind::Geometric,
                "learned" => DescriptorKind::Learned,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "FACEGATE_DESCRIPTOR_KIND must be geometric or learned, got {other:?}"
                    )))
                }
            };
        }
        if let Some(v) = lookup("FACEGATE_MATCH_POLICY") {
            self.auth.policy = match v.as_str() {
                "first-over-threshold" => MatchPolicy::FirstOverThreshold,
                "strict-max" => MatchPolicy::StrictMax,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "FACEGATE_MATCH_POLICY must be first-over-threshold or strict-max, got {other:?}"
                    )))
                }
            };
        }

        self.mirror = env_bool(lookup, "FACEGATE_MIRROR", self.mirror);
        self.system_bus = env_bool(lookup, "FACEGATE_SYSTEM_BUS", self.system_bus);
        self.embedding_dim = env_parse(lookup, "FACEGATE_EMBEDDING_DIM", self.embedding_dim);
        self.auth.confidence_threshold = env_parse(
            lookup,
            "FACEGATE_CONFIDENCE_THRESHOLD",
            self.auth.confidence_threshold,
        );
        self.auth.max_attempts = env_parse(lookup, "FACEGATE_MAX_ATTEMPTS", self.auth.max_attempts);
        self.auth.verification_frames = env_parse(
            lookup,
            "FACEGATE_VERIFICATION_FRAMES",
            self.auth.verification_frames,
        );
        self.enroll.target_frames =
            env_parse(lookup, "FACEGATE_ENROLL_FRAMES", self.enroll.target_frames);
        self.enroll.pacing_delay_ms = env_parse(
            lookup,
            "FACEGATE_PACING_DELAY_MS",
            self.enroll.pacing_delay_ms,
        );
        self.enroll.max_consecutive_failures = env_parse(
            lookup,
            "FACEGATE_MAX_CONSECUTIVE_FAILURES",
            self.enroll.max_consecutive_failures,
        );

        // Warm-up is shared by both sessions.
        let warmup_frames = env_parse(lookup, "FACEGATE_WARMUP_FRAMES", self.enroll.warmup_frames);
        let warmup_delay_ms = env_parse(
            lookup,
            "FACEGATE_WARMUP_DELAY_MS",
            self.enroll.warmup_delay_ms,
        );
        if lookup("FACEGATE_WARMUP_FRAMES").is_some() {
            self.enroll.warmup_frames = warmup_frames;
            self.auth.warmup_frames = warmup_frames;
        }
        if lookup("FACEGATE_WARMUP_DELAY_MS").is_some() {
            self.enroll.warmup_delay_ms = warmup_delay_ms;
            self.auth.warmup_delay_ms = warmup_delay_ms;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.auth.confidence_threshold;
        if !t.is_finite() || t < 0.0 {
            return Err(ConfigError::Invalid(format!("confidence threshold must be >= 0, got {t}")));
        }
        if self.auth.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.enroll.target_frames == 0 {
            return Err(ConfigError::Invalid("enroll target_frames must be at least 1".into()));
        }
        let ratio = self.enroll.min_capture_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::Invalid(format!(
                "min_capture_ratio must be within 0..=1, got {ratio}"
            )));
        }
        if self.descriptor_kind == DescriptorKind::Learned && self.embedding_dim == 0 {
            return Err(ConfigError::Invalid("embedding_dim must be at least 1".into()));
        }
        if self.embedding_input_size == 0 {
            return Err(ConfigError::Invalid("embedding_input_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Variant tag the store must carry for this configuration.
    pub fn store_variant(&self) -> StoreVariant {
        match self.descriptor_kind {
            DescriptorKind::Geometric => StoreVariant::geometric(),
            DescriptorKind::Learned => StoreVariant::learned(self.embedding_dim),
        }
    }

    pub fn detector_model_path(&self) -> String {
        self.model_dir.join(&self.detector_model).to_string_lossy().into_owned()
    }

    pub fn embedder_model_path(&self) -> String {
        self.model_dir.join(&self.embedder_model).to_string_lossy().into_owned()
    }
}

fn env_parse<T: std::str::FromStr>(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "ignoring unparsable setting");
            default
        }),
        None => default,
    }
}

fn env_bool(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key).map(|v| v != "0" && v != "false").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(&lookup_from(&[("HOME", "/home/u")])).unwrap();
        assert_eq!(config.auth.confidence_threshold, 0.65);
        assert_eq!(config.auth.max_attempts, 50);
        assert_eq!(config.auth.verification_frames, 15);
        assert_eq!(config.enroll.target_frames, 30);
        assert_eq!(config.enroll.max_consecutive_failures, 10);
        assert_eq!(config.store_variant(), StoreVariant::geometric());
        assert_eq!(config.auth.policy, MatchPolicy::FirstOverThreshold);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(&lookup_from(&[
            ("FACEGATE_DESCRIPTOR_KIND", "learned"),
            ("FACEGATE_EMBEDDING_DIM", "512"),
            ("FACEGATE_MATCH_POLICY", "strict-max"),
            ("FACEGATE_WARMUP_FRAMES", "0"),
            ("FACEGATE_CONFIDENCE_THRESHOLD", "0.8"),
            ("FACEGATE_MIRROR", "0"),
        ]))
        .unwrap();
        assert_eq!(config.store_variant(), StoreVariant::learned(512));
        assert_eq!(config.auth.policy, MatchPolicy::StrictMax);
        assert_eq!(config.auth.warmup_frames, 0);
        assert_eq!(config.enroll.warmup_frames, 0);
        assert_eq!(config.auth.confidence_threshold, 0.8);
        assert!(!config.mirror);
    }

    #[test]
    fn test_bad_kind_rejected() {
        let result = Config::from_lookup(&lookup_from(&[("FACEGATE_DESCRIPTOR_KIND", "hybrid")]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_toml_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facegate.toml");
        std::fs::write(
            &path,
            r#"
camera_device = "/dev/video2"
descriptor_kind = "learned"

[auth]
max_attempts = 30
policy = "strict-max"

[enroll]
target_frames = 20
"#,
        )
        .unwrap();

        let path_str = path.to_string_lossy().into_owned();
        let config = Config::from_lookup(&lookup_from(&[
            ("FACEGATE_CONFIG", path_str.as_str()),
            ("FACEGATE_MAX_ATTEMPTS", "40"),
        ]))
        .unwrap();

        assert_eq!(config.camera_device, "/dev/video2");
        assert_eq!(config.descriptor_kind, DescriptorKind::Learned);
        assert_eq!(config.auth.max_attempts, 40);
        assert_eq!(config.auth.policy, MatchPolicy::StrictMax);
        assert_eq!(config.auth.verification_frames, 15);
        assert_eq!(config.enroll.target_frames, 20);
    }

    #[test]
    fn test_zero_attempts_invalid() {
        let result = Config::from_lookup(&lookup_from(&[("FACEGATE_MAX_ATTEMPTS", "0")]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
