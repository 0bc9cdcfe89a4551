use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// JPEG quality used when a camera frame becomes an upload.
pub const FRAME_JPEG_QUALITY: u8 = 92;

pub const DEFAULT_CONFIG_FILE: &str = "plantscan.toml";
pub const SERVER_URL_ENV: &str = "PLANTSCAN_SERVER_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upload: UploadConfig,
    pub camera: CameraConfig,
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub base_url: String,
    pub prediction_path: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub field_name: String,
    pub file_name: String,
    pub max_file_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraBackend {
    Rpicam,
    TestPattern,
    #[serde(rename = "none")]
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub backend: CameraBackend,
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
    pub preview_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Start the prediction as soon as an image is acquired.
    pub auto_predict: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                base_url: "http://127.0.0.1:5000".to_string(),
                prediction_path: "/medicinal-plant-prediction".to_string(),
                timeout_seconds: 30,
            },
            upload: UploadConfig {
                field_name: "file".to_string(),
                file_name: "plant-image.jpg".to_string(),
                max_file_bytes: 10 * 1024 * 1024,
            },
            camera: CameraConfig {
                backend: CameraBackend::Rpicam,
                width: 800,
                height: 600,
                jpeg_quality: FRAME_JPEG_QUALITY,
                preview_path: PathBuf::from("/tmp/plantscan_camera_preview.jpg"),
            },
            workflow: WorkflowConfig { auto_predict: true },
        }
    }
}

impl Config {
    /// Load `plantscan.toml` from the working directory, writing the defaults
    /// first if it does not exist. Environment overrides apply on top.
    pub fn load() -> Result<Self> {
        let config_path = PathBuf::from(DEFAULT_CONFIG_FILE);

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            log::info!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save_to_file(&config_path)?;
            default_config
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| "Failed to parse configuration file")?;

        log::info!("Configuration loaded from {}", path.as_ref().display());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
        }

        std::fs::write(path.as_ref(), contents)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        log::info!("Configuration saved to {}", path.as_ref().display());
        Ok(())
    }

    /// `PLANTSCAN_SERVER_URL` replaces the classifier base URL when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            if !url.trim().is_empty() {
                log::info!("Using classifier URL from {}: {}", SERVER_URL_ENV, url);
                self.server.base_url = url.trim().to_string();
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let url = self.server.base_url.trim();
        if url.is_empty() {
            return Err(anyhow::anyhow!("Classifier base URL is empty"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(anyhow::anyhow!("Classifier base URL must be http(s): {}", url));
        }
        if !self.server.prediction_path.starts_with('/') {
            return Err(anyhow::anyhow!(
                "Prediction path must start with '/': {}",
                self.server.prediction_path
            ));
        }
        if self.server.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Request timeout must be at least one second"));
        }

        if self.upload.field_name.is_empty() || self.upload.file_name.is_empty() {
            return Err(anyhow::anyhow!("Upload field and file names must not be empty"));
        }
        if self.upload.max_file_bytes == 0 {
            return Err(anyhow::anyhow!("Invalid upload size limit"));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow::anyhow!(
                "Invalid camera dimensions: {}x{}",
                self.camera.width,
                self.camera.height
            ));
        }
        if !(1..=100).contains(&self.camera.jpeg_quality) {
            return Err(anyhow::anyhow!("Invalid JPEG quality: {}", self.camera.jpeg_quality));
        }

        Ok(())
    }

    /// Full URL of the classification endpoint.
    pub fn prediction_url(&self) -> String {
        format!(
            "{}{}",
            self.server.base_url.trim_end_matches('/'),
            self.server.prediction_path
        )
    }
}

pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn base_url(mut self, url: &str) -> Self {
        self.config.server.base_url = url.to_string();
        self
    }

    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.config.server.timeout_seconds = seconds;
        self
    }

    pub fn camera_backend(mut self, backend: CameraBackend) -> Self {
        self.config.camera.backend = backend;
        self
    }

    pub fn camera_size(mut self, width: u32, height: u32) -> Self {
        self.config.camera.width = width;
        self.config.camera.height = height;
        self
    }

    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.config.camera.jpeg_quality = quality;
        self
    }

    pub fn max_file_bytes(mut self, bytes: usize) -> Self {
        self.config.upload.max_file_bytes = bytes;
        self
    }

    pub fn auto_predict(mut self, enabled: bool) -> Self {
        self.config.workflow.auto_predict = enabled;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// Environment-specific configuration presets
impl Config {
    pub fn raspberry_pi() -> Self {
        Config {
            camera: CameraConfig {
                backend: CameraBackend::Rpicam,
                ..Config::default().camera
            },
            ..Default::default()
        }
    }

    pub fn development_desktop() -> Self {
        Config {
            camera: CameraConfig {
                backend: CameraBackend::TestPattern,
                width: 640,
                height: 480,
                ..Config::default().camera
            },
            ..Default::default()
        }
    }
}
