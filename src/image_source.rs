use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageFormat, RgbImage};
use log::debug;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::error::WorkflowError;

/// Where an [`Image`] came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageOrigin {
    File { name: String },
    Camera { captured_at: DateTime<Local> },
}

/// Canonical in-memory plant photo, regardless of origin.
///
/// The payload is shared, so cloning an image into a prediction task or a
/// presentation snapshot never copies the bytes.
#[derive(Clone, PartialEq)]
pub struct Image {
    bytes: Arc<[u8]>,
    mime_type: String,
    origin: ImageOrigin,
}

impl Image {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn origin(&self) -> &ImageOrigin {
        &self.origin
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `data:<mime>;base64,<payload>`, usable directly as a preview source.
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.bytes))
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .field("origin", &self.origin)
            .finish()
    }
}

/// A file the user picked, as handed over by the presentation layer.
#[derive(Debug, Clone)]
pub struct SelectedFile {
    pub name: String,
    pub bytes: Vec<u8>,
    /// Declared content type, if the picker reported one.
    pub content_type: Option<String>,
}

impl SelectedFile {
    /// Read a file from disk, guessing its declared type from the extension.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read image file {}", path.display()))?;

        let content_type = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| match ImageFormat::from_extension(ext).and_then(mime_for_format) {
                Some(mime) => mime.to_string(),
                None => "application/octet-stream".to_string(),
            });

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            name,
            bytes,
            content_type,
        })
    }
}

/// MIME type for the formats the classifier upload accepts.
pub fn mime_for_format(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::Gif => Some("image/gif"),
        ImageFormat::WebP => Some("image/webp"),
        ImageFormat::Bmp => Some("image/bmp"),
        ImageFormat::Tiff => Some("image/tiff"),
        _ => None,
    }
}

/// Turns file selections and camera frames into [`Image`]s.
#[derive(Debug, Clone)]
pub struct ImageSource {
    max_file_bytes: usize,
    jpeg_quality: u8,
}

impl ImageSource {
    pub fn new(max_file_bytes: usize, jpeg_quality: u8) -> Self {
        Self {
            max_file_bytes,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    /// Limits taken from the `upload` and `camera` sections.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.upload.max_file_bytes, config.camera.jpeg_quality)
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }

    /// Validate a picked file and wrap it as an [`Image`].
    ///
    /// The file must be non-empty, within the size limit, declared as
    /// `image/*` when a type is given, and decode as a supported format.
    /// Anything else is [`WorkflowError::InvalidFile`].
    pub fn from_file(&self, file: &SelectedFile) -> Result<Image, WorkflowError> {
        if file.bytes.is_empty() {
            return Err(WorkflowError::InvalidFile(format!("{} is empty", file.name)));
        }
        if file.bytes.len() > self.max_file_bytes {
            return Err(WorkflowError::InvalidFile(format!(
                "{} is {} bytes, limit is {}",
                file.name,
                file.bytes.len(),
                self.max_file_bytes
            )));
        }
        if let Some(declared) = &file.content_type {
            if !declared.starts_with("image/") {
                return Err(WorkflowError::InvalidFile(format!(
                    "{} has content type {}",
                    file.name, declared
                )));
            }
        }

        // Magic bytes decide the format, not the name
        let format = image::guess_format(&file.bytes)
            .map_err(|_| WorkflowError::InvalidFile(format!("{} is not an image", file.name)))?;
        let mime_type = mime_for_format(format).ok_or_else(|| {
            WorkflowError::InvalidFile(format!(
                "{} uses unsupported format {:?}",
                file.name, format
            ))
        })?;

        let decoded = image::load_from_memory_with_format(&file.bytes, format).map_err(|e| {
            WorkflowError::InvalidFile(format!("{} could not be decoded: {}", file.name, e))
        })?;
        debug!(
            "Accepted {} ({}, {}x{}, {} bytes)",
            file.name,
            mime_type,
            decoded.width(),
            decoded.height(),
            file.bytes.len()
        );

        Ok(Image {
            bytes: Arc::from(file.bytes.as_slice()),
            mime_type: mime_type.to_string(),
            origin: ImageOrigin::File {
                name: file.name.clone(),
            },
        })
    }

    /// Encodes a captured frame as JPEG at the configured quality.
    pub fn from_frame(&self, frame: &RgbImage) -> Result<Image, WorkflowError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(WorkflowError::FrameNotReady);
        }

        let mut buffer = Vec::new();
        JpegEncoder::new_with_quality(&mut buffer, self.jpeg_quality)
            .encode(frame.as_raw(), width, height, ColorType::Rgb8)
            .map_err(|e| {
                WorkflowError::InvalidFile(format!("failed to encode captured frame: {}", e))
            })?;

        debug!(
            "Encoded {}x{} frame as JPEG (quality {}, {} bytes)",
            width,
            height,
            self.jpeg_quality,
            buffer.len()
        );

        Ok(Image {
            bytes: Arc::from(buffer),
            mime_type: "image/jpeg".to_string(),
            origin: ImageOrigin::Camera {
                captured_at: Local::now(),
            },
        })
    }
}
