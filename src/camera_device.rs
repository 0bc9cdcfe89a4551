use anyhow::{anyhow, Result};
use async_trait::async_trait;
use image::{ImageBuffer, RgbImage};
use std::sync::Arc;
#[cfg(feature = "camera")]
use std::{
    collections::VecDeque,
    ffi::OsStr,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Child, ChildStderr, Command, Stdio},
    sync::Mutex,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::config::{CameraBackend, CameraConfig};
use crate::error::WorkflowError;

/// Camera hardware as seen by the capture controller.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Ask for access and start a live stream. Denial or a missing device
    /// must come back as [`WorkflowError::CameraUnavailable`].
    async fn open_stream(&self) -> Result<Box<dyn VideoStream>, WorkflowError>;
}

/// A live video stream. Dropping it without `stop` leaks the device, so the
/// capture controller only ever hands it out wrapped in a session.
pub trait VideoStream: Send {
    /// Frame size, or `None` while the stream has not produced a frame.
    fn dimensions(&self) -> Option<(u32, u32)>;

    fn sample(&mut self) -> Result<RgbImage>;

    /// Stop all underlying tracks. Calling it twice is harmless.
    fn stop(&mut self);
}

pub fn device_for(config: &CameraConfig) -> Arc<dyn CaptureDevice> {
    match config.backend {
        #[cfg(feature = "camera")]
        CameraBackend::Rpicam => Arc::new(RpiCamDevice::new(config)),
        #[cfg(not(feature = "camera"))]
        CameraBackend::Rpicam => {
            log::warn!("Built without camera support, camera disabled");
            Arc::new(NoCameraDevice)
        }
        CameraBackend::TestPattern => {
            Arc::new(TestPatternDevice::new(config.width, config.height))
        }
        CameraBackend::Disabled => Arc::new(NoCameraDevice),
    }
}

/// How long a fresh preview process gets to write its first frame.
#[cfg(feature = "camera")]
const PREVIEW_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(feature = "camera")]
const PREVIEW_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Raspberry Pi camera driven through `rpicam-still` (or legacy `raspistill`).
#[cfg(feature = "camera")]
pub struct RpiCamDevice {
    width: u32,
    height: u32,
    quality: u8,
    preview_path: PathBuf,
    tool: Option<String>,
}

#[cfg(feature = "camera")]
impl RpiCamDevice {
    /// Device that probes for `rpicam-still`, then `raspistill`, on each open.
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            quality: config.jpeg_quality,
            preview_path: config.preview_path.clone(),
            tool: None,
        }
    }

    /// Device that always runs `tool` without probing.
    #[cfg(test)]
    pub(crate) fn with_tool(config: &CameraConfig, tool: &str) -> Self {
        Self {
            tool: Some(tool.to_string()),
            ..Self::new(config)
        }
    }

    async fn find_tool() -> Option<&'static str> {
        use tokio::process::Command;

        match Command::new("rpicam-still").arg("--help").output().await {
            Ok(output) => {
                log::debug!(
                    "rpicam-still help output: {}",
                    String::from_utf8_lossy(&output.stdout)
                );
                return Some("rpicam-still");
            }
            Err(e) => log::warn!("rpicam-still not found: {}", e),
        }

        match Command::new("raspistill").arg("-?").output().await {
            Ok(_) => Some("raspistill"),
            Err(e) => {
                log::error!("Neither rpicam-still nor raspistill found: {}", e);
                None
            }
        }
    }

    fn preview_args(&self, tool: &str) -> Vec<String> {
        let path = self.preview_path.display().to_string();
        let legacy = Path::new(tool).file_name() == Some(OsStr::new("raspistill"));
        let flags: [(&str, String); 6] = if legacy {
            [
                ("-o", path),
                ("-w", self.width.to_string()),
                ("-h", self.height.to_string()),
                ("-q", self.quality.to_string()),
                ("-t", "0".to_string()),
                ("-tl", "200".to_string()),
            ]
        } else {
            [
                ("-o", path),
                ("--width", self.width.to_string()),
                ("--height", self.height.to_string()),
                ("--quality", self.quality.to_string()),
                ("--timeout", "0".to_string()),
                ("--timelapse", "200".to_string()),
            ]
        };

        let mut args: Vec<String> = flags
            .into_iter()
            .flat_map(|(flag, value)| [flag.to_string(), value])
            .collect();
        args.push(if legacy { "-n" } else { "--nopreview" }.to_string());
        args
    }
}

/// Collect a child's stderr on a background thread, logging each line.
///
/// The handle yields the last few lines once the child closes the pipe.
#[cfg(feature = "camera")]
fn drain_stderr(stderr: ChildStderr) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut tail: VecDeque<String> = VecDeque::new();
        for line in BufReader::new(stderr).lines().map_while(|line| line.ok()) {
            log::debug!("camera: {}", line);
            if tail.len() == 5 {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n")
    })
}

#[cfg(feature = "camera")]
#[async_trait]
impl CaptureDevice for RpiCamDevice {
    fn name(&self) -> &str {
        "rpicam"
    }

    async fn open_stream(&self) -> Result<Box<dyn VideoStream>, WorkflowError> {
        let tool = match &self.tool {
            Some(tool) => tool.as_str(),
            None => Self::find_tool().await.ok_or_else(|| {
                WorkflowError::CameraUnavailable(
                    "no Raspberry Pi camera tool installed".to_string(),
                )
            })?,
        };

        // A stale preview would look like a ready stream
        let _ = std::fs::remove_file(&self.preview_path);

        let args = self.preview_args(tool);
        log::info!("Preview command: {} {}", tool, args.join(" "));

        let mut child = Command::new(tool)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                WorkflowError::CameraUnavailable(format!("failed to start {}: {}", tool, e))
            })?;
        let stderr = child.stderr.take().map(drain_stderr);

        // Wait for the first frame so a tool that dies on startup is a denial
        let deadline = Instant::now() + PREVIEW_STARTUP_TIMEOUT;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let output = stderr
                        .and_then(|handle| handle.join().ok())
                        .unwrap_or_default();
                    let _ = std::fs::remove_file(&self.preview_path);
                    log::error!("{} exited during startup ({}): {}", tool, status, output);
                    let reason = if output.is_empty() {
                        format!("{} exited with {}", tool, status)
                    } else {
                        output
                    };
                    return Err(WorkflowError::CameraUnavailable(reason));
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = std::fs::remove_file(&self.preview_path);
                    return Err(WorkflowError::CameraUnavailable(format!(
                        "failed to watch {}: {}",
                        tool, e
                    )));
                }
            }

            if image::image_dimensions(&self.preview_path).is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                log::warn!("{} has not produced a frame yet", tool);
                break;
            }
            tokio::time::sleep(PREVIEW_POLL_INTERVAL).await;
        }

        log::info!("Camera preview started with {}", tool);
        Ok(Box::new(RpiCamStream {
            child: Mutex::new(Some(child)),
            preview_path: self.preview_path.clone(),
        }))
    }
}

#[cfg(feature = "camera")]
struct RpiCamStream {
    child: Mutex<Option<Child>>,
    preview_path: PathBuf,
}

#[cfg(feature = "camera")]
impl RpiCamStream {
    /// Whether the preview process is still alive. A dead process takes its
    /// last frame with it.
    fn running(&self) -> bool {
        let Ok(mut child) = self.child.lock() else {
            return false;
        };

        match child.as_mut().map(|process| process.try_wait()) {
            None => false,
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                log::error!("Camera preview process exited ({})", status);
                *child = None;
                let _ = std::fs::remove_file(&self.preview_path);
                false
            }
            Some(Err(e)) => {
                log::warn!("Failed to poll camera preview process: {}", e);
                true
            }
        }
    }
}

#[cfg(feature = "camera")]
impl VideoStream for RpiCamStream {
    fn dimensions(&self) -> Option<(u32, u32)> {
        if !self.running() {
            return None;
        }
        image::image_dimensions(&self.preview_path).ok()
    }

    fn sample(&mut self) -> Result<RgbImage> {
        if !self.running() {
            return Err(anyhow!("Camera preview is not running"));
        }
        let img = image::open(&self.preview_path)
            .map_err(|e| anyhow!("Failed to load preview frame: {}", e))?;
        Ok(img.to_rgb8())
    }

    fn stop(&mut self) {
        let process = match self.child.get_mut() {
            Ok(child) => child.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut process) = process {
            let _ = process.kill();
            let _ = process.wait();
            let _ = std::fs::remove_file(&self.preview_path);
            log::info!("Camera preview stopped");
        }
    }
}

#[cfg(feature = "camera")]
impl Drop for RpiCamStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Always-available synthetic camera for development machines.
pub struct TestPatternDevice {
    width: u32,
    height: u32,
}

impl TestPatternDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[async_trait]
impl CaptureDevice for TestPatternDevice {
    fn name(&self) -> &str {
        "test-pattern"
    }

    async fn open_stream(&self) -> Result<Box<dyn VideoStream>, WorkflowError> {
        log::warn!("Camera not available - streaming test pattern");
        Ok(Box::new(TestPatternStream {
            width: self.width,
            height: self.height,
            frame: 0,
            running: true,
        }))
    }
}

struct TestPatternStream {
    width: u32,
    height: u32,
    frame: u32,
    running: bool,
}

impl VideoStream for TestPatternStream {
    fn dimensions(&self) -> Option<(u32, u32)> {
        self.running.then_some((self.width, self.height))
    }

    fn sample(&mut self) -> Result<RgbImage> {
        if !self.running {
            return Err(anyhow!("Test pattern stream stopped"));
        }
        let (width, height, shift) = (self.width, self.height, self.frame);
        self.frame = self.frame.wrapping_add(1);

        Ok(ImageBuffer::from_fn(width, height, |x, y| {
            let r = (x * 255 / width) as u8;
            let g = (y * 255 / height) as u8;
            let b = ((x + y) * 255 / (width + height)) as u8;
            image::Rgb([r.wrapping_add(shift as u8), g, b])
        }))
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

/// Camera backend for hosts without one; every open is denied.
pub struct NoCameraDevice;

#[async_trait]
impl CaptureDevice for NoCameraDevice {
    fn name(&self) -> &str {
        "none"
    }

    async fn open_stream(&self) -> Result<Box<dyn VideoStream>, WorkflowError> {
        Err(WorkflowError::CameraUnavailable(
            "camera disabled in configuration".to_string(),
        ))
    }
}
