use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::Engine as _;

use crate::capture::traits::{Camera, CapturedFrame};
use crate::errors::{GuidedFixError, GuidedFixResult};

const FRAME_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Camera backed by a directory of still images, served in filename order and
/// wrapping around. Each frame is re-encoded as JPEG at the requested quality.
pub struct DirectoryCamera {
    frames: Vec<PathBuf>,
    next: AtomicUsize,
    ready: AtomicBool,
    permitted: AtomicBool,
}

impl DirectoryCamera {
    pub fn open(dir: &Path) -> GuidedFixResult<Self> {
        let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        frames.sort();

        if frames.is_empty() {
            return Err(GuidedFixError::Camera(format!(
                "no frames found in {}",
                dir.display()
            )));
        }
        tracing::info!(dir = %dir.display(), frames = frames.len(), "directory camera opened");

        Ok(Self {
            frames,
            next: AtomicUsize::new(0),
            ready: AtomicBool::new(false),
            permitted: AtomicBool::new(false),
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait]
impl Camera for DirectoryCamera {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn request_permission(&self) -> GuidedFixResult<bool> {
        self.permitted.store(true, Ordering::Release);
        self.ready.store(true, Ordering::Release);
        Ok(true)
    }

    async fn take_picture(&self, quality: f32) -> GuidedFixResult<CapturedFrame> {
        if !self.is_ready() {
            return Err(GuidedFixError::CameraNotReady);
        }
        let idx = self.next.fetch_add(1, Ordering::AcqRel) % self.frames.len();
        let path = self.frames[idx].clone();

        // Decoding and JPEG encoding are CPU-bound.
        let (bytes, width, height) = tokio::task::spawn_blocking(move || {
            let img = image::open(&path)?;
            let bytes = encode_jpeg(&img, quality)?;
            Ok::<_, GuidedFixError>((bytes, img.width(), img.height()))
        })
        .await
        .map_err(|e| GuidedFixError::Camera(format!("join: {e}")))??;

        tracing::debug!(frame = idx, bytes = bytes.len(), quality, "frame captured");
        Ok(CapturedFrame {
            base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
            width,
            height,
            captured_at: chrono::Utc::now(),
        })
    }

    async fn release(&self) {
        self.ready.store(false, Ordering::Release);
        tracing::info!("directory camera released");
    }
}

/// Encode as baseline JPEG. `quality` in [0, 1] maps onto the encoder's 1–100 scale.
pub fn encode_jpeg(img: &image::DynamicImage, quality: f32) -> GuidedFixResult<Vec<u8>> {
    let q = (quality.clamp(0.0, 1.0) * 100.0).round().max(1.0) as u8;
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, q);
    encoder.encode_image(&rgb)?;
    Ok(buf)
}
