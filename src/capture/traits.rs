use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::errors::GuidedFixResult;

/// A compressed still frame, base64 encoded for the wire.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub base64: String,
    pub width: u32,
    pub height: u32,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

/// Device camera as seen by a guided-fix session.
#[async_trait]
pub trait Camera: Send + Sync {
    /// Whether a capture would succeed right now.
    fn is_ready(&self) -> bool;

    async fn request_permission(&self) -> GuidedFixResult<bool>;

    /// Capture and compress a frame. `quality` is in [0, 1].
    /// Fails with `CameraNotReady` while the device is still initialising.
    async fn take_picture(&self, quality: f32) -> GuidedFixResult<CapturedFrame>;

    /// Release the device. Further captures fail with `CameraNotReady`.
    async fn release(&self);
}

/// Read-only view of the narration layer.
pub trait SpeechStatus: Send + Sync {
    fn is_speaking(&self) -> bool;
}

/// Speech status toggled by whatever drives text-to-speech.
#[derive(Debug, Default)]
pub struct SpeechFlag {
    speaking: AtomicBool,
}

impl SpeechFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.speaking.store(speaking, Ordering::Release);
    }
}

impl SpeechStatus for SpeechFlag {
    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Acquire)
    }
}
