use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuidedFixError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Rate limited by backend (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Camera not ready")]
    CameraNotReady,

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Request aborted")]
    Aborted,

    #[error("Task error: {0}")]
    Task(String),
}

impl GuidedFixError {
    /// Failures the scheduler absorbs and retries on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GuidedFixError::Backend(_)
                | GuidedFixError::Http(_)
                | GuidedFixError::Json(_)
                | GuidedFixError::Io(_)
                | GuidedFixError::Task(_)
                | GuidedFixError::RateLimited { .. }
                | GuidedFixError::CameraNotReady
                | GuidedFixError::Camera(_)
                | GuidedFixError::Image(_)
        )
    }
}

impl serde::Serialize for GuidedFixError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type GuidedFixResult<T> = Result<T, GuidedFixError>;
