#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("environment unsupported: {0}")]
    EnvironmentUnsupported(String),

    #[error("sandbox boot failed: {0}")]
    BootFailed(String),

    #[error("sandbox not running")]
    NotRunning,

    #[error("filesystem error at {path}: {detail}")]
    Fs { path: String, detail: String },

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn fs(path: &str, detail: impl std::fmt::Display) -> Self {
        Self::Fs {
            path: path.to_owned(),
            detail: detail.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
