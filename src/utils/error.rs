use thiserror::Error;

/// Startup-time application errors. Runtime layers carry their own
/// error types and convert at the seams.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),
}
