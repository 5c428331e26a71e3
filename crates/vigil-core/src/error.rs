use thiserror::Error;

#[derive(Debug, Error)]
pub enum VigilError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl VigilError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            VigilError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, VigilError>;
