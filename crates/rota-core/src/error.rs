use thiserror::Error;

#[derive(Debug, Error)]
pub enum RotaError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RotaError {
    /// Short error code string for log lines and CLI exit messages.
    pub fn code(&self) -> &'static str {
        match self {
            RotaError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RotaError>;
