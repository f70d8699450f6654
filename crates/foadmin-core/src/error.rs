use thiserror::Error;

#[derive(Debug, Error)]
pub enum FoadminError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl FoadminError {
    /// Short error code string used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            FoadminError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, FoadminError>;
