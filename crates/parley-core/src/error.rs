use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing credential: {name}")]
    MissingCredential { name: &'static str },

    #[error("Invalid command /{name}: {reason}")]
    InvalidCommand { name: String, reason: String },
}

impl ParleyError {
    /// Short error code used in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            ParleyError::Config(_) => "CONFIG_ERROR",
            ParleyError::MissingCredential { .. } => "MISSING_CREDENTIAL",
            ParleyError::InvalidCommand { .. } => "INVALID_COMMAND",
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
