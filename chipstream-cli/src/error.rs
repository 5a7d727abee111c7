use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Chipstream(#[from] chipstream::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Could not parse configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Error message including the chain of underlying causes.
    pub fn trace(&self) -> String {
        match self {
            Self::Chipstream(e) => e.trace(),
            other => other.to_string(),
        }
    }
}
