use thiserror::Error;

/// Errors loading or validating configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("config read error: {0}")]
    Io(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors parsing duration strings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("empty duration string")]
    Empty,

    #[error("invalid duration '{0}'")]
    Invalid(String),

    #[error("unknown duration unit '{unit}' in '{input}'")]
    UnknownUnit { input: String, unit: String },
}
