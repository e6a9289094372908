use thiserror::Error;

/// Errors raised while configuring the text layer.
#[derive(Error, Debug)]
pub enum TextError {
    #[error("Invalid delimiter pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Invalid window configuration: {0}")]
    InvalidConfig(String),
}
