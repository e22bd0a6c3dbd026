//! Error types for curriculum-rs.
//!
//! Every fallible operation in the crate returns [`Result`], and failures are
//! propagated with `?` up to the caller. There is no retry or partial
//! recovery: a failed epoch ends the run.
//!
//! # Example
//!
//! ```rust
//! use curriculum_rs::{CurriculumConfig, CurriculumError};
//!
//! match CurriculumConfig::from_preset("imagenet-22k") {
//!     Ok(_) => println!("Loaded preset"),
//!     Err(CurriculumError::Config(msg)) => eprintln!("Configuration error: {msg}"),
//!     Err(e) => eprintln!("Other error: {e}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for curriculum-rs operations.
pub type Result<T> = std::result::Result<T, CurriculumError>;

/// Errors that can occur in curriculum-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CurriculumError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Dataset or filter artifact error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Model construction or weight loading error.
    #[error("model error: {0}")]
    Model(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Report export error.
    #[error("report error: {0}")]
    Report(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Spreadsheet writer error.
    #[error("xlsx error: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for CurriculumError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        CurriculumError::Template(err.to_string())
    }
}
