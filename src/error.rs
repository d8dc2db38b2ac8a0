//! Error types shared across the processing pipeline

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AmyPetError>;

#[derive(Error, Debug, Diagnostic)]
pub enum AmyPetError {
    // --- FILESYSTEM ---
    #[error("File system error: {0}")]
    #[diagnostic(code(amypet::io), help("Check file permissions or path validity."))]
    Io(#[from] std::io::Error),

    #[error("Incorrect input path '{}': {reason}", path.display())]
    #[diagnostic(code(amypet::input))]
    InvalidInput { path: PathBuf, reason: String },

    // --- IMAGE I/O ---
    #[error("NIfTI error: {0}")]
    #[diagnostic(code(amypet::nifti))]
    Nifti(String),

    #[error("Image shape mismatch: {0}")]
    #[diagnostic(code(amypet::shape), help("Images must be aligned and share the same dimensions."))]
    ShapeMismatch(String),

    // --- METADATA / CONFIG ---
    #[error("Sidecar parsing error in '{}': {source}", path.display())]
    #[diagnostic(code(amypet::sidecar), help("Sidecars are BIDS JSON files as written by dcm2niix."))]
    Sidecar {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid acquisition metadata: {0}")]
    #[diagnostic(code(amypet::metadata))]
    Metadata(String),

    #[error("YAML parsing error: {0}")]
    #[diagnostic(code(amypet::config::yaml), help("Check your YAML syntax (indentation, types)."))]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    #[diagnostic(code(amypet::json))]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    #[diagnostic(code(amypet::config))]
    Config(String),

    // --- PROCESSING ---
    #[error("Classification error: {0}")]
    #[diagnostic(code(amypet::classify))]
    Classification(String),

    #[error("The selected frames do not exist: requested {requested:?}, image has {available} frame(s)")]
    #[diagnostic(code(amypet::frames))]
    FrameSelection { requested: Vec<usize>, available: usize },

    #[error("VOI definition error: {0}")]
    #[diagnostic(code(amypet::voi))]
    Voi(String),

    #[error("Registration failed: {0}")]
    #[diagnostic(code(amypet::registration))]
    Registration(String),

    // --- EXTERNAL TOOLS ---
    #[error("DICOM conversion failed: {0}")]
    #[diagnostic(
        code(amypet::convert),
        help("Make sure dcm2niix is installed or set AMYPET_DCM2NIIX to its path.")
    )]
    Conversion(String),
}

impl AmyPetError {
    pub fn invalid_input(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        AmyPetError::InvalidInput {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_message() {
        let err = AmyPetError::invalid_input("/data/pet", "not a folder");
        assert_eq!(err.to_string(), "Incorrect input path '/data/pet': not a folder");
    }

    #[test]
    fn test_frame_selection_message() {
        let err = AmyPetError::FrameSelection { requested: vec![0, 5], available: 4 };
        assert!(err.to_string().contains("4 frame(s)"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: AmyPetError = io.into();
        assert!(matches!(err, AmyPetError::Io(_)));
    }
}
