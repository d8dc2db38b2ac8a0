//! AmyPET: amyloid PET image processing
//!
//! This crate classifies PET acquisitions and quantifies amyloid load.
//!
//! # Modules
//! - `series`, `convert`, `classify`: discovery of PET series, DICOM
//!   conversion and acquisition classification
//! - `registration`, `transform`, `resample`: rigid registration
//! - `align`, `static_image`: SUVr frame alignment and static images
//! - `trim`, `vois`, `suvr`, `qc`: VOI sampling and SUVr in PET space
//! - `centiloid`: Centiloid scale conversion
//! - `pipeline`: the end-to-end workflow
//! - `utils`: smoothing, centre of mass, masks, bias-field correction

// Core modules
pub mod defs;
pub mod error;
pub mod config;

// I/O modules
pub mod nifti_io;
pub mod series;
pub mod convert;

// Algorithm modules
pub mod transform;
pub mod resample;
pub mod registration;
pub mod utils;

// Processing modules
pub mod classify;
pub mod align;
pub mod static_image;
pub mod trim;
pub mod vois;
pub mod suvr;
pub mod qc;
pub mod centiloid;
pub mod pipeline;

pub use error::{AmyPetError, Result};
