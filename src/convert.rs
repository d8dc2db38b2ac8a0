//! DICOM to NIfTI conversion through the external `dcm2niix` tool

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{AmyPetError, Result};
use crate::nifti_io::is_nifti_path;

/// Default executable name, resolved through `PATH`
pub const DCM2NIIX: &str = "dcm2niix";

#[derive(Debug, Clone)]
pub struct Dcm2niix {
    pub binary: PathBuf,
}

impl Default for Dcm2niix {
    fn default() -> Self {
        Self { binary: PathBuf::from(DCM2NIIX) }
    }
}

impl Dcm2niix {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    /// Arguments for converting `input` into `output`
    pub fn arguments(input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-i".into(),
            "y".into(),
            "-v".into(),
            "n".into(),
            "-z".into(),
            "y".into(),
            "-b".into(),
            "y".into(),
            "-f".into(),
            "%f_%s".into(),
            "-o".into(),
            output.to_string_lossy().into_owned(),
            input.to_string_lossy().into_owned(),
        ]
    }

    /// Convert a DICOM folder; returns the NIfTI files created in `output`
    pub fn convert(&self, input: &Path, output: &Path) -> Result<Vec<PathBuf>> {
        if !input.is_dir() {
            return Err(AmyPetError::invalid_input(input, "DICOM input must be a folder"));
        }
        std::fs::create_dir_all(output)?;
        let before = nifti_files(output);

        info!(input = %input.display(), output = %output.display(), "converting DICOM to NIfTI");
        let result = Command::new(&self.binary)
            .args(Self::arguments(input, output))
            .output()
            .map_err(|e| AmyPetError::Conversion(format!("could not run '{}': {}", self.binary.display(), e)))?;

        if !result.status.success() {
            return Err(AmyPetError::Conversion(format!(
                "'{}' exited with {}: {}",
                self.binary.display(),
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }

        let created: Vec<PathBuf> = nifti_files(output).into_iter().filter(|p| !before.contains(p)).collect();
        debug!(files = created.len(), "conversion finished");
        Ok(created)
    }
}

/// NIfTI files directly inside `dir`, sorted by name
pub fn nifti_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file() && is_nifti_path(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments_layout() {
        let args = Dcm2niix::arguments(Path::new("/in"), Path::new("/out"));
        assert_eq!(args[..10], ["-i", "y", "-v", "n", "-z", "y", "-b", "y", "-f", "%f_%s"]);
        assert_eq!(args[10..], ["-o", "/out", "/in"]);
    }

    #[test]
    fn test_missing_binary_is_conversion_error() {
        let dir = tempfile::tempdir().unwrap();
        let conv = Dcm2niix::new(dir.path().join("no-such-dcm2niix"));
        let err = conv.convert(dir.path(), &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, AmyPetError::Conversion(_)));
    }

    #[test]
    fn test_input_must_be_folder() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.dcm");
        std::fs::write(&file, b"").unwrap();
        let err = Dcm2niix::default().convert(&file, dir.path()).unwrap_err();
        assert!(matches!(err, AmyPetError::InvalidInput { .. }));
    }

    #[test]
    fn test_nifti_files_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.nii.gz", "a.nii", "c.json"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let files = nifti_files(dir.path());
        let names: Vec<_> = files.iter().map(|p| p.file_name().unwrap().to_string_lossy().to_string()).collect();
        assert_eq!(names, vec!["a.nii", "b.nii.gz"]);
    }
}
