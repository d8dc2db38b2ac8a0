//! Static (SUVr) image preparation
//!
//! Sums the selected frames of a dynamic PET image into a single static
//! image, optionally writing a centre-of-mass corrected copy.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::convert::{nifti_files, Dcm2niix};
use crate::error::{AmyPetError, Result};
use crate::nifti_io::{is_nifti_path, read_nifti_file, save_nifti_to_file, Image};
use crate::series::DICOM_EXTENSIONS;
use crate::utils::{centre_mass_correction, clean_name};

#[derive(Debug, Clone)]
pub struct StaticOptions {
    /// Frames to sum; all frames when `None`
    pub frames: Option<Vec<usize>>,
    /// Defaults to the parent folder of the input
    pub outpath: Option<PathBuf>,
    /// Core name of the static file
    pub fname: Option<String>,
    pub com_correction: bool,
    /// Regenerate the static image even if it exists
    pub force: bool,
    pub dcm2niix: Dcm2niix,
}

impl Default for StaticOptions {
    fn default() -> Self {
        Self {
            frames: None,
            outpath: None,
            fname: None,
            com_correction: true,
            force: true,
            dcm2niix: Dcm2niix::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticResult {
    /// Source NIfTI (converted when the input was DICOM)
    pub fpet_nii: PathBuf,
    /// Static image
    pub fstat: PathBuf,
    /// Centre-of-mass corrected static image
    pub fcom: Option<PathBuf>,
    /// Absolute centre of mass (mm) before correction
    pub com: Option<[f64; 3]>,
    pub frames: Vec<usize>,
}

/// Sum the selected frames; a single-frame image is returned as is
pub fn sum_frames(image: &Image, frames: &[usize]) -> Result<Image> {
    if frames.iter().any(|&t| t >= image.frames) || (frames.is_empty() && image.frames > 1) {
        return Err(AmyPetError::FrameSelection { requested: frames.to_vec(), available: image.frames });
    }
    if image.frames == 1 {
        return image.frame_image(0);
    }
    let n = image.n_voxels();
    let mut sum = vec![0.0; n];
    for &t in frames {
        for (s, v) in sum.iter_mut().zip(image.frame(t)) {
            *s += v;
        }
    }
    image.with_data(sum)
}

fn matching_niftis(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    nifti_files(dir)
        .into_iter()
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with(prefix))
                .unwrap_or(false)
        })
        .collect()
}

fn has_dicom(dir: &Path) -> Result<bool> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if DICOM_EXTENSIONS.contains(&ext) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// NIfTI file for a DICOM folder, converting into `petout` when not done before
fn dicom_to_nifti(pet_path: &Path, petout: &Path, dcm2niix: &Dcm2niix) -> Result<PathBuf> {
    let name = pet_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut found = matching_niftis(petout, &name);
    if found.is_empty() {
        dcm2niix.convert(pet_path, petout)?;
        found = matching_niftis(petout, &name);
    }
    // dcm2niix replaces spaces in folder names
    if found.is_empty() {
        found = matching_niftis(petout, &name.replace(' ', "_"));
    }

    match found.len() {
        0 => Err(AmyPetError::invalid_input(pet_path, "no SUVr NIfTI files found after conversion")),
        1 => Ok(found.remove(0)),
        n => Err(AmyPetError::invalid_input(
            pet_path,
            format!("too many SUVr NIfTI files found ({})", n),
        )),
    }
}

/// Prepare the static image used for SUVr analysis
#[instrument(skip(options), fields(pet = %pet_path.display()))]
pub fn preproc_suvr(pet_path: &Path, options: &StaticOptions) -> Result<StaticResult> {
    if !pet_path.exists() {
        return Err(AmyPetError::invalid_input(pet_path, "the provided path does not exist"));
    }

    let petout = match &options.outpath {
        Some(p) => p.clone(),
        None => pet_path.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    std::fs::create_dir_all(&petout)?;

    let fname = match &options.fname {
        None => {
            let name = pet_path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            let core = name.split('.').next().unwrap_or_default();
            format!("{}_static.nii.gz", clean_name(core))
        }
        Some(f) if f.ends_with(".nii.gz") => f.clone(),
        Some(f) => format!("{}.nii.gz", f),
    };

    let fpet_nii = if pet_path.is_file() && is_nifti_path(pet_path) {
        info!("PET path is a NIfTI file");
        pet_path.to_path_buf()
    } else if pet_path.is_dir() && has_dicom(pet_path)? {
        dicom_to_nifti(pet_path, &petout, &options.dcm2niix)?
    } else {
        return Err(AmyPetError::invalid_input(pet_path, "neither a NIfTI file nor a DICOM folder"));
    };

    let image = read_nifti_file(&fpet_nii)?;
    let nfrm = image.frames;
    info!(frames = nfrm, "frames found in the dynamic image");

    let frames = match &options.frames {
        Some(f) if !f.is_empty() => {
            if f.iter().any(|&i| i >= nfrm) {
                return Err(AmyPetError::FrameSelection { requested: f.clone(), available: nfrm });
            }
            f.clone()
        }
        _ => (0..nfrm).collect(),
    };

    let fstat = petout.join(&fname);
    let stat = if !fstat.is_file() || options.force {
        let stat = sum_frames(&image, &frames)?;
        save_nifti_to_file(&fstat, &stat)?;
        info!(file = %fstat.display(), "saved static SUVr image");
        stat
    } else {
        read_nifti_file(&fstat)?
    };

    let (fcom, com) = if options.com_correction {
        let (corrected, com) = centre_mass_correction(&stat)?;
        let stem = crate::nifti_io::nifti_stem(&fstat);
        let f = petout.join(format!("{}_com-modified.nii.gz", stem));
        save_nifti_to_file(&f, &corrected)?;
        info!(file = %f.display(), "saved centre-of-mass corrected image");
        (Some(f), Some(com))
    } else {
        (None, None)
    };

    Ok(StaticResult { fpet_nii, fstat, fcom, com, frames })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti_io::IDENTITY;

    fn dynamic(dir: &Path) -> PathBuf {
        let frames: Vec<Vec<f64>> = (1..=3).map(|t| vec![t as f64; 27]).collect();
        let img = Image::from_frames(frames, (3, 3, 3), (2.0, 2.0, 2.0), IDENTITY).unwrap();
        let f = dir.join("pet 4d.nii.gz");
        save_nifti_to_file(&f, &img).unwrap();
        f
    }

    #[test]
    fn test_sum_selected_frames() {
        let dir = tempfile::tempdir().unwrap();
        let f = dynamic(dir.path());
        let opts = StaticOptions {
            frames: Some(vec![1, 2]),
            com_correction: false,
            ..Default::default()
        };
        let res = preproc_suvr(&f, &opts).unwrap();
        assert!(res.fstat.ends_with("pet_4d_static.nii.gz"));
        let stat = read_nifti_file(&res.fstat).unwrap();
        assert_eq!(stat.frames, 1);
        assert!((stat.data[0] - 5.0).abs() < 1e-6);
        assert!(res.fcom.is_none());
    }

    #[test]
    fn test_all_frames_by_default_and_com() {
        let dir = tempfile::tempdir().unwrap();
        let f = dynamic(dir.path());
        let out = dir.path().join("out");
        let opts = StaticOptions {
            outpath: Some(out.clone()),
            fname: Some("static".into()),
            ..Default::default()
        };
        let res = preproc_suvr(&f, &opts).unwrap();
        assert_eq!(res.fstat, out.join("static.nii.gz"));
        assert_eq!(res.frames, vec![0, 1, 2]);
        assert!((read_nifti_file(&res.fstat).unwrap().data[13] - 6.0).abs() < 1e-6);

        let fcom = res.fcom.unwrap();
        assert!(fcom.ends_with("static_com-modified.nii.gz"));
        // Uniform cube on an identity grid: centre at voxel (1, 1, 1)
        let com = res.com.unwrap();
        for c in com {
            assert!((c - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_missing_frames_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let f = dynamic(dir.path());
        let opts = StaticOptions { frames: Some(vec![0, 3]), ..Default::default() };
        let err = preproc_suvr(&f, &opts).unwrap_err();
        assert!(matches!(err, AmyPetError::FrameSelection { available: 3, .. }));
    }

    #[test]
    fn test_sum_frames_checks_indices() {
        let frames: Vec<Vec<f64>> = (1..=3).map(|t| vec![t as f64; 27]).collect();
        let img = Image::from_frames(frames, (3, 3, 3), (2.0, 2.0, 2.0), IDENTITY).unwrap();
        assert_eq!(sum_frames(&img, &[0, 2]).unwrap().data[5], 4.0);
        assert!(matches!(
            sum_frames(&img, &[1, 3]),
            Err(AmyPetError::FrameSelection { available: 3, .. })
        ));
        assert!(sum_frames(&img, &[]).is_err());
    }

    #[test]
    fn test_missing_path() {
        let err = preproc_suvr(Path::new("/no/such/pet.nii.gz"), &StaticOptions::default()).unwrap_err();
        assert!(matches!(err, AmyPetError::InvalidInput { .. }));
    }

    #[test]
    fn test_existing_static_kept_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let f = dynamic(dir.path());
        let stat_path = dir.path().join("pet_4d_static.nii.gz");
        let marker = Image::new(vec![42.0; 27], (3, 3, 3), (2.0, 2.0, 2.0), IDENTITY).unwrap();
        save_nifti_to_file(&stat_path, &marker).unwrap();

        let opts = StaticOptions { force: false, com_correction: false, ..Default::default() };
        let res = preproc_suvr(&f, &opts).unwrap();
        assert_eq!(read_nifti_file(&res.fstat).unwrap().data[0], 42.0);
    }
}
