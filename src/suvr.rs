//! VOI and SUVr processing of a static PET image with an MR parcellation
//!
//! The T1w image and the label (parcellation) image must share the same
//! space. The T1w image is registered to the trimmed and upsampled static
//! PET image and the labels are carried into PET space with the same
//! transform.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{AmyPetError, Result};
use crate::nifti_io::{nifti_stem, read_nifti_file, save_nifti_to_file, Image};
use crate::qc::{qc_positions, save_montage};
use crate::registration::{coregister, RegistrationParams, RegistrationResult};
use crate::resample::{resample, Interpolation};
use crate::static_image::{preproc_suvr, StaticOptions, StaticResult};
use crate::transform::save_affine;
use crate::trim::{trim_upscale, TrimOptions};
use crate::utils::{bias_field_correction, BiasCorrectionParams};
use crate::vois::{default_definitions, extract_vois, VoiDefinitions, VoiOptions, VoiValue};

pub const REPORT_FILE: &str = "amypet_vois.json";

/// VOIs the QC montage is positioned on
const QC_VOIS: [&str; 2] = ["neocx", "cblgm"];

#[derive(Debug, Clone)]
pub struct SuvrOptions {
    /// VOI definitions; one VOI per label when `None`
    pub vois: Option<VoiDefinitions>,
    pub ref_vois: Vec<String>,
    /// Frames summed into the static image; all when `None`
    pub frames: Option<Vec<usize>>,
    pub fname: Option<String>,
    pub t1_bias_correction: bool,
    pub bias: BiasCorrectionParams,
    /// Defaults to the parent folder of the PET input
    pub outpath: Option<PathBuf>,
    pub output_masks: bool,
    pub save_voi_masks: bool,
    pub qc: bool,
    /// Registration of the T1w (floating) to the PET (reference) image
    pub registration: RegistrationParams,
    /// Run the registration even if labels in PET space exist
    pub reg_fresh: bool,
    pub trim: TrimOptions,
    pub static_options: StaticOptions,
}

impl Default for SuvrOptions {
    fn default() -> Self {
        Self {
            vois: None,
            ref_vois: Vec::new(),
            frames: None,
            fname: None,
            t1_bias_correction: true,
            bias: BiasCorrectionParams::default(),
            outpath: None,
            output_masks: true,
            save_voi_masks: false,
            qc: true,
            registration: RegistrationParams { init_com: true, ..Default::default() },
            reg_fresh: true,
            trim: TrimOptions::default(),
            static_options: StaticOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFiles {
    pub fpet: PathBuf,
    pub ft1w: PathBuf,
    pub flbl: PathBuf,
}

/// SUVr of every VOI for one reference VOI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuvrValues {
    pub values: BTreeMap<String, f64>,
    /// Trimmed static image divided by the reference mean
    pub fsuvr: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuvrResult {
    pub input: InputFiles,
    #[serde(rename = "static")]
    pub static_image: StaticResult,
    /// Bias corrected T1w image
    pub fbc: Option<PathBuf>,
    pub ftrm: PathBuf,
    pub trim_scale: usize,
    /// `None` when existing labels in PET space were reused
    pub registration: Option<RegistrationResult>,
    /// Labels in upsampled PET space
    pub flbl: PathBuf,
    pub vois: BTreeMap<String, VoiValue>,
    pub suvr: BTreeMap<String, SuvrValues>,
    pub fqc: Option<PathBuf>,
}

fn check_inputs(pet: &Path, labels: &Path, t1w: &Path) -> Result<()> {
    if !pet.exists() {
        return Err(AmyPetError::invalid_input(pet, "PET image does not exist"));
    }
    if !t1w.is_file() {
        return Err(AmyPetError::invalid_input(t1w, "T1w image does not exist"));
    }
    if !labels.is_file() {
        return Err(AmyPetError::invalid_input(labels, "label image does not exist"));
    }
    Ok(())
}

/// Process the PET image for VOI extraction using MR-based parcellations
#[instrument(skip_all, fields(pet = %pet.display()))]
pub fn voi_process(pet: &Path, labels: &Path, t1w: &Path, options: &SuvrOptions) -> Result<SuvrResult> {
    check_inputs(pet, labels, t1w)?;

    let label_img = read_nifti_file(labels)?;
    let vois = match &options.vois {
        Some(v) => v.clone(),
        None => default_definitions(&label_img),
    };
    if let Some(missing) = options.ref_vois.iter().find(|r| !vois.contains_key(*r)) {
        return Err(AmyPetError::Voi(format!(
            "reference VOI '{}' is not in the VOI definitions",
            missing
        )));
    }

    let outpath = match &options.outpath {
        Some(p) => p.clone(),
        None => pet.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    let pet_name = pet.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let pet_core = pet_name.split('.').next().unwrap_or_default().to_string();

    // Static image
    let static_opts = StaticOptions {
        frames: options.frames.clone(),
        outpath: Some(outpath.join(format!("{}_suvr", pet_core))),
        fname: options.fname.clone(),
        ..options.static_options.clone()
    };
    let static_image = preproc_suvr(pet, &static_opts)?;

    // T1w bias correction
    let t1_img = read_nifti_file(t1w)?;
    let (mri, fbc) = if options.t1_bias_correction {
        let corrected = bias_field_correction(&t1_img, &options.bias)?;
        let f = outpath.join(format!("{}_bias-corrected.nii.gz", nifti_stem(t1w)));
        save_nifti_to_file(&f, &corrected)?;
        info!(file = %f.display(), "saved bias corrected T1w image");
        (corrected, Some(f))
    } else {
        (t1_img, None)
    };

    // Trim and upscale towards the label voxel size
    let trim_opts = TrimOptions {
        outpath: static_image.fstat.parent().map(Path::to_path_buf),
        ..options.trim.clone()
    };
    let trimmed = trim_upscale(&static_image.fstat, label_img.voxel_array(), &trim_opts)?;
    let trmdir = trimmed.trmdir.clone();

    // Labels in PET space
    let flbl = trmdir.join(format!(
        "{}_Parcellation_in-upsampled-PET.nii.gz",
        nifti_stem(&static_image.fstat)
    ));
    let registration = if !flbl.is_file() || options.reg_fresh {
        info!(
            fwhm_pet = options.registration.fwhm_ref,
            fwhm_mri = options.registration.fwhm_flo,
            "registering T1w to PET"
        );
        let mut reg = coregister(&trimmed.image, &mri, &options.registration)?;
        let faff = trmdir.join(format!("affine-{}-{}.txt", nifti_stem(&trimmed.ftrm), nifti_stem(t1w)));
        save_affine(&faff, &reg.transform.matrix())?;
        reg.faff = Some(faff);

        let lbl_pet = resample(&trimmed.image, &label_img, &reg.transform, Interpolation::Nearest)?;
        save_nifti_to_file(&flbl, &lbl_pet)?;
        Some(reg)
    } else {
        info!(file = %flbl.display(), "reusing labels in PET space");
        None
    };
    let plbl = read_nifti_file(&flbl)?;

    // VOI sampling
    let voi_opts = VoiOptions {
        outpath: options.save_voi_masks.then(|| trmdir.join("masks")),
        output_masks: options.output_masks,
        ..Default::default()
    };
    let voi_values = extract_vois(&trimmed.image, &plbl, &vois, None, &voi_opts)?;

    // SUVr per reference region
    let mut suvr = BTreeMap::new();
    for rvoi in &options.ref_vois {
        let reference = voi_values[rvoi].mean();
        if !reference.is_finite() || reference == 0.0 {
            warn!(voi = %rvoi, reference, "reference VOI mean is not usable for SUVr");
        }
        let values: BTreeMap<String, f64> =
            voi_values.iter().map(|(name, v)| (name.clone(), v.mean() / reference)).collect();

        let ratio = Image {
            data: trimmed.image.data.iter().map(|v| v / reference).collect(),
            ..trimmed.image.clone()
        };
        let stat_name = static_image
            .fstat
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let fsuvr = trmdir.join(format!("SUVr_ref-{}_{}", rvoi, stat_name));
        save_nifti_to_file(&fsuvr, &ratio)?;
        info!(reference = %rvoi, file = %fsuvr.display(), "saved SUVr image");
        suvr.insert(rvoi.clone(), SuvrValues { values, fsuvr });
    }

    // QC montage
    let fqc = if options.qc && options.output_masks {
        let masks: Option<Vec<&Vec<u8>>> = QC_VOIS
            .iter()
            .map(|name| voi_values.get(*name).and_then(|v| v.mask.as_ref()))
            .collect();
        match masks.as_deref() {
            Some([neocx, cblgm]) => {
                let (zs, xs) = qc_positions(neocx, cblgm, trimmed.image.dims);
                let shown: Vec<u8> = neocx.iter().zip(cblgm.iter()).map(|(&a, &b)| a.max(b)).collect();
                let f = trmdir.join(format!("QC_{}_Parcellation-over-upsampled-PET.pgm", pet_name));
                save_montage(&trimmed.image, &shown, &zs, &xs, &f)?;
                f.is_file().then_some(f)
            }
            _ => {
                warn!("QC montage needs the 'neocx' and 'cblgm' VOIs, skipped");
                None
            }
        }
    } else {
        None
    };

    let result = SuvrResult {
        input: InputFiles {
            fpet: pet.to_path_buf(),
            ft1w: t1w.to_path_buf(),
            flbl: labels.to_path_buf(),
        },
        static_image,
        fbc,
        ftrm: trimmed.ftrm,
        trim_scale: trimmed.scale,
        registration,
        flbl,
        vois: voi_values,
        suvr,
        fqc,
    };

    if let Some(dir) = result.static_image.fstat.parent() {
        std::fs::write(dir.join(REPORT_FILE), serde_json::to_string_pretty(&result)?)?;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_inputs_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pet = dir.path().join("pet.nii.gz");
        let err = voi_process(&pet, &pet, &pet, &SuvrOptions::default()).unwrap_err();
        assert!(matches!(err, AmyPetError::InvalidInput { .. }));
    }

    #[test]
    fn test_unknown_reference_voi_rejected() {
        use crate::nifti_io::IDENTITY;
        let dir = tempfile::tempdir().unwrap();
        let img = Image::new(vec![1.0; 8], (2, 2, 2), (1.0, 1.0, 1.0), IDENTITY).unwrap();
        let f = dir.path().join("img.nii.gz");
        save_nifti_to_file(&f, &img).unwrap();

        let opts = SuvrOptions { ref_vois: vec!["wc".into()], ..Default::default() };
        let err = voi_process(&f, &f, &f, &opts).unwrap_err();
        assert!(matches!(err, AmyPetError::Voi(_)));
    }
}
