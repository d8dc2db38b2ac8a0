//! Rigid-body image registration
//!
//! Estimates the six-parameter transform that best aligns a floating image
//! with a reference image by maximising an intensity similarity measure
//! (normalised mutual information by default) over samples of the reference
//! grid. Both images may be smoothed beforehand, and the search is repeated
//! at progressively finer sampling separations.
//!
//! The resulting [`RigidTransform`] maps reference world coordinates to
//! floating world coordinates, as expected by [`crate::resample::resample`].

pub mod cost;
pub mod optimise;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{AmyPetError, Result};
use crate::nifti_io::{nifti_stem, Image};
use crate::resample::{sample, voxel_mapping, Interpolation};
use crate::transform::{save_affine, RigidTransform};
use crate::utils::{centre_of_mass, smooth_fwhm};

pub use cost::{Binning, CostFunction, JointHistogram};
pub use optimise::{Minimum, PatternSearch};

/// Minimum number of overlapping samples for a valid cost evaluation
const MIN_OVERLAP: f64 = 32.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationParams {
    pub cost: CostFunction,
    /// Gaussian FWHM (mm) applied to the reference before registration
    pub fwhm_ref: f64,
    /// Gaussian FWHM (mm) applied to the floating image before registration
    pub fwhm_flo: f64,
    /// Sampling separations in mm, coarse to fine
    pub separation: Vec<f64>,
    /// Initial steps: translations (mm) and rotations (degrees)
    pub initial_step_mm: f64,
    pub initial_step_deg: f64,
    /// Search stops when every step falls below this (mm and degrees)
    pub tolerance: f64,
    pub max_evaluations: usize,
    /// Start from the translation that superimposes the centres of mass
    pub init_com: bool,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            cost: CostFunction::Nmi,
            fwhm_ref: 0.0,
            fwhm_flo: 0.0,
            separation: vec![4.0, 2.0],
            initial_step_mm: 2.0,
            initial_step_deg: 2.0,
            tolerance: 0.02,
            max_evaluations: 4000,
            init_com: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResult {
    pub transform: RigidTransform,
    /// Rotations about x, y, z in radians
    pub rotations: [f64; 3],
    /// Translations along x, y, z in mm
    pub translations: [f64; 3],
    /// Final similarity value (larger is better)
    pub similarity: f64,
    pub evaluations: usize,
    /// Affine matrix file, when saved
    pub faff: Option<PathBuf>,
}

/// Reference sample: voxel position, intensity and bin
struct RefSample {
    pos: [f64; 3],
    value: f64,
    bin: usize,
}

struct Problem<'a> {
    reference: &'a Image,
    floating: &'a Image,
    flo_data: Vec<f64>,
    flo_binning: Binning,
    cost: CostFunction,
}

impl Problem<'_> {
    /// Negative similarity for the parameter vector (translations mm, rotations rad)
    fn evaluate(&self, samples: &[RefSample], params: &[f64; 6]) -> f64 {
        let transform = RigidTransform::from_params(params);
        let Ok(mapping) = voxel_mapping(&self.reference.affine, &self.floating.affine, &transform) else {
            return f64::INFINITY;
        };

        let mut hist = JointHistogram::new();
        for s in samples {
            let p = crate::transform::apply(&mapping, s.pos);
            let value = sample(&self.flo_data, self.floating.dims, p, Interpolation::Trilinear);
            if let Some(v) = value.filter(|v| v.is_finite()) {
                hist.add(s.bin, self.flo_binning.position(v), s.value, v);
            }
        }

        if hist.samples() < MIN_OVERLAP {
            return f64::INFINITY;
        }
        -hist.similarity(self.cost)
    }
}

fn reference_samples(reference: &Image, data: &[f64], binning: &Binning, separation_mm: f64) -> Vec<RefSample> {
    let (nx, ny, nz) = reference.dims;
    let vs = reference.voxel_array();
    let step = |axis: usize| ((separation_mm / vs[axis]).round() as usize).max(1);
    let (sx, sy, sz) = (step(0), step(1), step(2));

    let mut samples = Vec::new();
    for k in (0..nz).step_by(sz) {
        for j in (0..ny).step_by(sy) {
            for i in (0..nx).step_by(sx) {
                let v = data[i + j * nx + k * nx * ny];
                if v.is_finite() {
                    samples.push(RefSample {
                        pos: [i as f64, j as f64, k as f64],
                        value: v,
                        bin: binning.position(v).round() as usize,
                    });
                }
            }
        }
    }
    samples
}

/// Register `floating` to `reference` (first frames of each)
#[instrument(skip_all, fields(cost = ?params.cost))]
pub fn coregister(reference: &Image, floating: &Image, params: &RegistrationParams) -> Result<RegistrationResult> {
    if reference.n_voxels() == 0 || floating.n_voxels() == 0 {
        return Err(AmyPetError::Registration("empty image".into()));
    }
    if params.separation.is_empty() {
        return Err(AmyPetError::Registration("no sampling separation given".into()));
    }

    let ref_data = smooth_fwhm(reference.frame(0), reference.dims, reference.voxel_array(), params.fwhm_ref);
    let flo_data = smooth_fwhm(floating.frame(0), floating.dims, floating.voxel_array(), params.fwhm_flo);
    let ref_binning = Binning::from_data(&ref_data);
    let flo_binning = Binning::from_data(&flo_data);

    let problem = Problem {
        reference,
        floating,
        flo_data,
        flo_binning,
        cost: params.cost,
    };

    let mut x = [0.0; 6];
    if params.init_com {
        let c_ref = centre_of_mass(reference)?;
        let c_flo = centre_of_mass(floating)?;
        x[0] = c_flo[0] - c_ref[0];
        x[1] = c_flo[1] - c_ref[1];
        x[2] = c_flo[2] - c_ref[2];
    }

    let rot_step = params.initial_step_deg.to_radians();
    let steps = [
        params.initial_step_mm,
        params.initial_step_mm,
        params.initial_step_mm,
        rot_step,
        rot_step,
        rot_step,
    ];
    let search = PatternSearch {
        steps,
        tolerance: [
            params.tolerance,
            params.tolerance,
            params.tolerance,
            params.tolerance.to_radians(),
            params.tolerance.to_radians(),
            params.tolerance.to_radians(),
        ],
        max_evaluations: params.max_evaluations,
    };

    let mut minimum = Minimum { params: x, cost: f64::INFINITY, evaluations: 0 };
    let mut evaluations = 0;
    for &sep in &params.separation {
        let samples = reference_samples(reference, &ref_data, &ref_binning, sep);
        minimum = search.minimise(minimum.params, |p| problem.evaluate(&samples, p));
        evaluations += minimum.evaluations;
        debug!(
            separation = sep,
            similarity = -minimum.cost,
            evaluations = minimum.evaluations,
            "registration pass finished"
        );
    }

    if !minimum.cost.is_finite() {
        return Err(AmyPetError::Registration(
            "images do not overlap sufficiently for registration".into(),
        ));
    }

    let transform = RigidTransform::from_params(&minimum.params);
    Ok(RegistrationResult {
        transform,
        rotations: transform.rotations,
        translations: transform.translations,
        similarity: -minimum.cost,
        evaluations,
        faff: None,
    })
}

/// Register two NIfTI files and save the affine as
/// `affine-<ref>-<flo><comment>.txt` in `outpath`
pub fn coregister_files(
    reference: &Path,
    floating: &Path,
    params: &RegistrationParams,
    outpath: &Path,
    comment: &str,
) -> Result<RegistrationResult> {
    let ref_img = crate::nifti_io::read_nifti_file(reference)?;
    let flo_img = crate::nifti_io::read_nifti_file(floating)?;
    let mut result = coregister(&ref_img, &flo_img, params)?;

    std::fs::create_dir_all(outpath)?;
    let faff = outpath.join(format!(
        "affine-{}-{}{}.txt",
        nifti_stem(reference),
        nifti_stem(floating),
        comment
    ));
    save_affine(&faff, &result.transform.matrix())?;
    result.faff = Some(faff);
    Ok(result)
}
