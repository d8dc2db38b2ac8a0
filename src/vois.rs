//! Volume-of-interest (VOI) extraction
//!
//! A VOI is the union of one or more integer labels of a parcellation image
//! aligned with the PET image.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AmyPetError, Result};
use crate::nifti_io::{save_nifti_to_file, Image};

/// VOI name to its constituent labels
pub type VoiDefinitions = BTreeMap<String, Vec<i64>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiOptions {
    /// Folder for `<voi>_mask.nii.gz` files
    pub outpath: Option<PathBuf>,
    /// Return masks in the results
    pub output_masks: bool,
    /// Atlas mask voxels above this value are kept
    pub mask_threshold: f64,
}

impl Default for VoiOptions {
    fn default() -> Self {
        Self { outpath: None, output_masks: false, mask_threshold: 0.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiValue {
    /// Number of voxels in the VOI
    pub vox_no: usize,
    /// Emission sum per frame
    pub sum: Vec<f64>,
    /// Mean per frame; NaN for an empty VOI
    pub avg: Vec<f64>,
    pub fvoi: Option<PathBuf>,
    #[serde(skip)]
    pub mask: Option<Vec<u8>>,
}

impl VoiValue {
    /// Mean of the first (or only) frame
    pub fn mean(&self) -> f64 {
        self.avg.first().copied().unwrap_or(f64::NAN)
    }
}

/// Integer labels with NaN mapped to 0
fn clean_labels(labels: &Image) -> Vec<i64> {
    labels
        .frame(0)
        .iter()
        .map(|&v| if v.is_finite() { v.round() as i64 } else { 0 })
        .collect()
}

/// One VOI per unique label value, named after the label
pub fn default_definitions(labels: &Image) -> VoiDefinitions {
    let unique: BTreeSet<i64> = clean_labels(labels).into_iter().collect();
    unique.into_iter().map(|l| (l.to_string(), vec![l])).collect()
}

/// Extract VOI statistics from every frame of `pet`
pub fn extract_vois(
    pet: &Image,
    labels: &Image,
    vois: &VoiDefinitions,
    atlas_mask: Option<&Image>,
    options: &VoiOptions,
) -> Result<BTreeMap<String, VoiValue>> {
    if !pet.same_shape(labels) {
        return Err(AmyPetError::ShapeMismatch(format!(
            "PET {:?} and label image {:?} differ",
            pet.dims, labels.dims
        )));
    }
    if let Some(m) = atlas_mask {
        if !m.same_shape(labels) {
            return Err(AmyPetError::ShapeMismatch(format!(
                "atlas mask {:?} and label image {:?} differ",
                m.dims, labels.dims
            )));
        }
    }

    let lbls = clean_labels(labels);
    let keep: Option<Vec<bool>> = atlas_mask.map(|m| m.frame(0).iter().map(|&v| v > options.mask_threshold).collect());

    if let Some(dir) = &options.outpath {
        std::fs::create_dir_all(dir)?;
    }

    let mut out = BTreeMap::new();
    debug!("extracting volumes of interest");
    for (name, ids) in vois {
        info!(voi = %name, "extracting VOI");
        let mask: Vec<u8> = lbls
            .iter()
            .enumerate()
            .map(|(i, l)| {
                let inside = ids.contains(l) && keep.as_ref().map_or(true, |k| k[i]);
                u8::from(inside)
            })
            .collect();
        let vox_no = mask.iter().filter(|&&m| m > 0).count();

        let sum: Vec<f64> = (0..pet.frames)
            .map(|t| {
                pet.frame(t)
                    .iter()
                    .zip(&mask)
                    .filter(|(_, m)| **m > 0)
                    .map(|(v, _)| *v)
                    .sum()
            })
            .collect();
        if vox_no == 0 {
            warn!(voi = %name, "VOI is empty, average undefined");
        }
        let avg = sum.iter().map(|s| if vox_no > 0 { s / vox_no as f64 } else { f64::NAN }).collect();

        let fvoi = match &options.outpath {
            Some(dir) => {
                let f = dir.join(format!("{}_mask.nii.gz", name));
                let img = labels.with_data(mask.iter().map(|&m| m as f64).collect())?;
                save_nifti_to_file(&f, &img)?;
                Some(f)
            }
            None => None,
        };

        out.insert(
            name.clone(),
            VoiValue {
                vox_no,
                sum,
                avg,
                fvoi,
                mask: options.output_masks.then_some(mask),
            },
        );
    }
    Ok(out)
}
