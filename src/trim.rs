//! Trimming and upsampling of PET images
//!
//! PET voxels are typically much larger than those of a T1w parcellation.
//! Before label resampling the PET image is trimmed to the region holding
//! activity and upsampled by an integer factor so that VOI boundaries are
//! sampled more finely.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{AmyPetError, Result};
use crate::nifti_io::{nifti_stem, read_nifti_file, save_nifti_to_file, Affine, Image};
use crate::resample::{sample, Interpolation};
use crate::transform::apply;

pub const MAX_SCALE: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimOptions {
    /// Fraction of the image maximum defining the region kept
    pub threshold: f64,
    /// Margin kept around the region, in original voxels
    pub margin: usize,
    /// Fixed scale; derived from voxel sizes when `None`
    pub scale: Option<usize>,
    /// Output folder; the `trimmed` folder is created inside it
    pub outpath: Option<PathBuf>,
}

impl Default for TrimOptions {
    fn default() -> Self {
        Self { threshold: 0.05, margin: 2, scale: None, outpath: None }
    }
}

#[derive(Debug, Clone)]
pub struct TrimResult {
    pub image: Image,
    pub ftrm: PathBuf,
    pub trmdir: PathBuf,
    pub scale: usize,
    /// Kept region (start, end exclusive) in original voxels per axis
    pub bbox: [(usize, usize); 3],
}

/// Integer upsampling factor from mean voxel sizes
pub fn trim_scale(pet_voxel: [f64; 3], target_voxel: [f64; 3]) -> usize {
    let mean = |v: [f64; 3]| (v[0] + v[1] + v[2]) / 3.0;
    let t = mean(target_voxel);
    if t <= 0.0 || !t.is_finite() {
        return 1;
    }
    let s = (mean(pet_voxel) / t).round();
    (s.max(1.0) as usize).min(MAX_SCALE)
}

/// Bounding box of voxels above `threshold * max`, grown by `margin`
pub fn bounding_box(image: &Image, threshold: f64, margin: usize) -> Result<[(usize, usize); 3]> {
    let (nx, ny, nz) = image.dims;
    let data = image.frame(0);
    let max = data.iter().copied().filter(|v| v.is_finite()).fold(f64::MIN, f64::max);
    if !(max > 0.0) {
        return Err(AmyPetError::ShapeMismatch("cannot trim an image without positive voxels".into()));
    }
    let thr = threshold * max;

    let mut lo = [usize::MAX; 3];
    let mut hi = [0usize; 3];
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                if data[i + j * nx + k * nx * ny] > thr {
                    for (d, v) in [i, j, k].into_iter().enumerate() {
                        lo[d] = lo[d].min(v);
                        hi[d] = hi[d].max(v);
                    }
                }
            }
        }
    }

    let n = [nx, ny, nz];
    Ok([0, 1, 2].map(|d| (lo[d].saturating_sub(margin), (hi[d] + margin + 1).min(n[d]))))
}

/// Trim to `bbox` and upsample every frame trilinearly by `scale`
pub fn trim_upsample(image: &Image, bbox: [(usize, usize); 3], scale: usize) -> Result<Image> {
    let s = scale.max(1) as f64;
    let dims = (
        (bbox[0].1 - bbox[0].0) * scale.max(1),
        (bbox[1].1 - bbox[1].0) * scale.max(1),
        (bbox[2].1 - bbox[2].0) * scale.max(1),
    );

    // Upsampled voxel centres subdivide the original voxels
    let offset = 0.5 / s - 0.5;
    let to_old = |i: usize, d: usize| bbox[d].0 as f64 + i as f64 / s + offset;

    let a = &image.affine;
    let origin = apply(a, [to_old(0, 0), to_old(0, 1), to_old(0, 2)]);
    let affine: Affine = [
        a[0] / s, a[1] / s, a[2] / s, origin[0],
        a[4] / s, a[5] / s, a[6] / s, origin[1],
        a[8] / s, a[9] / s, a[10] / s, origin[2],
        0.0, 0.0, 0.0, 1.0,
    ];

    let mut frames = Vec::with_capacity(image.frames);
    for t in 0..image.frames {
        let src = image.frame(t);
        let mut out = Vec::with_capacity(dims.0 * dims.1 * dims.2);
        for k in 0..dims.2 {
            for j in 0..dims.1 {
                for i in 0..dims.0 {
                    let p = [to_old(i, 0), to_old(j, 1), to_old(k, 2)];
                    out.push(sample(src, image.dims, p, Interpolation::Trilinear).unwrap_or(0.0));
                }
            }
        }
        frames.push(out);
    }

    let vs = image.voxel_size;
    let mut img = Image::from_frames(frames, dims, (vs.0 / s, vs.1 / s, vs.2 / s), affine)?;
    img.description = image.description.clone();
    Ok(img)
}

/// Trim and upscale the PET file towards the voxel size of `target_voxel`
#[instrument(skip(options), fields(pet = %fpet.display()))]
pub fn trim_upscale(fpet: &Path, target_voxel: [f64; 3], options: &TrimOptions) -> Result<TrimResult> {
    let image = read_nifti_file(fpet)?;
    let scale = options
        .scale
        .unwrap_or_else(|| trim_scale(image.voxel_array(), target_voxel))
        .clamp(1, MAX_SCALE);
    let bbox = bounding_box(&image, options.threshold, options.margin)?;
    debug!(?bbox, scale, "trimming region");

    let trimmed = trim_upsample(&image, bbox, scale)?;

    let outpath = match &options.outpath {
        Some(p) => p.clone(),
        None => fpet.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    let trmdir = outpath.join("trimmed");
    std::fs::create_dir_all(&trmdir)?;
    let ftrm = trmdir.join(format!("{}_trim-upsampled-scale-{}.nii.gz", nifti_stem(fpet), scale));
    save_nifti_to_file(&ftrm, &trimmed)?;
    info!(file = %ftrm.display(), scale, dims = ?trimmed.dims, "saved trimmed and upsampled image");

    Ok(TrimResult { image: trimmed, ftrm, trmdir, scale, bbox })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti_io::IDENTITY;

    fn cube() -> Image {
        // 10^3 volume, activity in voxels 3..=6 on every axis
        let n = 10;
        let mut data = vec![0.0; n * n * n];
        for k in 3..7 {
            for j in 3..7 {
                for i in 3..7 {
                    data[i + j * n + k * n * n] = 10.0;
                }
            }
        }
        let affine = [
            2.0, 0.0, 0.0, -10.0,
            0.0, 2.0, 0.0, -10.0,
            0.0, 0.0, 2.0, -10.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        Image::new(data, (n, n, n), (2.0, 2.0, 2.0), affine).unwrap()
    }

    #[test]
    fn test_trim_scale() {
        assert_eq!(trim_scale([2.0; 3], [1.0; 3]), 2);
        assert_eq!(trim_scale([2.0, 2.0, 3.0], [1.0; 3]), 2);
        assert_eq!(trim_scale([1.0; 3], [2.0; 3]), 1);
        assert_eq!(trim_scale([8.0; 3], [1.0; 3]), MAX_SCALE);
        assert_eq!(trim_scale([2.0; 3], [0.0; 3]), 1);
    }

    #[test]
    fn test_bounding_box_with_margin() {
        let bbox = bounding_box(&cube(), 0.5, 1).unwrap();
        assert_eq!(bbox, [(2, 8), (2, 8), (2, 8)]);
        let bbox = bounding_box(&cube(), 0.5, 5).unwrap();
        assert_eq!(bbox, [(0, 10), (0, 10), (0, 10)]);
    }

    #[test]
    fn test_upsample_geometry_preserves_world_positions() {
        let img = cube();
        let bbox = bounding_box(&img, 0.5, 1).unwrap();
        let up = trim_upsample(&img, bbox, 2).unwrap();
        assert_eq!(up.dims, (12, 12, 12));
        assert_eq!(up.voxel_size, (1.0, 1.0, 1.0));

        // Centre of the active cube stays put in world space
        let c_old = apply(&img.affine, [4.5, 4.5, 4.5]);
        let c_new = apply(&up.affine, [5.5, 5.5, 5.5]);
        for d in 0..3 {
            assert!((c_old[d] - c_new[d]).abs() < 1e-9);
        }
        // Interior keeps the full value
        assert!((up.data[6 + 6 * 12 + 6 * 144] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_scale_one_is_plain_crop() {
        let img = cube();
        let up = trim_upsample(&img, [(3, 7), (3, 7), (3, 7)], 1).unwrap();
        assert_eq!(up.dims, (4, 4, 4));
        assert!(up.data.iter().all(|&v| v == 10.0));
        assert_eq!(up.affine[3], -4.0);
    }

    #[test]
    fn test_trim_upscale_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("pet_static.nii.gz");
        save_nifti_to_file(&f, &cube()).unwrap();
        let res = trim_upscale(&f, [1.0; 3], &TrimOptions { threshold: 0.5, ..Default::default() }).unwrap();
        assert_eq!(res.scale, 2);
        assert!(res.ftrm.ends_with("trimmed/pet_static_trim-upsampled-scale-2.nii.gz"));
        assert!(res.ftrm.is_file());
    }

    #[test]
    fn test_empty_image_cannot_be_trimmed() {
        let img = Image::new(vec![0.0; 8], (2, 2, 2), (1.0, 1.0, 1.0), IDENTITY).unwrap();
        assert!(bounding_box(&img, 0.1, 0).is_err());
    }
}
