//! Resampling of a floating image into the grid of a reference image

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::nifti_io::{Affine, Image};
use crate::transform::{apply, mat_inv, mat_mul, RigidTransform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Nearest neighbour, used for label images
    Nearest,
    Trilinear,
}

/// Sample a single frame at continuous voxel coordinates
///
/// Returns `None` outside the volume.
pub fn sample(
    data: &[f64],
    dims: (usize, usize, usize),
    p: [f64; 3],
    interpolation: Interpolation,
) -> Option<f64> {
    let (nx, ny, nz) = dims;
    let inside = |v: f64, n: usize| v >= -0.5 && v <= n as f64 - 0.5;
    if !(inside(p[0], nx) && inside(p[1], ny) && inside(p[2], nz)) {
        return None;
    }

    match interpolation {
        Interpolation::Nearest => {
            let i = (p[0].round().max(0.0) as usize).min(nx - 1);
            let j = (p[1].round().max(0.0) as usize).min(ny - 1);
            let k = (p[2].round().max(0.0) as usize).min(nz - 1);
            Some(data[i + j * nx + k * nx * ny])
        }
        Interpolation::Trilinear => {
            let x = p[0].clamp(0.0, (nx - 1) as f64);
            let y = p[1].clamp(0.0, (ny - 1) as f64);
            let z = p[2].clamp(0.0, (nz - 1) as f64);

            let i0 = x.floor() as usize;
            let j0 = y.floor() as usize;
            let k0 = z.floor() as usize;
            let i1 = (i0 + 1).min(nx - 1);
            let j1 = (j0 + 1).min(ny - 1);
            let k1 = (k0 + 1).min(nz - 1);
            let fx = x - i0 as f64;
            let fy = y - j0 as f64;
            let fz = z - k0 as f64;

            let v = |i: usize, j: usize, k: usize| data[i + j * nx + k * nx * ny];
            let c00 = v(i0, j0, k0) * (1.0 - fx) + v(i1, j0, k0) * fx;
            let c10 = v(i0, j1, k0) * (1.0 - fx) + v(i1, j1, k0) * fx;
            let c01 = v(i0, j0, k1) * (1.0 - fx) + v(i1, j0, k1) * fx;
            let c11 = v(i0, j1, k1) * (1.0 - fx) + v(i1, j1, k1) * fx;
            let c0 = c00 * (1.0 - fy) + c10 * fy;
            let c1 = c01 * (1.0 - fy) + c11 * fy;
            Some(c0 * (1.0 - fz) + c1 * fz)
        }
    }
}

/// Matrix mapping reference voxel indices to floating voxel indices
pub fn voxel_mapping(reference: &Affine, floating: &Affine, transform: &RigidTransform) -> Result<Affine> {
    let flo_inv = mat_inv(floating)?;
    Ok(mat_mul(&flo_inv, &mat_mul(&transform.matrix(), reference)))
}

/// Resample `floating` into the grid of `reference`
///
/// All frames of a 4D floating image are resampled. Samples falling outside
/// the floating volume are set to 0. The output takes the reference geometry.
pub fn resample(
    reference: &Image,
    floating: &Image,
    transform: &RigidTransform,
    interpolation: Interpolation,
) -> Result<Image> {
    let mapping = voxel_mapping(&reference.affine, &floating.affine, transform)?;
    let (nx, ny, nz) = reference.dims;
    let n = nx * ny * nz;

    // Floating voxel coordinates are shared by every frame
    let mut coords = Vec::with_capacity(n);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                coords.push(apply(&mapping, [i as f64, j as f64, k as f64]));
            }
        }
    }

    let mut frames = Vec::with_capacity(floating.frames);
    for t in 0..floating.frames {
        let src = floating.frame(t);
        let out: Vec<f64> = coords
            .iter()
            .map(|&p| sample(src, floating.dims, p, interpolation).unwrap_or(0.0))
            .collect();
        frames.push(out);
    }

    Image::from_frames(frames, reference.dims, reference.voxel_size, reference.affine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti_io::IDENTITY;

    fn ramp(dims: (usize, usize, usize)) -> Image {
        let (nx, ny, nz) = dims;
        let mut data = Vec::with_capacity(nx * ny * nz);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    data.push(i as f64 + 10.0 * j as f64 + 100.0 * k as f64);
                }
            }
        }
        Image::new(data, dims, (1.0, 1.0, 1.0), IDENTITY).unwrap()
    }

    #[test]
    fn test_identity_resample_is_exact() {
        let img = ramp((5, 4, 3));
        let out = resample(&img, &img, &RigidTransform::identity(), Interpolation::Trilinear).unwrap();
        assert_eq!(out.data, img.data);
    }

    #[test]
    fn test_trilinear_midpoint() {
        let img = ramp((4, 4, 4));
        let v = sample(&img.data, img.dims, [1.5, 2.0, 1.0], Interpolation::Trilinear).unwrap();
        assert!((v - 121.5).abs() < 1e-12);
    }

    #[test]
    fn test_nearest_keeps_labels() {
        let img = ramp((4, 4, 4));
        let v = sample(&img.data, img.dims, [1.4, 2.6, 0.2], Interpolation::Nearest).unwrap();
        assert_eq!(v, 31.0);
    }

    #[test]
    fn test_outside_is_none() {
        let img = ramp((4, 4, 4));
        assert!(sample(&img.data, img.dims, [-1.0, 0.0, 0.0], Interpolation::Trilinear).is_none());
        assert!(sample(&img.data, img.dims, [0.0, 0.0, 3.6], Interpolation::Nearest).is_none());
    }

    #[test]
    fn test_translation_shifts_content() {
        let img = ramp((6, 6, 6));
        let t = RigidTransform::from_params(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let out = resample(&img, &img, &t, Interpolation::Nearest).unwrap();
        // reference voxel (2,3,4) samples floating voxel (3,3,4)
        assert_eq!(out.data[2 + 3 * 6 + 4 * 36], img.data[3 + 3 * 6 + 4 * 36]);
        // last column falls outside
        assert_eq!(out.data[5], 0.0);
    }

    #[test]
    fn test_resample_4d_frames() {
        let a = ramp((3, 3, 3));
        let frames = vec![a.data.clone(), a.data.iter().map(|v| v * 2.0).collect()];
        let dyn_img = Image::from_frames(frames, a.dims, a.voxel_size, a.affine).unwrap();
        let out = resample(&a, &dyn_img, &RigidTransform::identity(), Interpolation::Trilinear).unwrap();
        assert_eq!(out.frames, 2);
        assert_eq!(out.frame(1)[13], 2.0 * a.data[13]);
    }
}
