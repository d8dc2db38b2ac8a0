//! Centre-of-mass utilities
//!
//! Centre-of-mass correction moves the world coordinate system to the centre
//! of the spatial intensity distribution, which gives registration a
//! consistent starting point.

use crate::error::{AmyPetError, Result};
use crate::nifti_io::Image;
use crate::transform::apply;

/// Intensity-weighted centre of mass of the first frame, in world mm
///
/// Negative and non-finite voxels are ignored.
pub fn centre_of_mass(image: &Image) -> Result<[f64; 3]> {
    let (nx, ny, nz) = image.dims;
    let data = image.frame(0);

    let mut total = 0.0;
    let mut acc = [0.0; 3];
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let v = data[i + j * nx + k * nx * ny];
                if v.is_finite() && v > 0.0 {
                    total += v;
                    acc[0] += v * i as f64;
                    acc[1] += v * j as f64;
                    acc[2] += v * k as f64;
                }
            }
        }
    }

    if total <= 0.0 {
        return Err(AmyPetError::ShapeMismatch(
            "centre of mass undefined for an image without positive voxels".into(),
        ));
    }

    let voxel = [acc[0] / total, acc[1] / total, acc[2] / total];
    Ok(apply(&image.affine, voxel))
}

/// Copy of the image with the affine translation shifted so that the centre
/// of mass sits at the world origin; returns the image and the absolute
/// centre of mass before correction
pub fn centre_mass_correction(image: &Image) -> Result<(Image, [f64; 3])> {
    let com = centre_of_mass(image)?;
    let mut corrected = image.clone();
    corrected.affine[3] -= com[0];
    corrected.affine[7] -= com[1];
    corrected.affine[11] -= com[2];
    Ok((corrected, com))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti_io::IDENTITY;

    #[test]
    fn test_com_single_voxel() {
        let mut data = vec![0.0; 27];
        data[2 + 1 * 3 + 0 * 9] = 5.0;
        let img = Image::new(data, (3, 3, 3), (1.0, 1.0, 1.0), IDENTITY).unwrap();
        assert_eq!(centre_of_mass(&img).unwrap(), [2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_com_uses_affine() {
        let affine = [
            2.0, 0.0, 0.0, -10.0,
            0.0, 2.0, 0.0, -10.0,
            0.0, 0.0, 2.0, -10.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        let img = Image::new(vec![1.0; 27], (3, 3, 3), (2.0, 2.0, 2.0), affine).unwrap();
        assert_eq!(centre_of_mass(&img).unwrap(), [-8.0, -8.0, -8.0]);
    }

    #[test]
    fn test_correction_moves_com_to_origin() {
        let mut data = vec![0.0; 64];
        data[1 + 2 * 4 + 3 * 16] = 1.0;
        data[2 + 2 * 4 + 3 * 16] = 1.0;
        let img = Image::new(data, (4, 4, 4), (1.0, 1.0, 1.0), IDENTITY).unwrap();

        let (corrected, com) = centre_mass_correction(&img).unwrap();
        assert_eq!(com, [1.5, 2.0, 3.0]);
        let after = centre_of_mass(&corrected).unwrap();
        for v in after {
            assert!(v.abs() < 1e-12);
        }
    }

    #[test]
    fn test_empty_image_errors() {
        let img = Image::new(vec![0.0; 8], (2, 2, 2), (1.0, 1.0, 1.0), IDENTITY).unwrap();
        assert!(centre_of_mass(&img).is_err());
    }
}
