//! Binary mask helpers for 3D volumes
//!
//! Uses Fortran ordering to match NIfTI convention: index = x + y*nx + z*nx*ny.

/// Create a binary sphere mask with the radius given in mm
///
/// Voxels whose centre lies within `radius_mm` of `centre` (voxel
/// coordinates) are set to 1. Anisotropic voxels are honoured.
pub fn sphere_mask(
    dims: (usize, usize, usize),
    voxel_size: [f64; 3],
    centre: [f64; 3],
    radius_mm: f64,
) -> Vec<u8> {
    let (nx, ny, nz) = dims;
    let mut mask = vec![0u8; nx * ny * nz];
    let r2 = radius_mm * radius_mm;

    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let dx = (i as f64 - centre[0]) * voxel_size[0];
                let dy = (j as f64 - centre[1]) * voxel_size[1];
                let dz = (k as f64 - centre[2]) * voxel_size[2];
                if dx * dx + dy * dy + dz * dz <= r2 {
                    mask[i + j * nx + k * nx * ny] = 1;
                }
            }
        }
    }

    mask
}

/// Number of set voxels
pub fn count(mask: &[u8]) -> usize {
    mask.iter().filter(|&&m| m > 0).count()
}

/// Voxel counts of a mask summed over two axes, leaving a profile along `axis`
pub fn profile(mask: &[u8], dims: (usize, usize, usize), axis: usize) -> Vec<usize> {
    let (nx, ny, nz) = dims;
    let len = [nx, ny, nz][axis];
    let mut prf = vec![0usize; len];
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                if mask[i + j * nx + k * nx * ny] > 0 {
                    prf[[i, j, k][axis]] += 1;
                }
            }
        }
    }
    prf
}
