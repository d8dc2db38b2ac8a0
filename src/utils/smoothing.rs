//! Gaussian smoothing of 3D volumes with the kernel width given as FWHM in mm

/// FWHM to sigma conversion factor, 2*sqrt(2*ln 2)
pub const FWHM_TO_SIGMA: f64 = 2.354_820_045_030_949;

/// Per-axis sigma in voxels for a FWHM in mm
pub fn fwhm_to_sigma_voxels(fwhm_mm: f64, voxel_size: [f64; 3]) -> [f64; 3] {
    let sigma_mm = fwhm_mm / FWHM_TO_SIGMA;
    [
        sigma_mm / voxel_size[0],
        sigma_mm / voxel_size[1],
        sigma_mm / voxel_size[2],
    ]
}

fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (3.0 * sigma).ceil() as usize;
    let mut kernel: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            let x = i as f64 - radius as f64;
            (-x * x / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= sum;
    }
    kernel
}

/// Convolve along one axis (0 = x, 1 = y, 2 = z) with replicate padding
fn convolve_axis(
    data: &[f64],
    nx: usize, ny: usize, nz: usize,
    kernel: &[f64],
    axis: usize,
) -> Vec<f64> {
    let radius = (kernel.len() - 1) / 2;
    let (len, stride) = match axis {
        0 => (nx, 1),
        1 => (ny, nx),
        _ => (nz, nx * ny),
    };
    let mut out = vec![0.0; data.len()];

    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let idx = i + j * nx + k * nx * ny;
                let pos = match axis {
                    0 => i,
                    1 => j,
                    _ => k,
                };
                let base = idx - pos * stride;
                let mut sum = 0.0;
                for (ki, w) in kernel.iter().enumerate() {
                    let p = (pos as isize + ki as isize - radius as isize)
                        .clamp(0, len as isize - 1) as usize;
                    sum += data[base + p * stride] * w;
                }
                out[idx] = sum;
            }
        }
    }

    out
}

/// Separable 3D Gaussian smoothing with per-axis sigma in voxels
///
/// Axes with sigma <= 0 (or a single slice) are left untouched.
pub fn gaussian_smooth(data: &[f64], nx: usize, ny: usize, nz: usize, sigma: [f64; 3]) -> Vec<f64> {
    let mut result = data.to_vec();
    let sizes = [nx, ny, nz];
    for axis in 0..3 {
        if sigma[axis] <= 0.0 || sizes[axis] < 2 {
            continue;
        }
        let kernel = gaussian_kernel(sigma[axis]);
        result = convolve_axis(&result, nx, ny, nz, &kernel, axis);
    }
    result
}

/// Smooth with an isotropic FWHM in mm; a FWHM of 0 returns a copy
pub fn smooth_fwhm(
    data: &[f64],
    dims: (usize, usize, usize),
    voxel_size: [f64; 3],
    fwhm_mm: f64,
) -> Vec<f64> {
    if fwhm_mm <= 0.0 {
        return data.to_vec();
    }
    let sigma = fwhm_to_sigma_voxels(fwhm_mm, voxel_size);
    gaussian_smooth(data, dims.0, dims.1, dims.2, sigma)
}
