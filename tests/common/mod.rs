//! Common test utilities for AmyPET integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use amypet::nifti_io::{save_nifti_to_file, Affine, Image};

/// Label of the cortical region in the synthetic parcellation
pub const CORTEX_LABEL: f64 = 3.0;
/// Label of the cerebellar region in the synthetic parcellation
pub const CEREBELLUM_LABEL: f64 = 8.0;

/// Compute RMSE between two arrays, only within mask (non-zero values)
pub fn rmse(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for i in 0..a.len() {
        if mask[i] > 0 {
            let diff = a[i] - b[i];
            sum_sq += diff * diff;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    (sum_sq / count as f64).sqrt()
}

/// Compute Pearson correlation coefficient within mask
pub fn correlation(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let mut sum_a = 0.0;
    let mut sum_b = 0.0;
    let mut sum_ab = 0.0;
    let mut sum_a2 = 0.0;
    let mut sum_b2 = 0.0;
    let mut n = 0usize;

    for i in 0..a.len() {
        if mask[i] > 0 {
            sum_a += a[i];
            sum_b += b[i];
            sum_ab += a[i] * b[i];
            sum_a2 += a[i] * a[i];
            sum_b2 += b[i] * b[i];
            n += 1;
        }
    }

    if n == 0 {
        return 0.0;
    }

    let n = n as f64;
    let numerator = n * sum_ab - sum_a * sum_b;
    let denominator = ((n * sum_a2 - sum_a * sum_a) * (n * sum_b2 - sum_b * sum_b)).sqrt();

    if denominator == 0.0 {
        return 0.0;
    }

    numerator / denominator
}

/// Affine of an isotropic grid centred on the world origin
pub fn centred_affine(dims: (usize, usize, usize), voxel: f64) -> Affine {
    let c = |n: usize| -voxel * (n as f64 - 1.0) / 2.0;
    [
        voxel, 0.0, 0.0, c(dims.0),
        0.0, voxel, 0.0, c(dims.1),
        0.0, 0.0, voxel, c(dims.2),
        0.0, 0.0, 0.0, 1.0,
    ]
}

/// Synthetic head: an ellipsoidal cortex over a smaller cerebellum
///
/// Returns (PET-like image, label image) on the same grid. The cortex
/// takes `cortex` uptake and label `CORTEX_LABEL`, the cerebellum takes
/// `cerebellum` and `CEREBELLUM_LABEL`.
pub fn head_phantom(dims: (usize, usize, usize), voxel: f64, cortex: f64, cerebellum: f64) -> (Image, Image) {
    let affine = centred_affine(dims, voxel);
    let (nx, ny, nz) = dims;
    let mut pet = vec![0.0; nx * ny * nz];
    let mut lbl = vec![0.0; nx * ny * nz];
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let x = affine[0] * i as f64 + affine[3];
                let y = affine[5] * j as f64 + affine[7];
                let z = affine[10] * k as f64 + affine[11];
                let idx = i + j * nx + k * nx * ny;
                let brain = (x / 18.0).powi(2) + (y / 20.0).powi(2) + ((z - 4.0) / 14.0).powi(2);
                let cbl = (x / 10.0).powi(2) + ((y + 10.0) / 7.0).powi(2) + ((z + 12.0) / 5.0).powi(2);
                if cbl <= 1.0 {
                    pet[idx] = cerebellum;
                    lbl[idx] = CEREBELLUM_LABEL;
                } else if brain <= 1.0 {
                    pet[idx] = cortex;
                    lbl[idx] = CORTEX_LABEL;
                }
            }
        }
    }
    let vs = (voxel, voxel, voxel);
    (
        Image::new(pet, dims, vs, affine).unwrap(),
        Image::new(lbl, dims, vs, affine).unwrap(),
    )
}

/// Write a NIfTI frame and its BIDS sidecar as dcm2niix would
pub fn write_frame(
    dir: &Path,
    name: &str,
    image: &Image,
    description: &str,
    radiopharmaceutical: &str,
    acquisition_time: &str,
    injection_time: &str,
    duration: f64,
) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let f = dir.join(format!("{}.nii.gz", name));
    save_nifti_to_file(&f, image).unwrap();
    let sidecar = serde_json::json!({
        "Modality": "PT",
        "SeriesDescription": description,
        "SeriesNumber": 3,
        "AcquisitionDate": "20230502",
        "AcquisitionTime": acquisition_time,
        "FrameDuration": duration,
        "Radiopharmaceutical": radiopharmaceutical,
        "RadiopharmaceuticalStartTime": injection_time,
    });
    std::fs::write(dir.join(format!("{}.json", name)), sidecar.to_string()).unwrap();
    f
}

/// A series of frames `duration` seconds long starting at the given minutes
/// after an 08:00:00 injection
pub fn write_series(
    dir: &Path,
    description: &str,
    radiopharmaceutical: &str,
    starts_min: &[u32],
    duration: f64,
    frame: impl Fn(usize) -> Image,
) -> Vec<PathBuf> {
    starts_min
        .iter()
        .enumerate()
        .map(|(n, &m)| {
            let time = format!("{:02}:{:02}:00", 8 + m / 60, m % 60);
            write_frame(
                dir,
                &format!("{}_{:02}", description.replace(' ', "_"), n),
                &frame(n),
                description,
                radiopharmaceutical,
                &time,
                "08:00:00",
                duration,
            )
        })
        .collect()
}

/// Small uniform image for tests that only need timing metadata
pub fn flat_image(value: f64) -> Image {
    Image::new(vec![value; 64], (4, 4, 4), (2.0, 2.0, 2.0), centred_affine((4, 4, 4), 2.0)).unwrap()
}
