//! Quality-control montage of VOI sampling over the PET image
//!
//! Two rows of three slices: axial slices on top, sagittal slices below.
//! The PET image is shown in grey scale (clipped at 90% of each slice
//! maximum) with the VOI masks blended over it. The montage is written as a
//! binary greyscale PGM image.

use std::path::Path;

use tracing::{info, warn};

use crate::error::Result;
use crate::nifti_io::Image;
use crate::utils::mask::profile;
use crate::utils::smooth_fwhm;

/// Voxel count a profile must exceed to be part of the displayed range
pub const PROFILE_THRESHOLD: usize = 100;

const MASK_ALPHA: f64 = 0.25;
const DISPLAY_FWHM: f64 = 3.0;

/// Interior cut positions splitting the above-threshold range into `parts`
///
/// Empty when no profile value exceeds the threshold.
pub fn axis_positions(profile: &[usize], threshold: usize, parts: usize) -> Vec<usize> {
    let Some(start) = profile.iter().position(|&v| v > threshold) else {
        return Vec::new();
    };
    let end = profile.len() - profile.iter().rev().position(|&v| v > threshold).unwrap_or(0);
    let step = (end - start) / parts.max(1);
    (1..parts).map(|k| start + k * step).collect()
}

/// Axial (z) and sagittal (x) slice positions from the neocortex and
/// cerebellar grey matter masks
pub fn qc_positions(neocx: &[u8], cblgm: &[u8], dims: (usize, usize, usize)) -> (Vec<usize>, Vec<usize>) {
    let mut zs = axis_positions(&profile(neocx, dims, 2), PROFILE_THRESHOLD, 3);
    zs.extend(axis_positions(&profile(cblgm, dims, 2), PROFILE_THRESHOLD, 2));

    let combined: Vec<u8> = neocx.iter().zip(cblgm).map(|(&a, &b)| a.max(b)).collect();
    let xs = axis_positions(&profile(&combined, dims, 0), PROFILE_THRESHOLD, 4);
    (zs, xs)
}

/// Greyscale tile with the mask blended in
struct Tile {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

fn render(values: &[f64], mask: &[u8], width: usize, height: usize) -> Tile {
    let vmax = 0.9 * values.iter().copied().filter(|v| v.is_finite()).fold(0.0, f64::max);
    let pixels = values
        .iter()
        .zip(mask)
        .map(|(&v, &m)| {
            let grey = if vmax > 0.0 { (v / vmax).clamp(0.0, 1.0) * 255.0 } else { 0.0 };
            let overlay = if m > 0 { 0.0 } else { 255.0 };
            ((1.0 - MASK_ALPHA) * grey + MASK_ALPHA * overlay).round() as u8
        })
        .collect();
    Tile { width, height, pixels }
}

fn axial(pet: &[f64], mask: &[u8], dims: (usize, usize, usize), z: usize) -> Tile {
    let (nx, ny, _) = dims;
    let mut v = Vec::with_capacity(nx * ny);
    let mut m = Vec::with_capacity(nx * ny);
    // Anterior at the top
    for j in (0..ny).rev() {
        for i in 0..nx {
            let idx = i + j * nx + z * nx * ny;
            v.push(pet[idx]);
            m.push(mask[idx]);
        }
    }
    render(&v, &m, nx, ny)
}

fn sagittal(pet: &[f64], mask: &[u8], dims: (usize, usize, usize), x: usize) -> Tile {
    let (nx, ny, nz) = dims;
    let mut v = Vec::with_capacity(ny * nz);
    let mut m = Vec::with_capacity(ny * nz);
    // Superior at the top
    for k in (0..nz).rev() {
        for j in 0..ny {
            let idx = x + j * nx + k * nx * ny;
            v.push(pet[idx]);
            m.push(mask[idx]);
        }
    }
    render(&v, &m, ny, nz)
}

/// Encode a greyscale image as binary PGM (P5)
pub fn encode_pgm(width: usize, height: usize, pixels: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len() + 20);
    out.extend_from_slice(format!("P5\n{} {}\n255\n", width, height).as_bytes());
    out.extend_from_slice(pixels);
    out
}

/// Build the montage (2 rows x 3 columns) and return (width, height, pixels)
pub fn montage(pet: &Image, mask: &[u8], zs: &[usize], xs: &[usize]) -> (usize, usize, Vec<u8>) {
    let dims = pet.dims;
    let shown = smooth_fwhm(pet.frame(0), dims, pet.voxel_array(), DISPLAY_FWHM);

    let top: Vec<Tile> = zs.iter().take(3).filter(|&&z| z < dims.2).map(|&z| axial(&shown, mask, dims, z)).collect();
    let bottom: Vec<Tile> = xs.iter().take(3).filter(|&&x| x < dims.0).map(|&x| sagittal(&shown, mask, dims, x)).collect();

    let cell_w = top.iter().chain(&bottom).map(|t| t.width).max().unwrap_or(1);
    let cell_h = top.iter().chain(&bottom).map(|t| t.height).max().unwrap_or(1);
    let width = 3 * cell_w;
    let height = 2 * cell_h;
    let mut pixels = vec![0u8; width * height];

    for (row, tiles) in [top, bottom].iter().enumerate() {
        for (col, tile) in tiles.iter().enumerate() {
            for y in 0..tile.height {
                let dst = (row * cell_h + y) * width + col * cell_w;
                pixels[dst..dst + tile.width].copy_from_slice(&tile.pixels[y * tile.width..(y + 1) * tile.width]);
            }
        }
    }
    (width, height, pixels)
}

/// Write the QC montage to `path`
pub fn save_montage(pet: &Image, mask: &[u8], zs: &[usize], xs: &[usize], path: &Path) -> Result<()> {
    if zs.is_empty() && xs.is_empty() {
        warn!("no slices to show, QC montage skipped");
        return Ok(());
    }
    let (w, h, pixels) = montage(pet, mask, zs, xs);
    std::fs::write(path, encode_pgm(w, h, &pixels))?;
    info!(file = %path.display(), "saved QC montage");
    Ok(())
}
