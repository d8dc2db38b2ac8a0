//! Bias field (intensity homogeneity) correction of T1-weighted MRI
//!
//! The receive-field sensitivity is estimated by heavily smoothing the
//! tissue voxels that fall into the bright (white-matter) intensity range of
//! local boxes, and the image is divided by that estimate. Gaussian smoothing
//! is approximated by repeated box filters.
//!
//! Reference:
//! Eckstein, K., Trattnig, S., Robinson, S.D. (2019).
//! "A Simple Homogeneity Correction for Neuroimaging at 7T."
//! Proc. ISMRM 27th Annual Meeting.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::nifti_io::Image;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BiasCorrectionParams {
    /// Smoothing sigma of the sensitivity estimate in mm
    pub sigma_mm: f64,
    /// Number of segmentation boxes per dimension
    pub nbox: usize,
}

impl Default for BiasCorrectionParams {
    fn default() -> Self {
        Self { sigma_mm: 7.0, nbox: 15 }
    }
}

#[derive(Clone, Copy)]
struct Grid {
    nx: usize,
    ny: usize,
    nz: usize,
}

impl Grid {
    fn len(&self, axis: usize) -> usize {
        [self.nx, self.ny, self.nz][axis]
    }

    fn total(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    #[inline(always)]
    fn idx(&self, i: usize, j: usize, k: usize) -> usize {
        i + j * self.nx + k * self.nx * self.ny
    }

    /// Flat indices of every line along `axis`, optionally reversed
    fn lines(&self, axis: usize, reverse: bool) -> Vec<Vec<usize>> {
        let n = self.len(axis);
        let (a, b) = match axis {
            0 => (self.ny, self.nz),
            1 => (self.nx, self.nz),
            _ => (self.nx, self.ny),
        };
        let mut out = Vec::with_capacity(a * b);
        for q in 0..b {
            for p in 0..a {
                let line: Vec<usize> = (0..n)
                    .map(|s| {
                        let s = if reverse { n - 1 - s } else { s };
                        match axis {
                            0 => self.idx(s, p, q),
                            1 => self.idx(p, s, q),
                            _ => self.idx(p, q, s),
                        }
                    })
                    .collect();
                out.push(line);
            }
        }
        out
    }
}

/// Box widths whose repeated application approximates a Gaussian of `sigma`
fn box_sizes(sigma: f64, n: usize) -> Vec<usize> {
    if sigma <= 0.0 || n == 0 {
        return vec![0; n];
    }

    let wideal = ((12.0 * sigma * sigma / n as f64) + 1.0).sqrt();
    let wl = (wideal - (wideal + 1.0) % 2.0).round() as usize;
    let wl = if wl % 2 == 0 { wl + 1 } else { wl };
    let wu = wl + 2;

    let (wl_f, n_f) = (wl as f64, n as f64);
    let mideal = (12.0 * sigma * sigma - n_f * wl_f * wl_f - 4.0 * n_f * wl_f - 3.0 * n_f)
        / (-4.0 * wl_f - 4.0);
    let m = mideal.round().max(0.0) as usize;

    (0..n).map(|i| if i < m { wl } else { wu }).collect()
}

/// Keep box widths odd and no larger than half the image extent
fn clamp_box_sizes(sizes: &mut [Vec<usize>; 3], grid: Grid) {
    for (axis, bs) in sizes.iter_mut().enumerate() {
        let max_size = grid.len(axis) / 2;
        for b in bs.iter_mut() {
            if *b % 2 == 0 {
                *b += 1;
            }
            if *b > max_size {
                *b = if max_size % 2 == 0 { max_size + 1 } else { max_size };
            }
        }
    }
}

/// Running-mean box filter with shrinking windows at the edges
fn box_filter_line(line: &mut [f64], boxsize: usize) {
    if boxsize < 3 || line.len() < boxsize {
        return;
    }
    let n = line.len();
    let r = boxsize / 2;

    let mut queue: VecDeque<f64> = line[..r].iter().copied().collect();
    let mut lsum: f64 = queue.iter().sum();

    for i in 0..=r {
        lsum += line[i + r];
        queue.push_back(line[i + r]);
        line[i] = lsum / (r + i + 1) as f64;
    }
    for i in (r + 1)..(n - r) {
        let old = queue.pop_front().unwrap_or(0.0);
        lsum += line[i + r] - old;
        queue.push_back(line[i + r]);
        line[i] = lsum / boxsize as f64;
    }
    for i in (n - r)..n {
        let old = queue.pop_front().unwrap_or(0.0);
        lsum -= old;
        line[i] = lsum / (r + n - i) as f64;
    }
}

/// Weighted running-mean box filter; the weights are smoothed alongside
fn weighted_box_filter_line(line: &mut [f64], weight: &mut [f64], boxsize: usize) {
    if boxsize < 3 || line.len() < boxsize {
        return;
    }
    let n = line.len();
    let r = boxsize / 2;

    let mut lq: VecDeque<f64> = line[..boxsize].iter().copied().collect();
    let mut wq: VecDeque<f64> = weight[..boxsize].iter().copied().collect();
    let mut sum = f64::EPSILON + lq.iter().zip(&wq).map(|(l, w)| l * w).sum::<f64>();
    let mut wsum = f64::EPSILON + wq.iter().sum::<f64>();
    let mut wsmooth = f64::EPSILON + wq.iter().map(|w| w * w).sum::<f64>();

    for i in (r + 1)..(n - r) {
        let (w, l) = (weight[i + r], line[i + r]);
        let wold = wq.pop_front().unwrap_or(0.0);
        let lold = lq.pop_front().unwrap_or(0.0);
        wq.push_back(w);
        lq.push_back(l);

        sum += l * w - lold * wold;
        wsum += w - wold;
        wsmooth += w * w - wold * wold;
        line[i] = sum / wsum;
        weight[i] = wsmooth / wsum;
    }
}

/// Box filter over NaN-masked data, extrapolating short gaps
fn nan_box_filter_line(line: &mut [f64], boxsize: usize) {
    if boxsize < 3 || line.len() < boxsize {
        return;
    }
    let n = line.len();
    let r = boxsize / 2;

    let mut orig = vec![f64::NAN; n + boxsize - 1];
    orig[r..r + n].copy_from_slice(line);

    #[derive(PartialEq, Clone, Copy)]
    enum Mode {
        Nan,
        Normal,
        Fill,
    }
    let mut mode = Mode::Nan;
    let mut lsum: f64 = orig[(r + 1)..=(2 * r)].iter().filter(|v| !v.is_nan()).sum();
    let mut nfills = 0usize;
    let mut nvalids = 0usize;

    for i in 0..n {
        let incoming_nan = orig[i + 2 * r].is_nan();
        match mode {
            Mode::Normal if incoming_nan => mode = Mode::Fill,
            Mode::Nan => {
                nvalids = if incoming_nan { 0 } else { nvalids + 1 };
                if nvalids == boxsize {
                    mode = Mode::Normal;
                    lsum = orig[i..=(i + 2 * r)].iter().sum();
                    line[i] = lsum / boxsize as f64;
                    continue;
                }
            }
            Mode::Fill => {
                if incoming_nan {
                    nfills += 1;
                    if nfills > r {
                        mode = Mode::Nan;
                        nfills = 0;
                        lsum = 0.0;
                        nvalids = 0;
                    }
                } else {
                    mode = Mode::Normal;
                    nfills = 0;
                }
            }
            _ => {}
        }

        match mode {
            Mode::Normal => {
                if i > 0 {
                    lsum += orig[i + 2 * r] - orig[i - 1];
                }
                line[i] = lsum / boxsize as f64;
            }
            Mode::Fill => {
                if i > 0 {
                    lsum -= orig[i - 1];
                }
                line[i] = (lsum - orig[i]) / (boxsize - 2) as f64;
                let extrapolated = if i >= r { 2.0 * line[i] - line[i - r] } else { line[i] };
                orig[i + 2 * r] = extrapolated;
                if i + r < n {
                    line[i + r] = extrapolated;
                }
                lsum += extrapolated;
            }
            Mode::Nan => {}
        }
    }
}

enum Smoothing<'a> {
    Plain,
    /// Voxels outside the mask do not contribute
    Masked(&'a [u8]),
    Weighted(&'a mut [f64]),
}

/// Box-filter approximation of a 3D Gaussian (sigma per axis in voxels)
fn box_gaussian(data: &[f64], grid: Grid, sigma: [f64; 3], nbox: usize, mut mode: Smoothing) -> Vec<f64> {
    let mut result = data.to_vec();
    let mut sizes = [box_sizes(sigma[0], nbox), box_sizes(sigma[1], nbox), box_sizes(sigma[2], nbox)];
    clamp_box_sizes(&mut sizes, grid);

    let masked = matches!(mode, Smoothing::Masked(_));
    if let Smoothing::Masked(mask) = mode {
        for (v, &m) in result.iter_mut().zip(mask) {
            if m == 0 {
                *v = f64::NAN;
            }
        }
    }

    for ibox in 0..nbox {
        for axis in 0..3 {
            let bsize = sizes[axis][ibox];
            if grid.len(axis) < 2 || bsize < 3 {
                continue;
            }
            // Masked smoothing alternates direction to balance extrapolation
            let reverse = masked && ibox % 2 == 1;
            for line_idx in grid.lines(axis, reverse) {
                let mut line: Vec<f64> = line_idx.iter().map(|&i| result[i]).collect();
                match mode {
                    Smoothing::Masked(_) => nan_box_filter_line(&mut line, bsize),
                    Smoothing::Weighted(ref mut w) => {
                        let mut wline: Vec<f64> = line_idx.iter().map(|&i| w[i]).collect();
                        weighted_box_filter_line(&mut line, &mut wline, bsize);
                        for (&i, &v) in line_idx.iter().zip(&wline) {
                            w[i] = v;
                        }
                    }
                    Smoothing::Plain => box_filter_line(&mut line, bsize),
                }
                for (&i, &v) in line_idx.iter().zip(&line) {
                    result[i] = v;
                }
            }
        }
    }

    result
}

/// Box filtering with explicit per-axis widths
fn box_smooth(data: &[f64], grid: Grid, sizes: &[usize], passes: usize) -> Vec<f64> {
    let mut result = data.to_vec();
    for pass in 0..passes {
        let bsize = sizes[pass.min(sizes.len() - 1)];
        for axis in 0..3 {
            if grid.len(axis) < 2 || bsize < 3 {
                continue;
            }
            for line_idx in grid.lines(axis, false) {
                let mut line: Vec<f64> = line_idx.iter().map(|&i| result[i]).collect();
                box_filter_line(&mut line, bsize);
                for (&i, &v) in line_idx.iter().zip(&line) {
                    result[i] = v;
                }
            }
        }
    }
    result
}

/// Fill enclosed background components up to `max_hole_size` voxels (6-connectivity)
fn fill_holes(mask: &[u8], grid: Grid, max_hole_size: usize) -> Vec<u8> {
    let mut result = mask.to_vec();
    let mut visited = vec![false; grid.total()];

    for start in 0..grid.total() {
        if mask[start] != 0 || visited[start] {
            continue;
        }

        let mut component = Vec::new();
        let mut touches_boundary = false;
        let mut stack = vec![start];
        visited[start] = true;

        while let Some(idx) = stack.pop() {
            component.push(idx);
            let k = idx / (grid.nx * grid.ny);
            let j = (idx % (grid.nx * grid.ny)) / grid.nx;
            let i = idx % grid.nx;
            if i == 0 || j == 0 || k == 0 || i + 1 == grid.nx || j + 1 == grid.ny || k + 1 == grid.nz {
                touches_boundary = true;
            }

            let mut visit = |n: usize| {
                if !visited[n] && mask[n] == 0 {
                    visited[n] = true;
                    stack.push(n);
                }
            };
            if i > 0 { visit(grid.idx(i - 1, j, k)); }
            if i + 1 < grid.nx { visit(grid.idx(i + 1, j, k)); }
            if j > 0 { visit(grid.idx(i, j - 1, k)); }
            if j + 1 < grid.ny { visit(grid.idx(i, j + 1, k)); }
            if k > 0 { visit(grid.idx(i, j, k - 1)); }
            if k + 1 < grid.nz { visit(grid.idx(i, j, k + 1)); }
        }

        if !touches_boundary && component.len() <= max_hole_size {
            for idx in component {
                result[idx] = 1;
            }
        }
    }

    result
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let idx = ((q * sorted.len() as f64) as usize).min(sorted.len() - 1);
    sorted[idx]
}

fn mean_of<'a>(values: impl Iterator<Item = &'a f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Head mask from intensity quantiles, smoothed and hole-filled
fn robust_mask(image: &[f64], grid: Grid) -> Vec<u8> {
    let mut samples: Vec<f64> = image.iter().copied().filter(|v| v.is_finite() && *v > 0.0).collect();
    if samples.is_empty() {
        return vec![0; grid.total()];
    }
    samples.sort_by(|a, b| a.total_cmp(b));

    let q05 = quantile(&samples, 0.05);
    let q15 = quantile(&samples, 0.15);
    let q80 = quantile(&samples, 0.80);
    let q99 = quantile(&samples, 0.99);

    let high = mean_of(samples.iter().filter(|&&v| v >= q80 && v <= q99)).unwrap_or(q99);
    let mut noise = mean_of(samples.iter().filter(|&&v| v <= q15)).unwrap_or(0.0);
    if noise > high / 10.0 {
        noise = mean_of(samples.iter().filter(|&&v| v <= q05)).unwrap_or(0.0);
        if noise > high / 10.0 {
            noise = 0.0;
        }
    }
    let threshold = (5.0 * noise).max(high / 5.0);

    let binary: Vec<f64> = image.iter().map(|&v| if v > threshold { 1.0 } else { 0.0 }).collect();
    let mut mask: Vec<u8> = box_smooth(&binary, grid, &[5], 1)
        .iter()
        .map(|&v| (v > 0.4) as u8)
        .collect();

    mask = fill_holes(&mask, grid, grid.total() / 20);

    let binary: Vec<f64> = mask.iter().map(|&v| v as f64).collect();
    box_smooth(&binary, grid, &[3, 3], 2)
        .iter()
        .map(|&v| (v > 0.6) as u8)
        .collect()
}

/// Voxels that fall within 10 % of the local 90th percentile in at least two boxes
fn box_segment(image: &[f64], mask: &[u8], grid: Grid, nbox: usize) -> Vec<u8> {
    let mut votes = vec![0u8; grid.total()];
    let shift = [
        grid.nx.div_ceil(nbox).max(1),
        grid.ny.div_ceil(nbox).max(1),
        grid.nz.div_ceil(nbox).max(1),
    ];

    for cz in (0..grid.nz).step_by(shift[2]) {
        for cy in (0..grid.ny).step_by(shift[1]) {
            for cx in (0..grid.nx).step_by(shift[0]) {
                let xr = cx.saturating_sub(shift[0])..(cx + shift[0]).min(grid.nx);
                let yr = cy.saturating_sub(shift[1])..(cy + shift[1]).min(grid.ny);
                let zr = cz.saturating_sub(shift[2])..(cz + shift[2]).min(grid.nz);

                let mut indices = Vec::new();
                for z in zr.clone() {
                    for y in yr.clone() {
                        for x in xr.clone() {
                            let idx = grid.idx(x, y, z);
                            if mask[idx] > 0 {
                                indices.push(idx);
                            }
                        }
                    }
                }

                let mut values: Vec<f64> =
                    indices.iter().map(|&i| image[i]).filter(|v| v.is_finite()).collect();
                if values.is_empty() {
                    continue;
                }
                values.sort_by(|a, b| a.total_cmp(b));
                let q90 = quantile(&values, 0.9);
                let (low, high) = (0.9 * q90, 1.1 * q90);

                for idx in indices {
                    if image[idx] > low && image[idx] < high {
                        votes[idx] = votes[idx].saturating_add(1);
                    }
                }
            }
        }
    }

    votes
        .iter()
        .zip(mask)
        .map(|(&v, &m)| (v >= 2 && m > 0) as u8)
        .collect()
}

/// Estimate the receive sensitivity (bias field) of an image
pub fn sensitivity(
    image: &[f64],
    dims: (usize, usize, usize),
    voxel_size: [f64; 3],
    params: &BiasCorrectionParams,
) -> Vec<f64> {
    let grid = Grid { nx: dims.0, ny: dims.1, nz: dims.2 };
    let sigma = [
        params.sigma_mm / voxel_size[0],
        params.sigma_mm / voxel_size[1],
        params.sigma_mm / voxel_size[2],
    ];

    let mask = robust_mask(image, grid);
    let segmentation = box_segment(image, &mask, grid, params.nbox);
    debug!(
        mask_voxels = mask.iter().filter(|&&m| m > 0).count(),
        tissue_voxels = segmentation.iter().filter(|&&m| m > 0).count(),
        "bias field segmentation"
    );

    // Split the smoothing between a masked and a weighted pass
    let factor: f64 = 0.7;
    let sigma1 = sigma.map(|s| (1.0 - factor * factor).sqrt() * s);
    let sigma2 = sigma.map(|s| factor * s);

    let mut lowpass = box_gaussian(image, grid, sigma1, 8, Smoothing::Masked(&segmentation));

    let stable_mean = mean_of(
        image
            .iter()
            .zip(&mask)
            .filter(|(v, m)| **m > 0 && v.is_finite())
            .map(|(v, _)| v),
    )
    .unwrap_or(1.0);

    // Holes and outliers are filled with a high value and down-weighted
    let mut weight = vec![1.2; grid.total()];
    for (v, w) in lowpass.iter_mut().zip(weight.iter_mut()) {
        if v.is_nan() || *v < stable_mean / 4.0 || *v > 10.0 * stable_mean {
            *v = 3.0 * stable_mean;
            *w = 0.2;
        }
    }
    box_gaussian(&lowpass, grid, sigma2, 3, Smoothing::Weighted(&mut weight))
}

/// Divide the image by its estimated sensitivity
pub fn bias_field_correction(image: &Image, params: &BiasCorrectionParams) -> Result<Image> {
    let data = image.frame(0);
    let field = sensitivity(data, image.dims, image.voxel_array(), params);
    let corrected: Vec<f64> = data
        .iter()
        .zip(&field)
        .map(|(&v, &s)| if s > 1e-10 && s.is_finite() { v / s } else { v })
        .collect();
    image.with_data(corrected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti_io::IDENTITY;
    use crate::utils::mask::sphere_mask;

    const G: Grid = Grid { nx: 3, ny: 3, nz: 3 };

    #[test]
    fn test_box_sizes_odd() {
        let sizes = box_sizes(5.0, 3);
        assert_eq!(sizes.len(), 3);
        for s in sizes {
            assert!(s % 2 == 1 && (3..=11).contains(&s), "box size {}", s);
        }
        assert_eq!(box_sizes(0.0, 3), vec![0, 0, 0]);
        assert!(box_sizes(2.0, 0).is_empty());
    }

    #[test]
    fn test_clamp_box_sizes() {
        let grid = Grid { nx: 10, ny: 6, nz: 4 };
        let mut sizes = [vec![21], vec![4], vec![3]];
        clamp_box_sizes(&mut sizes, grid);
        assert_eq!(sizes[0], vec![5]);
        assert_eq!(sizes[1], vec![3]);
        assert_eq!(sizes[2], vec![3]);
    }

    #[test]
    fn test_box_filter_uniform() {
        let mut line = vec![1.0; 10];
        box_filter_line(&mut line, 3);
        assert!(line.iter().all(|&v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_box_filter_smooths_step() {
        let mut line = vec![0.0, 0.0, 0.0, 0.0, 0.0, 10.0, 10.0, 10.0, 10.0, 10.0];
        box_filter_line(&mut line, 3);
        assert!(line[4] > 0.0 && line[5] < 10.0);
    }

    #[test]
    fn test_weighted_uniform() {
        let mut line = vec![2.0; 12];
        let mut w = vec![1.0; 12];
        weighted_box_filter_line(&mut line, &mut w, 5);
        assert!(line.iter().all(|&v| (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_nan_filter_no_nans() {
        let mut line = vec![4.0; 15];
        nan_box_filter_line(&mut line, 3);
        for &v in &line[1..14] {
            assert!((v - 4.0).abs() < 1e-10);
        }
    }

    #[test]
    fn test_fill_holes() {
        let mut mask = vec![1u8; 27];
        mask[13] = 0;
        assert_eq!(fill_holes(&mask, G, 5)[13], 1);
        // too large to be a hole
        assert_eq!(fill_holes(&mask, G, 0)[13], 0);
    }

    #[test]
    fn test_fill_holes_boundary_not_filled() {
        let mut mask = vec![1u8; 27];
        mask[0] = 0;
        assert_eq!(fill_holes(&mask, G, 5)[0], 0);
    }

    #[test]
    fn test_robust_mask_sphere() {
        let dims = (20, 20, 20);
        let sphere = sphere_mask(dims, [1.0; 3], [10.0, 10.0, 10.0], 6.0);
        let image: Vec<f64> = sphere.iter().map(|&m| if m > 0 { 100.0 } else { 1.0 }).collect();
        let grid = Grid { nx: 20, ny: 20, nz: 20 };
        let mask = robust_mask(&image, grid);
        assert_eq!(mask[grid.idx(10, 10, 10)], 1);
        assert_eq!(mask[grid.idx(0, 0, 0)], 0);
    }

    #[test]
    fn test_robust_mask_empty() {
        assert!(robust_mask(&[0.0; 27], G).iter().all(|&m| m == 0));
    }

    #[test]
    fn test_correction_reduces_gradient() {
        let dims = (24, 24, 24);
        let sphere = sphere_mask(dims, [1.0; 3], [12.0, 12.0, 12.0], 9.0);
        // linear bias along x on top of a uniform object
        let mut data = vec![0.0; 24 * 24 * 24];
        for k in 0..24 {
            for j in 0..24 {
                for i in 0..24 {
                    let idx = i + j * 24 + k * 576;
                    if sphere[idx] > 0 {
                        data[idx] = 100.0 * (0.7 + 0.6 * i as f64 / 23.0);
                    }
                }
            }
        }
        let img = Image::new(data.clone(), dims, (1.0, 1.0, 1.0), IDENTITY).unwrap();
        let params = BiasCorrectionParams { sigma_mm: 4.0, nbox: 6 };
        let out = bias_field_correction(&img, &params).unwrap();

        let left = 6 + 12 * 24 + 12 * 576;
        let right = 18 + 12 * 24 + 12 * 576;
        let before = data[right] / data[left];
        let after = out.data[right] / out.data[left];
        assert!(out.data.iter().all(|v| v.is_finite()));
        assert!((after - 1.0).abs() < (before - 1.0).abs(), "before {} after {}", before, after);
    }
}
