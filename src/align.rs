//! Alignment of the SUVr frames of a static acquisition
//!
//! Every pair of frames is registered in both directions. The motion metric
//! of a pair is the L2 norm of the rotations (degrees) plus the L2 norm of
//! the translations (mm). The frame with the least total motion relative to
//! all others becomes the reference into which the remaining frames are
//! resampled.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{AmyPetError, Result};
use crate::nifti_io::{nifti_stem, save_nifti_to_file, Image};
use crate::registration::{coregister, CostFunction, RegistrationParams};
use crate::resample::{resample, Interpolation};
use crate::series::Series;
use crate::transform::{save_affine, RigidTransform};
use crate::utils::clean_name;

pub const ALIGNED_DESCRIPTION: &str = "AmyPET: aligned SUVr frames";
const SUMMARY_FILE: &str = "alignment.json";

#[derive(Debug, Clone)]
pub struct AlignOptions {
    /// Defaults to the grandparent of the first frame file
    pub outpath: Option<PathBuf>,
    pub cost: CostFunction,
    /// Re-run even when aligned output exists
    pub force: bool,
    /// Smoothing applied to both frames for registration only (mm)
    pub fwhm: f64,
    pub registration: RegistrationParams,
}

impl Default for AlignOptions {
    fn default() -> Self {
        Self {
            outpath: None,
            cost: CostFunction::Nmi,
            force: false,
            fwhm: 8.0,
            registration: RegistrationParams::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignResult {
    /// Aligned 4D (or single frame) image
    pub fpet: PathBuf,
    /// Motion metric; row = reference frame, column = floating frame
    pub metric: Vec<Vec<f64>>,
    /// Index of the reference frame
    pub reference: usize,
    /// Affine files of each pairwise registration
    pub faff: Vec<Vec<Option<PathBuf>>>,
    pub outpath: PathBuf,
}

/// In-memory alignment outcome
#[derive(Debug, Clone)]
pub struct FrameAlignment {
    pub aligned: Image,
    pub metric: Vec<Vec<f64>>,
    pub reference: usize,
    pub transforms: Vec<Vec<Option<RigidTransform>>>,
}

/// Reference frame: least column sum plus row sum of the metric
pub fn reference_frame(metric: &[Vec<f64>]) -> usize {
    let n = metric.len();
    let score = |i: usize| -> f64 {
        let row: f64 = metric[i].iter().sum();
        let col: f64 = metric.iter().map(|r| r[i]).sum();
        row + col
    };
    let mut best = 0;
    for i in 1..n {
        if score(i) < score(best) {
            best = i;
        }
    }
    best
}

/// Register every pair of frames and resample all into the reference frame
///
/// `progress(done, total)` is called after each pairwise registration.
pub fn align_frames<F>(frames: &[Image], params: &RegistrationParams, progress: F) -> Result<FrameAlignment>
where
    F: FnMut(usize, usize) + Send,
{
    let n = frames.len();
    let Some(first) = frames.first() else {
        return Err(AmyPetError::FrameSelection { requested: vec![], available: 0 });
    };
    if let Some(i) = frames.iter().position(|f| !f.same_shape(first)) {
        return Err(AmyPetError::ShapeMismatch(format!(
            "frame {} has dimensions {:?}, frame 0 has {:?}",
            i, frames[i].dims, first.dims
        )));
    }

    if n == 1 {
        return Ok(FrameAlignment {
            aligned: first.clone(),
            metric: vec![vec![0.0]],
            reference: 0,
            transforms: vec![vec![None]],
        });
    }

    let pairs: Vec<(usize, usize)> = (0..n)
        .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
        .collect();
    let total = pairs.len();
    let done = Mutex::new((0usize, progress));

    let results: Vec<((usize, usize), RigidTransform)> = pairs
        .par_iter()
        .map(|&(i, j)| {
            info!(reference = i, floating = j, "registering frames");
            let res = coregister(&frames[i], &frames[j], params)?;
            if let Ok(mut guard) = done.lock() {
                guard.0 += 1;
                let count = guard.0;
                (guard.1)(count, total);
            }
            Ok(((i, j), res.transform))
        })
        .collect::<Result<_>>()?;

    let mut metric = vec![vec![0.0; n]; n];
    let mut transforms = vec![vec![None; n]; n];
    for ((i, j), t) in results {
        metric[i][j] = t.motion_metric();
        transforms[i][j] = Some(t);
    }

    let reference = reference_frame(&metric);
    info!(reference, "selected reference frame");

    let r = &frames[reference];
    let aligned = Image {
        data: data_frames(frames, &transforms, reference)?,
        dims: r.dims,
        frames: n,
        voxel_size: r.voxel_size,
        affine: r.affine,
        description: None,
    };

    Ok(FrameAlignment { aligned, metric, reference, transforms })
}

/// Reference frame as is, every other frame resampled into it
fn data_frames(frames: &[Image], transforms: &[Vec<Option<RigidTransform>>], reference: usize) -> Result<Vec<f64>> {
    let mut data = Vec::with_capacity(frames[0].n_voxels() * frames.len());
    for (i, frame) in frames.iter().enumerate() {
        match transforms[reference][i] {
            Some(t) if i != reference => {
                let moved = resample(&frames[reference], frame, &t, Interpolation::Trilinear)?;
                data.extend_from_slice(&moved.data);
            }
            _ => data.extend_from_slice(frame.frame(0)),
        }
    }
    Ok(data)
}

fn clear_folder(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn read_summary(path: &Path) -> Option<AlignResult> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Align the selected frames of a series and save the aligned image
#[instrument(skip_all, fields(series = %series.description, frames = frames.len()))]
pub fn align_suvr<F>(series: &Series, frames: &[usize], options: &AlignOptions, progress: F) -> Result<AlignResult>
where
    F: FnMut(usize, usize) + Send,
{
    if let Some(&bad) = frames.iter().find(|&&i| i >= series.len()) {
        warn!(frame = bad, available = series.len(), "frame selection out of range");
        return Err(AmyPetError::FrameSelection { requested: frames.to_vec(), available: series.len() });
    }
    if frames.is_empty() {
        return Err(AmyPetError::FrameSelection { requested: vec![], available: series.len() });
    }

    let outpath = match &options.outpath {
        Some(p) => p.clone(),
        None => series.frames[frames[0]]
            .path
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    };
    let niidir = outpath.join("NIfTI_SUVr");
    std::fs::create_dir_all(&niidir)?;
    let fpet = niidir.join(format!("SUVr_aligned_{}.nii.gz", clean_name(&series.description)));
    let fsummary = niidir.join(SUMMARY_FILE);

    if fpet.is_file() && !options.force {
        if let Some(summary) = read_summary(&fsummary) {
            info!(file = %fpet.display(), "reusing aligned SUVr frames");
            return Ok(summary);
        }
        warn!("aligned frames exist without a summary, aligning again");
    }

    clear_folder(&niidir)?;
    let rsmpl_dir = niidir.join("aligned");
    std::fs::create_dir_all(&rsmpl_dir)?;

    // Frames as individual files, named after their source
    let mut images = Vec::with_capacity(frames.len());
    let mut files = Vec::with_capacity(frames.len());
    for (n, &i) in frames.iter().enumerate() {
        let frame = &series.frames[i];
        let img = frame.load()?;
        let f = niidir.join(format!("{:02}_{}.nii.gz", n, clean_name(&frame.label())));
        save_nifti_to_file(&f, &img)?;
        images.push(img);
        files.push(f);
    }

    let params = RegistrationParams {
        cost: options.cost,
        fwhm_ref: options.fwhm,
        fwhm_flo: options.fwhm,
        ..options.registration.clone()
    };
    let alignment = align_frames(&images, &params, progress)?;

    let n = images.len();
    let mut faff = vec![vec![None; n]; n];
    for i in 0..n {
        for j in 0..n {
            if let Some(t) = &alignment.transforms[i][j] {
                let f = niidir.join(format!(
                    "affine-{}-{}_combi_{}-{}.txt",
                    nifti_stem(&files[i]),
                    nifti_stem(&files[j]),
                    i,
                    j
                ));
                save_affine(&f, &t.matrix())?;
                faff[i][j] = Some(f);
            }
        }
    }

    for j in (0..n).filter(|&j| j != alignment.reference) {
        let moved = alignment.aligned.frame_image(j)?;
        save_nifti_to_file(&rsmpl_dir.join(format!("{}_aligned.nii.gz", nifti_stem(&files[j]))), &moved)?;
    }

    let aligned = alignment.aligned.clone().with_description(ALIGNED_DESCRIPTION);
    save_nifti_to_file(&fpet, &aligned)?;

    let result = AlignResult {
        fpet,
        metric: alignment.metric,
        reference: alignment.reference,
        faff,
        outpath: niidir,
    };
    std::fs::write(&fsummary, serde_json::to_string_pretty(&result)?)?;
    info!(file = %result.fpet.display(), reference = result.reference, "saved aligned SUVr frames");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti_io::{read_nifti_file, Affine};
    use crate::series::Frame;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

    const N: usize = 28;

    const GRID: Affine = [
        2.0, 0.0, 0.0, -28.0,
        0.0, 2.0, 0.0, -28.0,
        0.0, 0.0, 2.0, -28.0,
        0.0, 0.0, 0.0, 1.0,
    ];

    /// Gaussian blobs displaced by `offset` voxels on a fixed 2 mm grid
    fn moved_blobs(offset: [f64; 3]) -> Image {
        let blobs = [
            ([14.0, 14.0, 14.0], 5.0, 100.0),
            ([9.0, 16.0, 12.0], 2.5, 60.0),
            ([18.0, 10.0, 17.0], 3.0, 80.0),
        ];
        let mut data = vec![0.0; N * N * N];
        for k in 0..N {
            for j in 0..N {
                for i in 0..N {
                    let p = [i as f64, j as f64, k as f64];
                    let mut v = 0.0;
                    for (c, sd, a) in blobs {
                        let d2: f64 = (0..3).map(|d| (p[d] - c[d] - offset[d]).powi(2)).sum();
                        v += a * (-d2 / (2.0 * sd * sd)).exp();
                    }
                    data[i + j * N + k * N * N] = v;
                }
            }
        }
        Image::new(data, (N, N, N), (2.0, 2.0, 2.0), GRID).unwrap()
    }

    /// RMSE over interior voxels where the reference carries signal
    fn signal_rmse(a: &[f64], reference: &[f64]) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for k in 4..N - 4 {
            for j in 4..N - 4 {
                for i in 4..N - 4 {
                    let idx = i + j * N + k * N * N;
                    if reference[idx] > 5.0 {
                        sum += (a[idx] - reference[idx]).powi(2);
                        count += 1;
                    }
                }
            }
        }
        (sum / count as f64).sqrt()
    }

    fn series_on_disk(dir: &Path, offsets: &[[f64; 3]]) -> Series {
        let date = NaiveDate::from_ymd_opt(2023, 5, 2).unwrap();
        let frames = offsets
            .iter()
            .enumerate()
            .map(|(n, &o)| {
                let path = dir.join(format!("frame{}.nii.gz", n));
                save_nifti_to_file(&path, &moved_blobs(o)).unwrap();
                let time = NaiveTime::from_hms_opt(9, 30 + 5 * n as u32, 0).unwrap();
                Frame { path, volume: None, acquisition: NaiveDateTime::new(date, time), duration: 300.0 }
            })
            .collect();
        Series {
            description: "Brain FBB".into(),
            series_number: Some(4),
            date,
            tracer: Some(crate::defs::Tracer::Fbb),
            radiopharmaceutical: Some("Florbetaben".into()),
            injection_time: NaiveTime::from_hms_opt(8, 0, 0),
            frames,
        }
    }

    #[test]
    fn test_align_frames_moves_frames_onto_reference() {
        let offsets = [[0.0, 0.0, 0.0], [2.0, 0.0, 0.0], [0.0, -2.0, 1.0]];
        let frames: Vec<Image> = offsets.iter().map(|&o| moved_blobs(o)).collect();

        let mut calls = Vec::new();
        let res = align_frames(&frames, &RegistrationParams::default(), |done, total| calls.push((done, total))).unwrap();
        assert_eq!(calls.len(), 6);
        assert_eq!(calls.last(), Some(&(6, 6)));
        assert_eq!(res.aligned.frames, 3);

        let r = res.reference;
        let reference = res.aligned.frame(r).to_vec();
        assert_eq!(reference, frames[r].data);

        for j in (0..3).filter(|&j| j != r) {
            // Content moved by whole voxels of 2 mm
            let t = res.transforms[r][j].unwrap();
            for d in 0..3 {
                let expected = 2.0 * (offsets[j][d] - offsets[r][d]);
                assert!((t.translations[d] - expected).abs() < 0.5, "frame {} axis {}: {}", j, d, t.translations[d]);
            }
            assert!(res.metric[r][j] > 1.0);

            let before = signal_rmse(&frames[j].data, &reference);
            let after = signal_rmse(res.aligned.frame(j), &reference);
            assert!(after < 0.25 * before, "frame {}: rmse {} before, {} after", j, before, after);
        }
    }

    #[test]
    fn test_align_suvr_reuses_saved_alignment() {
        let dir = tempfile::tempdir().unwrap();
        let pet = dir.path().join("pet");
        std::fs::create_dir_all(&pet).unwrap();
        let series = series_on_disk(&pet, &[[0.0, 0.0, 0.0], [2.0, 0.0, 0.0]]);
        let options = AlignOptions { outpath: Some(dir.path().join("out")), ..Default::default() };

        let mut calls = 0;
        let first = align_suvr(&series, &[0, 1], &options, |_, _| calls += 1).unwrap();
        assert_eq!(calls, 2);
        assert!(first.fpet.ends_with("NIfTI_SUVr/SUVr_aligned_Brain_FBB.nii.gz"));
        let aligned = read_nifti_file(&first.fpet).unwrap();
        assert_eq!(aligned.frames, 2);
        assert_eq!(aligned.description.as_deref(), Some(ALIGNED_DESCRIPTION));
        assert!(first.faff[0][1].as_ref().unwrap().is_file());

        let mut again = 0;
        let second = align_suvr(&series, &[0, 1], &options, |_, _| again += 1).unwrap();
        assert_eq!(again, 0);
        assert_eq!(second.fpet, first.fpet);
        assert_eq!(second.reference, first.reference);
        for (a, b) in first.metric.iter().flatten().zip(second.metric.iter().flatten()) {
            assert!((a - b).abs() < 1e-9);
        }

        // Forced runs register again
        let forced = AlignOptions { force: true, ..options.clone() };
        let mut third = 0;
        align_suvr(&series, &[0, 1], &forced, |_, _| third += 1).unwrap();
        assert_eq!(third, 2);
    }

    #[test]
    fn test_reference_frame_least_motion() {
        let metric = vec![
            vec![0.0, 1.0, 5.0],
            vec![1.0, 0.0, 1.0],
            vec![5.0, 1.0, 0.0],
        ];
        assert_eq!(reference_frame(&metric), 1);
    }

    #[test]
    fn test_reference_frame_ties_pick_first() {
        let metric = vec![vec![0.0, 2.0], vec![2.0, 0.0]];
        assert_eq!(reference_frame(&metric), 0);
    }

    #[test]
    fn test_single_frame_unchanged() {
        use crate::nifti_io::IDENTITY;
        let img = Image::new((0..27).map(|v| v as f64).collect(), (3, 3, 3), (1.0, 1.0, 1.0), IDENTITY).unwrap();
        let mut calls = 0;
        let res = align_frames(std::slice::from_ref(&img), &RegistrationParams::default(), |_, _| calls += 1).unwrap();
        assert_eq!(res.aligned.data, img.data);
        assert_eq!(res.metric, vec![vec![0.0]]);
        assert_eq!(res.reference, 0);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_frames_must_share_shape() {
        use crate::nifti_io::IDENTITY;
        let a = Image::new(vec![1.0; 8], (2, 2, 2), (1.0, 1.0, 1.0), IDENTITY).unwrap();
        let b = Image::new(vec![1.0; 27], (3, 3, 3), (1.0, 1.0, 1.0), IDENTITY).unwrap();
        let err = align_frames(&[a, b], &RegistrationParams::default(), |_, _| {}).unwrap_err();
        assert!(matches!(err, AmyPetError::ShapeMismatch(_)));
        assert!(matches!(
            align_frames(&[], &RegistrationParams::default(), |_, _| {}).unwrap_err(),
            AmyPetError::FrameSelection { .. }
        ));
    }
}
