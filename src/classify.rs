//! Exploration of an input folder and classification of PET acquisitions
//!
//! Each series found in the input folder (and its immediate sub-folders) is
//! classified by its frame timings relative to injection as a static,
//! coffee-break early dynamic (`breakdyn`) or full dynamic (`fulldyn`)
//! acquisition. For static acquisitions covering the SUVr window the frames
//! best matching the window are selected.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::convert::Dcm2niix;
use crate::defs::{SuvrWindow, Tracer, BREAKDYN_WINDOW, BREAK_TIME, FULLDYN_TIME, MARGIN};
use crate::error::{AmyPetError, Result};
use crate::series::{needs_conversion, scan_folder, Series, Timings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionType {
    Static,
    Breakdyn,
    Fulldyn,
    Unknown,
}

impl AcquisitionType {
    /// Classify from the first frame start and last frame stop
    pub fn from_timings(first_start: f64, last_stop: f64) -> Self {
        if first_start < 1.0 {
            if last_stop > BREAKDYN_WINDOW.0 && last_stop <= BREAKDYN_WINDOW.1 {
                AcquisitionType::Breakdyn
            } else if last_stop >= FULLDYN_TIME {
                AcquisitionType::Fulldyn
            } else {
                AcquisitionType::Unknown
            }
        } else if first_start > 1.0 {
            AcquisitionType::Static
        } else {
            AcquisitionType::Unknown
        }
    }
}

impl fmt::Display for AcquisitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AcquisitionType::Static => "static",
            AcquisitionType::Breakdyn => "breakdyn",
            AcquisitionType::Fulldyn => "fulldyn",
            AcquisitionType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Classification of one series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub acquisition: AcquisitionType,
    /// Frames selected for SUVr calculation
    pub suvr: bool,
    /// Start and stop of the selected frames
    pub time: (f64, f64),
    pub timings: Vec<(f64, f64)>,
    /// First and last selected frame
    pub idxs: (usize, usize),
    pub frames: Vec<usize>,
    /// Probable tracers, most likely first
    pub tracers: Vec<Tracer>,
    pub suvr_window: Option<SuvrWindow>,
}

impl Classification {
    /// Labels such as `[static, suvr]`
    pub fn labels(&self) -> Vec<String> {
        let mut l = vec![self.acquisition.to_string()];
        if self.suvr {
            l.push("suvr".into());
        }
        l
    }

    pub fn is_static_suvr(&self) -> bool {
        self.acquisition == AcquisitionType::Static && self.suvr
    }

    fn unknown(timings: &Timings, tracers: Vec<Tracer>) -> Self {
        let n = timings.len();
        Self {
            acquisition: AcquisitionType::Unknown,
            suvr: false,
            time: (timings.first_start(), timings.last_stop()),
            timings: timings.pairs(),
            idxs: (0, n.saturating_sub(1)),
            frames: (0..n).collect(),
            tracers,
            suvr_window: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExploreOptions {
    pub tracer: Option<Tracer>,
    pub suvr_window: Option<SuvrWindow>,
    pub outpath: Option<PathBuf>,
    pub dcm2niix: Dcm2niix,
}

/// Time-sorted series with their classification (same order)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExploreResult {
    pub series: Vec<Series>,
    pub descr: Vec<Classification>,
    pub outpath: PathBuf,
}

impl ExploreResult {
    /// First series selected for SUVr
    pub fn first_static_suvr(&self) -> Option<(&Series, &Classification)> {
        self.series.iter().zip(&self.descr).find(|(_, c)| c.is_static_suvr())
    }
}

/// Index of the value closest to `target`; first one wins on ties
fn closest(values: &[f64], target: f64) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if (v - target).abs() < (values[best] - target).abs() {
            best = i;
        }
    }
    best
}

/// Frames from the start closest to `t0` to the stop closest to `t1`
fn select(timings: &Timings, t0: f64, t1: f64) -> (usize, usize) {
    (closest(&timings.starts, t0), closest(&timings.stops, t1))
}

/// Probable tracers: the detected one, then (for static acquisitions) every
/// tracer whose static duration and window start fit the acquisition
pub fn candidate_tracers(detected: Option<Tracer>, acq: AcquisitionType, timings: &Timings) -> Vec<Tracer> {
    let mut tracers: Vec<Tracer> = detected.into_iter().collect();
    if acq == AcquisitionType::Static {
        let dur = timings.duration();
        for t in Tracer::ALL {
            let d = t.static_duration();
            let w = t.suvr_window();
            if !tracers.contains(&t)
                && dur > d * (1.0 - MARGIN)
                && dur < d * (1.0 + MARGIN)
                && timings.first_start() > w.start * (1.0 - MARGIN)
            {
                tracers.push(t);
            }
        }
    }
    tracers
}

/// Classify one time-sorted series
pub fn classify_series(series: &Series, tracer: Option<Tracer>, suvr_window: Option<SuvrWindow>) -> Classification {
    let detected = tracer.or(series.tracer);

    let timings = match series.timings() {
        Ok(t) => t,
        Err(e) => {
            warn!(series = %series.description, "cannot time frames: {}", e);
            return Classification::unknown(&Timings { starts: vec![], stops: vec![] }, detected.into_iter().collect());
        }
    };

    let acq = AcquisitionType::from_timings(timings.first_start(), timings.last_stop());
    let tracers = candidate_tracers(detected, acq, &timings);

    let build = |suvr: bool, (i0, i1): (usize, usize), window: Option<SuvrWindow>| Classification {
        acquisition: acq,
        suvr,
        time: (timings.starts[i0], timings.stops[i1]),
        timings: timings.pairs(),
        idxs: (i0, i1),
        frames: (i0..=i1).collect(),
        tracers: tracers.clone(),
        suvr_window: window,
    };

    match acq {
        AcquisitionType::Static => {
            let window = suvr_window.or_else(|| tracers.first().map(|t| t.suvr_window()));
            let all = (0, timings.len() - 1);
            match window {
                Some(w) if w.covered_by(timings.first_start(), timings.last_stop()) => {
                    build(true, select(&timings, w.start, w.stop), Some(w))
                }
                Some(w) => {
                    warn!(series = %series.description, "the acquisition does not cover the requested time frame");
                    build(false, all, Some(w))
                }
                None => {
                    warn!(series = %series.description, "no SUVr window: tracer unknown and no window given");
                    build(false, all, None)
                }
            }
        }
        AcquisitionType::Breakdyn => build(false, select(&timings, 0.0, BREAK_TIME), None),
        AcquisitionType::Fulldyn => build(false, select(&timings, 0.0, FULLDYN_TIME), None),
        AcquisitionType::Unknown => Classification::unknown(&timings, tracers.clone()),
    }
}

/// Collect series from a folder, converting DICOM data first when needed
fn collect_series(folder: &Path, outpath: &Path, dcm2niix: &Dcm2niix) -> Result<Vec<Series>> {
    if needs_conversion(folder) {
        let name = folder.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let converted = outpath.join("NIfTI").join(crate::utils::clean_name(&name));
        dcm2niix.convert(folder, &converted)?;
        return scan_folder(&converted);
    }
    scan_folder(folder)
}

/// Explore and classify the PET data in `input`
#[instrument(skip(options), fields(input = %input.display()))]
pub fn explore_input(input: &Path, options: &ExploreOptions) -> Result<ExploreResult> {
    if !input.is_dir() {
        return Err(AmyPetError::invalid_input(input, "not a folder"));
    }

    let outpath = match &options.outpath {
        Some(p) => p.clone(),
        None => input
            .parent()
            .map(|p| p.join("amypet_output"))
            .unwrap_or_else(|| PathBuf::from("amypet_output")),
    };
    std::fs::create_dir_all(&outpath)?;

    let mut folders: Vec<PathBuf> = std::fs::read_dir(input)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && *p != outpath)
        .collect();
    folders.sort();
    folders.push(input.to_path_buf());

    let mut series = Vec::new();
    for folder in &folders {
        series.extend(collect_series(folder, &outpath, &options.dcm2niix)?);
    }

    let descr: Vec<Classification> = series
        .iter()
        .map(|s| classify_series(s, options.tracer, options.suvr_window))
        .collect();

    for (s, c) in series.iter().zip(&descr) {
        info!(
            series = %s.description,
            frames = s.len(),
            acquisition = %c.labels().join("+"),
            "classified series"
        );
    }

    Ok(ExploreResult { series, descr, outpath })
}
