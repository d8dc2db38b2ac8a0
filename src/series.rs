//! PET series discovery from NIfTI files with BIDS JSON sidecars
//!
//! Every sidecar (`<name>.json`) next to a `<name>.nii[.gz]` image yields one
//! frame, or one frame per volume for 4D images whose sidecar carries frame
//! arrays. Frames are grouped into series by series description, acquisition
//! date and tracer, and sorted by acquisition time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::defs::Tracer;
use crate::error::{AmyPetError, Result};
use crate::nifti_io::{read_nifti_file, Image};

const SECONDS_PER_DAY: i64 = 86_400;

/// DICOM file extensions recognised when checking for unconverted data
pub const DICOM_EXTENSIONS: [&str; 6] = ["dcm", "DCM", "ima", "IMA", "img", "IMG"];

/// Frame duration as written by dcm2niix: a number, or one value per volume
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FrameDuration {
    Single(f64),
    Many(Vec<f64>),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Sidecar {
    series_description: Option<String>,
    series_number: Option<i64>,
    acquisition_date: Option<String>,
    study_date: Option<String>,
    acquisition_time: Option<String>,
    frame_duration: Option<FrameDuration>,
    frame_times_start: Option<Vec<f64>>,
    radiopharmaceutical_start_time: Option<String>,
    radiopharmaceutical: Option<String>,
}

/// One PET frame on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub path: PathBuf,
    /// Volume index inside a 4D file
    pub volume: Option<usize>,
    pub acquisition: NaiveDateTime,
    /// Frame duration in seconds
    pub duration: f64,
}

/// Frames sharing description, acquisition date and tracer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub description: String,
    pub series_number: Option<i64>,
    pub date: NaiveDate,
    pub tracer: Option<Tracer>,
    pub radiopharmaceutical: Option<String>,
    pub injection_time: Option<NaiveTime>,
    /// Time sorted
    pub frames: Vec<Frame>,
}

/// Frame start and stop times in seconds after injection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub starts: Vec<f64>,
    pub stops: Vec<f64>,
}

impl Timings {
    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    pub fn first_start(&self) -> f64 {
        self.starts.first().copied().unwrap_or(0.0)
    }

    pub fn last_stop(&self) -> f64 {
        self.stops.last().copied().unwrap_or(0.0)
    }

    /// Overall acquisition duration
    pub fn duration(&self) -> f64 {
        self.last_stop() - self.first_start()
    }

    /// Pairs of (start, stop)
    pub fn pairs(&self) -> Vec<(f64, f64)> {
        self.starts.iter().copied().zip(self.stops.iter().copied()).collect()
    }
}

/// Seconds from `from` to `to`, wrapped into one day
pub fn seconds_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    let ms = (to - from).num_milliseconds() as f64 / 1000.0;
    ms.rem_euclid(SECONDS_PER_DAY as f64)
}

impl Series {
    /// Frame timings relative to the radiopharmaceutical start time
    pub fn timings(&self) -> Result<Timings> {
        let injection = self.injection_time.ok_or_else(|| {
            AmyPetError::Metadata(format!(
                "series '{}' has no RadiopharmaceuticalStartTime",
                self.description
            ))
        })?;
        if self.frames.is_empty() {
            return Err(AmyPetError::Metadata(format!("series '{}' has no frames", self.description)));
        }

        let injected = NaiveDateTime::new(self.date, injection);
        let mut starts = Vec::with_capacity(self.frames.len());
        let mut stops = Vec::with_capacity(self.frames.len());
        for f in &self.frames {
            let t0 = seconds_between(injected, f.acquisition);
            starts.push(t0);
            stops.push(t0 + f.duration);
        }
        Ok(Timings { starts, stops })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Load frame `i` as a 3D image
    pub fn load_frame(&self, i: usize) -> Result<Image> {
        let frame = self.frames.get(i).ok_or_else(|| AmyPetError::FrameSelection {
            requested: vec![i],
            available: self.frames.len(),
        })?;
        frame.load()
    }
}

impl Frame {
    pub fn load(&self) -> Result<Image> {
        let img = read_nifti_file(&self.path)?;
        match self.volume {
            Some(v) => img.frame_image(v),
            None if img.is_dynamic() => img.frame_image(0),
            None => Ok(img),
        }
    }

    /// Short label for logs and file names
    pub fn label(&self) -> String {
        let stem = crate::nifti_io::nifti_stem(&self.path);
        match self.volume {
            Some(v) => format!("{}_frm{:02}", stem, v),
            None => stem,
        }
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .ok()
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H%M%S%.f"))
        .ok()
}

/// Image file belonging to a sidecar
fn image_for_sidecar(json: &Path) -> Option<PathBuf> {
    let stem = json.file_stem()?.to_string_lossy().to_string();
    let dir = json.parent()?;
    ["nii.gz", "nii"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", stem, ext)))
        .find(|p| p.is_file())
}

fn read_sidecar(path: &Path) -> Result<Sidecar> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|source| AmyPetError::Sidecar { path: path.to_path_buf(), source })
}

/// Frames described by one sidecar
fn sidecar_frames(json: &Path, image: &Path, sc: &Sidecar, date: NaiveDate) -> Result<Vec<Frame>> {
    let time = sc
        .acquisition_time
        .as_deref()
        .and_then(parse_time)
        .ok_or_else(|| AmyPetError::Metadata(format!("missing or invalid AcquisitionTime in '{}'", json.display())))?;
    let start = NaiveDateTime::new(date, time);

    let frames = match (&sc.frame_duration, &sc.frame_times_start) {
        (Some(FrameDuration::Single(d)), None) => vec![Frame {
            path: image.to_path_buf(),
            volume: None,
            acquisition: start,
            duration: *d,
        }],
        (Some(FrameDuration::Many(ds)), Some(ts)) if ds.len() == ts.len() => ds
            .iter()
            .zip(ts)
            .enumerate()
            .map(|(v, (&d, &t))| Frame {
                path: image.to_path_buf(),
                volume: Some(v),
                acquisition: start + chrono::Duration::milliseconds((t * 1000.0).round() as i64),
                duration: d,
            })
            .collect(),
        (Some(FrameDuration::Many(ds)), None) => {
            // Consecutive frames without gaps
            let mut offset = 0.0;
            ds.iter()
                .enumerate()
                .map(|(v, &d)| {
                    let f = Frame {
                        path: image.to_path_buf(),
                        volume: Some(v),
                        acquisition: start + chrono::Duration::milliseconds((offset * 1000.0_f64).round() as i64),
                        duration: d,
                    };
                    offset += d;
                    f
                })
                .collect()
        }
        (Some(FrameDuration::Single(d)), Some(ts)) => ts
            .iter()
            .enumerate()
            .map(|(v, &t)| Frame {
                path: image.to_path_buf(),
                volume: Some(v),
                acquisition: start + chrono::Duration::milliseconds((t * 1000.0).round() as i64),
                duration: *d,
            })
            .collect(),
        _ => {
            return Err(AmyPetError::Metadata(format!(
                "missing or inconsistent FrameDuration in '{}'",
                json.display()
            )))
        }
    };
    Ok(frames)
}

/// Scan a folder (non-recursively) for sidecar-described PET frames
pub fn scan_folder(dir: &Path) -> Result<Vec<Series>> {
    if !dir.is_dir() {
        return Err(AmyPetError::invalid_input(dir, "not a folder"));
    }

    let mut groups: BTreeMap<(String, NaiveDate, String), Series> = BTreeMap::new();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| AmyPetError::Io(e.into()))?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(image) = image_for_sidecar(path) else {
            debug!(sidecar = %path.display(), "no image next to sidecar, skipping");
            continue;
        };

        let sc = read_sidecar(path)?;
        let date_text = sc.acquisition_date.as_deref().or(sc.study_date.as_deref());
        let Some(date) = date_text.and_then(parse_date) else {
            warn!(sidecar = %path.display(), "no acquisition date, skipping");
            continue;
        };

        // Non-PET sidecars (MR, CT) carry no frame timing
        let frames = match sidecar_frames(path, &image, &sc, date) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(sidecar = %path.display(), error = %e, "no usable frame timing, skipping");
                continue;
            }
        };
        let description = sc.series_description.clone().unwrap_or_default();
        let tracer = sc
            .radiopharmaceutical
            .as_deref()
            .and_then(Tracer::detect)
            .or_else(|| Tracer::detect(&description));
        let key = (
            description.clone(),
            date,
            tracer.map(|t| t.key().to_string()).unwrap_or_default(),
        );

        let series = groups.entry(key).or_insert_with(|| Series {
            description,
            series_number: sc.series_number,
            date,
            tracer,
            radiopharmaceutical: sc.radiopharmaceutical.clone(),
            injection_time: None,
            frames: Vec::new(),
        });
        if series.injection_time.is_none() {
            series.injection_time = sc.radiopharmaceutical_start_time.as_deref().and_then(parse_time);
        }
        series.frames.extend(frames);
    }

    let mut out: Vec<Series> = groups.into_values().collect();
    for s in out.iter_mut() {
        s.frames.sort_by_key(|f| (f.acquisition, f.volume));
    }
    debug!(folder = %dir.display(), series = out.len(), "scanned folder");
    Ok(out)
}

/// True if the folder holds DICOM files (by extension) but no sidecars
pub fn needs_conversion(dir: &Path) -> bool {
    let mut dicom = false;
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).into_iter().filter_map(|e| e.ok()) {
        let Some(ext) = entry.path().extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if ext == "json" {
            return false;
        }
        if DICOM_EXTENSIONS.contains(&ext) {
            dicom = true;
        }
    }
    dicom
}
