//! End-to-end processing of an amyloid PET study
//!
//! explore the input folder, align the SUVr frames of the first static
//! series, build the static image, sample the VOIs and convert the result
//! to Centiloid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::align::{align_suvr, AlignOptions, AlignResult};
use crate::centiloid::{centiloid, CentiloidResult};
use crate::classify::{explore_input, Classification, ExploreOptions};
use crate::config::AmyPetConfig;
use crate::convert::Dcm2niix;
use crate::defs::Tracer;
use crate::error::{AmyPetError, Result};
use crate::static_image::StaticOptions;
use crate::suvr::{voi_process, SuvrOptions, SuvrResult};

pub const REPORT_FILE: &str = "amypet_report.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub input: PathBuf,
    pub outpath: PathBuf,
    /// Description of the processed series
    pub series: String,
    pub classification: Classification,
    pub alignment: AlignResult,
    pub suvr: SuvrResult,
    pub centiloid: Option<CentiloidResult>,
}

/// Options of the SUVr stage derived from the configuration
pub fn suvr_options(config: &AmyPetConfig, outpath: Option<PathBuf>) -> SuvrOptions {
    let reg = &config.registration;
    SuvrOptions {
        vois: config.vois.clone(),
        ref_vois: config.reference_vois(),
        outpath,
        save_voi_masks: config.save_voi_masks,
        qc: config.qc,
        t1_bias_correction: config.t1_bias_correction,
        registration: reg.params(reg.fwhm_pet, reg.fwhm_mri, true),
        reg_fresh: config.reg_fresh,
        trim: config.trim.clone(),
        static_options: StaticOptions {
            com_correction: config.com_correction,
            dcm2niix: Dcm2niix::new(config.dcm2niix.clone()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Centiloid from the VOI results, when the tracer and both VOIs are known
pub fn centiloid_from_vois(config: &AmyPetConfig, tracer: Option<Tracer>, suvr: &SuvrResult) -> Option<CentiloidResult> {
    let tracer = tracer?;
    let Some(values) = suvr.suvr.get(&config.centiloid_ref) else {
        warn!(reference = %config.centiloid_ref, "Centiloid reference VOI not processed");
        return None;
    };
    let Some(&value) = values.values.get(&config.target_voi) else {
        warn!(target = %config.target_voi, "Centiloid target VOI not defined");
        return None;
    };
    let cl = centiloid(tracer, value);
    info!(%tracer, suvr = value, centiloid = cl, "Centiloid");
    Some(CentiloidResult { tracer, suvr: value, centiloid: cl })
}

/// Run the full pipeline on a folder of PET series
///
/// `progress(done, total)` follows the pairwise frame registrations.
#[instrument(skip(config, progress), fields(input = %input.display()))]
pub fn run_pipeline<F>(input: &Path, t1w: &Path, labels: &Path, config: &AmyPetConfig, progress: F) -> Result<PipelineReport>
where
    F: FnMut(usize, usize) + Send,
{
    let explore = explore_input(
        input,
        &ExploreOptions {
            tracer: config.tracer,
            suvr_window: config.suvr_window,
            outpath: config.output.clone(),
            dcm2niix: Dcm2niix::new(config.dcm2niix.clone()),
        },
    )?;

    let (series, classification) = explore.first_static_suvr().ok_or_else(|| {
        AmyPetError::Classification(format!(
            "no static SUVr series among the {} found in '{}'",
            explore.series.len(),
            input.display()
        ))
    })?;
    info!(series = %series.description, frames = ?classification.frames, "selected series for SUVr");

    let reg = &config.registration;
    let alignment = align_suvr(
        series,
        &classification.frames,
        &AlignOptions {
            outpath: Some(explore.outpath.clone()),
            cost: reg.cost,
            force: config.force_align,
            fwhm: reg.align_fwhm,
            registration: reg.params(reg.align_fwhm, reg.align_fwhm, false),
        },
        progress,
    )?;

    // The aligned image holds exactly the selected frames
    let options = suvr_options(config, Some(explore.outpath.clone()));
    let suvr = voi_process(&alignment.fpet, labels, t1w, &options)?;

    let tracer = config.tracer.or_else(|| classification.tracers.first().copied());
    let centiloid = centiloid_from_vois(config, tracer, &suvr);

    let report = PipelineReport {
        input: input.to_path_buf(),
        outpath: explore.outpath.clone(),
        series: series.description.clone(),
        classification: classification.clone(),
        alignment,
        suvr,
        centiloid,
    };
    let freport = explore.outpath.join(REPORT_FILE);
    std::fs::write(&freport, serde_json::to_string_pretty(&report)?)?;
    info!(file = %freport.display(), "saved report");
    Ok(report)
}
