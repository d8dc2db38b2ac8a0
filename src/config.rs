//! Processing configuration
//!
//! Loaded from YAML, every field defaulted, then layered with environment
//! overrides (`AMYPET_OUTPUT`, `AMYPET_DCM2NIIX`, `AMYPET_TRACER`). Command
//! line flags are applied last by the binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::defs::{SuvrWindow, Tracer};
use crate::error::{AmyPetError, Result};
use crate::registration::{CostFunction, RegistrationParams};
use crate::trim::TrimOptions;
use crate::vois::VoiDefinitions;

pub const ENV_OUTPUT: &str = "AMYPET_OUTPUT";
pub const ENV_DCM2NIIX: &str = "AMYPET_DCM2NIIX";
pub const ENV_TRACER: &str = "AMYPET_TRACER";

/// Registration settings for frame alignment and MR to PET registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub cost: CostFunction,
    /// Smoothing of SUVr frames for their alignment (mm)
    pub align_fwhm: f64,
    /// Smoothing of the PET image for MR registration (mm)
    pub fwhm_pet: f64,
    /// Smoothing of the T1w image for MR registration (mm)
    pub fwhm_mri: f64,
    pub separation: Vec<f64>,
    pub tolerance: f64,
    pub max_evaluations: usize,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        let p = RegistrationParams::default();
        Self {
            cost: CostFunction::Nmi,
            align_fwhm: 8.0,
            fwhm_pet: 0.0,
            fwhm_mri: 0.0,
            separation: p.separation,
            tolerance: p.tolerance,
            max_evaluations: p.max_evaluations,
        }
    }
}

impl RegistrationConfig {
    /// Parameters with the given smoothing
    pub fn params(&self, fwhm_ref: f64, fwhm_flo: f64, init_com: bool) -> RegistrationParams {
        RegistrationParams {
            cost: self.cost,
            fwhm_ref,
            fwhm_flo,
            separation: self.separation.clone(),
            tolerance: self.tolerance,
            max_evaluations: self.max_evaluations,
            init_com,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmyPetConfig {
    pub tracer: Option<Tracer>,
    /// SUVr window override (seconds post injection)
    pub suvr_window: Option<SuvrWindow>,
    pub output: Option<PathBuf>,
    pub dcm2niix: PathBuf,
    pub registration: RegistrationConfig,
    pub trim: TrimOptions,
    /// VOI definitions; one VOI per label when absent
    pub vois: Option<VoiDefinitions>,
    /// Reference VOIs for SUVr
    pub ref_vois: Vec<String>,
    /// VOI used as Centiloid target
    pub target_voi: String,
    /// VOI used as Centiloid reference
    pub centiloid_ref: String,
    pub t1_bias_correction: bool,
    pub com_correction: bool,
    pub save_voi_masks: bool,
    pub qc: bool,
    /// Re-run frame alignment even if results exist
    pub force_align: bool,
    /// Re-run MR to PET registration even if results exist
    pub reg_fresh: bool,
}

impl Default for AmyPetConfig {
    fn default() -> Self {
        Self {
            tracer: None,
            suvr_window: None,
            output: None,
            dcm2niix: PathBuf::from(crate::convert::DCM2NIIX),
            registration: RegistrationConfig::default(),
            trim: TrimOptions::default(),
            vois: None,
            ref_vois: Vec::new(),
            target_voi: "neocx".into(),
            centiloid_ref: "wc".into(),
            t1_bias_correction: true,
            com_correction: true,
            save_voi_masks: false,
            qc: true,
            force_align: false,
            reg_fresh: true,
        }
    }
}

impl AmyPetConfig {
    /// Parse YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: AmyPetConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(w) = &self.suvr_window {
            if !(w.stop > w.start) {
                return Err(AmyPetError::Config(format!(
                    "SUVr window must end after it starts ({} - {} s)",
                    w.start, w.stop
                )));
            }
        }
        if self.registration.separation.iter().any(|&s| !(s > 0.0)) {
            return Err(AmyPetError::Config("registration separations must be positive".into()));
        }
        Ok(())
    }

    /// Apply environment overrides using `lookup` for variable access
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup(ENV_OUTPUT) {
            info!(old = ?self.output, new = %val, "overriding output folder via ENV");
            self.output = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup(ENV_DCM2NIIX) {
            info!(new = %val, "overriding dcm2niix path via ENV");
            self.dcm2niix = PathBuf::from(val);
        }
        if let Some(val) = lookup(ENV_TRACER) {
            let tracer: Tracer = val.parse()?;
            info!(%tracer, "overriding tracer via ENV");
            self.tracer = Some(tracer);
        }
        Ok(())
    }

    /// VOIs used for SUVr; the Centiloid reference is included when defined
    pub fn reference_vois(&self) -> Vec<String> {
        let mut refs = self.ref_vois.clone();
        if let Some(v) = &self.vois {
            if v.contains_key(&self.centiloid_ref) && !refs.contains(&self.centiloid_ref) {
                refs.push(self.centiloid_ref.clone());
            }
        }
        refs
    }
}

/// Load the configuration file (defaults when `None`) and apply the
/// process environment
#[instrument]
pub fn load_config(path: Option<&Path>) -> Result<AmyPetConfig> {
    let mut config = match path {
        Some(p) => {
            info!(path = %p.display(), "loading configuration");
            let text = std::fs::read_to_string(p)
                .map_err(|e| AmyPetError::Config(format!("failed to read '{}': {}", p.display(), e)))?;
            AmyPetConfig::from_yaml(&text)?
        }
        None => AmyPetConfig::default(),
    };
    config.apply_overrides(|k| std::env::var(k).ok())?;
    Ok(config)
}
