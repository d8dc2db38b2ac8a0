//! Centiloid conversion of SUVr values
//!
//! Each tracer has a linear calibration from whole-cerebellum referenced
//! neocortical SUVr to the Centiloid scale. A generic calibration from the
//! young-control and typical-AD anchor SUVr values is also provided.

use serde::{Deserialize, Serialize};

use crate::defs::Tracer;
use crate::error::{AmyPetError, Result};

/// Linear calibration `CL = slope * SUVr + intercept`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub slope: f64,
    pub intercept: f64,
}

impl Calibration {
    /// Calibration from the anchor SUVr values of young controls (0 CL)
    /// and typical AD patients (100 CL)
    pub fn from_anchors(suvr_yc: f64, suvr_ad: f64) -> Result<Self> {
        let range = suvr_ad - suvr_yc;
        if !(range.abs() > f64::EPSILON) || !range.is_finite() {
            return Err(AmyPetError::Config(format!(
                "anchor SUVr values must differ (young control {}, AD {})",
                suvr_yc, suvr_ad
            )));
        }
        let slope = 100.0 / range;
        Ok(Self { slope, intercept: -slope * suvr_yc })
    }

    pub fn apply(&self, suvr: f64) -> f64 {
        self.slope * suvr + self.intercept
    }

    /// Inverse mapping, Centiloid to SUVr
    pub fn suvr(&self, cl: f64) -> f64 {
        (cl - self.intercept) / self.slope
    }
}

impl Tracer {
    /// Published whole-cerebellum calibration of the tracer
    pub fn calibration(&self) -> Calibration {
        match self {
            Tracer::Flute => Calibration { slope: 121.42, intercept: -121.16 },
            Tracer::Fbb => Calibration { slope: 153.4, intercept: -154.9 },
            Tracer::Fbp => Calibration { slope: 175.4, intercept: -182.3 },
        }
    }
}

/// Centiloid of a whole-cerebellum referenced SUVr
pub fn centiloid(tracer: Tracer, suvr: f64) -> f64 {
    tracer.calibration().apply(suvr)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentiloidResult {
    pub tracer: Tracer,
    pub suvr: f64,
    pub centiloid: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracer_calibrations() {
        assert!((centiloid(Tracer::Flute, 1.0) - 0.26).abs() < 1e-9);
        assert!((centiloid(Tracer::Fbb, 2.0) - 151.9).abs() < 1e-9);
        assert!((centiloid(Tracer::Fbp, 1.5) - 80.8).abs() < 1e-9);
    }

    #[test]
    fn test_anchor_calibration() {
        let cal = Calibration::from_anchors(1.0, 2.0).unwrap();
        assert!((cal.apply(1.0)).abs() < 1e-12);
        assert!((cal.apply(2.0) - 100.0).abs() < 1e-12);
        assert!((cal.apply(1.5) - 50.0).abs() < 1e-12);
        assert!((cal.suvr(50.0) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_equal_anchors_rejected() {
        assert!(Calibration::from_anchors(1.2, 1.2).is_err());
    }

    #[test]
    fn test_round_trip_through_suvr() {
        let cal = Tracer::Fbb.calibration();
        assert!((cal.suvr(cal.apply(1.37)) - 1.37).abs() < 1e-12);
    }
}
