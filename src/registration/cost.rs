//! Similarity measures for intensity-based registration

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AmyPetError;

/// Number of intensity bins per image in the joint histogram
pub const HIST_BINS: usize = 64;

/// Registration cost function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostFunction {
    /// Mutual information
    Mi,
    /// Normalised mutual information
    #[default]
    Nmi,
    /// Entropy correlation coefficient
    Ecc,
    /// Normalised cross correlation
    Ncc,
}

impl FromStr for CostFunction {
    type Err = AmyPetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mi" => Ok(CostFunction::Mi),
            "nmi" => Ok(CostFunction::Nmi),
            "ecc" => Ok(CostFunction::Ecc),
            "ncc" => Ok(CostFunction::Ncc),
            other => Err(AmyPetError::Config(format!(
                "unknown cost function '{}' (expected mi, nmi, ecc or ncc)",
                other
            ))),
        }
    }
}

/// Maps intensities onto continuous bin positions in [0, HIST_BINS - 1]
#[derive(Debug, Clone, Copy)]
pub struct Binning {
    min: f64,
    scale: f64,
}

impl Binning {
    pub fn from_data(data: &[f64]) -> Self {
        let (min, max) = data
            .iter()
            .filter(|v| v.is_finite())
            .fold((f64::MAX, f64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = max - min;
        let scale = if range > 0.0 && range.is_finite() {
            (HIST_BINS - 1) as f64 / range
        } else {
            0.0
        };
        Self { min: if min.is_finite() { min } else { 0.0 }, scale }
    }

    #[inline]
    pub fn position(&self, v: f64) -> f64 {
        ((v - self.min) * self.scale).clamp(0.0, (HIST_BINS - 1) as f64)
    }
}

/// Joint intensity statistics of overlapping samples
pub struct JointHistogram {
    counts: Vec<f64>,
    total: f64,
    // Moments for cross correlation
    sa: f64,
    sb: f64,
    saa: f64,
    sbb: f64,
    sab: f64,
}

impl JointHistogram {
    pub fn new() -> Self {
        Self {
            counts: vec![0.0; HIST_BINS * HIST_BINS],
            total: 0.0,
            sa: 0.0,
            sb: 0.0,
            saa: 0.0,
            sbb: 0.0,
            sab: 0.0,
        }
    }

    /// Add a sample; `b` is spread linearly over its two nearest bins
    #[inline]
    pub fn add(&mut self, a_bin: usize, b_pos: f64, a: f64, b: f64) {
        let b0 = b_pos.floor() as usize;
        let fb = b_pos - b0 as f64;
        let row = a_bin * HIST_BINS;
        self.counts[row + b0] += 1.0 - fb;
        if fb > 0.0 && b0 + 1 < HIST_BINS {
            self.counts[row + b0 + 1] += fb;
        }
        self.total += 1.0;

        self.sa += a;
        self.sb += b;
        self.saa += a * a;
        self.sbb += b * b;
        self.sab += a * b;
    }

    pub fn samples(&self) -> f64 {
        self.total
    }

    /// Marginal and joint entropies (H(A), H(B), H(A,B))
    fn entropies(&self) -> (f64, f64, f64) {
        let n: f64 = self.counts.iter().sum();
        if n <= 0.0 {
            return (0.0, 0.0, 0.0);
        }
        let mut pa = vec![0.0; HIST_BINS];
        let mut pb = vec![0.0; HIST_BINS];
        let mut hab = 0.0;
        for a in 0..HIST_BINS {
            for b in 0..HIST_BINS {
                let p = self.counts[a * HIST_BINS + b] / n;
                if p > 0.0 {
                    hab -= p * p.ln();
                    pa[a] += p;
                    pb[b] += p;
                }
            }
        }
        let h = |ps: &[f64]| -> f64 { ps.iter().filter(|&&p| p > 0.0).map(|p| -p * p.ln()).sum() };
        (h(&pa), h(&pb), hab)
    }

    fn correlation(&self) -> f64 {
        let n = self.total;
        if n < 2.0 {
            return 0.0;
        }
        let cov = n * self.sab - self.sa * self.sb;
        let var = (n * self.saa - self.sa * self.sa) * (n * self.sbb - self.sb * self.sb);
        if var <= 0.0 {
            return 0.0;
        }
        cov / var.sqrt()
    }

    /// Similarity value; larger means better aligned
    pub fn similarity(&self, cost: CostFunction) -> f64 {
        match cost {
            CostFunction::Ncc => self.correlation(),
            _ => {
                let (ha, hb, hab) = self.entropies();
                match cost {
                    CostFunction::Mi => ha + hb - hab,
                    CostFunction::Nmi => {
                        if hab > 0.0 { (ha + hb) / hab } else { 0.0 }
                    }
                    _ => {
                        if ha + hb > 0.0 { 2.0 * (ha + hb - hab) / (ha + hb) } else { 0.0 }
                    }
                }
            }
        }
    }
}

impl Default for JointHistogram {
    fn default() -> Self {
        Self::new()
    }
}
