//! Amyloid tracer definitions and acquisition timing constants
//!
//! All times are in seconds relative to the radiopharmaceutical
//! administration start (injection time).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AmyPetError;

/// Relative tolerance applied to all timing comparisons
pub const MARGIN: f64 = 0.1;

/// Target break time of the coffee-break protocol
pub const BREAK_TIME: f64 = 1800.0;

/// Window in which the early dynamic (coffee-break) acquisition must end: (lower, upper]
pub const BREAKDYN_WINDOW: (f64, f64) = (1200.0, 2400.0);

/// Minimum end time of a full dynamic acquisition
pub const FULLDYN_TIME: f64 = 3600.0;

/// Amyloid PET radiotracers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tracer {
    /// [18F]flutemetamol
    Flute,
    /// [18F]florbetaben
    Fbb,
    /// [18F]florbetapir
    Fbp,
}

/// SUVr time window post injection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuvrWindow {
    pub start: f64,
    pub stop: f64,
}

impl SuvrWindow {
    pub fn new(start: f64, stop: f64) -> Self {
        Self { start, stop }
    }

    pub fn duration(&self) -> f64 {
        self.stop - self.start
    }

    /// True if [first_start, last_stop] lies inside the window, within the margin
    pub fn covered_by(&self, first_start: f64, last_stop: f64) -> bool {
        first_start > self.start * (1.0 - MARGIN) && last_stop < self.stop * (1.0 + MARGIN)
    }
}

impl Tracer {
    /// Definition order; later matches take precedence in name detection
    pub const ALL: [Tracer; 3] = [Tracer::Flute, Tracer::Fbb, Tracer::Fbp];

    pub fn key(&self) -> &'static str {
        match self {
            Tracer::Flute => "flute",
            Tracer::Fbb => "fbb",
            Tracer::Fbp => "fbp",
        }
    }

    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Tracer::Flute => &["flt", "flut", "flute", "flutemetamol"],
            Tracer::Fbb => &["fbb", "florbetaben"],
            Tracer::Fbp => &["fbp", "florbetapir"],
        }
    }

    /// Default SUVr window for the tracer
    pub fn suvr_window(&self) -> SuvrWindow {
        match self {
            Tracer::Flute | Tracer::Fbb => SuvrWindow::new(90.0 * 60.0, 110.0 * 60.0),
            Tracer::Fbp => SuvrWindow::new(50.0 * 60.0, 60.0 * 60.0),
        }
    }

    /// Expected duration of the static SUVr acquisition
    pub fn static_duration(&self) -> f64 {
        match self {
            Tracer::Flute | Tracer::Fbb => 1200.0,
            Tracer::Fbp => 600.0,
        }
    }

    /// Detect the tracer from free text (e.g. the DICOM radiopharmaceutical field)
    ///
    /// Case insensitive substring match against the aliases; when several
    /// tracers match, the last one in definition order is returned.
    pub fn detect(text: &str) -> Option<Tracer> {
        let text = text.to_lowercase();
        let mut found = None;
        for tracer in Tracer::ALL {
            if tracer.aliases().iter().any(|a| text.contains(a)) {
                found = Some(tracer);
            }
        }
        found
    }
}

impl fmt::Display for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Tracer {
    type Err = AmyPetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Tracer::ALL
            .into_iter()
            .find(|t| t.aliases().contains(&lower.as_str()))
            .ok_or_else(|| {
                AmyPetError::Config(format!(
                    "unknown tracer '{}' (expected one of: flute, fbb, fbp)",
                    s
                ))
            })
    }
}
