//! Image processing utilities

pub mod bias_correction;
pub mod com;
pub mod mask;
pub mod smoothing;

pub use bias_correction::{bias_field_correction, BiasCorrectionParams};
pub use com::{centre_mass_correction, centre_of_mass};
pub use mask::sphere_mask;
pub use smoothing::{gaussian_smooth, smooth_fwhm};

/// Replace every character that is not alphanumeric, '-' or '_' with '_'
///
/// Used to derive file names from series descriptions.
pub fn clean_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("Brain PET (AC) 20min"), "Brain_PET__AC__20min");
        assert_eq!(clean_name("frame-01_a"), "frame-01_a");
    }
}
