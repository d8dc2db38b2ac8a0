//! Rigid-body transforms and 4x4 affine helpers
//!
//! A [`RigidTransform`] maps world coordinates (mm) of a reference image to
//! world coordinates of a floating image: `x_flo = M * x_ref`, with
//! `M = T * Rx * Ry * Rz`.

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AmyPetError, Result};
use crate::nifti_io::{Affine, IDENTITY};

/// Multiply two row-major 4x4 matrices
pub fn mat_mul(a: &Affine, b: &Affine) -> Affine {
    let mut out = [0.0; 16];
    for r in 0..4 {
        for c in 0..4 {
            out[r * 4 + c] = (0..4).map(|k| a[r * 4 + k] * b[k * 4 + c]).sum();
        }
    }
    out
}

/// Apply a 4x4 matrix to a 3D point
#[inline]
pub fn apply(m: &Affine, p: [f64; 3]) -> [f64; 3] {
    [
        m[0] * p[0] + m[1] * p[1] + m[2] * p[2] + m[3],
        m[4] * p[0] + m[5] * p[1] + m[6] * p[2] + m[7],
        m[8] * p[0] + m[9] * p[1] + m[10] * p[2] + m[11],
    ]
}

/// Invert an affine matrix (last row assumed [0 0 0 1])
pub fn mat_inv(m: &Affine) -> Result<Affine> {
    let (a, b, c) = (m[0], m[1], m[2]);
    let (d, e, f) = (m[4], m[5], m[6]);
    let (g, h, i) = (m[8], m[9], m[10]);

    let det = a * (e * i - f * h) - b * (d * i - f * g) + c * (d * h - e * g);
    if det.abs() < 1e-12 {
        return Err(AmyPetError::Registration("singular affine matrix".into()));
    }
    let inv_det = 1.0 / det;

    let r = [
        (e * i - f * h) * inv_det,
        (c * h - b * i) * inv_det,
        (b * f - c * e) * inv_det,
        (f * g - d * i) * inv_det,
        (a * i - c * g) * inv_det,
        (c * d - a * f) * inv_det,
        (d * h - e * g) * inv_det,
        (b * g - a * h) * inv_det,
        (a * e - b * d) * inv_det,
    ];
    let t = [m[3], m[7], m[11]];
    let tx = -(r[0] * t[0] + r[1] * t[1] + r[2] * t[2]);
    let ty = -(r[3] * t[0] + r[4] * t[1] + r[5] * t[2]);
    let tz = -(r[6] * t[0] + r[7] * t[1] + r[8] * t[2]);

    Ok([
        r[0], r[1], r[2], tx,
        r[3], r[4], r[5], ty,
        r[6], r[7], r[8], tz,
        0.0, 0.0, 0.0, 1.0,
    ])
}

/// Six-parameter rigid-body transform
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RigidTransform {
    /// Translations along x, y, z in mm
    pub translations: [f64; 3],
    /// Rotations about x, y, z in radians
    pub rotations: [f64; 3],
}

impl RigidTransform {
    pub fn identity() -> Self {
        Self::default()
    }

    /// Build from the parameter vector [tx, ty, tz, rx, ry, rz]
    pub fn from_params(p: &[f64; 6]) -> Self {
        Self {
            translations: [p[0], p[1], p[2]],
            rotations: [p[3], p[4], p[5]],
        }
    }

    pub fn params(&self) -> [f64; 6] {
        let t = self.translations;
        let r = self.rotations;
        [t[0], t[1], t[2], r[0], r[1], r[2]]
    }

    /// Matrix form T * Rx * Ry * Rz
    pub fn matrix(&self) -> Affine {
        let [tx, ty, tz] = self.translations;
        let [rx, ry, rz] = self.rotations;

        let t = [
            1.0, 0.0, 0.0, tx,
            0.0, 1.0, 0.0, ty,
            0.0, 0.0, 1.0, tz,
            0.0, 0.0, 0.0, 1.0,
        ];
        let (sx, cx) = rx.sin_cos();
        let r1 = [
            1.0, 0.0, 0.0, 0.0,
            0.0, cx, sx, 0.0,
            0.0, -sx, cx, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        let (sy, cy) = ry.sin_cos();
        let r2 = [
            cy, 0.0, sy, 0.0,
            0.0, 1.0, 0.0, 0.0,
            -sy, 0.0, cy, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        let (sz, cz) = rz.sin_cos();
        let r3 = [
            cz, sz, 0.0, 0.0,
            -sz, cz, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];

        mat_mul(&t, &mat_mul(&r1, &mat_mul(&r2, &r3)))
    }

    /// Rotation magnitude in degrees (L2 norm) plus translation magnitude in mm
    pub fn motion_metric(&self) -> f64 {
        let rot = self
            .rotations
            .iter()
            .map(|r| (r.to_degrees()).powi(2))
            .sum::<f64>()
            .sqrt();
        let trn = self.translations.iter().map(|t| t * t).sum::<f64>().sqrt();
        rot + trn
    }
}

/// Write a 4x4 matrix as four whitespace separated rows
pub fn save_affine(path: &Path, m: &Affine) -> Result<()> {
    let mut text = String::new();
    for r in 0..4 {
        let row: Vec<String> = (0..4).map(|c| format!("{:.10e}", m[r * 4 + c])).collect();
        let _ = writeln!(text, "{}", row.join(" "));
    }
    std::fs::write(path, text)?;
    Ok(())
}

/// Read a 4x4 matrix written by [`save_affine`]
pub fn load_affine(path: &Path) -> Result<Affine> {
    let text = std::fs::read_to_string(path)?;
    let values: Vec<f64> = text
        .split_whitespace()
        .map(|v| v.parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| AmyPetError::Registration(format!("invalid affine file '{}': {}", path.display(), e)))?;
    if values.len() != 16 {
        return Err(AmyPetError::Registration(format!(
            "affine file '{}' holds {} values, expected 16",
            path.display(),
            values.len()
        )));
    }
    let mut m = IDENTITY;
    m.copy_from_slice(&values);
    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &Affine, b: &Affine, tol: f64) {
        for i in 0..16 {
            assert!((a[i] - b[i]).abs() < tol, "element {}: {} vs {}", i, a[i], b[i]);
        }
    }

    #[test]
    fn test_identity_matrix() {
        assert_close(&RigidTransform::identity().matrix(), &IDENTITY, 1e-12);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = RigidTransform::from_params(&[3.0, -2.0, 5.0, 0.1, -0.05, 0.2]);
        let m = t.matrix();
        let inv = mat_inv(&m).unwrap();
        assert_close(&mat_mul(&m, &inv), &IDENTITY, 1e-10);
    }

    #[test]
    fn test_apply_translation() {
        let t = RigidTransform::from_params(&[1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        let p = apply(&t.matrix(), [10.0, 10.0, 10.0]);
        assert_eq!(p, [11.0, 12.0, 13.0]);
    }

    #[test]
    fn test_rotation_preserves_distance() {
        let t = RigidTransform::from_params(&[0.0, 0.0, 0.0, 0.3, 0.2, -0.4]);
        let p = apply(&t.matrix(), [3.0, 4.0, 12.0]);
        let norm = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
        assert!((norm - 13.0).abs() < 1e-10);
    }

    #[test]
    fn test_motion_metric() {
        let t = RigidTransform {
            translations: [3.0, 4.0, 0.0],
            rotations: [1.0f64.to_radians(), 0.0, 0.0],
        };
        assert!((t.motion_metric() - 6.0).abs() < 1e-10);
    }

    #[test]
    fn test_singular_matrix() {
        assert!(mat_inv(&[0.0; 16]).is_err());
    }

    #[test]
    fn test_affine_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("affine.txt");
        let m = RigidTransform::from_params(&[1.5, -0.5, 2.0, 0.01, 0.02, 0.03]).matrix();
        save_affine(&path, &m).unwrap();
        assert_close(&load_affine(&path).unwrap(), &m, 1e-9);
    }
}
