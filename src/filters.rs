use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Resampling kernel family used for upscaling, warping and PSF simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Nearest,
    Bilinear,
    Bicubic,
    Lanczos3,
    #[default]
    Lanczos4,
}

impl Interpolation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Bilinear => "bilinear",
            Self::Bicubic => "bicubic",
            Self::Lanczos3 => "lanczos3",
            Self::Lanczos4 => "lanczos4",
        }
    }

    /// Radius (in source pixels) outside of which the filter is zero.
    pub fn support(&self) -> f64 {
        match self {
            Self::Nearest => 0.5,
            Self::Bilinear => 1.0,
            Self::Bicubic => 2.0,
            Self::Lanczos3 => 3.0,
            Self::Lanczos4 => 4.0,
        }
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        match self {
            Self::Nearest => box_filter(x),
            Self::Bilinear => triangle(x),
            // Catmull-Rom
            Self::Bicubic => cubic(x, 0.0, 0.5),
            Self::Lanczos3 => lanczos(x, 3),
            Self::Lanczos4 => lanczos(x, 4),
        }
    }

    pub fn all() -> &'static [Interpolation] {
        &[
            Interpolation::Nearest,
            Interpolation::Bilinear,
            Interpolation::Bicubic,
            Interpolation::Lanczos3,
            Interpolation::Lanczos4,
        ]
    }
}

impl std::fmt::Display for Interpolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Interpolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|f| f.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown interpolation '{s}'"))
    }
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-10 {
        1.0
    } else {
        let px = PI * x;
        px.sin() / px
    }
}

fn box_filter(x: f64) -> f64 {
    let ax = x.abs();
    if ax < 0.5 {
        1.0
    } else if (ax - 0.5).abs() < 1e-10 {
        0.5
    } else {
        0.0
    }
}

fn triangle(x: f64) -> f64 {
    let ax = x.abs();
    if ax < 1.0 { 1.0 - ax } else { 0.0 }
}

/// Mitchell-Netravali family; (B, C) = (0, 0.5) is Catmull-Rom.
fn cubic(x: f64, b: f64, c: f64) -> f64 {
    let ax = x.abs();
    if ax < 1.0 {
        ((12.0 - 9.0 * b - 6.0 * c) * ax * ax * ax
            + (-18.0 + 12.0 * b + 6.0 * c) * ax * ax
            + (6.0 - 2.0 * b))
            / 6.0
    } else if ax < 2.0 {
        ((-b - 6.0 * c) * ax * ax * ax
            + (6.0 * b + 30.0 * c) * ax * ax
            + (-12.0 * b - 48.0 * c) * ax
            + (8.0 * b + 24.0 * c))
            / 6.0
    } else {
        0.0
    }
}

fn lanczos(x: f64, n: u32) -> f64 {
    let ax = x.abs();
    if ax < n as f64 {
        sinc(x) * sinc(x / n as f64)
    } else {
        0.0
    }
}
