//! Point-spread-function kernels used by the deconvolver.

use std::f64::consts::PI;

use imgref::{ImgRef, ImgVec};

use crate::Error;
use crate::convolve::filter2d;
use crate::filters::Interpolation;
use crate::resample::resize;

/// Edge length of the impulse image the simulated PSF starts from.
const IMPULSE_SIZE: usize = 5;

/// A square PSF whose entries sum to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    size: usize,
    weights: Vec<f32>,
}

impl Kernel {
    /// Build a kernel from row-major weights, renormalizing them to sum 1.
    pub fn from_weights(size: usize, weights: Vec<f32>) -> Result<Self, Error> {
        if size == 0 || weights.len() != size * size {
            return Err(Error::InvalidKernel(format!(
                "expected {size}x{size} weights, got {}",
                weights.len()
            )));
        }
        let sum: f64 = weights.iter().map(|&w| w as f64).sum();
        if !sum.is_finite() || sum <= 0.0 {
            return Err(Error::InvalidKernel(format!("kernel sum {sum} is not positive")));
        }
        let weights = weights.into_iter().map(|w| (w as f64 / sum) as f32).collect();
        Ok(Self { size, weights })
    }

    /// Sampled 2D Gaussian centred in a `size × size` matrix.
    pub fn analytic(size: usize, sigma: f64) -> Result<Self, Error> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(Error::InvalidKernel(format!("sigma must be positive, got {sigma}")));
        }
        let center = (size as f64 - 1.0) / 2.0;
        let two_sigma2 = 2.0 * sigma * sigma;
        let mut weights = Vec::with_capacity(size * size);
        for y in 0..size {
            for x in 0..size {
                let dx = x as f64 - center;
                let dy = y as f64 - center;
                let v = (-(dx * dx + dy * dy) / two_sigma2).exp() / (PI * two_sigma2);
                weights.push(v as f32);
            }
        }
        Self::from_weights(size, weights)
    }

    /// Blur that a point light source picks up when it is sampled by the
    /// sensor and then upscaled by `scale_factor`.
    ///
    /// A centred impulse is upscaled with `interpolation`, box-filtered over
    /// one source pixel's footprint (`scale_factor²` output pixels), then
    /// renormalized.
    pub fn simulated(scale_factor: u32, interpolation: Interpolation) -> Result<Self, Error> {
        if scale_factor == 0 {
            return Err(Error::InvalidKernel("scale factor must be at least 1".into()));
        }
        let s = scale_factor as usize;

        let mut impulse = vec![0.0f32; IMPULSE_SIZE * IMPULSE_SIZE];
        let center = (IMPULSE_SIZE - 1) / 2;
        impulse[center * IMPULSE_SIZE + center] = 1.0;
        let impulse = ImgVec::new(impulse, IMPULSE_SIZE, IMPULSE_SIZE);

        let size = IMPULSE_SIZE * s;
        let upscaled = resize(impulse.as_ref(), size, size, interpolation);

        let box_kernel = Self::from_weights(s, vec![1.0; s * s])?;
        let blurred = filter2d(upscaled.as_ref(), &box_kernel);

        Self::from_weights(size, blurred.into_buf())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Row-major weights.
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.weights[y * self.size + x]
    }

    pub fn sum(&self) -> f64 {
        self.weights.iter().map(|&w| w as f64).sum()
    }

    /// The kernel rotated by 180°.
    pub fn flipped(&self) -> Self {
        Self {
            size: self.size,
            weights: self.weights.iter().rev().copied().collect(),
        }
    }

    pub fn as_image(&self) -> ImgRef<'_, f32> {
        ImgRef::new(&self.weights[..], self.size, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_psf_sums_to_one() {
        for scale in 1..=4 {
            for interp in Interpolation::all() {
                let k = Kernel::simulated(scale, *interp).unwrap();
                assert_eq!(k.size(), 5 * scale as usize);
                assert!(
                    (k.sum() - 1.0).abs() < 1e-5,
                    "scale {scale} {interp}: sum {}",
                    k.sum()
                );
            }
        }
    }

    #[test]
    fn simulated_psf_peaks_near_centre() {
        let k = Kernel::simulated(3, Interpolation::Bilinear).unwrap();
        let (mut best, mut at) = (f32::MIN, (0, 0));
        for y in 0..k.size() {
            for x in 0..k.size() {
                if k.get(x, y) > best {
                    best = k.get(x, y);
                    at = (x, y);
                }
            }
        }
        let c = k.size() / 2;
        assert!(at.0.abs_diff(c) <= 1 && at.1.abs_diff(c) <= 1, "peak at {at:?}");
    }

    #[test]
    fn analytic_psf_is_normalized_and_symmetric() {
        let k = Kernel::analytic(5, 0.8).unwrap();
        assert!((k.sum() - 1.0).abs() < 1e-6);
        assert_eq!(k.flipped(), k);
        assert!(k.get(2, 2) > k.get(1, 2));
        assert!((k.get(0, 1) - k.get(1, 0)).abs() < 1e-9);
        let img = k.as_image();
        assert_eq!((img.width(), img.height()), (5, 5));
        assert_eq!(img.buf()[12], k.get(2, 2));
    }

    #[test]
    fn flip_rotates_half_turn() {
        let k = Kernel::from_weights(2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let f = k.flipped();
        assert_eq!(f.get(0, 0), k.get(1, 1));
        assert_eq!(f.get(1, 0), k.get(0, 1));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(Kernel::from_weights(3, vec![1.0; 4]).is_err());
        assert!(Kernel::from_weights(2, vec![0.0; 4]).is_err());
        assert!(Kernel::analytic(5, 0.0).is_err());
        assert!(Kernel::simulated(0, Interpolation::Lanczos4).is_err());
    }
}
