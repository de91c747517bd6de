//! Richardson-Lucy deconvolution of an accumulated tile.
//!
//! Each iteration re-blurs the current estimate, divides the observation by
//! it and multiplies the estimate by the back-projected ratio:
//!
//! ```text
//! blur       = filter2d(x, flip(K))
//! correction = filter2d(y / blur, K)
//! x          = x · correction
//! ```
//!
//! The guarded variant zeroes the ratio wherever the re-blurred estimate is
//! under [`GUARD_EPSILON`], which keeps dark or empty regions finite. The
//! unguarded variant divides unconditionally and can produce NaN there.

use imgref::{ImgRef, ImgVec};
use log::trace;
use serde::{Deserialize, Serialize};

use crate::convolve::filter2d;
use crate::kernel::Kernel;
use crate::pixel::Sample;

/// Re-blurred values below this get a zero correction in the guarded variant.
pub const GUARD_EPSILON: f32 = 1e-2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeconvVariant {
    #[default]
    Guarded,
    Unguarded,
}

/// An in-progress deconvolution. Call [`step`](Self::step) to run one
/// iteration, or [`run`](Self::run) for a fixed count.
pub struct RichardsonLucy<'k, P> {
    observed: ImgVec<P>,
    estimate: ImgVec<P>,
    kernel: &'k Kernel,
    flipped: Kernel,
    variant: DeconvVariant,
    iteration: usize,
}

impl<'k, P: Sample> RichardsonLucy<'k, P> {
    pub fn new(observed: ImgVec<P>, kernel: &'k Kernel, variant: DeconvVariant) -> Self {
        Self {
            estimate: observed.clone(),
            observed,
            kernel,
            flipped: kernel.flipped(),
            variant,
            iteration: 0,
        }
    }

    pub fn step(&mut self) {
        let blur = filter2d(self.estimate.as_ref(), &self.flipped);
        let guarded = self.variant == DeconvVariant::Guarded;
        let ratio: Vec<P> = self
            .observed
            .pixels()
            .zip(blur.pixels())
            .map(|(y, b)| {
                y.zip_map(b, |y, b| if guarded && b < GUARD_EPSILON { 0.0 } else { y / b })
            })
            .collect();
        let ratio = ImgVec::new(ratio, self.observed.width(), self.observed.height());
        let correction = filter2d(ratio.as_ref(), self.kernel);

        for (x, c) in self.estimate.buf_mut().iter_mut().zip(correction.pixels()) {
            *x = x.zip_map(c, |x, c| x * c);
        }
        self.iteration += 1;
    }

    /// Run `iterations` more steps.
    pub fn run(&mut self, iterations: usize) {
        for _ in 0..iterations {
            self.step();
        }
        trace!("deconvolved {} iterations", self.iteration);
    }

    /// Completed iterations.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn estimate(&self) -> ImgRef<'_, P> {
        self.estimate.as_ref()
    }

    pub fn into_estimate(self) -> ImgVec<P> {
        self.estimate
    }
}

/// Deconvolve `observed` with `iterations` Richardson-Lucy steps.
pub fn deconvolve<P: Sample>(
    observed: ImgVec<P>,
    kernel: &Kernel,
    iterations: usize,
    variant: DeconvVariant,
) -> ImgVec<P> {
    let mut rl = RichardsonLucy::new(observed, kernel, variant);
    rl.run(iterations);
    rl.into_estimate()
}
