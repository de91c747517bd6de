//! Pixel arithmetic shared by the resampling, convolution and fusion code.

use imgref::{ImgRef, ImgVec};
use rgb::RGB;

/// Three-channel floating point pixel, 0..=255 scale.
pub type Rgbf = RGB<f32>;

/// A colour frame (or tile) of [`Rgbf`] pixels.
pub type Frame = ImgVec<Rgbf>;

/// A value that can be weighted and summed: a single channel or an RGB triple.
pub trait Sample: Copy + Send + Sync + 'static {
    const ZERO: Self;

    fn scaled(self, weight: f32) -> Self;

    fn plus(self, other: Self) -> Self;

    /// Combine two samples channel by channel.
    fn zip_map(self, other: Self, f: impl Fn(f32, f32) -> f32) -> Self;
}

impl Sample for f32 {
    const ZERO: Self = 0.0;

    #[inline]
    fn scaled(self, weight: f32) -> Self {
        self * weight
    }

    #[inline]
    fn plus(self, other: Self) -> Self {
        self + other
    }

    #[inline]
    fn zip_map(self, other: Self, f: impl Fn(f32, f32) -> f32) -> Self {
        f(self, other)
    }
}

impl Sample for Rgbf {
    const ZERO: Self = RGB { r: 0.0, g: 0.0, b: 0.0 };

    #[inline]
    fn scaled(self, weight: f32) -> Self {
        RGB::new(self.r * weight, self.g * weight, self.b * weight)
    }

    #[inline]
    fn plus(self, other: Self) -> Self {
        RGB::new(self.r + other.r, self.g + other.g, self.b + other.b)
    }

    #[inline]
    fn zip_map(self, other: Self, f: impl Fn(f32, f32) -> f32) -> Self {
        RGB::new(f(self.r, other.r), f(self.g, other.g), f(self.b, other.b))
    }
}

/// Rec. 601 luma, used only for registration.
#[inline]
pub fn luma(p: Rgbf) -> f32 {
    0.299 * p.r + 0.587 * p.g + 0.114 * p.b
}

pub fn to_luma(img: ImgRef<'_, Rgbf>) -> ImgVec<f32> {
    let buf = img.pixels().map(luma).collect();
    ImgVec::new(buf, img.width(), img.height())
}

/// Copy a (possibly strided) view into a tightly packed image.
pub fn to_owned<P: Copy>(img: ImgRef<'_, P>) -> ImgVec<P> {
    ImgVec::new(img.pixels().collect(), img.width(), img.height())
}
