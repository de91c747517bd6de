//! 2D discrete Fourier transform helpers and FFT-backed correlation.
//!
//! The deconvolver works in the spatial domain; these helpers exist for
//! phase correlation during registration and for callers that want to
//! correlate with large kernels.

use imgref::{ImgRef, ImgVec};
use rayon::prelude::*;
use rustfft::{FftDirection, FftPlanner, num_complex::Complex};

use crate::convolve::reflect_101;
use crate::kernel::Kernel;

pub type Spectrum = ImgVec<Complex<f32>>;

fn transform_rows(data: &mut [Complex<f32>], width: usize, direction: FftDirection) {
    let fft = FftPlanner::<f32>::new().plan_fft(width, direction);
    data.par_chunks_mut(width).for_each(|row| fft.process(row));
}

fn transpose(data: &[Complex<f32>], width: usize, height: usize) -> Vec<Complex<f32>> {
    let mut out = vec![Complex::new(0.0, 0.0); data.len()];
    for y in 0..height {
        for x in 0..width {
            out[x * height + y] = data[y * width + x];
        }
    }
    out
}

fn transform_2d(
    mut data: Vec<Complex<f32>>,
    width: usize,
    height: usize,
    direction: FftDirection,
) -> Vec<Complex<f32>> {
    transform_rows(&mut data, width, direction);
    let mut cols = transpose(&data, width, height);
    transform_rows(&mut cols, height, direction);
    transpose(&cols, height, width)
}

/// Forward 2D DFT of a real image. No scaling.
pub fn forward_dft(img: ImgRef<'_, f32>) -> Spectrum {
    let (w, h) = (img.width(), img.height());
    let data = img.pixels().map(|v| Complex::new(v, 0.0)).collect();
    ImgVec::new(transform_2d(data, w, h, FftDirection::Forward), w, h)
}

/// Inverse 2D DFT, scaled by `1 / (w·h)`, keeping the real part.
pub fn inverse_dft(spectrum: ImgRef<'_, Complex<f32>>) -> ImgVec<f32> {
    let (w, h) = (spectrum.width(), spectrum.height());
    let data = transform_2d(spectrum.pixels().collect(), w, h, FftDirection::Inverse);
    let scale = 1.0 / (w * h) as f32;
    ImgVec::new(data.into_iter().map(|c| c.re * scale).collect(), w, h)
}

/// Same result as [`crate::convolve::filter2d`] on a single channel,
/// computed through the frequency domain.
pub fn fft_filter2d(src: ImgRef<'_, f32>, kernel: &Kernel) -> ImgVec<f32> {
    let (w, h) = (src.width(), src.height());
    let size = kernel.size();
    let anchor = (size / 2) as isize;
    let (pw, ph) = (w + size - 1, h + size - 1);

    let mut padded = vec![0.0f32; pw * ph];
    for (y, row) in padded.chunks_mut(pw).enumerate() {
        let sy = reflect_101(y as isize - anchor, h);
        let src_row = &src.buf()[sy * src.stride()..][..w];
        for (x, v) in row.iter_mut().enumerate() {
            *v = src_row[reflect_101(x as isize - anchor, w)];
        }
    }

    let mut kpad = vec![0.0f32; pw * ph];
    for y in 0..size {
        for x in 0..size {
            kpad[y * pw + x] = kernel.get(x, y);
        }
    }

    let image_spectrum = forward_dft(ImgRef::new(&padded[..], pw, ph));
    let kernel_spectrum = forward_dft(ImgRef::new(&kpad[..], pw, ph));
    // Correlation theorem: conjugate the kernel spectrum.
    let product: Vec<Complex<f32>> = image_spectrum
        .pixels()
        .zip(kernel_spectrum.pixels())
        .map(|(a, k)| a * k.conj())
        .collect();
    let full = inverse_dft(ImgRef::new(&product[..], pw, ph));

    let mut out = Vec::with_capacity(w * h);
    for row in full.rows().take(h) {
        out.extend_from_slice(&row[..w]);
    }
    ImgVec::new(out, w, h)
}
