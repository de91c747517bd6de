use imgref::{ImgRef, ImgVec};
use rayon::prelude::*;

use crate::filters::Interpolation;
use crate::pixel::Sample;

/// A single weight entry: which source pixel contributes and by how much.
#[derive(Debug, Clone)]
pub struct WeightEntry {
    pub src_pixel: usize,
    pub weight: f32,
}

/// The computed weights for a single output pixel.
#[derive(Debug, Clone)]
pub struct PixelWeights {
    pub entries: Vec<WeightEntry>,
}

/// Compute the pixel weight table for a 1D resize operation.
///
/// For each output pixel, returns the list of source pixels and their
/// normalized weights. Uses clamp edge handling (repeats the edge pixel
/// for out-of-bounds accesses). Upscaling evaluates the filter at unit
/// scale; downscaling widens it by the reduction ratio.
pub fn compute_weights(
    filter: Interpolation,
    src_size: usize,
    dst_size: usize,
) -> Vec<PixelWeights> {
    let scale = dst_size as f64 / src_size as f64;
    let filter_scale = if scale < 1.0 { 1.0 / scale } else { 1.0 };
    let support = filter.support() * filter_scale;

    let mut result = Vec::with_capacity(dst_size);

    for dst_x in 0..dst_size {
        // Center of this output pixel in source coordinates.
        let center = (dst_x as f64 + 0.5) / scale - 0.5;

        let left = (center - support).ceil() as isize;
        let right = (center + support).floor() as isize;

        let mut entries: Vec<(usize, f64)> = Vec::new();
        let mut total = 0.0;

        for src_x in left..=right {
            let clamped = src_x.clamp(0, src_size as isize - 1) as usize;
            let distance = (src_x as f64 - center) / filter_scale;
            let w = filter.evaluate(distance);

            if w.abs() > 1e-12 {
                // Merge with existing entry for same clamped pixel.
                if let Some(existing) = entries.iter_mut().find(|e| e.0 == clamped) {
                    existing.1 += w;
                } else {
                    entries.push((clamped, w));
                }
                total += w;
            }
        }

        // A box filter exactly between two pixels can leave nothing behind.
        if entries.is_empty() {
            let nearest = (center.round() as isize).clamp(0, src_size as isize - 1) as usize;
            entries.push((nearest, 1.0));
            total = 1.0;
        }

        let entries = entries
            .into_iter()
            .map(|(src_pixel, w)| WeightEntry {
                src_pixel,
                weight: (w / total) as f32,
            })
            .collect();

        result.push(PixelWeights { entries });
    }

    result
}

#[inline]
fn apply_weights<P: Sample>(pw: &PixelWeights, fetch: impl Fn(usize) -> P) -> P {
    pw.entries
        .iter()
        .fold(P::ZERO, |acc, e| acc.plus(fetch(e.src_pixel).scaled(e.weight)))
}

/// Separable 2D resize: horizontal pass then vertical pass, rows in parallel.
pub fn resize<P: Sample>(
    src: ImgRef<'_, P>,
    dst_width: usize,
    dst_height: usize,
    filter: Interpolation,
) -> ImgVec<P> {
    let h_weights = compute_weights(filter, src.width(), dst_width);

    let mut temp = vec![P::ZERO; dst_width * src.height()];
    temp.par_chunks_mut(dst_width)
        .zip(src.rows().collect::<Vec<_>>().into_par_iter())
        .for_each(|(dst_row, src_row)| {
            for (out, pw) in dst_row.iter_mut().zip(&h_weights) {
                *out = apply_weights(pw, |i| src_row[i]);
            }
        });

    if dst_height == src.height() {
        return ImgVec::new(temp, dst_width, dst_height);
    }

    let v_weights = compute_weights(filter, src.height(), dst_height);
    let mut result = vec![P::ZERO; dst_width * dst_height];
    result
        .par_chunks_mut(dst_width)
        .zip(v_weights.par_iter())
        .for_each(|(dst_row, pw)| {
            for (x, out) in dst_row.iter_mut().enumerate() {
                *out = apply_weights(pw, |y| temp[y * dst_width + x]);
            }
        });

    ImgVec::new(result, dst_width, dst_height)
}

/// Interpolate `img` at the continuous position `(x, y)` (pixel centres on
/// integers), clamping out-of-range taps to the border.
pub fn sample<P: Sample>(img: ImgRef<'_, P>, x: f64, y: f64, filter: Interpolation) -> P {
    let w = img.width() as isize;
    let h = img.height() as isize;
    let stride = img.stride();
    let buf = img.buf();

    if filter == Interpolation::Nearest {
        let ix = (x.round() as isize).clamp(0, w - 1) as usize;
        let iy = (y.round() as isize).clamp(0, h - 1) as usize;
        return buf[iy * stride + ix];
    }

    let support = filter.support();
    let x0 = (x - support).ceil() as isize;
    let x1 = (x + support).floor() as isize;
    let y0 = (y - support).ceil() as isize;
    let y1 = (y + support).floor() as isize;

    // Small fixed upper bound: Lanczos4 has at most 9 taps per axis.
    let mut wx = [0.0f64; 10];
    let mut wy = [0.0f64; 10];
    let nx = ((x1 - x0 + 1) as usize).min(wx.len());
    let ny = ((y1 - y0 + 1) as usize).min(wy.len());
    let mut sum_x = 0.0;
    for (i, slot) in wx.iter_mut().take(nx).enumerate() {
        *slot = filter.evaluate((x0 + i as isize) as f64 - x);
        sum_x += *slot;
    }
    let mut sum_y = 0.0;
    for (j, slot) in wy.iter_mut().take(ny).enumerate() {
        *slot = filter.evaluate((y0 + j as isize) as f64 - y);
        sum_y += *slot;
    }
    let norm = sum_x * sum_y;
    if norm.abs() < 1e-12 {
        let ix = (x.round() as isize).clamp(0, w - 1) as usize;
        let iy = (y.round() as isize).clamp(0, h - 1) as usize;
        return buf[iy * stride + ix];
    }

    let mut acc = P::ZERO;
    for (j, &wyj) in wy.iter().take(ny).enumerate() {
        if wyj == 0.0 {
            continue;
        }
        let sy = (y0 + j as isize).clamp(0, h - 1) as usize;
        let row = &buf[sy * stride..];
        let mut row_acc = P::ZERO;
        for (i, &wxi) in wx.iter().take(nx).enumerate() {
            if wxi == 0.0 {
                continue;
            }
            let sx = (x0 + i as isize).clamp(0, w - 1) as usize;
            row_acc = row_acc.plus(row[sx].scaled(wxi as f32));
        }
        acc = acc.plus(row_acc.scaled(wyj as f32));
    }
    acc.scaled((1.0 / norm) as f32)
}
