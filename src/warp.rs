use imgref::{ImgRef, ImgVec};
use rayon::prelude::*;

use crate::filters::Interpolation;
use crate::pixel::Sample;
use crate::resample::sample;
use crate::transform::Affine;

/// Resample `src` into a `width × height` image aligned with the reference:
/// output pixel `x` takes `src` at `transform(x)`. Taps past the border
/// repeat the edge pixel.
pub fn warp_inverse<P: Sample>(
    src: ImgRef<'_, P>,
    transform: &Affine,
    width: usize,
    height: usize,
    filter: Interpolation,
) -> ImgVec<P> {
    let mut out = vec![P::ZERO; width * height];
    out.par_chunks_mut(width.max(1))
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.iter_mut().enumerate() {
                let (u, v) = transform.apply(x as f64, y as f64);
                *px = sample(src, u, v, filter);
            }
        });
    ImgVec::new(out, width, height)
}
