//! Spatial correlation of an image with a small kernel.

use imgref::{ImgRef, ImgVec};
use rayon::prelude::*;

use crate::kernel::Kernel;
use crate::pixel::Sample;

/// Reflect-101 border: `gfedcb|abcdefgh|gfedcba`.
#[inline]
pub(crate) fn reflect_101(i: isize, len: usize) -> usize {
    let n = len as isize;
    if n == 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let mut i = i.rem_euclid(period);
    if i >= n {
        i = period - i;
    }
    i as usize
}

/// Correlate `src` with `kernel`, anchored at the kernel centre
/// (`size / 2`), with reflect-101 borders.
///
/// `dst(x, y) = Σ k(i, j) · src(x + i − a, y + j − a)`. Correlating with
/// [`Kernel::flipped`] is a true convolution.
pub fn filter2d<P: Sample>(src: ImgRef<'_, P>, kernel: &Kernel) -> ImgVec<P> {
    let (w, h) = (src.width(), src.height());
    let size = kernel.size();
    let anchor = (size / 2) as isize;
    let weights = kernel.weights();

    // Column lookup is the same for every row.
    let columns: Vec<Vec<usize>> = (0..w)
        .map(|x| {
            (0..size)
                .map(|i| reflect_101(x as isize + i as isize - anchor, w))
                .collect()
        })
        .collect();

    let mut out = vec![P::ZERO; w * h];
    out.par_chunks_mut(w.max(1)).enumerate().for_each(|(y, dst_row)| {
        let rows: Vec<&[P]> = (0..size)
            .map(|j| {
                let sy = reflect_101(y as isize + j as isize - anchor, h);
                &src.buf()[sy * src.stride()..][..w]
            })
            .collect();
        for (x, out) in dst_row.iter_mut().enumerate() {
            let cols = &columns[x];
            let mut acc = P::ZERO;
            for (j, row) in rows.iter().enumerate() {
                let krow = &weights[j * size..][..size];
                for (i, &k) in krow.iter().enumerate() {
                    if k != 0.0 {
                        acc = acc.plus(row[cols[i]].scaled(k));
                    }
                }
            }
            *out = acc;
        }
    });

    ImgVec::new(out, w, h)
}
