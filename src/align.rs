//! Two-stage registration of a candidate tile onto the reference tile.
//!
//! Stage A seeds the transform: phase correlation finds the dominant
//! translation, then one linearized least-squares step on the image
//! gradients estimates a full affine map around it.
//!
//! Stage B refines the seed with the Enhanced Correlation Coefficient
//! criterion (Evangelidis & Psarakis, 2008) restricted to rotation plus
//! translation. Each iteration warps the candidate, projects the zero-mean
//! residual on the warp Jacobian and solves a 3×3 system for the update.
//!
//! All transforms map reference coordinates to candidate coordinates.

use imgref::{ImgRef, ImgVec};
use log::debug;
use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::convolve::filter2d;
use crate::fft::{forward_dft, inverse_dft};
use crate::kernel::Kernel;
use crate::transform::Affine;

/// Luma difference below which two tiles are treated as already aligned.
const COINCIDENT_TOLERANCE: f32 = 1e-4;
/// Phase correlation peaks weaker than this give no translation seed.
const MIN_PEAK: f32 = 0.03;
/// Affine seeds deforming more than this are reduced to their translation.
const MAX_SEED_DEFORMATION: f64 = 0.25;
/// Smoothing applied to both tiles before refinement.
const SMOOTHING_SIZE: usize = 5;
const SMOOTHING_SIGMA: f64 = 1.1;

/// Termination policy for the refinement stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationParams {
    pub max_iterations: usize,
    /// Stop once the correlation coefficient changes by less than this.
    pub epsilon: f64,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            max_iterations: 5000,
            epsilon: 1e-5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistrationError {
    #[error("tile has too little texture to register ({0})")]
    Degenerate(&'static str),
    #[error("correlation started decreasing; tiles may not overlap")]
    NonConvergent,
    #[error("registration produced a non-finite transform")]
    NotFinite,
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Registration {
    pub transform: Affine,
    /// Final correlation coefficient in `[-1, 1]`.
    pub correlation: f64,
    pub iterations: usize,
}

/// Register `candidate` onto `reference`. Both are luma tiles of equal size.
pub fn register(
    reference: ImgRef<'_, f32>,
    candidate: ImgRef<'_, f32>,
    params: &RegistrationParams,
) -> Result<Registration, RegistrationError> {
    if (reference.width(), reference.height()) != (candidate.width(), candidate.height()) {
        return Err(RegistrationError::Degenerate("tile sizes differ"));
    }

    let max_diff = reference
        .pixels()
        .zip(candidate.pixels())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    if max_diff <= COINCIDENT_TOLERANCE {
        return Ok(Registration {
            transform: Affine::identity(),
            correlation: 1.0,
            iterations: 0,
        });
    }

    let (dx, dy) = phase_correlate(reference, candidate).unwrap_or((0.0, 0.0));
    let seed = estimate_affine(reference, candidate, Affine::translation(dx, dy))?;
    debug!("seed translation ({dx:.3}, {dy:.3}), affine {:?}", seed.0);

    let smoothing = Kernel::analytic(SMOOTHING_SIZE, SMOOTHING_SIGMA)
        .map_err(|_| RegistrationError::Degenerate("smoothing kernel"))?;
    let reference = filter2d(reference, &smoothing);
    let candidate = filter2d(candidate, &smoothing);

    refine_euclidean(reference.as_ref(), candidate.as_ref(), seed.to_euclidean(), params)
}

fn hann(n: usize) -> Vec<f32> {
    if n < 2 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| {
            let t = std::f32::consts::TAU * i as f32 / (n - 1) as f32;
            0.5 - 0.5 * t.cos()
        })
        .collect()
}

fn windowed(img: ImgRef<'_, f32>, wx: &[f32], wy: &[f32]) -> ImgVec<f32> {
    let mean = img.pixels().sum::<f32>() / (img.width() * img.height()) as f32;
    let buf = img
        .rows()
        .zip(wy)
        .flat_map(|(row, &fy)| row.iter().zip(wx).map(move |(&v, &fx)| (v - mean) * fx * fy))
        .collect();
    ImgVec::new(buf, img.width(), img.height())
}

/// Translation `d` such that `candidate(x + d) ≈ reference(x)`.
pub fn phase_correlate(reference: ImgRef<'_, f32>, candidate: ImgRef<'_, f32>) -> Option<(f64, f64)> {
    let (w, h) = (reference.width(), reference.height());
    if w < 4 || h < 4 {
        return None;
    }
    let (wx, wy) = (hann(w), hann(h));
    let fr = forward_dft(windowed(reference, &wx, &wy).as_ref());
    let fc = forward_dft(windowed(candidate, &wx, &wy).as_ref());

    let cross: Vec<Complex<f32>> = fr
        .pixels()
        .zip(fc.pixels())
        .map(|(r, c)| {
            let p = r * c.conj();
            let mag = p.norm();
            if mag > 1e-12 { p / mag } else { Complex::new(0.0, 0.0) }
        })
        .collect();
    let surface = inverse_dft(ImgRef::new(&cross[..], w, h));

    let (peak_idx, &peak) = surface
        .buf()
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))?;
    if !(peak >= MIN_PEAK) {
        return None;
    }
    let (px, py) = (peak_idx % w, peak_idx / w);

    let at = |x: usize, y: usize| surface.buf()[y * w + x];
    let parabolic = |l: f32, c: f32, r: f32| {
        let denom = l - 2.0 * c + r;
        if denom.abs() > 1e-12 { (0.5 * (l - r) / denom) as f64 } else { 0.0 }
    };
    let sub_x = parabolic(at((px + w - 1) % w, py), peak, at((px + 1) % w, py));
    let sub_y = parabolic(at(px, (py + h - 1) % h), peak, at(px, (py + 1) % h));

    let wrap = |p: usize, n: usize| if p > n / 2 { p as f64 - n as f64 } else { p as f64 };
    Some((wrap(px, w) + sub_x.clamp(-0.5, 0.5), wrap(py, h) + sub_y.clamp(-0.5, 0.5)))
}

#[inline]
fn bilinear(img: &[f32], w: usize, h: usize, u: f64, v: f64) -> f32 {
    let x0 = (u.floor() as usize).min(w - 1);
    let y0 = (v.floor() as usize).min(h - 1);
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = (u - x0 as f64) as f32;
    let fy = (v - y0 as f64) as f32;
    let top = img[y0 * w + x0] * (1.0 - fx) + img[y0 * w + x1] * fx;
    let bottom = img[y1 * w + x0] * (1.0 - fx) + img[y1 * w + x1] * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Central-difference gradients, one-sided at the borders.
fn gradients(img: ImgRef<'_, f32>) -> (Vec<f32>, Vec<f32>) {
    let (w, h) = (img.width(), img.height());
    let at = |x: usize, y: usize| img.buf()[y * img.stride() + x];
    let mut gx = vec![0.0f32; w * h];
    let mut gy = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let (xl, xr) = (x.saturating_sub(1), (x + 1).min(w - 1));
            let (yt, yb) = (y.saturating_sub(1), (y + 1).min(h - 1));
            if xr > xl {
                gx[y * w + x] = (at(xr, y) - at(xl, y)) / (xr - xl) as f32;
            }
            if yb > yt {
                gy[y * w + x] = (at(x, yb) - at(x, yt)) / (yb - yt) as f32;
            }
        }
    }
    (gx, gy)
}

#[inline]
fn inside(u: f64, v: f64, w: usize, h: usize) -> bool {
    u >= 0.0 && v >= 0.0 && u <= (w - 1) as f64 && v <= (h - 1) as f64
}

/// One Gauss-Newton step over all six affine parameters around `seed`.
fn estimate_affine(
    reference: ImgRef<'_, f32>,
    candidate: ImgRef<'_, f32>,
    seed: Affine,
) -> Result<Affine, RegistrationError> {
    let (w, h) = (reference.width(), reference.height());
    let cand = crate::pixel::to_owned(candidate);
    let (gx, gy) = gradients(cand.as_ref());
    let (cx, cy) = ((w as f64 - 1.0) / 2.0, (h as f64 - 1.0) / 2.0);

    let mut hessian = SMatrix::<f64, 6, 6>::zeros();
    let mut rhs = SVector::<f64, 6>::zeros();
    let mut count = 0usize;
    for (y, row) in reference.rows().enumerate() {
        for (x, &r) in row.iter().enumerate() {
            let (u, v) = seed.apply(x as f64, y as f64);
            if !inside(u, v, w, h) {
                continue;
            }
            let iw = bilinear(cand.buf(), w, h, u, v) as f64;
            let gxw = bilinear(&gx, w, h, u, v) as f64;
            let gyw = bilinear(&gy, w, h, u, v) as f64;
            let (xn, yn) = (x as f64 - cx, y as f64 - cy);
            let j = SVector::<f64, 6>::from([gxw * xn, gyw * xn, gxw * yn, gyw * yn, gxw, gyw]);
            hessian += j * j.transpose();
            rhs += j * (r as f64 - iw);
            count += 1;
        }
    }

    if count < 6 || hessian.trace() / (count as f64) < 1e-10 {
        return Err(RegistrationError::Degenerate("no gradient energy"));
    }
    let p = hessian
        .lu()
        .solve(&rhs)
        .ok_or(RegistrationError::Degenerate("singular affine system"))?;
    if !p.iter().all(|v| v.is_finite()) {
        return Err(RegistrationError::NotFinite);
    }
    if p.iter().take(4).any(|v| v.abs() > MAX_SEED_DEFORMATION) {
        debug!("discarding implausible affine seed {:?}", p.as_slice());
        return Ok(seed);
    }

    let (tx, ty) = seed.translation_part();
    let m = &seed.0;
    let a00 = m[(0, 0)] + p[0];
    let a01 = m[(0, 1)] + p[2];
    let a10 = m[(1, 0)] + p[1];
    let a11 = m[(1, 1)] + p[3];
    Ok(Affine(nalgebra::Matrix2x3::new(
        a00,
        a01,
        tx + p[4] - (p[0] * cx + p[2] * cy),
        a10,
        a11,
        ty + p[5] - (p[1] * cx + p[3] * cy),
    )))
}

/// Per-iteration sums over the valid (overlapping) pixels.
#[derive(Debug, Clone, Copy, Default)]
struct EccSums {
    hessian: [f64; 6],
    image_projection: [f64; 3],
    template_projection: [f64; 3],
    correlation: f64,
    image_norm2: f64,
    template_norm2: f64,
}

impl EccSums {
    fn merge(mut self, o: Self) -> Self {
        for (a, b) in self.hessian.iter_mut().zip(o.hessian) {
            *a += b;
        }
        for i in 0..3 {
            self.image_projection[i] += o.image_projection[i];
            self.template_projection[i] += o.template_projection[i];
        }
        self.correlation += o.correlation;
        self.image_norm2 += o.image_norm2;
        self.template_norm2 += o.template_norm2;
        self
    }

    fn hessian(&self) -> Matrix3<f64> {
        let h = &self.hessian;
        Matrix3::new(h[0], h[1], h[2], h[1], h[3], h[4], h[2], h[4], h[5])
    }
}

fn refine_euclidean(
    template: ImgRef<'_, f32>,
    image: ImgRef<'_, f32>,
    (mut theta, mut tx, mut ty): (f64, f64, f64),
    params: &RegistrationParams,
) -> Result<Registration, RegistrationError> {
    let (w, h) = (template.width(), template.height());
    let tmpl = crate::pixel::to_owned(template);
    let img = crate::pixel::to_owned(image);
    let (gx, gy) = gradients(img.as_ref());

    let mut warped = vec![0.0f32; w * h];
    let mut warped_gx = vec![0.0f32; w * h];
    let mut warped_gy = vec![0.0f32; w * h];
    let mut valid = vec![false; w * h];

    let mut rho = -1.0f64;
    let mut last_rho = -params.epsilon;
    let mut iterations = 0;

    while iterations < params.max_iterations && (rho - last_rho).abs() >= params.epsilon {
        iterations += 1;
        let (sin, cos) = theta.sin_cos();

        warped
            .par_chunks_mut(w)
            .zip(warped_gx.par_chunks_mut(w))
            .zip(warped_gy.par_chunks_mut(w))
            .zip(valid.par_chunks_mut(w))
            .enumerate()
            .for_each(|(y, (((iw, wgx), wgy), ok))| {
                for x in 0..w {
                    let (xf, yf) = (x as f64, y as f64);
                    let u = cos * xf - sin * yf + tx;
                    let v = sin * xf + cos * yf + ty;
                    ok[x] = inside(u, v, w, h);
                    if ok[x] {
                        iw[x] = bilinear(img.buf(), w, h, u, v);
                        wgx[x] = bilinear(&gx, w, h, u, v);
                        wgy[x] = bilinear(&gy, w, h, u, v);
                    }
                }
            });

        let (mut count, mut tsum, mut isum) = (0usize, 0.0f64, 0.0f64);
        for i in 0..w * h {
            if valid[i] {
                count += 1;
                tsum += tmpl.buf()[i] as f64;
                isum += warped[i] as f64;
            }
        }
        if count < (w * h) / 10 || count < 3 {
            return Err(RegistrationError::Degenerate("tiles barely overlap"));
        }
        let (tmean, imean) = (tsum / count as f64, isum / count as f64);

        let sums = (0..h)
            .into_par_iter()
            .map(|y| {
                let mut s = EccSums::default();
                for x in 0..w {
                    let i = y * w + x;
                    if !valid[i] {
                        continue;
                    }
                    let t = tmpl.buf()[i] as f64 - tmean;
                    let im = warped[i] as f64 - imean;
                    let (gxw, gyw) = (warped_gx[i] as f64, warped_gy[i] as f64);
                    let (xf, yf) = (x as f64, y as f64);
                    let hat_x = -xf * sin - yf * cos;
                    let hat_y = xf * cos - yf * sin;
                    let j = [gxw * hat_x + gyw * hat_y, gxw, gyw];
                    s.hessian[0] += j[0] * j[0];
                    s.hessian[1] += j[0] * j[1];
                    s.hessian[2] += j[0] * j[2];
                    s.hessian[3] += j[1] * j[1];
                    s.hessian[4] += j[1] * j[2];
                    s.hessian[5] += j[2] * j[2];
                    for k in 0..3 {
                        s.image_projection[k] += j[k] * im;
                        s.template_projection[k] += j[k] * t;
                    }
                    s.correlation += t * im;
                    s.image_norm2 += im * im;
                    s.template_norm2 += t * t;
                }
                s
            })
            .reduce(EccSums::default, EccSums::merge);

        let norms = (sums.image_norm2 * sums.template_norm2).sqrt();
        if norms < 1e-12 {
            return Err(RegistrationError::Degenerate("flat tile"));
        }
        last_rho = rho;
        rho = sums.correlation / norms;
        if !rho.is_finite() {
            return Err(RegistrationError::NotFinite);
        }

        let hessian_inv = sums
            .hessian()
            .try_inverse()
            .ok_or(RegistrationError::Degenerate("singular hessian"))?;
        let image_projection = Vector3::from(sums.image_projection);
        let template_projection = Vector3::from(sums.template_projection);
        let iph = hessian_inv * image_projection;

        let lambda_n = sums.image_norm2 - image_projection.dot(&iph);
        let lambda_d = sums.correlation - template_projection.dot(&iph);
        if lambda_d <= 0.0 {
            return Err(RegistrationError::NonConvergent);
        }
        let lambda = lambda_n / lambda_d;

        // Jᵀ(λ·t − i) is linear in the projections already summed.
        let delta = hessian_inv * (template_projection * lambda - image_projection);
        if !delta.iter().all(|v| v.is_finite()) {
            return Err(RegistrationError::NotFinite);
        }
        theta += delta[0];
        tx += delta[1];
        ty += delta[2];
    }

    let transform = Affine::euclidean(theta, tx, ty);
    if !transform.is_finite() {
        return Err(RegistrationError::NotFinite);
    }
    debug!("refined to theta={theta:.5} t=({tx:.3}, {ty:.3}) rho={rho:.5} after {iterations} iterations");
    Ok(Registration {
        transform,
        correlation: rho,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOBS: [(f64, f64, f64); 12] = [
        (14.0, 20.0, 120.0),
        (40.0, 11.0, 90.0),
        (71.0, 25.0, 140.0),
        (23.0, 52.0, 100.0),
        (55.0, 47.0, 80.0),
        (82.0, 60.0, 110.0),
        (10.0, 83.0, 95.0),
        (46.0, 78.0, 130.0),
        (77.0, 88.0, 70.0),
        (33.0, 33.0, 60.0),
        (63.0, 70.0, 105.0),
        (88.0, 12.0, 85.0),
    ];

    fn scene(x: f64, y: f64) -> f32 {
        let mut v = 40.0;
        for &(bx, by, a) in &BLOBS {
            v += a * (-((x - bx).powi(2) + (y - by).powi(2)) / (2.0 * 5.5 * 5.5)).exp();
        }
        v as f32
    }

    /// Render the scene as seen through `transform`: `img(W(x)) = scene(x)`.
    fn render(w: usize, h: usize, transform: Option<Affine>) -> ImgVec<f32> {
        let mut buf = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                let (sx, sy) = match transform {
                    None => (x as f64, y as f64),
                    Some(t) => {
                        // Invert the Euclidean map.
                        let (theta, dx, dy) = t.to_euclidean();
                        let (s, c) = theta.sin_cos();
                        let (px, py) = (x as f64 - dx, y as f64 - dy);
                        (c * px + s * py, -s * px + c * py)
                    }
                };
                buf.push(scene(sx, sy));
            }
        }
        ImgVec::new(buf, w, h)
    }

    #[test]
    fn identical_tiles_take_the_fast_path() {
        let img = render(64, 64, None);
        let reg = register(img.as_ref(), img.as_ref(), &RegistrationParams::default()).unwrap();
        assert_eq!(reg.transform, Affine::identity());
        assert_eq!(reg.iterations, 0);
    }

    #[test]
    fn phase_correlation_finds_integer_shift() {
        let reference = render(96, 96, None);
        let candidate = render(96, 96, Some(Affine::translation(4.0, -3.0)));
        let (dx, dy) = phase_correlate(reference.as_ref(), candidate.as_ref()).unwrap();
        assert!((dx - 4.0).abs() < 0.5 && (dy + 3.0).abs() < 0.5, "({dx}, {dy})");
    }

    #[test]
    fn recovers_subpixel_translation() {
        let truth = Affine::translation(2.3, -1.7);
        let reference = render(96, 96, None);
        let candidate = render(96, 96, Some(truth));
        let reg = register(reference.as_ref(), candidate.as_ref(), &RegistrationParams::default())
            .unwrap();
        let (theta, dx, dy) = reg.transform.to_euclidean();
        assert!((dx - 2.3).abs() < 0.1, "dx = {dx}");
        assert!((dy + 1.7).abs() < 0.1, "dy = {dy}");
        assert!(theta.abs() < 0.005, "theta = {theta}");
        assert!(reg.correlation > 0.99, "rho = {}", reg.correlation);
    }

    #[test]
    fn recovers_small_rotation() {
        let truth = Affine::euclidean(0.02, 1.5, 0.5);
        let reference = render(96, 96, None);
        let candidate = render(96, 96, Some(truth));
        let reg = register(reference.as_ref(), candidate.as_ref(), &RegistrationParams::default())
            .unwrap();
        let (theta, dx, dy) = reg.transform.to_euclidean();
        assert!((theta - 0.02).abs() < 0.003, "theta = {theta}");
        assert!((dx - 1.5).abs() < 0.2 && (dy - 0.5).abs() < 0.2, "({dx}, {dy})");
    }

    #[test]
    fn flat_tiles_that_differ_are_degenerate() {
        let a = ImgVec::new(vec![100.0f32; 32 * 32], 32, 32);
        let b = ImgVec::new(vec![120.0f32; 32 * 32], 32, 32);
        let err = register(a.as_ref(), b.as_ref(), &RegistrationParams::default()).unwrap_err();
        assert!(matches!(err, RegistrationError::Degenerate(_)), "{err:?}");
    }

    #[test]
    fn iteration_budget_is_respected() {
        let reference = render(64, 64, None);
        let candidate = render(64, 64, Some(Affine::translation(1.2, 0.4)));
        let params = RegistrationParams {
            max_iterations: 2,
            epsilon: 0.0,
        };
        let reg = register(reference.as_ref(), candidate.as_ref(), &params).unwrap();
        assert_eq!(reg.iterations, 2);
    }
}
