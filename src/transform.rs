use nalgebra::Matrix2x3;

/// 2×3 affine map from reference-tile coordinates to candidate-tile
/// coordinates: `[u, v] = M · [x, y, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine(pub Matrix2x3<f64>);

impl Affine {
    pub fn identity() -> Self {
        Self(Matrix2x3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0))
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self(Matrix2x3::new(1.0, 0.0, dx, 0.0, 1.0, dy))
    }

    /// Rotation by `theta` radians about the origin followed by a translation.
    pub fn euclidean(theta: f64, dx: f64, dy: f64) -> Self {
        let (s, c) = theta.sin_cos();
        Self(Matrix2x3::new(c, -s, dx, s, c, dy))
    }

    #[inline]
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let m = &self.0;
        (
            m[(0, 0)] * x + m[(0, 1)] * y + m[(0, 2)],
            m[(1, 0)] * x + m[(1, 1)] * y + m[(1, 2)],
        )
    }

    pub fn translation_part(&self) -> (f64, f64) {
        (self.0[(0, 2)], self.0[(1, 2)])
    }

    /// Closest rotation + translation, as `(theta, dx, dy)`.
    pub fn to_euclidean(&self) -> (f64, f64, f64) {
        let m = &self.0;
        let theta = (m[(1, 0)] - m[(0, 1)]).atan2(m[(0, 0)] + m[(1, 1)]);
        (theta, m[(0, 2)], m[(1, 2)])
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

impl Default for Affine {
    fn default() -> Self {
        Self::identity()
    }
}
