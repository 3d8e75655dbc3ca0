//! Interpolating Splines
//!
//! Linear and cubic interpolating splines over a strictly increasing
//! knot sequence with either natural or periodic boundary conditions.
//! Cubic splines store the second derivative at each knot.

use serde::{Deserialize, Serialize};
use tracing::{error, trace};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplineType {
    Linear,
    Cubic,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Boundary {
    /// Zero curvature at the end knots.
    Natural,
    /// Value, slope and curvature wrap from the last knot to the first.
    Periodic,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Spline {
    kind: SplineType,
    knots: Vec<f64>,
    values: Vec<f64>,
    curvatures: Vec<f64>,
}

impl Spline {
    pub fn new(kind: SplineType) -> Self {
        Self { kind, knots: Vec::new(), values: Vec::new(), curvatures: Vec::new() }
    }

    pub fn initialized(&self) -> bool {
        !self.knots.is_empty()
    }

    pub fn clear(&mut self) {
        self.knots.clear();
        self.values.clear();
        self.curvatures.clear();
    }

    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Fit through `(knots[i], values[i])`. Leaves the spline unchanged
    /// and returns false if the knots are unusable.
    pub fn interpolate(&mut self, knots: &[f64], values: &[f64], boundary: Boundary) -> bool {
        if knots.len() != values.len() || knots.len() < 2 {
            error!(knots = knots.len(), values = values.len(), "bad spline inputs");
            return false;
        }
        if knots.windows(2).any(|w| !(w[1] > w[0])) || values.iter().any(|v| !v.is_finite()) {
            error!(?knots, "spline knots must be strictly increasing with finite values");
            return false;
        }

        let curvatures = match self.kind {
            SplineType::Linear => vec![0.0; knots.len()],
            SplineType::Cubic => match boundary {
                Boundary::Natural => natural_curvatures(knots, values),
                Boundary::Periodic => periodic_curvatures(knots, values),
            },
        };
        if curvatures.iter().any(|c| !c.is_finite()) {
            trace!("non-finite curvature, falling back to linear");
            self.curvatures = vec![0.0; knots.len()];
        } else {
            self.curvatures = curvatures;
        }
        self.knots = knots.to_vec();
        self.values = values.to_vec();
        true
    }

    /// Evaluate at `x`, clamped into the knot range.
    pub fn value(&self, x: f64) -> f64 {
        let n = self.knots.len();
        if n == 0 {
            return 0.0;
        }
        if n == 1 {
            return self.values[0];
        }
        let x = x.max(self.knots[0]).min(self.knots[n - 1]);
        let i = self.knots.partition_point(|k| *k <= x).clamp(1, n - 1) - 1;
        let (a, b) = (self.knots[i], self.knots[i + 1]);
        let h = b - a;
        let t = (x - a) / h;
        let (ya, yb) = (self.values[i], self.values[i + 1]);
        match self.kind {
            SplineType::Linear => ya + t * (yb - ya),
            SplineType::Cubic => {
                let (ma, mb) = (self.curvatures[i], self.curvatures[i + 1]);
                let u = 1.0 - t;
                u * ya + t * yb + h * h / 6.0 * ((u * u * u - u) * ma + (t * t * t - t) * mb)
            }
        }
    }

    /// Mean value over the knot range.
    pub fn mean(&self) -> f64 {
        let n = self.knots.len();
        if n == 0 {
            return 0.0;
        }
        if n == 1 {
            return self.values[0];
        }
        let mut integral = 0.0;
        for i in 0..n - 1 {
            let h = self.knots[i + 1] - self.knots[i];
            integral += h * (self.values[i] + self.values[i + 1]) / 2.0;
            if self.kind == SplineType::Cubic {
                integral -= h * h * h * (self.curvatures[i] + self.curvatures[i + 1]) / 24.0;
            }
        }
        integral / (self.knots[n - 1] - self.knots[0])
    }

    pub fn shift(&mut self, shift: f64) {
        for v in &mut self.values {
            *v += shift;
        }
    }
}

fn slopes(knots: &[f64], values: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let h: Vec<f64> = knots.windows(2).map(|w| w[1] - w[0]).collect();
    let d: Vec<f64> = values.windows(2).zip(&h).map(|(v, h)| (v[1] - v[0]) / h).collect();
    (h, d)
}

fn natural_curvatures(knots: &[f64], values: &[f64]) -> Vec<f64> {
    let n = knots.len();
    let mut m = vec![0.0; n];
    if n < 3 {
        return m;
    }
    let (h, d) = slopes(knots, values);
    let k = n - 2;
    let mut diag: Vec<f64> = (0..k).map(|i| 2.0 * (h[i] + h[i + 1])).collect();
    let mut rhs: Vec<f64> = (0..k).map(|i| 6.0 * (d[i + 1] - d[i])).collect();
    for i in 1..k {
        let w = h[i] / diag[i - 1];
        diag[i] -= w * h[i];
        rhs[i] -= w * rhs[i - 1];
    }
    m[k] = rhs[k - 1] / diag[k - 1];
    for i in (0..k - 1).rev() {
        m[i + 1] = (rhs[i] - h[i + 1] * m[i + 2]) / diag[i];
    }
    m
}

/// Curvatures for a spline whose first and last knots are identified.
fn periodic_curvatures(knots: &[f64], values: &[f64]) -> Vec<f64> {
    let n = knots.len();
    // Unknowns m[0..n-1); m[n-1] == m[0].
    let k = n - 1;
    if k < 2 {
        return vec![0.0; n];
    }
    let (h, d) = slopes(knots, values);
    let prev = |i: usize| (i + k - 1) % k;

    // Cyclic tridiagonal system: a[i] m[i-1] + b[i] m[i] + c[i] m[i+1] = r[i].
    let a: Vec<f64> = (0..k).map(|i| h[prev(i)]).collect();
    let b: Vec<f64> = (0..k).map(|i| 2.0 * (h[prev(i)] + h[i])).collect();
    let c: Vec<f64> = (0..k).map(|i| h[i]).collect();
    let r: Vec<f64> = (0..k).map(|i| 6.0 * (d[i] - d[prev(i)])).collect();

    let mut m = if k == 2 {
        // Two unknowns coupled through both neighbours.
        let (b0, c0, b1, a1) = (b[0], a[0] + c[0], b[1], a[1] + c[1]);
        let det = b0 * b1 - c0 * a1;
        if det == 0.0 {
            vec![0.0; 2]
        } else {
            vec![(r[0] * b1 - c0 * r[1]) / det, (b0 * r[1] - a1 * r[0]) / det]
        }
    } else {
        solve_cyclic(&a, &b, &c, &r)
    };
    m.push(m[0]);
    m
}

/// Sherman-Morrison reduction of a cyclic tridiagonal system.
fn solve_cyclic(a: &[f64], b: &[f64], c: &[f64], r: &[f64]) -> Vec<f64> {
    let n = b.len();
    let alpha = c[n - 1];
    let beta = a[0];
    let gamma = -b[0];
    let mut bb = b.to_vec();
    bb[0] -= gamma;
    bb[n - 1] -= alpha * beta / gamma;
    let x = solve_tridiagonal(a, &bb, c, r);
    let mut u = vec![0.0; n];
    u[0] = gamma;
    u[n - 1] = alpha;
    let z = solve_tridiagonal(a, &bb, c, &u);
    let factor = (x[0] + beta * x[n - 1] / gamma) / (1.0 + z[0] + beta * z[n - 1] / gamma);
    x.iter().zip(&z).map(|(x, z)| x - factor * z).collect()
}

fn solve_tridiagonal(a: &[f64], b: &[f64], c: &[f64], r: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut cp = vec![0.0; n];
    let mut dp = vec![0.0; n];
    cp[0] = c[0] / b[0];
    dp[0] = r[0] / b[0];
    for i in 1..n {
        let denom = b[i] - a[i] * cp[i - 1];
        cp[i] = c[i] / denom;
        dp[i] = (r[i] - a[i] * dp[i - 1]) / denom;
    }
    let mut x = vec![0.0; n];
    x[n - 1] = dp[n - 1];
    for i in (0..n - 1).rev() {
        x[i] = dp[i] - cp[i] * x[i + 1];
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_linear_interpolation() {
        let mut spline = Spline::new(SplineType::Linear);
        assert!(spline.interpolate(&[0.0, 1.0, 3.0], &[0.0, 2.0, 0.0], Boundary::Natural));
        assert!((spline.value(0.5) - 1.0).abs() < 1e-12);
        assert!((spline.value(2.0) - 1.0).abs() < 1e-12);
        assert!((spline.value(-1.0) - 0.0).abs() < 1e-12);
        assert!((spline.mean() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cubic_passes_through_knots() {
        let knots: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let values: Vec<f64> = knots.iter().map(|x| (x * 0.7).sin()).collect();
        let mut spline = Spline::new(SplineType::Cubic);
        assert!(spline.interpolate(&knots, &values, Boundary::Natural));
        for (k, v) in knots.iter().zip(&values) {
            assert!((spline.value(*k) - v).abs() < 1e-10);
        }
    }

    #[test]
    fn test_periodic_sine() {
        let n = 25;
        let knots: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();
        let values: Vec<f64> = knots.iter().map(|x| (2.0 * PI * x).sin()).collect();
        let mut spline = Spline::new(SplineType::Cubic);
        assert!(spline.interpolate(&knots, &values, Boundary::Periodic));
        for i in 0..100 {
            let x = i as f64 / 100.0;
            let error = (spline.value(x) - (2.0 * PI * x).sin()).abs();
            assert!(error < 1e-3, "x = {}, error = {}", x, error);
        }
        assert!(spline.mean().abs() < 1e-3);
    }

    #[test]
    fn test_rejects_bad_knots() {
        let mut spline = Spline::new(SplineType::Cubic);
        assert!(!spline.interpolate(&[0.0, 0.0, 1.0], &[1.0, 2.0, 3.0], Boundary::Natural));
        assert!(!spline.interpolate(&[0.0], &[1.0], Boundary::Natural));
        assert!(!spline.initialized());
    }

    #[test]
    fn test_shift() {
        let mut spline = Spline::new(SplineType::Cubic);
        spline.interpolate(&[0.0, 1.0, 2.0, 3.0], &[1.0, 3.0, 2.0, 1.0], Boundary::Periodic);
        let before = spline.value(1.3);
        spline.shift(2.0);
        assert!((spline.value(1.3) - before - 2.0).abs() < 1e-12);
    }
}
