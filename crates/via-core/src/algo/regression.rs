//! Online Least Squares Regression
//!
//! Fits `y = c_0 + c_1 x + ... + c_{n-1} x^{n-1}` to weighted points
//! online by keeping the `3n - 1` sufficient statistics
//! `[1, x, ..., x^{2n-2}, y, xy, ..., x^{n-1}y]` as a weighted mean.
//!
//! The Gramian is solved directly, so callers keep the abscissa near
//! zero with `shift_abscissa`. When the Gramian is badly conditioned the
//! fit drops to a lower order polynomial, ending at the mean.

use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};
use tracing::trace;

/// Largest Gramian condition we will attempt to solve.
pub const MAX_CONDITION: f64 = 1e15;

/// Spread of abscissa below which predictions fall back to the mean.
pub const MINIMUM_RANGE_TO_PREDICT: f64 = 1.0;

type Stats = SmallVec<[f64; 11]>;
pub type Params = SmallVec<[f64; 4]>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Regression {
    /// Number of polynomial coefficients.
    n: usize,
    count: f64,
    stats: Stats,
}

impl Regression {
    /// A regression with `n` coefficients, i.e. degree `n - 1`, at most cubic.
    pub fn new(n: usize) -> Self {
        let n = n.clamp(1, 4);
        Self { n, count: 0.0, stats: smallvec![0.0; 3 * n - 1] }
    }

    pub fn linear() -> Self {
        Self::new(2)
    }

    pub fn cubic() -> Self {
        Self::new(4)
    }

    fn y_index(&self, i: usize) -> usize {
        2 * self.n - 1 + i
    }

    pub fn add(&mut self, x: f64, y: f64, weight: f64) {
        if weight <= 0.0 || !x.is_finite() || !y.is_finite() {
            return;
        }
        let n = self.n;
        let mut d: Stats = smallvec![0.0; 3 * n - 1];
        let mut xi = 1.0;
        for i in 0..n {
            d[i] = xi;
            d[2 * n - 1 + i] = xi * y;
            xi *= x;
        }
        for item in d.iter_mut().take(2 * n - 1).skip(n) {
            *item = xi;
            xi *= x;
        }
        self.count += weight;
        let r = weight / self.count;
        for (s, di) in self.stats.iter_mut().zip(d.iter()) {
            *s += r * (di - *s);
        }
    }

    /// Combine with the points fitted by `other`.
    pub fn merge(&mut self, other: &Regression) {
        if other.n != self.n {
            return;
        }
        let count = self.count + other.count;
        if count > 0.0 {
            let r = other.count / count;
            for (s, o) in self.stats.iter_mut().zip(other.stats.iter()) {
                *s += r * (o - *s);
            }
        }
        self.count = count;
    }

    /// Update the statistics for the abscissa map `x -> x + dx`.
    pub fn shift_abscissa(&mut self, dx: f64) {
        if self.count == 0.0 {
            return;
        }
        let n = self.n;
        let mut d = [0.0; 8];
        let m = 2 * n - 2;
        if m > 0 {
            d[0] = dx;
            for i in 1..m {
                d[i] = d[i - 1] * dx;
            }
        }
        for i in (1..=m).rev() {
            for j in 0..i {
                let bij = binomial(i, j) * d[i - j - 1];
                self.stats[i] += bij * self.stats[j];
                if i >= n {
                    continue;
                }
                let yi = self.y_index(i);
                let yj = self.y_index(j);
                self.stats[yi] += bij * self.stats[yj];
            }
        }
    }

    /// Update the statistics for the ordinate map `y -> y + dy`.
    pub fn shift_ordinate(&mut self, dy: f64) {
        if self.count == 0.0 {
            return;
        }
        for i in 0..self.n {
            let yi = self.y_index(i);
            self.stats[yi] += self.stats[i] * dy;
        }
    }

    /// Shift the gradient of the fit by `dydx`.
    pub fn shift_gradient(&mut self, dydx: f64) {
        if self.count == 0.0 || self.n < 2 {
            return;
        }
        for i in 0..self.n {
            let yi = self.y_index(i);
            self.stats[yi] += self.stats[i + 1] * dydx;
        }
    }

    pub fn scale(&mut self, scale: f64) {
        self.count *= scale;
    }

    pub fn scaled(&self, scale: f64) -> Self {
        let mut result = self.clone();
        result.scale(scale);
        result
    }

    /// Age the points by `factor`.
    pub fn age(&mut self, factor: f64) {
        self.count *= factor;
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    /// Mean of the ordinates.
    pub fn mean(&self) -> f64 {
        self.stats[self.y_index(0)]
    }

    /// Safe prediction horizon from the spread of the abscissa.
    pub fn range(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        let x1 = self.stats[1];
        let x2 = self.stats[2];
        (12.0 * (x2 - x1 * x1).max(0.0)).sqrt()
    }

    /// The polynomial coefficients, dropping order until solvable.
    pub fn parameters(&self) -> Params {
        let mut result: Params = smallvec![0.0; self.n];
        for m in (1..=self.n).rev() {
            if m == 1 {
                result[0] = self.mean();
                return result;
            }
            if let Some(solution) = self.solve(m) {
                result[..m].copy_from_slice(&solution);
                return result;
            }
            trace!(order = m, "degenerate gramian, dropping order");
        }
        result
    }

    /// Evaluate the fit at `x`, or the mean if the abscissa spread is small.
    pub fn predict(&self, x: f64) -> f64 {
        if self.range() < MINIMUM_RANGE_TO_PREDICT {
            return self.mean();
        }
        evaluate(&self.parameters(), x)
    }

    /// Mean of the fit over `[a, b]`.
    pub fn mean_over(&self, a: f64, b: f64) -> f64 {
        if self.range() < MINIMUM_RANGE_TO_PREDICT {
            return self.mean();
        }
        let params = self.parameters();
        if (b - a).abs() < 1e-12 {
            return evaluate(&params, a);
        }
        let integral: f64 = params
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let k = (i + 1) as i32;
                c * (b.powi(k) - a.powi(k)) / k as f64
            })
            .sum();
        integral / (b - a)
    }

    /// Solve the leading `m x m` system by Gaussian elimination.
    fn solve(&self, m: usize) -> Option<Params> {
        let mut a = [[0.0f64; 5]; 4];
        for i in 0..m {
            for j in 0..m {
                a[i][j] = self.stats[i + j];
            }
            a[i][m] = self.stats[self.y_index(i)];
        }

        let mut max_pivot: f64 = 0.0;
        let mut min_pivot = f64::INFINITY;
        for col in 0..m {
            let pivot = (col..m)
                .max_by(|&r, &s| a[r][col].abs().total_cmp(&a[s][col].abs()))
                .unwrap_or(col);
            a.swap(col, pivot);
            let p = a[col][col];
            max_pivot = max_pivot.max(p.abs());
            min_pivot = min_pivot.min(p.abs());
            if p == 0.0 || !p.is_finite() {
                return None;
            }
            for row in (col + 1)..m {
                let f = a[row][col] / p;
                for k in col..=m {
                    a[row][k] -= f * a[col][k];
                }
            }
        }
        // Pivot spread approximates the Gramian's condition.
        if min_pivot == 0.0 || max_pivot > MAX_CONDITION * min_pivot {
            return None;
        }

        let mut x: Params = smallvec![0.0; m];
        for i in (0..m).rev() {
            let mut s = a[i][m];
            for j in (i + 1)..m {
                s -= a[i][j] * x[j];
            }
            x[i] = s / a[i][i];
        }
        if x.iter().all(|v| v.is_finite()) { Some(x) } else { None }
    }

    pub fn print(&self) -> String {
        let params = self.parameters();
        let mut result = String::new();
        for i in (1..params.len()).rev() {
            result.push_str(&format!("{:.6} x^{} + ", params[i], i));
        }
        result.push_str(&format!("{:.6}", params[0]));
        result
    }
}

/// Evaluate the polynomial with coefficients `params` at `x`.
pub fn evaluate(params: &[f64], x: f64) -> f64 {
    params.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

fn binomial(n: usize, k: usize) -> f64 {
    if k == 0 || k == n {
        return 1.0;
    }
    let mut result = 1.0;
    for i in 0..k {
        result *= (n - i) as f64 / (i + 1) as f64;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_fit() {
        let mut regression = Regression::new(3);
        for i in 0..20 {
            let x = i as f64 * 0.5;
            regression.add(x, 1.0 + 2.0 * x - 0.5 * x * x, 1.0);
        }
        let params = regression.parameters();
        assert!((params[0] - 1.0).abs() < 1e-6, "{:?}", params);
        assert!((params[1] - 2.0).abs() < 1e-6, "{:?}", params);
        assert!((params[2] + 0.5).abs() < 1e-6, "{:?}", params);
    }

    #[test]
    fn test_shift_abscissa_matches_refit() {
        let mut shifted = Regression::cubic();
        let mut direct = Regression::cubic();
        for i in 0..30 {
            let x = i as f64 / 10.0;
            let y = 0.3 * x * x * x - x + 4.0;
            shifted.add(x, y, 1.0);
            direct.add(x - 1.5, y, 1.0);
        }
        shifted.shift_abscissa(-1.5);
        let a = shifted.parameters();
        let b = direct.parameters();
        for i in 0..4 {
            assert!((a[i] - b[i]).abs() < 1e-6, "{:?} vs {:?}", a, b);
        }
    }

    #[test]
    fn test_shift_ordinate_and_merge() {
        let mut a = Regression::linear();
        let mut b = Regression::linear();
        for i in 0..10 {
            a.add(i as f64, 2.0 * i as f64, 1.0);
            b.add(10.0 + i as f64, 2.0 * (10.0 + i as f64), 1.0);
        }
        a.merge(&b);
        assert!((a.count() - 20.0).abs() < 1e-12);
        a.shift_ordinate(3.0);
        let params = a.parameters();
        assert!((params[0] - 3.0).abs() < 1e-8);
        assert!((params[1] - 2.0).abs() < 1e-8);
    }

    #[test]
    fn test_degenerate_falls_back_to_mean() {
        let mut regression = Regression::cubic();
        for _ in 0..10 {
            regression.add(2.0, 5.0, 1.0);
        }
        let params = regression.parameters();
        assert!((evaluate(&params, 2.0) - 5.0).abs() < 1e-9);
        assert_eq!(regression.predict(100.0), 5.0);
    }

    #[test]
    fn test_mean_over_interval() {
        let mut regression = Regression::linear();
        for i in 0..10 {
            regression.add(i as f64, 2.0 * i as f64 + 1.0, 1.0);
        }
        assert!((regression.mean_over(2.0, 4.0) - 7.0).abs() < 1e-8);
        assert!((regression.mean_over(3.0, 3.0) - 7.0).abs() < 1e-8);
    }

    #[test]
    fn test_age_keeps_fit() {
        let mut regression = Regression::linear();
        for i in 0..10 {
            regression.add(i as f64, i as f64, 1.0);
        }
        regression.age(0.5);
        assert!((regression.count() - 5.0).abs() < 1e-12);
        assert!((regression.predict(20.0) - 20.0).abs() < 1e-8);
    }
}
