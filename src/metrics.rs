//! Reconstruction error between original and decoded parameters.

use serde::Serialize;

/// Running error statistics over pairs of values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ErrorStats {
    pub count: usize,
    sum_sq: f64,
    sum_abs: f64,
    pub max: f64,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate element-wise errors between `original` and `restored`.
    /// Extra elements in the longer slice are ignored.
    pub fn update(&mut self, original: &[f32], restored: &[f32]) {
        for (o, r) in original.iter().zip(restored) {
            let diff = (*o as f64 - *r as f64).abs();
            self.sum_sq += diff * diff;
            self.sum_abs += diff;
            if diff > self.max {
                self.max = diff;
            }
            self.count += 1;
        }
    }

    pub fn merge(&mut self, other: &ErrorStats) {
        self.count += other.count;
        self.sum_sq += other.sum_sq;
        self.sum_abs += other.sum_abs;
        self.max = self.max.max(other.max);
    }

    /// Mean squared error; 0 when nothing was compared.
    pub fn mse(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_sq / self.count as f64
        }
    }

    /// Mean absolute error; 0 when nothing was compared.
    pub fn mae(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_abs / self.count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_and_merges() {
        let mut a = ErrorStats::new();
        a.update(&[1.0, 2.0], &[1.5, 2.0]);
        assert_eq!(a.count, 2);
        assert_eq!(a.max, 0.5);
        assert_eq!(a.mae(), 0.25);
        assert_eq!(a.mse(), 0.125);

        let mut b = ErrorStats::new();
        b.update(&[0.0], &[-1.0]);
        a.merge(&b);
        assert_eq!(a.count, 3);
        assert_eq!(a.max, 1.0);
        assert_eq!(a.mae(), 0.5);
    }

    #[test]
    fn empty_is_zero() {
        let s = ErrorStats::new();
        assert_eq!(s.mse(), 0.0);
        assert_eq!(s.mae(), 0.0);
        assert_eq!(s.max, 0.0);
    }
}
