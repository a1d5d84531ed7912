//! Reduction helpers shared by the format selector and the quantizer.

use rayon::prelude::*;

use crate::error::{Error, Result};

/// Number of elements implied by `shape`, failing on overflow.
pub fn numel(shape: &[usize]) -> Result<usize> {
    shape.iter().try_fold(1usize, |acc, &d| {
        acc.checked_mul(d)
            .ok_or_else(|| Error::domain(format!("shape {:?} overflows usize", shape)))
    })
}

/// Largest element, ignoring NaNs. `None` for an empty slice or all-NaN data.
pub fn max_element(data: &[f32], parallel_threshold: usize) -> Option<f32> {
    reduce_max(data, parallel_threshold, |x| x)
}

/// Largest magnitude, ignoring NaNs.
pub fn max_abs_element(data: &[f32], parallel_threshold: usize) -> Option<f32> {
    reduce_max(data, parallel_threshold, f32::abs)
}

/// Smallest element, ignoring NaNs.
pub fn min_element(data: &[f32], parallel_threshold: usize) -> Option<f32> {
    reduce_max(data, parallel_threshold, |x| -x).map(|m| -m)
}

fn reduce_max<F>(data: &[f32], parallel_threshold: usize, key: F) -> Option<f32>
where
    F: Fn(f32) -> f32 + Sync + Send,
{
    let max = if data.len() > parallel_threshold {
        data.par_iter()
            .map(|&x| key(x))
            .reduce(|| f32::NEG_INFINITY, f32::max)
    } else {
        data.iter()
            .map(|&x| key(x))
            .fold(f32::NEG_INFINITY, f32::max)
    };

    // f32::max drops NaN operands, so an all-NaN input leaves the seed untouched.
    if max == f32::NEG_INFINITY && !data.iter().any(|&x| key(x) == f32::NEG_INFINITY) {
        None
    } else {
        Some(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numel() {
        assert_eq!(numel(&[2, 3, 4]).unwrap(), 24);
        assert_eq!(numel(&[]).unwrap(), 1);
        assert_eq!(numel(&[5, 0]).unwrap(), 0);
        assert!(numel(&[usize::MAX, 2]).is_err());
    }

    #[test]
    fn test_max_element_takes_signed_maximum() {
        let data = vec![0.3, -0.9, 1.2];
        assert_eq!(max_element(&data, usize::MAX), Some(1.2));
        assert_eq!(max_abs_element(&data, usize::MAX), Some(1.2));
        assert_eq!(min_element(&data, usize::MAX), Some(-0.9));

        let negative_heavy = vec![0.5, -4.0];
        assert_eq!(max_element(&negative_heavy, usize::MAX), Some(0.5));
        assert_eq!(max_abs_element(&negative_heavy, usize::MAX), Some(4.0));
    }

    #[test]
    fn test_empty_and_nan() {
        assert_eq!(max_element(&[], 0), None);
        assert_eq!(max_element(&[f32::NAN, f32::NAN], usize::MAX), None);
        assert_eq!(max_element(&[f32::NAN, 2.0], usize::MAX), Some(2.0));
        assert_eq!(
            max_element(&[f32::NEG_INFINITY], usize::MAX),
            Some(f32::NEG_INFINITY)
        );
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let data: Vec<f32> = (0..100_000)
            .map(|i| ((i * 37) % 1001) as f32 * 0.01 - 5.0)
            .collect();

        assert_eq!(max_element(&data, 0), max_element(&data, usize::MAX));
        assert_eq!(max_abs_element(&data, 0), max_abs_element(&data, usize::MAX));
        assert_eq!(min_element(&data, 0), min_element(&data, usize::MAX));
    }
}
