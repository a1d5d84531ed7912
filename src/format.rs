//! Per-layer dynamic fixed-point format selection.
//!
//! A layer's weights decide how an 8-bit budget is split between integer
//! and fractional bits: `integer_bits = ceil(log2(max) + 1)`, the rest go to
//! the fraction. Every tensor of the layer is then encoded at that format.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::{max_abs_element, max_element};

/// Total bits per quantized value. Fixed for the whole archive.
pub const BIT_WIDTH: u32 = 8;

/// Which statistic of the weight tensor sizes the integer part.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum RangePolicy {
    /// Largest element (signed). Tensors whose negative tail outweighs the
    /// positive maximum get too few integer bits.
    #[default]
    MaxElement,
    /// Largest magnitude.
    MaxAbs,
}

/// Signed fixed-point format `Q(integer_bits).(fractional_bits)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPointFormat {
    pub integer_bits: i32,
    pub fractional_bits: i32,
}

impl FixedPointFormat {
    /// Format with `fractional_bits` out of `bit_width` total bits.
    pub fn from_fractional_bits(fractional_bits: i32, bit_width: u32) -> Self {
        FixedPointFormat {
            integer_bits: bit_width as i32 - fractional_bits,
            fractional_bits,
        }
    }

    pub fn bit_width(&self) -> u32 {
        (self.integer_bits + self.fractional_bits) as u32
    }

    /// Smallest representable increment, `2^-fractional_bits`.
    pub fn step(&self) -> f64 {
        2f64.powi(-self.fractional_bits)
    }

    /// Largest representable value.
    pub fn max_value(&self) -> f64 {
        let levels = (1i64 << (self.bit_width() - 1)) - 1;
        levels as f64 * self.step()
    }

    /// Smallest (most negative) representable value.
    pub fn min_value(&self) -> f64 {
        let levels = -(1i64 << (self.bit_width() - 1));
        levels as f64 * self.step()
    }
}

/// Fractional bits for a layer whose weights are `weights`, using the
/// maximum element.
pub fn select_format(weights: &[f32], bit_width: u32) -> Result<i32> {
    select_format_with(weights, bit_width, RangePolicy::MaxElement, usize::MAX)
        .map(|f| f.fractional_bits)
}

/// Full format selection under an explicit range policy.
pub fn select_format_with(
    weights: &[f32],
    bit_width: u32,
    policy: RangePolicy,
    parallel_threshold: usize,
) -> Result<FixedPointFormat> {
    if weights.is_empty() {
        return Err(Error::domain("cannot select a format for an empty tensor"));
    }

    let peak = match policy {
        RangePolicy::MaxElement => max_element(weights, parallel_threshold),
        RangePolicy::MaxAbs => max_abs_element(weights, parallel_threshold),
    }
    .ok_or_else(|| Error::domain("weight tensor holds no comparable values"))?;

    if !peak.is_finite() || peak <= 0.0 {
        return Err(Error::domain(format!(
            "range statistic must be positive and finite, got {}",
            peak
        )));
    }

    let integer_bits = ((peak as f64).log2() + 1.0).ceil() as i32;
    Ok(FixedPointFormat {
        integer_bits,
        fractional_bits: bit_width as i32 - integer_bits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_example() {
        let weights = vec![0.3f32, -0.9, 1.2];
        assert_eq!(select_format(&weights, BIT_WIDTH).unwrap(), 6);

        let fmt = select_format_with(&weights, BIT_WIDTH, RangePolicy::MaxElement, 0).unwrap();
        assert_eq!(fmt.integer_bits, 2);
        assert_eq!(fmt.fractional_bits, 6);
        assert_eq!(fmt.bit_width(), 8);
    }

    #[test]
    fn test_policies_differ_on_negative_outliers() {
        let weights = vec![0.4f32, -3.0, 0.1];
        let max_el = select_format_with(&weights, BIT_WIDTH, RangePolicy::MaxElement, 0).unwrap();
        let max_abs = select_format_with(&weights, BIT_WIDTH, RangePolicy::MaxAbs, 0).unwrap();

        // log2(0.4) + 1 = -0.32 -> 0 integer bits
        assert_eq!(max_el.fractional_bits, 8);
        // log2(3.0) + 1 = 2.58 -> 3 integer bits
        assert_eq!(max_abs.fractional_bits, 5);
    }

    #[test]
    fn test_fractional_bits_range() {
        // Large weights push fractional bits negative.
        assert_eq!(select_format(&[1000.0], BIT_WIDTH).unwrap(), -3);
        // Tiny weights give more than 8 fractional bits.
        assert_eq!(select_format(&[0.01], BIT_WIDTH).unwrap(), 13);
        // Powers of two sit exactly on the boundary.
        assert_eq!(select_format(&[1.0], BIT_WIDTH).unwrap(), 7);
        assert_eq!(select_format(&[2.0], BIT_WIDTH).unwrap(), 6);
    }

    #[test]
    fn test_domain_errors() {
        assert!(matches!(select_format(&[], BIT_WIDTH), Err(Error::Domain(_))));
        assert!(matches!(
            select_format(&[-1.0, -0.5], BIT_WIDTH),
            Err(Error::Domain(_))
        ));
        assert!(matches!(select_format(&[0.0, 0.0], BIT_WIDTH), Err(Error::Domain(_))));
        assert!(matches!(
            select_format(&[f32::INFINITY], BIT_WIDTH),
            Err(Error::Domain(_))
        ));
        assert!(matches!(select_format(&[f32::NAN], BIT_WIDTH), Err(Error::Domain(_))));
    }

    #[test]
    fn test_format_bounds() {
        let fmt = FixedPointFormat::from_fractional_bits(6, BIT_WIDTH);
        assert_eq!(fmt.integer_bits, 2);
        assert_eq!(fmt.step(), 1.0 / 64.0);
        assert_eq!(fmt.max_value(), 127.0 / 64.0);
        assert_eq!(fmt.min_value(), -2.0);
    }

    #[test]
    fn test_deterministic() {
        let weights: Vec<f32> = (0..5000).map(|i| (i as f32).sin() * 0.7).collect();
        let a = select_format_with(&weights, BIT_WIDTH, RangePolicy::MaxElement, 100).unwrap();
        let b = select_format_with(&weights, BIT_WIDTH, RangePolicy::MaxElement, usize::MAX).unwrap();
        assert_eq!(a, b);
    }
}
