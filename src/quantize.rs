use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// Default element count above which quantization runs on the rayon pool.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 10000;

/// What happens to values that do not fit in i8 after scaling.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Clamp into [-128, 127].
    #[default]
    Saturate,
    /// Keep the low 8 bits of the rounded integer (two's-complement wrap).
    Wrap,
}

/// Int8 tensor with the shape of the float tensor it encodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Int8Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<i8>,
}

/// Quantizer output: the encoded tensor and how many elements were out of range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quantized {
    pub tensor: Int8Tensor,
    pub out_of_range: usize,
}

/// Fixed-point int8 quantizer.
#[derive(Debug, Clone, Copy)]
pub struct FixedPointQuantizer {
    overflow: OverflowPolicy,
    parallel_threshold: usize,
}

impl Default for FixedPointQuantizer {
    fn default() -> Self {
        FixedPointQuantizer::new(OverflowPolicy::default())
    }
}

impl FixedPointQuantizer {
    pub fn new(overflow: OverflowPolicy) -> Self {
        FixedPointQuantizer {
            overflow,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }

    pub fn with_parallel_threshold(mut self, parallel_threshold: usize) -> Self {
        self.parallel_threshold = parallel_threshold;
        self
    }

    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Quantize FP32 tensor to INT8 at `fractional_bits`.
    ///
    /// Each element becomes `round(x * 2^fractional_bits)`, rounding half
    /// away from zero, then narrowed per the overflow policy.
    pub fn quantize(&self, tensor: &Tensor, fractional_bits: i32) -> Quantized {
        let scale = 2f64.powi(fractional_bits);
        let overflow = self.overflow;

        let (data, out_of_range) = if tensor.len() > self.parallel_threshold {
            let data: Vec<i8> = tensor
                .data
                .par_iter()
                .map(|&x| narrow(scaled(x, scale), overflow))
                .collect();
            let out_of_range = tensor
                .data
                .par_iter()
                .filter(|&&x| !fits_i8(scaled(x, scale)))
                .count();
            (data, out_of_range)
        } else {
            let data: Vec<i8> = tensor
                .data
                .iter()
                .map(|&x| narrow(scaled(x, scale), overflow))
                .collect();
            let out_of_range = tensor
                .data
                .iter()
                .filter(|&&x| !fits_i8(scaled(x, scale)))
                .count();
            (data, out_of_range)
        };

        Quantized {
            tensor: Int8Tensor {
                shape: tensor.shape.clone(),
                data,
            },
            out_of_range,
        }
    }

    /// Dequantize INT8 back to FP32: `q * 2^-fractional_bits`.
    pub fn dequantize(&self, quantized: &Int8Tensor, fractional_bits: i32) -> Tensor {
        let step = 2f64.powi(-fractional_bits);

        let data: Vec<f32> = if quantized.data.len() > self.parallel_threshold {
            quantized
                .data
                .par_iter()
                .map(|&q| (q as f64 * step) as f32)
                .collect()
        } else {
            quantized
                .data
                .iter()
                .map(|&q| (q as f64 * step) as f32)
                .collect()
        };

        Tensor {
            shape: quantized.shape.clone(),
            data,
        }
    }
}

#[inline]
fn scaled(x: f32, scale: f64) -> f64 {
    (x as f64 * scale).round()
}

#[inline]
fn fits_i8(v: f64) -> bool {
    (i8::MIN as f64..=i8::MAX as f64).contains(&v)
}

#[inline]
fn narrow(v: f64, overflow: OverflowPolicy) -> i8 {
    match overflow {
        // NaN saturates to 0 under `as`.
        OverflowPolicy::Saturate => v.clamp(i8::MIN as f64, i8::MAX as f64) as i8,
        OverflowPolicy::Wrap => (v as i64) as i8,
    }
}

/// Standalone quantization with the default (saturating) policy.
pub fn quantize(tensor: &Tensor, fractional_bits: i32) -> Int8Tensor {
    FixedPointQuantizer::default()
        .quantize(tensor, fractional_bits)
        .tensor
}

/// Standalone dequantization.
pub fn dequantize(quantized: &Int8Tensor, fractional_bits: i32) -> Tensor {
    FixedPointQuantizer::default().dequantize(quantized, fractional_bits)
}
