//! Dense float32 parameter tensors.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::numel;

/// A dense, row-major float32 tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Build a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let tensor = Tensor { shape, data };
        tensor.validate()?;
        Ok(tensor)
    }

    /// One-dimensional tensor over `data`.
    pub fn from_vec(data: Vec<f32>) -> Self {
        Tensor {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check that the shape's element count matches the data length.
    pub fn validate(&self) -> Result<()> {
        let expected = numel(&self.shape)?;
        if expected != self.data.len() {
            return Err(Error::domain(format!(
                "tensor has shape {:?} (size {}), but data length {}",
                self.shape,
                expected,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Reinterpret the data under `shape`; element counts must agree.
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self> {
        Tensor::new(shape, self.data)
    }

    /// Size of the data in bytes when stored as float32.
    pub fn byte_len(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}
