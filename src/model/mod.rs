//! Model stores: the codec's view of a trained network's parameters.
//!
//! The codec never builds or owns a model. It lists layers, reads their
//! float tensors, and writes decoded tensors back in place through
//! [`ModelStore`].

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tensor::Tensor;

mod bundle;
mod safetensors_store;

pub use self::bundle::{LayerRecord, ModelBundle};
pub use self::safetensors_store::SafetensorsModel;

/// Layer type as far as the codec cares: which tensors it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Weights and bias.
    Generic,
    /// Weights, bias and a per-channel scale.
    Normalization,
}

impl LayerKind {
    /// Roles owned by a layer of this kind, in archive order.
    pub fn roles(self) -> &'static [ParamRole] {
        match self {
            LayerKind::Generic => &[ParamRole::Weights, ParamRole::Bias],
            LayerKind::Normalization => &[ParamRole::Weights, ParamRole::Bias, ParamRole::Scale],
        }
    }

    pub fn owns(self, role: ParamRole) -> bool {
        self.roles().contains(&role)
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::Generic => f.write_str("generic"),
            LayerKind::Normalization => f.write_str("normalization"),
        }
    }
}

/// Role of a parameter tensor within its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamRole {
    Weights,
    Bias,
    Scale,
}

impl ParamRole {
    /// Position of the tensor in the layer's archive entries (`{name}_{index}`).
    pub fn index(self) -> usize {
        match self {
            ParamRole::Weights => 0,
            ParamRole::Bias => 1,
            ParamRole::Scale => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParamRole::Weights => "weights",
            ParamRole::Bias => "bias",
            ParamRole::Scale => "scale",
        }
    }
}

impl fmt::Display for ParamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A layer as listed by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    pub name: String,
    pub kind: LayerKind,
}

impl LayerInfo {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        LayerInfo {
            name: name.into(),
            kind,
        }
    }
}

/// Addressable set of named layers with float32 parameter tensors.
pub trait ModelStore {
    /// Parameter-bearing layers in model order. Names are unique.
    fn list_layers(&self) -> Vec<LayerInfo>;

    /// Current tensor for `role` of `layer`.
    ///
    /// Fails with [`crate::Error::LayerMismatch`] if the layer is unknown or
    /// its kind does not own `role`.
    fn get_parameter(&self, layer: &str, role: ParamRole) -> Result<&Tensor>;

    /// Overwrite the tensor for `role` of `layer` in place, keeping its shape.
    ///
    /// Fails with [`crate::Error::LayerMismatch`] if the element count of
    /// `tensor` differs from the current tensor's.
    fn set_parameter(&mut self, layer: &str, role: ParamRole, tensor: &Tensor) -> Result<()>;

    /// Write the whole model, with current parameters, to `destination`.
    fn persist(&self, destination: &Path) -> Result<()>;
}

/// Open a model file, choosing the store by extension: `.safetensors` files
/// load as [`SafetensorsModel`], anything else as a JSON [`ModelBundle`].
pub fn load_model(path: &Path) -> Result<Box<dyn ModelStore>> {
    let is_safetensors = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("safetensors"));

    if is_safetensors {
        Ok(Box::new(SafetensorsModel::open(path)?))
    } else {
        Ok(Box::new(ModelBundle::open(path)?))
    }
}

/// Copy `tensor` into `target`, which must have the same element count.
pub(crate) fn overwrite(
    target: &mut Tensor,
    layer: &str,
    role: ParamRole,
    tensor: &Tensor,
) -> Result<()> {
    if target.len() != tensor.len() {
        return Err(crate::Error::layer_mismatch(
            layer,
            format!(
                "{} holds {} elements, got {}",
                role,
                target.len(),
                tensor.len()
            ),
        ));
    }
    target.data.copy_from_slice(&tensor.data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_owns_scale() {
        assert_eq!(LayerKind::Generic.roles().len(), 2);
        assert_eq!(LayerKind::Normalization.roles().len(), 3);
        assert!(!LayerKind::Generic.owns(ParamRole::Scale));
        assert!(LayerKind::Normalization.owns(ParamRole::Scale));
    }

    #[test]
    fn role_indices_follow_archive_order() {
        let indices: Vec<usize> = LayerKind::Normalization
            .roles()
            .iter()
            .map(|r| r.index())
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn overwrite_checks_element_count() {
        let mut target = Tensor::new(vec![2, 2], vec![0.0; 4]).unwrap();
        let same = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        overwrite(&mut target, "fc", ParamRole::Weights, &same).unwrap();
        assert_eq!(target.shape, vec![2, 2]);
        assert_eq!(target.data, vec![1.0, 2.0, 3.0, 4.0]);

        let short = Tensor::from_vec(vec![1.0]);
        assert!(matches!(
            overwrite(&mut target, "fc", ParamRole::Weights, &short),
            Err(crate::Error::LayerMismatch { .. })
        ));
    }
}
