use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{overwrite, LayerInfo, LayerKind, ModelStore, ParamRole};
use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// One parameter-bearing layer in a JSON model bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub name: String,
    pub kind: LayerKind,
    pub weights: Tensor,
    pub bias: Tensor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<Tensor>,
}

impl LayerRecord {
    /// Generic layer owning weights and bias.
    pub fn generic(name: impl Into<String>, weights: Tensor, bias: Tensor) -> Self {
        LayerRecord {
            name: name.into(),
            kind: LayerKind::Generic,
            weights,
            bias,
            scale: None,
        }
    }

    /// Normalization layer owning weights, bias and scale.
    pub fn normalization(
        name: impl Into<String>,
        weights: Tensor,
        bias: Tensor,
        scale: Tensor,
    ) -> Self {
        LayerRecord {
            name: name.into(),
            kind: LayerKind::Normalization,
            weights,
            bias,
            scale: Some(scale),
        }
    }

    fn tensor(&self, role: ParamRole) -> Option<&Tensor> {
        match role {
            ParamRole::Weights => Some(&self.weights),
            ParamRole::Bias => Some(&self.bias),
            ParamRole::Scale if self.kind.owns(role) => self.scale.as_ref(),
            ParamRole::Scale => None,
        }
    }

    fn tensor_mut(&mut self, role: ParamRole) -> Option<&mut Tensor> {
        match role {
            ParamRole::Weights => Some(&mut self.weights),
            ParamRole::Bias => Some(&mut self.bias),
            ParamRole::Scale if self.kind.owns(role) => self.scale.as_mut(),
            ParamRole::Scale => None,
        }
    }
}

/// A model held as a JSON document of named layers.
///
/// ```json
/// {"layers": [{"name": "conv1", "kind": "generic",
///              "weights": {"shape": [2, 2], "data": [0.1, 0.2, 0.3, 0.4]},
///              "bias": {"shape": [2], "data": [0.0, 0.1]}}]}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    pub layers: Vec<LayerRecord>,
}

impl ModelBundle {
    /// Build a bundle, validating it.
    pub fn new(layers: Vec<LayerRecord>) -> Result<Self> {
        let bundle = ModelBundle { layers };
        bundle.validate()?;
        Ok(bundle)
    }

    /// Load and validate a JSON bundle.
    pub fn open(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let bundle: ModelBundle = serde_json::from_str(data)
            .map_err(|e| Error::model(format!("failed to parse JSON model: {}", e)))?;
        bundle.validate()?;
        Ok(bundle)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Unique names, shapes consistent with data, scale present exactly
    /// on normalization layers.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for layer in &self.layers {
            if !seen.insert(layer.name.as_str()) {
                return Err(Error::model(format!("duplicate layer '{}'", layer.name)));
            }

            let check = |role: ParamRole, t: &Tensor| {
                t.validate()
                    .map_err(|e| Error::model(format!("layer '{}' {}: {}", layer.name, role, e)))
            };
            check(ParamRole::Weights, &layer.weights)?;
            check(ParamRole::Bias, &layer.bias)?;

            match (layer.kind, &layer.scale) {
                (LayerKind::Normalization, Some(scale)) => check(ParamRole::Scale, scale)?,
                (LayerKind::Normalization, None) => {
                    return Err(Error::model(format!(
                        "normalization layer '{}' has no scale tensor",
                        layer.name
                    )))
                }
                (LayerKind::Generic, Some(_)) => {
                    return Err(Error::model(format!(
                        "generic layer '{}' carries a scale tensor",
                        layer.name
                    )))
                }
                (LayerKind::Generic, None) => {}
            }
        }
        Ok(())
    }

    pub fn layer(&self, name: &str) -> Option<&LayerRecord> {
        self.layers.iter().find(|l| l.name == name)
    }

    fn record(&self, name: &str) -> Result<&LayerRecord> {
        self.layer(name)
            .ok_or_else(|| Error::layer_mismatch(name, "no such layer in model"))
    }

    fn record_mut(&mut self, name: &str) -> Result<&mut LayerRecord> {
        self.layers
            .iter_mut()
            .find(|l| l.name == name)
            .ok_or_else(|| Error::layer_mismatch(name, "no such layer in model"))
    }
}

impl ModelStore for ModelBundle {
    fn list_layers(&self) -> Vec<LayerInfo> {
        self.layers
            .iter()
            .map(|l| LayerInfo::new(l.name.clone(), l.kind))
            .collect()
    }

    fn get_parameter(&self, layer: &str, role: ParamRole) -> Result<&Tensor> {
        let record = self.record(layer)?;
        record.tensor(role).ok_or_else(|| {
            Error::layer_mismatch(layer, format!("{} layer has no {}", record.kind, role))
        })
    }

    fn set_parameter(&mut self, layer: &str, role: ParamRole, tensor: &Tensor) -> Result<()> {
        let record = self.record_mut(layer)?;
        let kind = record.kind;
        let target = record.tensor_mut(role).ok_or_else(|| {
            Error::layer_mismatch(layer, format!("{} layer has no {}", kind, role))
        })?;
        overwrite(target, layer, role, tensor)
    }

    fn persist(&self, destination: &Path) -> Result<()> {
        fs::write(destination, self.to_json()?)?;
        Ok(())
    }
}
