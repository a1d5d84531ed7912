//! Safetensors-backed model store.
//!
//! Layers are discovered from tensor names: `<layer>.weight` plus
//! `<layer>.bias` make a generic layer, and a `<layer>.scale` alongside them
//! makes it a normalization layer. Parameters are held as f32 while loaded
//! and written back in the dtype they were read in. Tensors that belong to
//! no layer pass through untouched.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::Path;

use half::{bf16, f16};
use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::{debug, warn};

use super::{overwrite, LayerInfo, LayerKind, ModelStore, ParamRole};
use crate::error::{Error, Result};
use crate::tensor::Tensor;

#[derive(Debug, Clone)]
enum Payload {
    Float(Tensor),
    Raw { shape: Vec<usize>, bytes: Vec<u8> },
}

#[derive(Debug, Clone)]
struct StoredTensor {
    dtype: Dtype,
    payload: Payload,
}

impl StoredTensor {
    fn float(&self) -> Option<&Tensor> {
        match &self.payload {
            Payload::Float(t) => Some(t),
            Payload::Raw { .. } => None,
        }
    }
}

/// Model parameters loaded from a `.safetensors` file.
#[derive(Debug, Clone)]
pub struct SafetensorsModel {
    tensors: BTreeMap<String, StoredTensor>,
    layers: Vec<LayerInfo>,
    metadata: Option<HashMap<String, String>>,
}

fn tensor_name(layer: &str, role: ParamRole) -> String {
    let suffix = match role {
        ParamRole::Weights => "weight",
        ParamRole::Bias => "bias",
        ParamRole::Scale => "scale",
    };
    format!("{}.{}", layer, suffix)
}

fn decode_floats(dtype: Dtype, bytes: &[u8]) -> Option<Vec<f32>> {
    match dtype {
        Dtype::F32 => Some(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        Dtype::F16 => Some(
            bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
        ),
        Dtype::BF16 => Some(
            bytes
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
        ),
        _ => None,
    }
}

fn encode_floats(dtype: Dtype, data: &[f32]) -> Vec<u8> {
    match dtype {
        Dtype::F16 => data
            .iter()
            .flat_map(|&x| f16::from_f32(x).to_le_bytes())
            .collect(),
        Dtype::BF16 => data
            .iter()
            .flat_map(|&x| bf16::from_f32(x).to_le_bytes())
            .collect(),
        _ => data.iter().flat_map(|x| x.to_le_bytes()).collect(),
    }
}

/// Load a safetensors file without copying it into memory first
fn load_safetensors_mmap(path: &Path) -> Result<Mmap> {
    let file = File::open(path)?;
    Ok(unsafe { Mmap::map(&file) }?)
}

impl SafetensorsModel {
    /// Memory-map and load the model at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let mmap = load_safetensors_mmap(path)?;
        debug!(path = %path.display(), bytes = mmap.len(), "mapped safetensors model");
        Self::from_bytes(&mmap)
    }

    /// Load a model from serialized safetensors bytes.
    pub fn from_bytes(buffer: &[u8]) -> Result<Self> {
        let parsed = SafeTensors::deserialize(buffer)
            .map_err(|e| Error::model(format!("failed to parse safetensors: {:?}", e)))?;
        let (_, header) = SafeTensors::read_metadata(buffer)
            .map_err(|e| Error::model(format!("failed to read safetensors header: {:?}", e)))?;

        let mut tensors = BTreeMap::new();
        for (name, view) in parsed.tensors() {
            let dtype = view.dtype();
            let shape = view.shape().to_vec();
            let payload = match decode_floats(dtype, view.data()) {
                Some(data) => Payload::Float(Tensor::new(shape, data)?),
                None => Payload::Raw {
                    shape,
                    bytes: view.data().to_vec(),
                },
            };
            tensors.insert(name, StoredTensor { dtype, payload });
        }

        let layers = discover_layers(&tensors);
        debug!(
            tensors = tensors.len(),
            layers = layers.len(),
            "loaded safetensors model"
        );

        Ok(SafetensorsModel {
            tensors,
            layers,
            metadata: header.metadata().clone(),
        })
    }

    /// Serialize the model, with current parameters, to safetensors bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let encoded: Vec<(&str, Dtype, &[usize], Vec<u8>)> = self
            .tensors
            .iter()
            .map(|(name, stored)| match &stored.payload {
                Payload::Float(t) => (
                    name.as_str(),
                    stored.dtype,
                    t.shape.as_slice(),
                    encode_floats(stored.dtype, &t.data),
                ),
                Payload::Raw { shape, bytes } => {
                    (name.as_str(), stored.dtype, shape.as_slice(), bytes.clone())
                }
            })
            .collect();

        let views = encoded
            .iter()
            .map(|(name, dtype, shape, bytes)| {
                TensorView::new(*dtype, shape.to_vec(), bytes)
                    .map(|view| (*name, view))
                    .map_err(|e| Error::model(format!("tensor '{}': {:?}", name, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        safetensors::serialize(views.iter().map(|(name, view)| (*name, view)), &self.metadata)
            .map_err(|e| Error::model(format!("failed to serialize safetensors: {:?}", e)))
    }

    fn float_tensor(&self, layer: &str, role: ParamRole) -> Result<&Tensor> {
        let kind = self
            .layers
            .iter()
            .find(|l| l.name == layer)
            .map(|l| l.kind)
            .ok_or_else(|| Error::layer_mismatch(layer, "no such layer in model"))?;
        if !kind.owns(role) {
            return Err(Error::layer_mismatch(
                layer,
                format!("{} layer has no {}", kind, role),
            ));
        }
        self.tensors
            .get(&tensor_name(layer, role))
            .and_then(StoredTensor::float)
            .ok_or_else(|| Error::layer_mismatch(layer, format!("{} tensor missing", role)))
    }
}

fn discover_layers(tensors: &BTreeMap<String, StoredTensor>) -> Vec<LayerInfo> {
    let is_float = |name: &str| tensors.get(name).and_then(StoredTensor::float).is_some();

    let mut layers = Vec::new();
    for layer in tensors.keys().filter_map(|name| name.strip_suffix(".weight")) {
        if !is_float(&tensor_name(layer, ParamRole::Weights)) {
            debug!(layer, "weight tensor is not floating point, passing through");
            continue;
        }
        if !is_float(&tensor_name(layer, ParamRole::Bias)) {
            warn!(layer, "no floating-point bias tensor, layer left uncompressed");
            continue;
        }
        let kind = if is_float(&tensor_name(layer, ParamRole::Scale)) {
            LayerKind::Normalization
        } else {
            LayerKind::Generic
        };
        layers.push(LayerInfo::new(layer, kind));
    }
    layers
}

impl ModelStore for SafetensorsModel {
    fn list_layers(&self) -> Vec<LayerInfo> {
        self.layers.clone()
    }

    fn get_parameter(&self, layer: &str, role: ParamRole) -> Result<&Tensor> {
        self.float_tensor(layer, role)
    }

    fn set_parameter(&mut self, layer: &str, role: ParamRole, tensor: &Tensor) -> Result<()> {
        // Ownership and presence checks.
        self.float_tensor(layer, role)?;
        let stored = self
            .tensors
            .get_mut(&tensor_name(layer, role))
            .ok_or_else(|| Error::layer_mismatch(layer, format!("{} tensor missing", role)))?;
        match &mut stored.payload {
            Payload::Float(target) => overwrite(target, layer, role, tensor),
            Payload::Raw { .. } => Err(Error::layer_mismatch(
                layer,
                format!("{} tensor is not floating point", role),
            )),
        }
    }

    fn persist(&self, destination: &Path) -> Result<()> {
        fs::write(destination, self.to_bytes()?)?;
        Ok(())
    }
}
