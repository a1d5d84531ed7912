//! Layer-by-layer compression of a model store into an archive.

use serde::Serialize;
use tracing::{info, warn};

use crate::archive::{ArchiveInfo, ArchiveWriter, Entry};
use crate::config::CodecConfig;
use crate::error::{Error, Result};
use crate::format::{select_format_with, FixedPointFormat, RangePolicy, BIT_WIDTH};
use crate::model::{LayerInfo, LayerKind, ModelStore, ParamRole};
use crate::utils::min_element;

/// Suffix of the key holding a layer's fractional bits.
pub const FRACTIONAL_BITS_SUFFIX: &str = "_fl";

/// Key holding the fractional bits of `layer`.
pub fn fractional_bits_key(layer: &str) -> String {
    format!("{}{}", layer, FRACTIONAL_BITS_SUFFIX)
}

/// Key holding the quantized `role` tensor of `layer`.
pub fn tensor_key(layer: &str, role: ParamRole) -> String {
    format!("{}_{}", layer, role.index())
}

/// What happened to one layer during compression.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerReport {
    pub name: String,
    pub kind: LayerKind,
    pub format: FixedPointFormat,
    /// Parameters encoded across all of the layer's tensors.
    pub elements: usize,
    /// Size of those parameters as float32.
    pub original_bytes: usize,
    /// Parameters that did not fit in i8 and were clamped or wrapped.
    pub out_of_range: usize,
}

/// Summary of a whole-model compression.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompressionReport {
    pub layers: Vec<LayerReport>,
}

impl CompressionReport {
    pub fn elements(&self) -> usize {
        self.layers.iter().map(|l| l.elements).sum()
    }

    pub fn out_of_range(&self) -> usize {
        self.layers.iter().map(|l| l.out_of_range).sum()
    }

    /// Size of the parameters as float32.
    pub fn original_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.original_bytes).sum()
    }
}

/// Archive entries emitted for one layer, in write order.
#[derive(Debug, Clone)]
pub struct LayerEntries {
    pub entries: Vec<(String, Entry)>,
    pub report: LayerReport,
}

/// Quantizes every layer of a model store at its own fixed-point format.
#[derive(Debug, Clone, Default)]
pub struct Compressor {
    config: CodecConfig,
}

impl Compressor {
    pub fn new(config: CodecConfig) -> Self {
        Compressor { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Encode one layer: select a format from its weights, then quantize
    /// every tensor the layer's kind owns at that format.
    pub fn compress_layer<S>(&self, store: &S, layer: &LayerInfo) -> Result<LayerEntries>
    where
        S: ModelStore + ?Sized,
    {
        let name = layer.name.as_str();
        let weights = store.get_parameter(name, ParamRole::Weights)?;
        let format = select_format_with(
            &weights.data,
            BIT_WIDTH,
            self.config.range_policy,
            self.config.parallel_threshold,
        )
        .map_err(|e| match e {
            Error::Domain(msg) => Error::domain(format!("layer '{}': {}", name, msg)),
            other => other,
        })?;

        if self.config.range_policy == RangePolicy::MaxElement {
            let peak = format.max_value();
            if let Some(min) = min_element(&weights.data, self.config.parallel_threshold) {
                if (min as f64) < format.min_value() {
                    warn!(
                        layer = name,
                        min,
                        representable = -peak,
                        "negative weights exceed the range chosen from the maximum element"
                    );
                }
            }
        }

        let quantizer = self.config.quantizer();
        let mut entries = Vec::with_capacity(1 + layer.kind.roles().len());
        entries.push((
            fractional_bits_key(name),
            Entry::Scalar(format.fractional_bits as i64),
        ));

        let mut elements = 0;
        let mut original_bytes = 0;
        let mut out_of_range = 0;
        for &role in layer.kind.roles() {
            let tensor = store.get_parameter(name, role)?;
            let quantized = quantizer.quantize(tensor, format.fractional_bits);
            elements += tensor.len();
            original_bytes += tensor.byte_len();
            out_of_range += quantized.out_of_range;
            entries.push((tensor_key(name, role), Entry::Int8(quantized.tensor.data)));
        }

        if out_of_range > 0 {
            warn!(
                layer = name,
                out_of_range,
                policy = ?quantizer.overflow(),
                "values outside the int8 range"
            );
        }

        info!(
            layer = name,
            kind = %layer.kind,
            fractional_bits = format.fractional_bits,
            "compressed layer"
        );

        Ok(LayerEntries {
            entries,
            report: LayerReport {
                name: name.to_string(),
                kind: layer.kind,
                format,
                elements,
                original_bytes,
                out_of_range,
            },
        })
    }

    /// Compress every layer of `store`, sequentially, into a new archive.
    /// Any failure aborts the whole operation.
    pub fn compress<S>(&self, store: &S) -> Result<(ArchiveWriter, CompressionReport)>
    where
        S: ModelStore + ?Sized,
    {
        let mut writer = ArchiveWriter::with_info(ArchiveInfo::default());
        let mut report = CompressionReport::default();

        for layer in store.list_layers() {
            let encoded = self.compress_layer(store, &layer)?;
            for (key, entry) in encoded.entries {
                writer.insert(key, entry)?;
            }
            report.layers.push(encoded.report);
        }

        Ok((writer, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LayerRecord, ModelBundle};
    use crate::quantize::OverflowPolicy;
    use crate::tensor::Tensor;

    fn model() -> ModelBundle {
        ModelBundle::new(vec![
            LayerRecord::generic(
                "conv1",
                Tensor::new(vec![1, 3], vec![0.3, -0.9, 1.2]).unwrap(),
                Tensor::from_vec(vec![0.05, -0.05]),
            ),
            LayerRecord::normalization(
                "bn1",
                Tensor::from_vec(vec![0.5, 0.25]),
                Tensor::from_vec(vec![0.1, -0.1]),
                Tensor::from_vec(vec![0.9, 0.8]),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn keys_follow_naming_scheme() {
        assert_eq!(fractional_bits_key("conv1"), "conv1_fl");
        assert_eq!(tensor_key("conv1", ParamRole::Weights), "conv1_0");
        assert_eq!(tensor_key("conv1", ParamRole::Bias), "conv1_1");
        assert_eq!(tensor_key("bn1", ParamRole::Scale), "bn1_2");
    }

    #[test]
    fn generic_layer_emits_three_entries() {
        let store = model();
        let layer = LayerInfo::new("conv1", LayerKind::Generic);
        let encoded = Compressor::default().compress_layer(&store, &layer).unwrap();

        let keys: Vec<&str> = encoded.entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["conv1_fl", "conv1_0", "conv1_1"]);
        assert_eq!(encoded.entries[0].1, Entry::Scalar(6));
        assert_eq!(encoded.entries[1].1, Entry::Int8(vec![19, -58, 77]));
        // Bias reuses the weights' fractional bits: 0.05 * 64 = 3.2
        assert_eq!(encoded.entries[2].1, Entry::Int8(vec![3, -3]));
        assert_eq!(encoded.report.elements, 5);
        assert_eq!(encoded.report.original_bytes, 20);
        assert_eq!(encoded.report.out_of_range, 0);
    }

    #[test]
    fn normalization_layer_emits_four_entries() {
        let store = model();
        let layer = LayerInfo::new("bn1", LayerKind::Normalization);
        let encoded = Compressor::default().compress_layer(&store, &layer).unwrap();

        let keys: Vec<&str> = encoded.entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["bn1_fl", "bn1_0", "bn1_1", "bn1_2"]);
        // max 0.5 -> log2 = -1 -> 0 integer bits -> 8 fractional bits
        assert_eq!(encoded.entries[0].1, Entry::Scalar(8));
        // Scale 0.9 * 256 = 230 does not fit and saturates.
        assert_eq!(encoded.entries[3].1, Entry::Int8(vec![127, 127]));
        assert_eq!(encoded.report.out_of_range, 3);
    }

    #[test]
    fn wrap_policy_truncates() {
        let store = model();
        let config = CodecConfig {
            overflow: OverflowPolicy::Wrap,
            ..CodecConfig::default()
        };
        let layer = LayerInfo::new("bn1", LayerKind::Normalization);
        let encoded = Compressor::new(config).compress_layer(&store, &layer).unwrap();
        // 0.9 * 256 = 230.4 -> 230 -> -26; 0.8 * 256 = 204.8 -> 205 -> -51
        assert_eq!(encoded.entries[3].1, Entry::Int8(vec![-26, -51]));
    }

    #[test]
    fn whole_model_archive() {
        let (writer, report) = Compressor::default().compress(&model()).unwrap();
        assert_eq!(writer.len(), 1 + 3 + 4);
        assert_eq!(
            writer.get(crate::archive::INFO_KEY),
            Some(&Entry::Ints(vec![1, 8]))
        );
        assert_eq!(report.layers.len(), 2);
        assert_eq!(report.elements(), 5 + 6);
        assert_eq!(report.original_bytes(), 44);
    }

    #[test]
    fn non_positive_weights_abort() {
        let store = ModelBundle::new(vec![LayerRecord::generic(
            "dead",
            Tensor::from_vec(vec![-0.5, -0.1]),
            Tensor::from_vec(vec![0.0]),
        )])
        .unwrap();

        let err = Compressor::default().compress(&store).unwrap_err();
        assert!(matches!(err, Error::Domain(msg) if msg.contains("dead")));

        // Opting into magnitudes accepts the same layer.
        let config = CodecConfig {
            range_policy: RangePolicy::MaxAbs,
            ..CodecConfig::default()
        };
        assert!(Compressor::new(config).compress(&store).is_ok());
    }
}
