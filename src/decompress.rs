//! Restoring model parameters from an archive.
//!
//! Decoding is all-or-nothing: the header is validated and every layer is
//! decoded into a staging area before the first parameter is written back,
//! so a failure leaves the model untouched.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};

use crate::archive::{ArchiveInfo, ArchiveReader};
use crate::compress::{fractional_bits_key, tensor_key};
use crate::config::CodecConfig;
use crate::error::{Error, Result};
use crate::format::FixedPointFormat;
use crate::model::{LayerInfo, LayerKind, ModelStore, ParamRole};
use crate::quantize::{FixedPointQuantizer, Int8Tensor};
use crate::tensor::Tensor;

/// One layer decoded from an archive, not yet applied to a model.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLayer {
    pub name: String,
    pub kind: LayerKind,
    pub fractional_bits: i32,
    pub tensors: Vec<(ParamRole, Tensor)>,
}

/// What was restored for one layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoredLayer {
    pub name: String,
    pub kind: LayerKind,
    pub format: FixedPointFormat,
    pub elements: usize,
}

/// Summary of a whole-model decompression.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecompressionReport {
    pub info: ArchiveInfo,
    pub layers: Vec<RestoredLayer>,
}

impl DecompressionReport {
    pub fn elements(&self) -> usize {
        self.layers.iter().map(|l| l.elements).sum()
    }
}

/// Decodes archives back into float32 parameters.
#[derive(Debug, Clone, Default)]
pub struct Decompressor {
    quantizer: FixedPointQuantizer,
}

impl Decompressor {
    pub fn new(config: &CodecConfig) -> Self {
        Decompressor {
            quantizer: config.quantizer(),
        }
    }

    /// Decode the tensors of `layer`, shaped like the ones currently in `store`.
    pub fn decode_layer<S>(
        &self,
        archive: &ArchiveReader,
        store: &S,
        layer: &LayerInfo,
    ) -> Result<DecodedLayer>
    where
        S: ModelStore + ?Sized,
    {
        let name = layer.name.as_str();
        let fl_key = fractional_bits_key(name);
        let raw_fl = archive.scalar(&fl_key)?;
        let fractional_bits = i32::try_from(raw_fl).map_err(|_| Error::InvalidEntry {
            key: fl_key,
            expected: "32-bit fractional bit count",
        })?;

        let mut tensors = Vec::with_capacity(layer.kind.roles().len());
        for &role in layer.kind.roles() {
            let target = store.get_parameter(name, role)?;
            let data = archive.int8(&tensor_key(name, role))?;
            if data.len() != target.len() {
                return Err(Error::layer_mismatch(
                    name,
                    format!(
                        "archived {} holds {} elements, model expects {}",
                        role,
                        data.len(),
                        target.len()
                    ),
                ));
            }
            let flat = Int8Tensor {
                shape: vec![data.len()],
                data,
            };
            let restored = self
                .quantizer
                .dequantize(&flat, fractional_bits)
                .reshape(target.shape.clone())?;
            tensors.push((role, restored));
        }

        debug!(layer = name, fractional_bits, "decoded layer");
        Ok(DecodedLayer {
            name: name.to_string(),
            kind: layer.kind,
            fractional_bits,
            tensors,
        })
    }

    /// Decode every layer of `store` from `archive`, then overwrite the
    /// store's parameters in place.
    pub fn decompress<S>(&self, archive: &ArchiveReader, store: &mut S) -> Result<DecompressionReport>
    where
        S: ModelStore + ?Sized,
    {
        let info = archive.validate()?;
        let layers = store.list_layers();

        let known: HashSet<&str> = layers.iter().map(|l| l.name.as_str()).collect();
        if let Some(extra) = archive
            .layer_names()
            .into_iter()
            .find(|name| !known.contains(name))
        {
            return Err(Error::layer_mismatch(extra, "archived layer not present in model"));
        }

        let staged = layers
            .iter()
            .map(|layer| self.decode_layer(archive, &*store, layer))
            .collect::<Result<Vec<_>>>()?;

        let mut restored = Vec::with_capacity(staged.len());
        for decoded in staged {
            let mut elements = 0;
            for (role, tensor) in &decoded.tensors {
                store.set_parameter(&decoded.name, *role, tensor)?;
                elements += tensor.len();
            }
            info!(
                layer = decoded.name.as_str(),
                fractional_bits = decoded.fractional_bits,
                "restored layer"
            );
            restored.push(RestoredLayer {
                name: decoded.name,
                kind: decoded.kind,
                format: FixedPointFormat::from_fractional_bits(
                    decoded.fractional_bits,
                    info.bit_width as u32,
                ),
                elements,
            });
        }

        Ok(DecompressionReport {
            info,
            layers: restored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveWriter, Entry};
    use crate::compress::Compressor;
    use crate::model::{LayerRecord, ModelBundle};

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
                Tensor::from_vec(vec![0.25, 0.125]),
            ),
        ])
        .unwrap()
    }

    fn zeroed() -> ModelBundle {
        let mut m = model();
        for layer in &mut m.layers {
            layer.weights.data.iter_mut().for_each(|x| *x = 0.0);
            layer.bias.data.iter_mut().for_each(|x| *x = 0.0);
            if let Some(s) = layer.scale.as_mut() {
                s.data.iter_mut().for_each(|x| *x = 0.0);
            }
        }
        m
    }

    fn archive_for(store: &ModelBundle) -> ArchiveReader {
        let (writer, _) = Compressor::default().compress(store).unwrap();
        ArchiveReader::from_bytes(writer.to_bytes(3).unwrap()).unwrap()
    }

    fn writer_with(info: ArchiveInfo, entries: &[(&str, Entry)]) -> ArchiveReader {
        let mut w = ArchiveWriter::with_info(info);
        for (k, e) in entries {
            w.insert(*k, e.clone()).unwrap();
        }
        ArchiveReader::from_bytes(w.to_bytes(3).unwrap()).unwrap()
    }

    #[test]
    fn restores_reference_values() {
        let archive = archive_for(&model());
        let mut target = zeroed();
        let report = Decompressor::default()
            .decompress(&archive, &mut target)
            .unwrap();

        let w = target.get_parameter("conv1", ParamRole::Weights).unwrap();
        assert_eq!(w.shape, vec![1, 3]);
        assert_eq!(w.data, vec![0.296875, -0.90625, 1.203125]);
        assert_eq!(
            target.get_parameter("bn1", ParamRole::Scale).unwrap().data,
            vec![0.25, 0.125]
        );
        assert_eq!(report.layers.len(), 2);
        assert_eq!(report.layers[0].format.fractional_bits, 6);
        assert_eq!(report.layers[0].format.integer_bits, 2);
        assert_eq!(report.layers[1].format.integer_bits, 0);
        assert_eq!(report.elements(), 11);
    }

    #[test]
    fn rejects_future_version_before_touching_layers() {
        let archive = writer_with(
            ArchiveInfo {
                format_version: 2,
                bit_width: 8,
            },
            &[],
        );
        let mut target = zeroed();
        let err = Decompressor::default()
            .decompress(&archive, &mut target)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedVersion {
                found: 2,
                expected: 1
            }
        ));
        assert_eq!(target, zeroed());
    }

    #[test]
    fn rejects_other_bit_width() {
        let archive = writer_with(
            ArchiveInfo {
                format_version: 1,
                bit_width: 16,
            },
            &[],
        );
        let err = Decompressor::default()
            .decompress(&archive, &mut zeroed())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedBitWidth { found: 16, .. }));
    }

    #[test]
    fn scale_under_legacy_key_is_missing() {
        let archive = writer_with(
            ArchiveInfo::default(),
            &[
                ("conv1_fl", Entry::Scalar(6)),
                ("conv1_0", Entry::Int8(vec![19, -58, 77])),
                ("conv1_1", Entry::Int8(vec![3, -3])),
                ("bn1_fl", Entry::Scalar(8)),
                ("bn1_0", Entry::Int8(vec![127, 64])),
                ("bn1_1", Entry::Int8(vec![26, -26])),
                ("bn1_3", Entry::Int8(vec![64, 32])),
            ],
        );
        let mut target = zeroed();
        let err = Decompressor::default()
            .decompress(&archive, &mut target)
            .unwrap_err();
        assert!(matches!(err, Error::MissingKey(key) if key == "bn1_2"));
        // conv1 decoded fine but nothing was applied.
        assert_eq!(target, zeroed());
    }

    #[test]
    fn archive_layer_absent_from_model() {
        let mut bigger = model();
        bigger.layers.push(LayerRecord::generic(
            "fc9",
            Tensor::from_vec(vec![1.0]),
            Tensor::from_vec(vec![0.0]),
        ));
        let archive = archive_for(&bigger);
        let err = Decompressor::default()
            .decompress(&archive, &mut zeroed())
            .unwrap_err();
        assert!(matches!(err, Error::LayerMismatch { layer, .. } if layer == "fc9"));
    }

    #[test]
    fn model_layer_absent_from_archive() {
        let archive = archive_for(&model());
        let mut bigger = zeroed();
        bigger.layers.push(LayerRecord::generic(
            "fc9",
            Tensor::from_vec(vec![1.0]),
            Tensor::from_vec(vec![0.0]),
        ));
        let err = Decompressor::default()
            .decompress(&archive, &mut bigger)
            .unwrap_err();
        assert!(matches!(err, Error::MissingKey(key) if key == "fc9_fl"));
    }

    #[test]
    fn element_count_mismatch() {
        let archive = archive_for(&model());
        let mut reshaped = zeroed();
        reshaped.layers[0].weights = Tensor::from_vec(vec![0.0; 4]);
        let err = Decompressor::default()
            .decompress(&archive, &mut reshaped)
            .unwrap_err();
        assert!(matches!(err, Error::LayerMismatch { layer, .. } if layer == "conv1"));
    }

    #[test]
    fn mistyped_fractional_bits() {
        let archive = writer_with(
            ArchiveInfo::default(),
            &[("conv1_fl", Entry::Int8(vec![6]))],
        );
        let layer = LayerInfo::new("conv1", LayerKind::Generic);
        let err = Decompressor::default()
            .decode_layer(&archive, &model(), &layer)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEntry { .. }));
    }
}
