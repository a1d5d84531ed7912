//! compz: 8-bit dynamic fixed-point compression of trained model parameters.
//!
//! Each parameter-bearing layer gets its own fixed-point format, chosen from
//! the largest value in its weight tensor. Weights, bias and (for
//! normalization layers) scale are quantized to int8 at that format and
//! stored in a versioned archive alongside the format's fractional bits.
//! Decompression restores float32 parameters into a structurally matching
//! model, in place.
//!
//! ```no_run
//! use std::path::Path;
//! use compz::{compress_to_file, decompress_from_file, CodecConfig, ModelBundle};
//!
//! # fn main() -> compz::Result<()> {
//! let config = CodecConfig::default();
//! let model = ModelBundle::open(Path::new("model.json"))?;
//! compress_to_file(&model, Path::new("model.compz"), &config)?;
//!
//! let mut template = ModelBundle::open(Path::new("model.json"))?;
//! decompress_from_file(&mut template, Path::new("model.compz"), &config)?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use tracing::info;

pub mod archive;
pub mod compress;
pub mod compression;
pub mod config;
pub mod decompress;
pub mod error;
pub mod format;
pub mod metrics;
pub mod model;
pub mod quantize;
pub mod tensor;
pub mod utils;

pub use archive::{ArchiveInfo, ArchiveReader, ArchiveWriter, Entry, EntryKind, FORMAT_VERSION};
pub use compress::{CompressionReport, Compressor, LayerReport};
pub use config::CodecConfig;
pub use decompress::{DecompressionReport, Decompressor};
pub use error::{Error, Result};
pub use format::{select_format, select_format_with, FixedPointFormat, RangePolicy, BIT_WIDTH};
pub use metrics::ErrorStats;
pub use model::{
    load_model, LayerInfo, LayerKind, LayerRecord, ModelBundle, ModelStore, ParamRole,
    SafetensorsModel,
};
pub use quantize::{dequantize, quantize, FixedPointQuantizer, Int8Tensor, OverflowPolicy};
pub use tensor::Tensor;

/// Compress every layer of `store` into an in-memory archive.
pub fn compress_model<S>(store: &S, config: &CodecConfig) -> Result<(ArchiveWriter, CompressionReport)>
where
    S: ModelStore + ?Sized,
{
    config.validate()?;
    Compressor::new(config.clone()).compress(store)
}

/// Compress `store` and write the archive to `path`.
///
/// Returns the report and the archive size in bytes. Nothing is written
/// unless every layer compressed.
pub fn compress_to_file<S>(
    store: &S,
    path: &Path,
    config: &CodecConfig,
) -> Result<(CompressionReport, usize)>
where
    S: ModelStore + ?Sized,
{
    let (writer, report) = compress_model(store, config)?;
    let written = writer.write_to(path, config.zstd_level)?;
    info!(
        path = %path.display(),
        layers = report.layers.len(),
        bytes = written,
        "wrote archive"
    );
    Ok((report, written))
}

/// Restore the parameters of `store` from `archive`.
pub fn decompress_model<S>(
    store: &mut S,
    archive: &ArchiveReader,
    config: &CodecConfig,
) -> Result<DecompressionReport>
where
    S: ModelStore + ?Sized,
{
    Decompressor::new(config).decompress(archive, store)
}

/// Open the archive at `path` and restore the parameters of `store` from it.
pub fn decompress_from_file<S>(
    store: &mut S,
    path: &Path,
    config: &CodecConfig,
) -> Result<DecompressionReport>
where
    S: ModelStore + ?Sized,
{
    let archive = ArchiveReader::open(path)?;
    decompress_model(store, &archive, config)
}
