use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use compz::compression::compression_ratio;
use compz::{
    compress_model, compress_to_file, decompress_from_file, load_model, ArchiveReader,
    CodecConfig, Decompressor, ErrorStats, FixedPointFormat, ModelStore, OverflowPolicy,
    RangePolicy, BIT_WIDTH,
};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// compz CLI: 8-bit fixed-point compression of model parameters.
#[derive(Parser, Debug)]
#[command(author, version, about = "compz model parameter compressor", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compress a model (JSON bundle or .safetensors) into a compz archive.
    Compress {
        /// Input model file
        #[arg(short, long)]
        model: String,
        /// Output archive file
        #[arg(short, long)]
        output: String,
        /// Statistic used to size each layer's integer bits
        #[arg(long, value_enum)]
        range: Option<RangePolicy>,
        /// Handling of values outside the int8 range
        #[arg(long, value_enum)]
        overflow: Option<OverflowPolicy>,
        /// Zstd level (1-22)
        #[arg(long)]
        level: Option<i32>,
        /// JSON codec configuration; flags override its values
        #[arg(long)]
        config: Option<String>,
    },
    /// Restore parameters from an archive into a template model.
    Decompress {
        /// Input archive file
        #[arg(short, long)]
        archive: String,
        /// Template model with the same layers and shapes
        #[arg(short, long)]
        model: String,
        /// Output model file, written in the template's format
        #[arg(short, long)]
        output: String,
    },
    /// Inspect an archive and print a human-readable summary.
    Inspect {
        /// Input archive file
        #[arg(short, long)]
        input: String,
    },
    /// Compare range and overflow policies on a model.
    Bench {
        /// Input model file
        #[arg(short, long)]
        model: String,
        /// Zstd level (1-22)
        #[arg(long, default_value_t = 3)]
        level: i32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Compress {
            model,
            output,
            range,
            overflow,
            level,
            config,
        } => {
            let mut codec = match config {
                Some(path) => CodecConfig::from_json_file(Path::new(&path))
                    .with_context(|| format!("Failed to load codec config: {}", path))?,
                None => CodecConfig::default(),
            };
            if let Some(range) = range {
                codec.range_policy = range;
            }
            if let Some(overflow) = overflow {
                codec.overflow = overflow;
            }
            if let Some(level) = level {
                codec.zstd_level = level;
            }
            compress_cmd(&model, &output, &codec)?
        }
        Commands::Decompress {
            archive,
            model,
            output,
        } => decompress_cmd(&archive, &model, &output)?,
        Commands::Inspect { input } => inspect_cmd(&input)?,
        Commands::Bench { model, level } => bench_cmd(&model, level)?,
    }

    Ok(())
}

/// Decode every layer of `archive` against `store` and compare it with the
/// parameters the store currently holds, per layer.
fn reconstruction_error(
    store: &dyn ModelStore,
    archive: &ArchiveReader,
    config: &CodecConfig,
) -> compz::Result<Vec<(String, ErrorStats)>> {
    let decompressor = Decompressor::new(config);
    let mut per_layer = Vec::new();
    for layer in store.list_layers() {
        let decoded = decompressor.decode_layer(archive, store, &layer)?;
        let mut stats = ErrorStats::new();
        for (role, restored) in &decoded.tensors {
            let original = store.get_parameter(&layer.name, *role)?;
            stats.update(&original.data, &restored.data);
        }
        per_layer.push((layer.name, stats));
    }
    Ok(per_layer)
}

fn total_error(per_layer: &[(String, ErrorStats)]) -> ErrorStats {
    let mut total = ErrorStats::new();
    for (_, stats) in per_layer {
        total.merge(stats);
    }
    total
}

fn compress_cmd(input: &str, output: &str, config: &CodecConfig) -> Result<()> {
    let model = load_model(Path::new(input))
        .with_context(|| format!("Failed to load model: {}", input))?;

    let (report, written) = compress_to_file(model.as_ref(), Path::new(output), config)
        .with_context(|| format!("Compression failed for {}", input))?;

    let input_bytes = fs::metadata(input)
        .with_context(|| format!("Failed to stat model file: {}", input))?
        .len();
    println!("Layers:            {}", report.layers.len());
    println!("Parameters:        {}", report.elements());
    println!("Model file size:   {} bytes", input_bytes);
    println!("Float32 size:      {} bytes", report.original_bytes());
    println!("Archive size:      {} bytes", written);
    if written > 0 {
        println!(
            "Compression ratio: {:.2}x (float32 / archive)",
            compression_ratio(report.original_bytes(), written)
        );
    }
    if report.out_of_range() > 0 {
        println!(
            "Out of int8 range: {} values ({:?})",
            report.out_of_range(),
            config.overflow
        );
    }

    // Compute reconstruction error by decoding the archive just written.
    let archive = ArchiveReader::open(Path::new(output))
        .with_context(|| format!("Failed to reopen archive: {}", output))?;
    let per_layer = reconstruction_error(model.as_ref(), &archive, config)
        .context("Decompression for metrics failed")?;
    let stats = total_error(&per_layer);

    if stats.count > 0 {
        println!("Reconstruction error (over {} values):", stats.count);
        println!("  MSE:  {:.6}", stats.mse());
        println!("  MAE:  {:.6}", stats.mae());
        println!("  MAX:  {:.6}", stats.max);
        for ((name, layer_stats), layer) in per_layer.iter().zip(&report.layers) {
            println!(
                "    - {}: Q{}.{}, MAE {:.6}, MAX {:.6}",
                name,
                layer.format.integer_bits,
                layer.format.fractional_bits,
                layer_stats.mae(),
                layer_stats.max
            );
        }
    }

    Ok(())
}

fn decompress_cmd(archive: &str, template: &str, output: &str) -> Result<()> {
    let mut model = load_model(Path::new(template))
        .with_context(|| format!("Failed to load template model: {}", template))?;

    let report = decompress_from_file(model.as_mut(), Path::new(archive), &CodecConfig::default())
        .with_context(|| format!("Decompression failed for {}", archive))?;

    model
        .persist(Path::new(output))
        .with_context(|| format!("Failed to write model file: {}", output))?;

    println!(
        "Restored {} layers ({} values) from {} into {}",
        report.layers.len(),
        report.elements(),
        archive,
        output
    );

    Ok(())
}

fn inspect_cmd(input: &str) -> Result<()> {
    let archive = ArchiveReader::open(Path::new(input))
        .with_context(|| format!("Failed to read archive file: {}", input))?;
    let info = archive.info().context("Failed to read archive header")?;

    println!("Archive: {}", input);
    println!("  Size:       {} bytes", archive.byte_len());
    println!("  Version:    {}", info.format_version);
    println!("  Bit width:  {}", info.bit_width);
    if let Err(e) = archive.validate() {
        println!("  Warning:    {}", e);
    }
    println!("  Entries:    {}", archive.headers().len());

    for h in archive.headers() {
        println!(
            "    - {}: {} x {}, {} bytes stored",
            h.key,
            h.elements,
            h.kind.as_str(),
            h.stored_len
        );
    }

    let layers = archive.layer_names();
    println!("  Layers:     {}", layers.len());
    for name in layers {
        let fl = archive
            .scalar(&compz::compress::fractional_bits_key(name))
            .with_context(|| format!("Failed to read fractional bits of {}", name))?;
        match i32::try_from(fl) {
            Ok(fb) => {
                let format = FixedPointFormat::from_fractional_bits(fb, BIT_WIDTH);
                println!(
                    "    - {}: Q{}.{} (step {})",
                    name,
                    format.integer_bits,
                    format.fractional_bits,
                    format.step()
                );
            }
            Err(_) => println!("    - {}: invalid fractional bits {}", name, fl),
        }
    }

    Ok(())
}

struct Candidate {
    range: RangePolicy,
    overflow: OverflowPolicy,
    archive_bytes: usize,
    out_of_range: usize,
    mse: f64,
    mae: f64,
    max: f64,
}

fn evaluate_policies(model: &dyn ModelStore, level: i32) -> Result<Vec<Candidate>> {
    let mut candidates = Vec::new();

    for range in [RangePolicy::MaxElement, RangePolicy::MaxAbs] {
        for overflow in [OverflowPolicy::Saturate, OverflowPolicy::Wrap] {
            let config = CodecConfig {
                range_policy: range,
                overflow,
                zstd_level: level,
                ..CodecConfig::default()
            };

            let (writer, report) = match compress_model(model, &config) {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("Skipping {:?}/{:?} due to compression error: {}", range, overflow, e);
                    continue;
                }
            };

            let bytes = writer.to_bytes(level).context("Failed to serialize archive")?;
            let archive = ArchiveReader::from_bytes(bytes).context("Failed to reread archive")?;
            let stats = total_error(
                &reconstruction_error(model, &archive, &config)
                    .context("Decompression for metrics failed")?,
            );

            candidates.push(Candidate {
                range,
                overflow,
                archive_bytes: archive.byte_len(),
                out_of_range: report.out_of_range(),
                mse: stats.mse(),
                mae: stats.mae(),
                max: stats.max,
            });
        }
    }

    Ok(candidates)
}

fn bench_cmd(input: &str, level: i32) -> Result<()> {
    let model = load_model(Path::new(input))
        .with_context(|| format!("Failed to load model: {}", input))?;

    let candidates = evaluate_policies(model.as_ref(), level)?;

    if candidates.is_empty() {
        return Err(anyhow::Error::msg("No policy combination compressed the model"));
    }

    println!("Policy benchmark for {}:", input);
    println!(
        "  {:<12} {:<10} {:>10} {:>8} {:>12} {:>12} {:>12}",
        "range", "overflow", "bytes", "clipped", "MSE", "MAE", "MAX"
    );
    for c in &candidates {
        println!(
            "  {:<12} {:<10} {:>10} {:>8} {:>12.6} {:>12.6} {:>12.6}",
            format!("{:?}", c.range),
            format!("{:?}", c.overflow),
            c.archive_bytes,
            c.out_of_range,
            c.mse,
            c.mae,
            c.max
        );
    }

    Ok(())
}
