//! nanoquant CLI
//!
//! Command-line interface for multi-level model compression.

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use indicatif::{ProgressBar, ProgressStyle};
use nanoquant_compress::artifact::{ArtifactReader, LayerReport};
use nanoquant_compress::calibration::{CalibrationSignal, SampleInput};
use nanoquant_compress::model::Model;
use nanoquant_compress::pipeline::{
    compress_all_levels, CompressOptions, CompressionPipeline, PipelineState,
};
use nanoquant_compress::policy::{Level, TechniqueChain};
use nanoquant_core::CodecKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// JSON output for compression results.
#[derive(Serialize)]
struct CompressOutput {
    success: bool,
    operation: String,
    input: String,
    output: String,
    level: String,
    layers: usize,
    degraded_layers: usize,
    original_size: u64,
    compressed_size: u64,
    size_ratio: f64,
    bits_per_weight: f64,
    estimated_quality_loss: f64,
    digest: String,
    time_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    per_layer: Option<Vec<LayerReport>>,
}

/// JSON output for one row of a sweep.
#[derive(Serialize)]
struct SweepRow {
    level: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bits_per_weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    estimated_quality_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// JSON output for the level catalogue.
#[derive(Serialize)]
struct LevelRow {
    level: String,
    description: String,
    target_reduction: (f64, f64),
    estimated_ratio: f64,
    techniques: Vec<String>,
    requires_calibration: bool,
}

/// Compression level
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LevelArg {
    /// 4/8-bit mixed precision, light pruning
    Light,
    /// 2-8 bit mixed precision, 30% pruning
    Medium,
    /// 2-4 bit tiers with low-rank correction (needs calibration)
    Heavy,
    /// Ternary and 2-3 bit tiers, 70% sparsity
    Extreme,
    /// Binary and ternary tiers, 85% sparsity
    Ultra,
    /// Binary and ternary tiers, 90% sparsity
    Nano,
    /// Count-sketch and binary tiers, 95% sparsity
    Atomic,
}

impl From<LevelArg> for Level {
    fn from(arg: LevelArg) -> Self {
        match arg {
            LevelArg::Light => Level::Light,
            LevelArg::Medium => Level::Medium,
            LevelArg::Heavy => Level::Heavy,
            LevelArg::Extreme => Level::Extreme,
            LevelArg::Ultra => Level::Ultra,
            LevelArg::Nano => Level::Nano,
            LevelArg::Atomic => Level::Atomic,
        }
    }
}

/// Payload codec for the artifact
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CodecArg {
    /// Zstd (smaller)
    Zstd,
    /// LZ4 (faster to unpack)
    Lz4,
}

impl From<CodecArg> for CodecKind {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::Zstd => CodecKind::Zstd,
            CodecArg::Lz4 => CodecKind::Lz4,
        }
    }
}

/// Multi-level weight compression for language models
#[derive(Parser)]
#[command(name = "nanoquant")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a model into an .nqa artifact
    Compress(CompressArgs),
    /// Decompress an .nqa artifact back to safetensors
    Decompress(DecompressArgs),
    /// Show artifact information
    Info(InfoArgs),
    /// List compression levels
    Levels(LevelsArgs),
    /// Summarize a model and recommend a level
    Analyze(AnalyzeArgs),
    /// Compress a model at every level and compare
    Sweep(SweepArgs),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Calibration inputs shared by compress and sweep.
#[derive(clap::Args, Debug)]
struct CalibrationArgs {
    /// JSON file with an array of sample input vectors
    #[arg(long, value_name = "FILE")]
    samples: Option<PathBuf>,

    /// Generate N seeded random sample inputs
    #[arg(long, value_name = "N", conflicts_with = "samples")]
    synthetic_samples: Option<usize>,

    /// Precomputed activation statistics (JSON)
    #[arg(long, value_name = "FILE", conflicts_with_all = ["samples", "synthetic_samples"])]
    calibration: Option<PathBuf>,

    /// Seed for synthetic samples and sample selection
    #[arg(long, default_value = "0")]
    seed: u64,
}

#[derive(Parser, Debug)]
struct CompressArgs {
    /// Model file (.safetensors) or directory of shards
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output artifact path (.nqa)
    #[arg(short, long, value_name = "OUTPUT")]
    output: PathBuf,

    /// Compression level
    #[arg(short, long, value_enum, default_value = "medium")]
    level: LevelArg,

    /// Custom technique chain (JSON), replaces the level's chain
    #[arg(long, value_name = "FILE")]
    chain: Option<PathBuf>,

    /// Compression options (JSON); flags override its fields
    #[arg(long, value_name = "FILE")]
    options: Option<PathBuf>,

    #[command(flatten)]
    calibration: CalibrationArgs,

    /// Do not keep super weights exact
    #[arg(long)]
    no_preserve: bool,

    /// Worker threads (defaults to all cores)
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Abort if the run takes longer than this many seconds
    #[arg(long, value_name = "SECS")]
    deadline_secs: Option<u64>,

    /// Payload codec
    #[arg(long, value_enum)]
    codec: Option<CodecArg>,

    /// Zstd level (1-22)
    #[arg(long, value_parser = clap::value_parser!(i32).range(1..=22))]
    codec_level: Option<i32>,

    /// Include the per-layer report in JSON output
    #[arg(long)]
    per_layer: bool,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Show progress spinner
    #[arg(long)]
    progress: bool,
}

#[derive(Parser, Debug)]
struct DecompressArgs {
    /// Input artifact (.nqa)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output file path (.safetensors)
    #[arg(short, long, value_name = "OUTPUT")]
    output: PathBuf,

    /// Output results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Input artifact (.nqa)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Show per-layer details
    #[arg(short, long)]
    detailed: bool,

    /// Output results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct LevelsArgs {
    /// Output results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// Model file (.safetensors) or directory of shards
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct SweepArgs {
    /// Model file (.safetensors) or directory of shards
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    #[command(flatten)]
    calibration: CalibrationArgs,

    /// Output results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    shell: Shell,
}

/// Create a spinner for indeterminate progress.
fn create_spinner(msg: &str) -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn format_size(bits: u64) -> String {
    let bytes = bits as f64 / 8.0;
    if bytes >= 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} GiB", bytes / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024.0 * 1024.0 {
        format!("{:.2} MiB", bytes / (1024.0 * 1024.0))
    } else if bytes >= 1024.0 {
        format!("{:.2} KiB", bytes / 1024.0)
    } else {
        format!("{bytes:.0} B")
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_samples(path: &Path) -> Result<Vec<SampleInput>, Box<dyn std::error::Error>> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| format!("invalid samples file {}: {e}", path.display()).into())
}

/// Uniform samples in [-1, 1), one entry per hidden unit.
fn synthetic_samples(count: usize, len: usize, seed: u64) -> Vec<SampleInput> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (0..len.max(1)).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

/// Fold calibration flags into `options`.
fn apply_calibration(
    args: &CalibrationArgs,
    model: &Model,
    options: CompressOptions,
) -> Result<CompressOptions, Box<dyn std::error::Error>> {
    let mut options = options;
    options.calibration.seed = args.seed;
    if let Some(path) = &args.calibration {
        options = options.with_activation_stats(CalibrationSignal::load(path)?);
    } else if let Some(path) = &args.samples {
        options = options.with_calibration_samples(load_samples(path)?);
    } else if let Some(count) = args.synthetic_samples {
        let len = model.summary().hidden_size;
        options = options.with_calibration_samples(synthetic_samples(count, len, args.seed));
    }
    Ok(options)
}

fn run_compress(args: CompressArgs) -> Result<(), Box<dyn std::error::Error>> {
    let level = Level::from(args.level);
    let chain = match &args.chain {
        Some(path) => TechniqueChain::from_json(&std::fs::read_to_string(path)?)?,
        None => level.chain(),
    };

    let mut options = match &args.options {
        Some(path) => CompressOptions::from_json_file(path)?,
        None => CompressOptions::default(),
    };
    if args.no_preserve {
        options = options.with_preserve_super_weights(false);
    }
    if let Some(threads) = args.threads {
        options = options.with_concurrency_limit(threads);
    }
    if let Some(secs) = args.deadline_secs {
        options = options.with_deadline(Duration::from_secs(secs));
    }
    if args.codec.is_some() || args.codec_level.is_some() {
        let codec = args.codec.map_or(options.codec, CodecKind::from);
        let codec_level = args.codec_level.unwrap_or(options.codec_level);
        options = options.with_codec(codec, codec_level);
    }

    let mut model = Model::open(&args.input)?.with_layer_cache(options.cache_layers);
    let options = apply_calibration(&args.calibration, &model, options)?;

    if !args.json {
        eprintln!("Compressing {}", args.input.display());
        eprintln!("  Output:        {}", args.output.display());
        eprintln!("  Chain:         {}", chain.label);
        eprintln!("  Layers:        {}", model.layer_count());
        eprintln!("  Parameters:    {}", model.param_count());
        eprintln!("  Preserve:      {}", options.preserve_super_weights);
        eprintln!("  Codec:         {}", options.codec.name());
    }

    let spinner = if args.progress && !args.json {
        Some(create_spinner("Starting")?)
    } else {
        None
    };
    let mut pipeline = CompressionPipeline::new(options);
    if let Some(pb) = &spinner {
        let pb = pb.clone();
        pipeline = pipeline.with_observer(Box::new(move |state: &PipelineState| {
            pb.set_message(state.to_string());
        }));
    }

    let start = Instant::now();
    let result = pipeline.run(&mut model, chain);
    if let Some(pb) = &spinner {
        pb.finish_and_clear();
    }
    let artifact = result?;
    artifact.write_file(&args.output)?;
    let elapsed = start.elapsed();

    let compressed = artifact.model();
    if args.json {
        return print_json(&CompressOutput {
            success: true,
            operation: "compress".to_string(),
            input: args.input.display().to_string(),
            output: args.output.display().to_string(),
            level: artifact.level().to_string(),
            layers: compressed.layers.len(),
            degraded_layers: compressed.degraded_count(),
            original_size: compressed.original_bits().div_ceil(8),
            compressed_size: artifact.payload().len() as u64,
            size_ratio: artifact.size_ratio(),
            bits_per_weight: compressed.bits_per_weight(),
            estimated_quality_loss: artifact.estimated_quality_loss(),
            digest: artifact.digest(),
            time_secs: elapsed.as_secs_f64(),
            per_layer: args.per_layer.then(|| artifact.per_layer_report()),
        });
    }

    eprintln!("Compression complete:");
    eprintln!("  Original size:   {}", format_size(compressed.original_bits()));
    eprintln!("  Encoded size:    {}", format_size(compressed.compressed_bits()));
    eprintln!("  Artifact size:   {} bytes", artifact.payload().len());
    eprintln!("  Size ratio:      {:.4}", artifact.size_ratio());
    eprintln!("  Bits per weight: {:.3}", compressed.bits_per_weight());
    eprintln!("  Quality loss:    {:.4}", artifact.estimated_quality_loss());
    eprintln!("  Degraded layers: {}", compressed.degraded_count());
    eprintln!("  Time:            {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_decompress(args: DecompressArgs) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();
    let reader = ArtifactReader::open(&args.input)?;
    let writer = reader.to_safetensors()?;
    writer.write_file(&args.output)?;
    let elapsed = start.elapsed();

    if args.json {
        return print_json(&serde_json::json!({
            "success": true,
            "operation": "decompress",
            "input": args.input.display().to_string(),
            "output": args.output.display().to_string(),
            "tensors": writer.tensor_count(),
            "time_secs": elapsed.as_secs_f64(),
        }));
    }

    eprintln!("Decompression complete:");
    eprintln!("  Level:   {}", reader.header().level);
    eprintln!("  Tensors: {}", writer.tensor_count());
    eprintln!("  Time:    {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_info(args: InfoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let reader = ArtifactReader::open(&args.input)?;
    let header = reader.header();

    if args.json {
        return print_json(header);
    }

    println!("Artifact: {}", args.input.display());
    println!("  Model:           {}", header.model_id);
    println!("  Level:           {}", header.level);
    println!("  Codec:           {}", header.codec.name());
    println!("  Calibration:     {} samples", header.calibration_samples);
    println!("  Layers:          {}", header.layers.len());
    println!("  Tensors:         {}", header.tensors.len());
    println!("  Original size:   {}", format_size(header.original_bits));
    println!("  Encoded size:    {}", format_size(header.compressed_bits));
    println!("  Size ratio:      {:.4}", header.size_ratio);
    println!("  Quality loss:    {:.4}", header.estimated_quality_loss);
    println!(
        "  Techniques:      {}",
        header
            .chain
            .kinds()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" > ")
    );

    if args.detailed {
        println!();
        println!(
            "{:<48} {:<10} {:>10} {:>8} {:>10}",
            "Layer", "Role", "Params", "BPW", "Error"
        );
        for layer in &header.layers {
            println!(
                "{:<48} {:<10} {:>10} {:>8.3} {:>10.5}{}",
                layer.layer_name,
                layer.role.to_string(),
                layer.param_count,
                layer.achieved_bits_per_weight,
                layer.residual_error,
                if layer.degraded { "  (degraded)" } else { "" }
            );
        }
    }
    Ok(())
}

fn run_levels(args: LevelsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let rows: Vec<LevelRow> = Level::ALL
        .into_iter()
        .map(|level| {
            let chain = level.chain();
            LevelRow {
                level: level.to_string(),
                description: level.description().to_string(),
                target_reduction: level.target_reduction(),
                estimated_ratio: level.estimated_ratio(),
                techniques: chain.kinds().iter().map(ToString::to_string).collect(),
                requires_calibration: chain.requires_calibration(),
            }
        })
        .collect();

    if args.json {
        return print_json(&rows);
    }

    for row in rows {
        println!(
            "{:<8} {:>4.0}-{:<3.0}% ratio ~{:<6} {}",
            row.level,
            row.target_reduction.0,
            row.target_reduction.1,
            row.estimated_ratio,
            row.description
        );
    }
    Ok(())
}

fn run_analyze(args: AnalyzeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let model = Model::open(&args.input)?;
    let summary = model.summary();
    let recommended = Level::recommend(&summary);

    if args.json {
        return print_json(&serde_json::json!({
            "summary": summary,
            "recommended_level": recommended.to_string(),
        }));
    }

    println!("Model: {}", summary.model_id);
    println!("  Layers:          {}", summary.layer_count);
    println!("  Tensors:         {}", summary.tensor_count);
    println!("  Parameters:      {}", summary.param_count);
    println!("  Size:            {}", format_size(summary.original_bits));
    println!("  Hidden size:     {}", summary.hidden_size);
    println!("  Blocks:          {}", summary.block_count);
    println!(
        "  Recommended:     {} ({})",
        recommended,
        recommended.description()
    );
    Ok(())
}

fn run_sweep(args: SweepArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut model = Model::open(&args.input)?;
    let options = apply_calibration(&args.calibration, &model, CompressOptions::default())?;

    let rows: Vec<SweepRow> = compress_all_levels(&mut model, options)?
        .into_iter()
        .map(|(level, result)| match result {
            Ok(artifact) => SweepRow {
                level: level.to_string(),
                success: true,
                size_ratio: Some(artifact.size_ratio()),
                bits_per_weight: Some(artifact.model().bits_per_weight()),
                estimated_quality_loss: Some(artifact.estimated_quality_loss()),
                error: None,
            },
            Err(e) => SweepRow {
                level: level.to_string(),
                success: false,
                size_ratio: None,
                bits_per_weight: None,
                estimated_quality_loss: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    if args.json {
        return print_json(&rows);
    }

    println!(
        "{:<8} {:>10} {:>8} {:>12}",
        "Level", "Ratio", "BPW", "Quality loss"
    );
    for row in rows {
        match (row.size_ratio, row.bits_per_weight, row.estimated_quality_loss) {
            (Some(ratio), Some(bpw), Some(loss)) => {
                println!("{:<8} {:>10.4} {:>8.3} {:>12.4}", row.level, ratio, bpw, loss);
            }
            _ => println!(
                "{:<8} failed: {}",
                row.level,
                row.error.unwrap_or_default()
            ),
        }
    }
    Ok(())
}

fn run_completions(args: CompletionsArgs) {
    let mut cmd = Cli::command();
    generate(args.shell, &mut cmd, "nanoquant", &mut io::stdout());
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Compress(args) => run_compress(args),
        Commands::Decompress(args) => run_decompress(args),
        Commands::Info(args) => run_info(args),
        Commands::Levels(args) => run_levels(args),
        Commands::Analyze(args) => run_analyze(args),
        Commands::Sweep(args) => run_sweep(args),
        Commands::Completions(args) => {
            run_completions(args);
            return;
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
