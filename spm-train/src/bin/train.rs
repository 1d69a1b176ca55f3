//! Build a trained recognition bank from the training manifest.
//!
//! Usage:
//!   cargo run --bin train -- --manifest data/train_manifest.json \
//!       --vocabulary data/dictionary.spmv --wordmap-dir data/wordmaps \
//!       --output trained_bank.spmb

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use spm_train::artifacts;
use spm_train::pipeline::train_bank_with_progress;
use spm_train::{DatasetManifest, DiskWordmaps, RecognitionConfig};
use std::path::PathBuf;

/// Training CLI
#[derive(Parser, Debug)]
#[command(name = "train")]
#[command(about = "Train the spatial-pyramid recognition system")]
struct Args {
    /// Configuration file (JSON); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Training manifest (JSON)
    #[arg(short, long)]
    manifest: PathBuf,

    /// Vocabulary artifact
    #[arg(short, long)]
    vocabulary: PathBuf,

    /// Directory holding precomputed word-map artifacts
    #[arg(short, long)]
    wordmap_dir: PathBuf,

    /// Output path for the trained bank
    #[arg(short, long, default_value = "trained_bank.spmb")]
    output: PathBuf,

    /// Override the configured worker count
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RecognitionConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RecognitionConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.train_workers = workers;
    }
    config.validate().context("Invalid configuration")?;

    let manifest = DatasetManifest::load_json(&args.manifest)
        .with_context(|| format!("Failed to load manifest {}", args.manifest.display()))?;
    let vocabulary = artifacts::load_vocabulary(&args.vocabulary)
        .with_context(|| format!("Failed to load vocabulary {}", args.vocabulary.display()))?;
    let assigner = DiskWordmaps::new(&args.wordmap_dir);

    println!("Building recognition system ({})", config.run_label());
    println!("  Training images: {}", manifest.len());
    println!("  Vocabulary: {} words", vocabulary.size());
    println!("  Pyramid layers: {}", config.layer_num);
    println!("  Workers: {}", config.train_workers);
    println!();

    let pb = ProgressBar::new(manifest.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("##-"),
    );

    let bank = train_bank_with_progress(&assigner, &manifest, &vocabulary, &config, |done, _| {
        pb.set_position(done as u64);
    })
    .context("Training failed")?;
    pb.finish_with_message("features complete");

    artifacts::save_bank(&bank, &args.output)
        .with_context(|| format!("Failed to save bank to {}", args.output.display()))?;

    println!();
    println!("Recognition system build complete");
    println!("  Bank: {} ({} features x {})", args.output.display(), bank.len(), bank.features().ncols());

    Ok(())
}
