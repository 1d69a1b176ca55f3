//! Evaluate a trained recognition bank on the test manifest.
//!
//! Usage:
//!   cargo run --bin evaluate -- --manifest data/test_manifest.json \
//!       --bank trained_bank.spmb --wordmap-dir data/wordmaps

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use spm_train::artifacts;
use spm_train::pipeline::evaluate_bank_with_progress;
use spm_train::{DatasetManifest, DiskWordmaps, RecognitionConfig};
use std::path::PathBuf;

/// Evaluation CLI
#[derive(Parser, Debug)]
#[command(name = "evaluate")]
#[command(about = "Evaluate the spatial-pyramid recognition system")]
struct Args {
    /// Configuration file (JSON); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Test manifest (JSON)
    #[arg(short, long)]
    manifest: PathBuf,

    /// Trained bank artifact
    #[arg(short, long)]
    bank: PathBuf,

    /// Directory holding precomputed word-map artifacts
    #[arg(short, long)]
    wordmap_dir: PathBuf,

    /// Report output path; defaults to <run label>_evaluation.json
    #[arg(short, long)]
    report: Option<PathBuf>,

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
        config.eval_workers = workers;
    }
    config.validate().context("Invalid configuration")?;
    let metric = config.metric().context("Invalid distance metric")?;

    let manifest = DatasetManifest::load_json(&args.manifest)
        .with_context(|| format!("Failed to load manifest {}", args.manifest.display()))?;
    let bank = artifacts::load_bank(&args.bank)
        .with_context(|| format!("Failed to load bank {}", args.bank.display()))?;
    let assigner = DiskWordmaps::new(&args.wordmap_dir);

    println!("Evaluating recognition system ({})", config.run_label());
    println!("  Test images: {}", manifest.len());
    println!("  Bank: {} references, {} layers", bank.len(), bank.layer_num());
    println!("  Metric: {}", metric);
    println!("  Workers: {}", config.eval_workers);
    println!();

    let pb = ProgressBar::new(manifest.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.green/white} {pos}/{len}")
            .unwrap()
            .progress_chars("##-"),
    );

    let report = evaluate_bank_with_progress(&assigner, &manifest, &bank, &config, |done, _| {
        pb.set_position(done as u64);
    })
    .context("Evaluation failed")?;
    pb.finish();

    println!();
    println!("Confusion matrix:");
    let counts = report.confusion.counts();
    for row in counts.outer_iter() {
        let cells: Vec<String> = row.iter().map(|c| format!("{:>5}", c)).collect();
        println!("  {}", cells.join(" "));
    }
    println!();
    println!(
        "Accuracy: {:.4} ({}/{})",
        report.accuracy,
        report.confusion.trace(),
        report.confusion.total()
    );
    if !report.errors.is_empty() {
        println!("Misclassified {} images:", report.errors.len());
        for err in report.errors.iter().take(20) {
            println!(
                "  [{}] {} predicted {} actual {}",
                err.index, err.path, err.predicted, err.actual
            );
        }
        if report.errors.len() > 20 {
            println!("  ... and {} more", report.errors.len() - 20);
        }
    }

    let report_path = args
        .report
        .unwrap_or_else(|| PathBuf::from(format!("{}_evaluation.json", config.run_label())));
    report
        .save_json(&report_path)
        .with_context(|| format!("Failed to save report to {}", report_path.display()))?;
    println!();
    println!("Report saved to {}", report_path.display());

    Ok(())
}
