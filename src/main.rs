//! saefx CLI: SAE and hidden-state feature extraction for transcripts

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use saefx::{
    run, ChunkWriter, Encoder, EncoderKind, EncoderOptions, FeatureStore, MalformedPolicy,
    ModelRegistry, PipelineConfig, ProbeConfig, ProbeTrainer, SaeReadout, Statistic,
    TranscriptDataset, DEFAULT_FLUSH_EVERY,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "saefx")]
#[command(about = "Extract SAE and hidden-state features from transcripts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Sparse auto-encoder readout of intermediate layers
    Sae {
        #[command(flatten)]
        extract: ExtractArgs,

        /// SAE identifier in the registry (e.g. "sae_2b")
        #[arg(long, default_value = "sae_2b")]
        sae_id: String,

        /// SAE output kept per token
        #[arg(long, default_value_t = SaeReadout::Reconstruction)]
        readout: SaeReadout,
    },
    /// Final-layer hidden states reduced to cls and mean
    Hidden {
        #[command(flatten)]
        extract: ExtractArgs,

        /// Hidden-state identifier in the registry (e.g. "cls_gemma_2b")
        #[arg(long, default_value = "cls_gemma_2b")]
        cls_id: String,
    },
    /// Train and evaluate a logistic-regression probe on extracted chunks
    Probe {
        /// Directory of chunk files
        #[arg(long)]
        feature_dir: PathBuf,

        #[arg(long, default_value = "mean")]
        statistic: Statistic,

        /// Layer of a multi-layer extraction
        #[arg(long)]
        layer: Option<usize>,

        #[arg(long, default_value = "label")]
        label_column: String,

        /// Keep the k best features by ANOVA F-score
        #[arg(long)]
        select_k: Option<usize>,

        #[arg(long, default_value_t = 0.2)]
        test_size: f64,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Write results (metrics and probabilities) as JSON
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ExtractArgs {
    /// Transcript components (JSONL with transcript_id, component_text)
    #[arg(long)]
    components: PathBuf,

    /// Per-transcript metadata (JSONL, or CSV by .csv extension, with transcript_id)
    #[arg(long)]
    metadata: PathBuf,

    /// Output directory for chunk files
    #[arg(short, long)]
    out: PathBuf,

    /// Documents per chunk
    #[arg(long, default_value_t = DEFAULT_FLUSH_EVERY)]
    flush: usize,

    /// JSON file replacing the built-in encoder registry
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Skip documents without usable tokens instead of stopping
    #[arg(long)]
    skip_malformed: bool,

    /// Truncate documents to this many tokens
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Sae {
            extract,
            sae_id,
            readout,
        } => extract_features(&extract, &sae_id, EncoderKind::Sae, readout),
        Command::Hidden { extract, cls_id } => {
            extract_features(&extract, &cls_id, EncoderKind::HiddenState, SaeReadout::default())
        }
        Command::Probe {
            feature_dir,
            statistic,
            layer,
            label_column,
            select_k,
            test_size,
            seed,
            out,
        } => {
            let config = ProbeConfig {
                statistic,
                layer,
                label_column,
                select_k,
                test_size,
                seed,
                ..ProbeConfig::default()
            };
            probe(&feature_dir, config, out)
        }
    }
}

fn extract_features(args: &ExtractArgs, id: &str, kind: EncoderKind, readout: SaeReadout) -> Result<()> {
    println!("=== saefx: {id} ===");
    println!("Components: {}", args.components.display());
    println!("Metadata:   {}", args.metadata.display());
    println!("Output:     {}", args.out.display());
    if args.cpu {
        println!("Mode:       CPU (forced)");
    }

    let registry = match &args.registry {
        Some(path) => ModelRegistry::from_json_file(path)?,
        None => ModelRegistry::builtin(),
    };
    let options = EncoderOptions {
        force_cpu: args.cpu,
        max_tokens: args.max_tokens,
        readout,
    };
    let config = PipelineConfig {
        flush_every: args.flush,
        malformed: if args.skip_malformed {
            MalformedPolicy::Skip
        } else {
            MalformedPolicy::Halt
        },
    };

    let dataset = TranscriptDataset::new(&args.components, &args.metadata);
    let writer = ChunkWriter::create(&args.out)?;
    let mut encoder = Encoder::from_registry(&registry, id, kind, &options)?;

    let summary = run(&mut encoder, &dataset, &config, &writer)?;

    println!("\n=== Results ===");
    println!("Chunks:    {}", summary.chunks.len());
    println!("Documents: {}", summary.documents_processed);
    if !summary.skipped.is_empty() {
        println!("Skipped:   {}", summary.skipped.len());
        for (layer, doc) in &summary.skipped {
            match layer {
                Some(layer) => info!("Skipped {doc} at layer {layer}"),
                None => info!("Skipped {doc}"),
            }
        }
    }
    Ok(())
}

fn probe(feature_dir: &Path, config: ProbeConfig, out: Option<PathBuf>) -> Result<()> {
    let store = FeatureStore::open(feature_dir)?;
    let set = store.load(config.statistic, config.layer)?;
    info!(
        "Features: {} rows x {} columns from {}",
        set.n_rows(),
        set.n_features(),
        feature_dir.display()
    );

    let results = ProbeTrainer::new(config).train_and_evaluate(&set)?;

    println!("\n=== Probe ===");
    println!("Accuracy:  {:.1}%", results.accuracy * 100.0);
    println!("Precision: {:.3}", results.precision());
    println!("Recall:    {:.3}", results.recall());
    println!("F1:        {:.3}", results.f1());

    if let Some(path) = out {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&results)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Results saved to {}", path.display());
    }
    Ok(())
}
