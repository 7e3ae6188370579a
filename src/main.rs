//! sae-rs CLI: sparse autoencoder training on buffered activations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use hf_hub::{api::sync::Api, Repo, RepoType};
use safetensors::tensor::SafeTensors;
use sae_rs::{
    ArtifactStore, EmbeddingSource, SaeConfig, ShuffleBuffer, SparseAutoencoder, TokenCorpus,
    Trainer, TrainerConfig,
};
use tokenizers::Tokenizer;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sae-rs")]
#[command(about = "Sparse autoencoder training on transformer activations")]
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
    /// Train a sweep of autoencoders
    Train(TrainArgs),
    /// Print the config and parameter shapes of a saved version
    Inspect {
        /// Checkpoint directory
        dir: PathBuf,
        /// Version to inspect (default: latest)
        #[arg(long)]
        version: Option<u32>,
    },
}

#[derive(Args)]
struct TrainArgs {
    /// Autoencoder config JSON (defaults apply to missing fields)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Trainer schedule JSON
    #[arg(long)]
    trainer_config: Option<PathBuf>,

    /// Local safetensors weights holding the token embedding
    #[arg(long, conflicts_with = "model")]
    embeddings: Option<PathBuf>,

    /// Model ID from `HuggingFace` to take the embedding (and tokenizer) from
    #[arg(short, long)]
    model: Option<String>,

    /// Weights file inside the `HuggingFace` repo
    #[arg(long, default_value = "model.safetensors")]
    weights_file: String,

    /// Embedding tensor name (default: try common names)
    #[arg(long)]
    embedding_name: Option<String>,

    /// Pre-tokenized corpus: safetensors file with a 2-D `tokens` tensor
    #[arg(short, long, conflicts_with = "text")]
    corpus: Option<PathBuf>,

    /// Plain-text corpus, one document per line
    #[arg(long)]
    text: Option<PathBuf>,

    /// tokenizer.json for --text (default: the model's tokenizer)
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Overwrite the first token of every sequence with this id
    #[arg(long)]
    bos: Option<u32>,

    /// Shuffle corpus sequences before training
    #[arg(long)]
    shuffle: bool,

    /// Override the number of training activations
    #[arg(long)]
    num_tokens: Option<usize>,

    /// Output directory for checkpoints and metrics
    #[arg(short, long, default_value = "outputs")]
    output: PathBuf,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
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
        Command::Train(args) => train(&args),
        Command::Inspect { dir, version } => inspect(&dir, version),
    }
}

fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Forcing CPU mode");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}

fn load_tokenizer(args: &TrainArgs) -> Result<Tokenizer> {
    let path = match (&args.tokenizer, &args.model) {
        (Some(path), _) => path.clone(),
        (None, Some(model_id)) => {
            let api = Api::new()?;
            let repo = api.repo(Repo::new(model_id.clone(), RepoType::Model));
            repo.get("tokenizer.json")
                .context("Failed to download tokenizer.json")?
        }
        (None, None) => anyhow::bail!("--text needs --tokenizer or --model"),
    };
    Tokenizer::from_file(&path).map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))
}

fn train(args: &TrainArgs) -> Result<()> {
    let cfg = match &args.config {
        Some(path) => SaeConfig::load(path)?,
        None => SaeConfig::default().derive()?,
    };
    let mut trainer_cfg = match &args.trainer_config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str::<TrainerConfig>(&text)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        }
        None => TrainerConfig::default(),
    };
    if let Some(n) = args.num_tokens {
        trainer_cfg.num_tokens = n;
    }
    trainer_cfg.save_dir = args.output.join("checkpoints");
    trainer_cfg.metrics_file = Some(args.output.join("metrics.jsonl"));

    println!("=== sae-rs: sparse autoencoder training ===");
    println!("Run:     {}", cfg.name);
    println!("Site:    {}", cfg.act_name);
    println!(
        "Sweep:   {} lr x {} l1 = {} variant(s)",
        cfg.lrs.len(),
        cfg.l1_coeffs.len(),
        cfg.n_variants()
    );
    println!("Output:  {}", args.output.display());
    if args.cpu {
        println!("Mode:    CPU (forced)");
    }

    let device = select_device(args.cpu);
    let n_heads = if cfg.flatten_heads { cfg.n_heads } else { 1 };
    let source = match (&args.embeddings, &args.model) {
        (Some(path), _) => {
            EmbeddingSource::from_file(path, args.embedding_name.as_deref(), n_heads, &device)?
        }
        (None, Some(model_id)) => EmbeddingSource::from_hub(
            model_id,
            &args.weights_file,
            args.embedding_name.as_deref(),
            n_heads,
            &device,
        )?,
        (None, None) => anyhow::bail!("Provide --embeddings <file> or --model <id>"),
    };

    let mut corpus = match (&args.corpus, &args.text) {
        (Some(path), _) => TokenCorpus::load(path)?,
        (None, Some(path)) => TokenCorpus::from_text(path, &load_tokenizer(args)?, cfg.seq_len)?,
        (None, None) => anyhow::bail!("Provide --corpus <tokens.safetensors> or --text <file>"),
    };
    if let Some(bos) = args.bos {
        corpus = corpus.with_bos(bos)?;
    }
    if args.shuffle {
        corpus = corpus.shuffle_documents(cfg.seed)?;
    }
    info!(
        "Corpus: {} sequences of {} tokens",
        corpus.len(),
        corpus.seq_len()
    );

    std::fs::create_dir_all(&args.output)?;
    let buffer = ShuffleBuffer::new(&cfg, corpus, source, &device)?;
    let sae = SparseAutoencoder::new(&cfg, &device)?;
    let mut trainer = Trainer::new(trainer_cfg, sae, buffer)?;
    let summary = trainer.run()?;

    println!("\n=== Done ===");
    println!("Steps:       {}", summary.steps);
    if let Some(loss) = summary.final_loss {
        println!("Last loss:   {loss:.6}");
    }
    println!("Resampled:   {} feature(s)", summary.features_resampled);
    println!(
        "Refreshing:  {:.1?} over {} refreshes",
        summary.time_refreshing, summary.refresh_count
    );
    if let Some(v) = summary.saved_version {
        println!(
            "Saved:       {}",
            trainer.store().params_path(v).display()
        );
    }
    Ok(())
}

fn inspect(dir: &Path, version: Option<u32>) -> Result<()> {
    let store = ArtifactStore::open(dir)?;
    let version = match version {
        Some(v) => v,
        None => store
            .latest()?
            .with_context(|| format!("No saved versions in {}", dir.display()))?,
    };

    let data = std::fs::read(store.params_path(version))
        .with_context(|| format!("Failed to read version {version}"))?;
    let st = SafeTensors::deserialize(&data)?;
    let sae = SparseAutoencoder::load(&store, version, &Device::Cpu)?;

    println!("=== {} version {version} ===", dir.display());
    println!("{}", serde_json::to_string_pretty(sae.cfg())?);
    println!("\nParameters:");
    let mut names = st.names();
    names.sort();
    for name in names {
        let view = st.tensor(name)?;
        println!("  {name:8} {:?} {:?}", view.dtype(), view.shape());
    }
    Ok(())
}
