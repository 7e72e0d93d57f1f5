mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "smidja", about = "GPT-2 pretraining and evaluation on the CPU", version)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pretrain a model on sharded token data
    Train {
        /// Directory of .bin token shards (train/val split by file name)
        #[arg(long)]
        data_dir: PathBuf,
        /// Run directory for logs and checkpoints
        #[arg(long, default_value = "runs/gpt2")]
        out_dir: PathBuf,
        /// Model preset: gpt2, gpt2-medium, gpt2-large, gpt2-xl
        #[arg(long, default_value = "gpt2")]
        model: String,
        /// Resume from a checkpoint (.safetensors path)
        #[arg(long, conflicts_with = "pretrained")]
        checkpoint: Option<PathBuf>,
        /// Start from a HuggingFace GPT-2 directory (config.json + model.safetensors)
        #[arg(long)]
        pretrained: Option<PathBuf>,
        /// GPT-2 BPE tokenizer.json; enables sampling previews
        #[arg(long)]
        tokenizer: Option<PathBuf>,
        /// HellaSwag validation JSONL; enables accuracy tracking
        #[arg(long)]
        hellaswag: Option<PathBuf>,
        /// Cap on HellaSwag examples per in-training evaluation
        #[arg(long)]
        hellaswag_limit: Option<usize>,
        /// Micro-batch size in sequences
        #[arg(long, default_value_t = 8)]
        batch_size: usize,
        /// Sequence length in tokens
        #[arg(long, default_value_t = 1024)]
        seq_len: usize,
        /// Batch size per optimizer step, in tokens
        #[arg(long, default_value_t = 524_288)]
        total_batch_size: usize,
        #[arg(long, default_value_t = 19_702)]
        max_steps: usize,
        #[arg(long, default_value_t = 6e-4)]
        max_lr: f32,
        #[arg(long, default_value_t = 128)]
        warmup_steps: usize,
        #[arg(long, default_value_t = 250)]
        eval_every: usize,
        #[arg(long, default_value_t = 20)]
        val_steps: usize,
        /// Checkpoint cadence in steps (0 saves only the final model)
        #[arg(long, default_value_t = 0)]
        checkpoint_every: usize,
        #[arg(long, default_value_t = 1337)]
        seed: u64,
    },
    /// Score a model on the HellaSwag benchmark
    Eval {
        /// Checkpoint (.safetensors path) to evaluate
        #[arg(long, conflicts_with = "pretrained", required_unless_present = "pretrained")]
        checkpoint: Option<PathBuf>,
        /// HuggingFace GPT-2 directory to evaluate
        #[arg(long)]
        pretrained: Option<PathBuf>,
        /// HellaSwag validation JSONL
        #[arg(long)]
        hellaswag: PathBuf,
        #[arg(long)]
        tokenizer: PathBuf,
        /// Evaluate only the first N examples
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Sample completions from a model
    Sample {
        #[arg(long, conflicts_with = "pretrained", required_unless_present = "pretrained")]
        checkpoint: Option<PathBuf>,
        #[arg(long)]
        pretrained: Option<PathBuf>,
        #[arg(long)]
        tokenizer: PathBuf,
        #[arg(long, default_value = "Hello, I'm a language model,")]
        prompt: String,
        #[arg(long, default_value_t = 4)]
        num_samples: usize,
        #[arg(long, default_value_t = 32)]
        max_length: usize,
        #[arg(long, default_value_t = 50)]
        top_k: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    std::env::set_var("RUST_LOG", log_level);
    env_logger::init();

    match cli.command {
        Commands::Train {
            data_dir,
            out_dir,
            model,
            checkpoint,
            pretrained,
            tokenizer,
            hellaswag,
            hellaswag_limit,
            batch_size,
            seq_len,
            total_batch_size,
            max_steps,
            max_lr,
            warmup_steps,
            eval_every,
            val_steps,
            checkpoint_every,
            seed,
        } => commands::train(commands::TrainArgs {
            data_dir,
            out_dir,
            model,
            checkpoint,
            pretrained,
            tokenizer,
            hellaswag,
            hellaswag_limit,
            batch_size,
            seq_len,
            total_batch_size,
            max_steps,
            max_lr,
            warmup_steps,
            eval_every,
            val_steps,
            checkpoint_every,
            seed,
        }),

        Commands::Eval {
            checkpoint,
            pretrained,
            hellaswag,
            tokenizer,
            limit,
        } => commands::eval(
            checkpoint.as_deref(),
            pretrained.as_deref(),
            &hellaswag,
            &tokenizer,
            limit,
        ),

        Commands::Sample {
            checkpoint,
            pretrained,
            tokenizer,
            prompt,
            num_samples,
            max_length,
            top_k,
            seed,
        } => commands::sample(
            checkpoint.as_deref(),
            pretrained.as_deref(),
            &tokenizer,
            &prompt,
            num_samples,
            max_length,
            top_k,
            seed,
        ),
    }
}
