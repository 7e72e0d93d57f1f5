use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use tokenizers::Tokenizer;

use smidja::eval::hellaswag;
use smidja::{from_pretrained, generate, load_checkpoint, Gpt2, Gpt2Config, TrainConfig, Trainer};

pub struct TrainArgs {
    pub data_dir: PathBuf,
    pub out_dir: PathBuf,
    pub model: String,
    pub checkpoint: Option<PathBuf>,
    pub pretrained: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub hellaswag: Option<PathBuf>,
    pub hellaswag_limit: Option<usize>,
    pub batch_size: usize,
    pub seq_len: usize,
    pub total_batch_size: usize,
    pub max_steps: usize,
    pub max_lr: f32,
    pub warmup_steps: usize,
    pub eval_every: usize,
    pub val_steps: usize,
    pub checkpoint_every: usize,
    pub seed: u64,
}

fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(|e| anyhow!("failed to load tokenizer {}: {e}", path.display()))
}

/// Resolves a model from a checkpoint, a pretrained directory, or a fresh
/// preset, in that order of precedence. Returns the step to resume from.
fn load_model(
    checkpoint: Option<&Path>,
    pretrained: Option<&Path>,
    preset: &str,
    seed: u64,
) -> Result<(Gpt2, usize)> {
    if let Some(path) = checkpoint {
        let (model, step) = load_checkpoint(path)?;
        log::info!("resumed from checkpoint {} at step {}", path.display(), step);
        return Ok((model, step));
    }
    if let Some(dir) = pretrained {
        return Ok((from_pretrained(dir)?, 0));
    }
    let config = Gpt2Config::from_preset(preset)?;
    Ok((Gpt2::new(config, seed)?, 0))
}

pub fn train(args: TrainArgs) -> Result<()> {
    let (mut model, start_step) =
        load_model(args.checkpoint.as_deref(), args.pretrained.as_deref(), &args.model, args.seed)?;
    log::info!("model has {} parameters", model.num_params());

    let config = TrainConfig {
        total_batch_size: args.total_batch_size,
        batch_size: args.batch_size,
        seq_len: args.seq_len,
        max_lr: args.max_lr,
        warmup_steps: args.warmup_steps,
        max_steps: args.max_steps,
        eval_every: args.eval_every,
        val_steps: args.val_steps,
        checkpoint_every: args.checkpoint_every,
        seed: args.seed,
        ..Default::default()
    };

    let mut trainer =
        Trainer::new(model, config, &args.data_dir, &args.out_dir)?.starting_at(start_step);
    if let Some(path) = &args.tokenizer {
        trainer = trainer.with_tokenizer(load_tokenizer(path)?);
    }
    if let Some(path) = args.hellaswag {
        trainer = trainer.with_hellaswag(path, args.hellaswag_limit);
    }
    trainer.run()
}

pub fn eval(
    checkpoint: Option<&Path>,
    pretrained: Option<&Path>,
    hellaswag_path: &Path,
    tokenizer_path: &Path,
    limit: Option<usize>,
) -> Result<()> {
    let (mut model, _) = load_model(checkpoint, pretrained, "gpt2", 0)?;
    let tokenizer = load_tokenizer(tokenizer_path)?;

    let acc = hellaswag::evaluate(&mut model, &tokenizer, hellaswag_path, limit)?;
    println!("hellaswag accuracy: {acc:.4}");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn sample(
    checkpoint: Option<&Path>,
    pretrained: Option<&Path>,
    tokenizer_path: &Path,
    prompt: &str,
    num_samples: usize,
    max_length: usize,
    top_k: usize,
    seed: u64,
) -> Result<()> {
    let (mut model, _) = load_model(checkpoint, pretrained, "gpt2", 0)?;
    let tokenizer = load_tokenizer(tokenizer_path)?;

    let prompt_tokens = tokenizer
        .encode(prompt, false)
        .map_err(|e| anyhow!("tokenization failed: {e}"))?
        .get_ids()
        .to_vec();
    let rows = generate(&mut model, &prompt_tokens, num_samples, max_length, top_k, seed)?;

    for row in &rows {
        let text = tokenizer
            .decode(row, false)
            .map_err(|e| anyhow!("detokenization failed: {e}"))?;
        println!("> {text}");
    }
    Ok(())
}
