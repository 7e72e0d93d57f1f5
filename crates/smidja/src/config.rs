//! Model and training hyperparameter configuration.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

fn default_layer_norm_epsilon() -> f32 {
    1e-5
}

/// Architecture hyperparameters for a GPT-2 style decoder.
///
/// Field names follow the HuggingFace `config.json` convention so pretrained
/// configurations deserialize directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gpt2Config {
    /// Maximum sequence length the learned position table supports.
    /// HF configs carry both `n_positions` and `n_ctx`; the latter is simply
    /// ignored as an unknown field.
    #[serde(alias = "n_positions")]
    pub block_size: usize,
    /// 50k BPE merges + 256 byte tokens + 1 <|endoftext|> token.
    pub vocab_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f32,
    /// Optional override for the padded vocabulary size. When absent the
    /// vocabulary is rounded up to the next multiple of 64 so the LM head
    /// matmul stays on friendly dimensions.
    #[serde(default)]
    pub padded_vocab_size: Option<usize>,
}

impl Default for Gpt2Config {
    fn default() -> Self {
        Self::gpt2()
    }
}

impl Gpt2Config {
    /// GPT-2 (124M).
    pub fn gpt2() -> Self {
        Self::with_dims(12, 12, 768)
    }

    /// GPT-2 Medium (350M).
    pub fn gpt2_medium() -> Self {
        Self::with_dims(24, 16, 1024)
    }

    /// GPT-2 Large (774M).
    pub fn gpt2_large() -> Self {
        Self::with_dims(36, 20, 1280)
    }

    /// GPT-2 XL (1558M).
    pub fn gpt2_xl() -> Self {
        Self::with_dims(48, 25, 1600)
    }

    /// Looks up a preset by its registry name.
    pub fn from_preset(name: &str) -> Result<Self> {
        match name {
            "gpt2" => Ok(Self::gpt2()),
            "gpt2-medium" => Ok(Self::gpt2_medium()),
            "gpt2-large" => Ok(Self::gpt2_large()),
            "gpt2-xl" => Ok(Self::gpt2_xl()),
            _ => bail!("unknown model preset: {name}"),
        }
    }

    fn with_dims(n_layer: usize, n_head: usize, n_embd: usize) -> Self {
        Self {
            block_size: 1024,
            vocab_size: 50257,
            n_layer,
            n_head,
            n_embd,
            layer_norm_epsilon: default_layer_norm_epsilon(),
            padded_vocab_size: None,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// The vocabulary size the weight matrices actually use. Token IDs in
    /// `vocab_size..padded_vocab()` are never valid targets.
    pub fn padded_vocab(&self) -> usize {
        self.padded_vocab_size
            .unwrap_or_else(|| self.vocab_size.div_ceil(64) * 64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_embd % self.n_head != 0 {
            bail!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd,
                self.n_head
            );
        }
        if self.padded_vocab() < self.vocab_size {
            bail!(
                "padded vocab ({}) smaller than vocab ({})",
                self.padded_vocab(),
                self.vocab_size
            );
        }
        Ok(())
    }
}

fn default_total_batch_size() -> usize {
    524_288 // 2^19 tokens, ~0.5M
}

fn one() -> usize {
    1
}

/// Hyperparameters for a pretraining run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Desired batch size in tokens per optimizer step; gradient accumulation
    /// steps are derived from it.
    #[serde(default = "default_total_batch_size")]
    pub total_batch_size: usize,
    /// Micro-batch size (sequences per forward pass).
    pub batch_size: usize,
    /// Sequence length per forward pass.
    pub seq_len: usize,
    pub max_lr: f32,
    /// `min_lr = max_lr * min_lr_ratio`.
    pub min_lr_ratio: f32,
    pub warmup_steps: usize,
    pub max_steps: usize,
    pub weight_decay: f32,
    pub grad_clip: f32,
    /// Validation / HellaSwag / sampling cadence in optimizer steps.
    pub eval_every: usize,
    /// Number of validation batches averaged per evaluation.
    pub val_steps: usize,
    pub sample_prompt: String,
    pub num_samples: usize,
    pub sample_len: usize,
    /// Checkpoint cadence in optimizer steps (0 disables intermediate saves).
    #[serde(default)]
    pub checkpoint_every: usize,
    /// Data-parallel rank of this process.
    #[serde(default)]
    pub rank: usize,
    #[serde(default = "one")]
    pub world_size: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    1337
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            total_batch_size: default_total_batch_size(),
            batch_size: 8,
            seq_len: 1024,
            max_lr: 6e-4,
            min_lr_ratio: 0.1,
            warmup_steps: 128,
            max_steps: 19_702,
            weight_decay: 0.1,
            grad_clip: 1.0,
            eval_every: 250,
            val_steps: 20,
            sample_prompt: "Hello, I'm a language model,".to_string(),
            num_samples: 4,
            sample_len: 32,
            checkpoint_every: 0,
            rank: 0,
            world_size: 1,
            seed: default_seed(),
        }
    }
}

impl TrainConfig {
    /// Gradient accumulation steps needed to reach `total_batch_size`.
    pub fn grad_accum_steps(&self) -> Result<usize> {
        let micro = self.batch_size * self.seq_len * self.world_size;
        if micro == 0 || self.total_batch_size % micro != 0 {
            bail!(
                "total batch size {} must be divisible by B * T * world_size = {}",
                self.total_batch_size,
                micro
            );
        }
        Ok(self.total_batch_size / micro)
    }

    pub fn min_lr(&self) -> f32 {
        self.max_lr * self.min_lr_ratio
    }
}
