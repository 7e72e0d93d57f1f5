//! The pretraining loop: gradient accumulation, clipping, the LR schedule,
//! periodic validation / HellaSwag / sampling previews, and checkpoints.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tokenizers::Tokenizer;

use crate::checkpoint::save_checkpoint;
use crate::config::TrainConfig;
use crate::data::{Split, TokenShardLoader};
use crate::eval::hellaswag;
use crate::loss::{cross_entropy, cross_entropy_loss};
use crate::model::Gpt2;
use crate::optim::{clip_grad_norm, AdamW};
use crate::sample::{generate, DEFAULT_TOP_K};
use crate::schedule::LrSchedule;
use crate::stats::{RunStats, StepTimer};

pub struct Trainer {
    model: Gpt2,
    optimizer: AdamW,
    schedule: LrSchedule,
    train_loader: TokenShardLoader,
    val_loader: TokenShardLoader,
    config: TrainConfig,
    run_dir: PathBuf,
    log_file: File,
    tokenizer: Option<Tokenizer>,
    hellaswag_path: Option<PathBuf>,
    hellaswag_limit: Option<usize>,
    start_step: usize,
    stats: RunStats,
}

impl Trainer {
    pub fn new(
        model: Gpt2,
        config: TrainConfig,
        data_dir: &Path,
        run_dir: &Path,
    ) -> Result<Self> {
        let grad_accum = config.grad_accum_steps()?;
        log::info!(
            "total batch size {} tokens => {} gradient accumulation steps of B={} T={}",
            config.total_batch_size,
            grad_accum,
            config.batch_size,
            config.seq_len
        );

        let train_loader = TokenShardLoader::new(
            data_dir,
            config.batch_size,
            config.seq_len,
            Split::Train,
            config.rank,
            config.world_size,
        )?;
        let val_loader = TokenShardLoader::new(
            data_dir,
            config.batch_size,
            config.seq_len,
            Split::Val,
            config.rank,
            config.world_size,
        )?;

        let log_dir = run_dir.join("log");
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create {}", log_dir.display()))?;
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("log.txt"))?;

        let schedule = LrSchedule::new(
            config.max_lr,
            config.min_lr(),
            config.warmup_steps,
            config.max_steps,
        );
        let optimizer = AdamW::new(config.weight_decay);

        Ok(Self {
            model,
            optimizer,
            schedule,
            train_loader,
            val_loader,
            config,
            run_dir: run_dir.to_path_buf(),
            log_file,
            tokenizer: None,
            hellaswag_path: None,
            hellaswag_limit: None,
            start_step: 0,
            stats: RunStats::new(),
        })
    }

    /// Enables sampling previews; without a tokenizer they are skipped.
    pub fn with_tokenizer(mut self, tokenizer: Tokenizer) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn with_hellaswag(mut self, path: PathBuf, limit: Option<usize>) -> Self {
        self.hellaswag_path = Some(path);
        self.hellaswag_limit = limit;
        self
    }

    /// Resumes step counting from a checkpoint's step.
    pub fn starting_at(mut self, step: usize) -> Self {
        self.start_step = step;
        self
    }

    fn log_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.log_file, "{line}")?;
        Ok(())
    }

    fn run_validation(&mut self, step: usize) -> Result<()> {
        self.val_loader.reset()?;
        let mut val_loss = 0.0f32;
        for _ in 0..self.config.val_steps {
            let (x, y) = self.val_loader.next_batch()?;
            let logits = self.model.forward(&x)?;
            val_loss += cross_entropy_loss(&logits, &y) / self.config.val_steps as f32;
        }
        log::info!("step {:5} | val loss {:.4}", step, val_loss);
        self.log_line(&format!("{step} val {val_loss:.4}"))
    }

    fn run_hellaswag(&mut self, step: usize) -> Result<()> {
        let Some(path) = self.hellaswag_path.clone() else {
            return Ok(());
        };
        let Some(tokenizer) = self.tokenizer.as_ref() else {
            return Ok(());
        };
        let acc = hellaswag::evaluate(&mut self.model, tokenizer, &path, self.hellaswag_limit)?;
        log::info!("step {:5} | hellaswag acc {:.4}", step, acc);
        self.log_line(&format!("{step} hella {acc:.4}"))
    }

    fn sample_preview(&mut self) -> Result<()> {
        let Some(tokenizer) = self.tokenizer.as_ref() else {
            return Ok(());
        };
        let prompt = tokenizer
            .encode(self.config.sample_prompt.as_str(), false)
            .map_err(|e| anyhow!("tokenization failed: {e}"))?
            .get_ids()
            .to_vec();
        let rows = generate(
            &mut self.model,
            &prompt,
            self.config.num_samples,
            self.config.sample_len,
            DEFAULT_TOP_K,
            42 + self.config.rank as u64,
        )?;
        for (i, row) in rows.iter().enumerate() {
            let text = tokenizer
                .decode(row, false)
                .map_err(|e| anyhow!("detokenization failed: {e}"))?;
            log::info!("sample {}: {}", i, text);
        }
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let grad_accum = self.config.grad_accum_steps()?;
        let loss_scale = 1.0 / grad_accum as f32;
        let tokens_per_step = self.config.batch_size
            * self.config.seq_len
            * grad_accum
            * self.config.world_size;

        for step in self.start_step..self.config.max_steps {
            let last_step = step == self.config.max_steps - 1;

            if step % self.config.eval_every == 0 || last_step {
                self.run_validation(step)?;
                self.run_hellaswag(step)?;
                if step > 0 {
                    self.sample_preview()?;
                }
            }
            if self.config.checkpoint_every > 0
                && step > 0
                && step % self.config.checkpoint_every == 0
            {
                save_checkpoint(&self.model, step, &self.run_dir)?;
            }

            let timer = StepTimer::start();
            self.model.zero_grad();
            let mut loss_accum = 0.0f32;
            for _ in 0..grad_accum {
                let (x, y) = self.train_loader.next_batch()?;
                let logits = self.model.forward(&x)?;
                let (loss, dlogits) = cross_entropy(&logits, &y, loss_scale);
                loss_accum += loss;
                self.model.backward(&dlogits)?;
            }

            let norm = clip_grad_norm(&mut self.model, self.config.grad_clip);
            let lr = self.schedule.lr_at(step);
            self.optimizer.step(&mut self.model, lr);

            let elapsed = timer.elapsed();
            self.stats.record_step(tokens_per_step, elapsed);
            log::info!(
                "step {:5} | loss {:.6} | lr {:.4e} | norm {:.4} | {:.0} ms | {:.0} tok/s",
                step,
                loss_accum,
                lr,
                norm,
                timer.elapsed_ms(),
                timer.tokens_per_sec(tokens_per_step)
            );
            self.log_line(&format!("{step} train {loss_accum:.6}"))?;
        }

        save_checkpoint(&self.model, self.config.max_steps, &self.run_dir)?;
        log::info!("run finished: {}", self.stats.summary_line());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Gpt2Config;
    use tempfile::TempDir;

    fn tiny_model(seed: u64) -> Gpt2 {
        let config = Gpt2Config {
            block_size: 8,
            vocab_size: 16,
            n_layer: 1,
            n_head: 2,
            n_embd: 8,
            layer_norm_epsilon: 1e-5,
            padded_vocab_size: Some(16),
        };
        Gpt2::new(config, seed).unwrap()
    }

    fn write_shard(dir: &Path, name: &str, tokens: &[u16]) {
        std::fs::write(dir.join(name), bytemuck::cast_slice::<u16, u8>(tokens)).unwrap();
    }

    fn tiny_train_config(max_steps: usize) -> TrainConfig {
        TrainConfig {
            total_batch_size: 2 * 4,
            batch_size: 2,
            seq_len: 4,
            max_lr: 1e-3,
            min_lr_ratio: 0.1,
            warmup_steps: 1,
            max_steps,
            weight_decay: 0.1,
            grad_clip: 1.0,
            eval_every: 2,
            val_steps: 1,
            checkpoint_every: 0,
            ..Default::default()
        }
    }

    fn seed_data(dir: &Path) {
        let tokens: Vec<u16> = (0..256).map(|i| (i % 16) as u16).collect();
        write_shard(dir, "tokens_train_000.bin", &tokens);
        write_shard(dir, "tokens_val_000.bin", &tokens);
    }

    #[test]
    fn test_run_writes_log_and_final_checkpoint() {
        let data_dir = TempDir::new().unwrap();
        let run_dir = TempDir::new().unwrap();
        seed_data(data_dir.path());

        let model = tiny_model(0);
        let mut trainer =
            Trainer::new(model, tiny_train_config(3), data_dir.path(), run_dir.path()).unwrap();
        trainer.run().unwrap();

        let log = std::fs::read_to_string(run_dir.path().join("log").join("log.txt")).unwrap();
        assert!(log.contains("0 train "), "log was: {log}");
        assert!(log.contains("0 val "), "log was: {log}");
        assert!(log.contains("2 val "), "eval_every fires mid-run: {log}");
        assert!(log.contains("2 train "), "log was: {log}");

        assert!(run_dir.path().join("model_00003.safetensors").exists());
        assert!(run_dir.path().join("model_00003.json").exists());
    }

    #[test]
    fn test_run_loss_is_finite_and_improves() {
        let data_dir = TempDir::new().unwrap();
        let run_dir = TempDir::new().unwrap();
        seed_data(data_dir.path());

        let model = tiny_model(1);
        let mut config = tiny_train_config(20);
        config.eval_every = 100; // keep the loop pure training
        let mut trainer = Trainer::new(model, config, data_dir.path(), run_dir.path()).unwrap();
        trainer.run().unwrap();

        let log = std::fs::read_to_string(run_dir.path().join("log").join("log.txt")).unwrap();
        let losses: Vec<f32> = log
            .lines()
            .filter(|l| l.contains(" train "))
            .map(|l| l.split_whitespace().last().unwrap().parse().unwrap())
            .collect();
        assert_eq!(losses.len(), 20);
        assert!(losses.iter().all(|l| l.is_finite()));
        // Cyclic data is learnable; the tail should beat the head.
        assert!(losses.last().unwrap() < losses.first().unwrap());
    }

    #[test]
    fn test_intermediate_checkpoints() {
        let data_dir = TempDir::new().unwrap();
        let run_dir = TempDir::new().unwrap();
        seed_data(data_dir.path());

        let model = tiny_model(2);
        let mut config = tiny_train_config(5);
        config.checkpoint_every = 2;
        let mut trainer = Trainer::new(model, config, data_dir.path(), run_dir.path()).unwrap();
        trainer.run().unwrap();

        assert!(run_dir.path().join("model_00002.safetensors").exists());
        assert!(run_dir.path().join("model_00004.safetensors").exists());
        assert!(run_dir.path().join("model_00005.safetensors").exists());
    }

    #[test]
    fn test_missing_data_dir_is_an_error() {
        let data_dir = TempDir::new().unwrap();
        let run_dir = TempDir::new().unwrap();
        // train shard only; the val split is missing
        write_shard(
            data_dir.path(),
            "tokens_train_000.bin",
            &(0..64).map(|i| (i % 16) as u16).collect::<Vec<_>>(),
        );

        let model = tiny_model(3);
        let result = Trainer::new(model, tiny_train_config(1), data_dir.path(), run_dir.path());
        assert!(result.is_err());
    }
}
