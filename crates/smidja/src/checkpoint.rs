//! Safetensors checkpointing and pretrained GPT-2 loading.
//!
//! A checkpoint is a `model_{step}.safetensors` weight file plus a JSON
//! sidecar carrying the step and the model configuration.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use memmap2::Mmap;
use ndarray::ArrayViewMutD;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};

use crate::config::Gpt2Config;
use crate::model::Gpt2;

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: usize,
    pub config: Gpt2Config,
}

fn fill_from_le_bytes(dst: &mut ArrayViewMutD<f32>, bytes: &[u8]) {
    // The tensor data offset inside a safetensors file is not guaranteed to
    // be 4-byte aligned, so decode bytewise instead of casting.
    for (d, chunk) in dst.iter_mut().zip(bytes.chunks_exact(4)) {
        *d = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
}

/// Writes `model_{step}.safetensors` + `model_{step}.json` under `dir` and
/// returns the weight file path.
pub fn save_checkpoint(model: &Gpt2, step: usize, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create checkpoint dir {}", dir.display()))?;

    let mut owned: Vec<(String, Vec<usize>, Vec<f32>)> = Vec::new();
    model.visit_values(&mut |name, view| {
        let data: Vec<f32> = view.iter().copied().collect();
        owned.push((name.to_string(), view.shape().to_vec(), data));
    });

    let views = owned
        .iter()
        .map(|(name, shape, data)| {
            TensorView::new(Dtype::F32, shape.clone(), bytemuck::cast_slice(data))
                .map(|v| (name.clone(), v))
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to build safetensors views")?;

    let weights_path = dir.join(format!("model_{step:05}.safetensors"));
    safetensors::serialize_to_file(views, &None, &weights_path)
        .with_context(|| format!("failed to write {}", weights_path.display()))?;

    let meta = CheckpointMeta {
        step,
        config: model.config.clone(),
    };
    let meta_path = weights_path.with_extension("json");
    let file = File::create(&meta_path)
        .with_context(|| format!("failed to create {}", meta_path.display()))?;
    serde_json::to_writer_pretty(file, &meta)?;

    log::info!("saved checkpoint for step {} to {}", step, weights_path.display());
    Ok(weights_path)
}

/// Loads a checkpoint written by [`save_checkpoint`] from its weight file
/// path. Returns the model and the step it was saved at.
pub fn load_checkpoint(weights_path: &Path) -> Result<(Gpt2, usize)> {
    let meta_path = weights_path.with_extension("json");
    let meta: CheckpointMeta = serde_json::from_reader(
        File::open(&meta_path)
            .with_context(|| format!("failed to open sidecar {}", meta_path.display()))?,
    )
    .context("malformed checkpoint sidecar")?;

    let mut model = Gpt2::zeroed(meta.config)?;
    load_weights_into(&mut model, weights_path, false)?;
    Ok((model, meta.step))
}

/// Loads HuggingFace GPT-2 weights (`config.json` + `model.safetensors` in
/// `model_dir`). The Conv1D `[in, out]` layout matches ours, so tensors copy
/// over without transposition.
pub fn from_pretrained(model_dir: &Path) -> Result<Gpt2> {
    let config_path = model_dir.join("config.json");
    let mut config: Gpt2Config = serde_json::from_reader(
        File::open(&config_path)
            .with_context(|| format!("failed to open {}", config_path.display()))?,
    )
    .context("malformed config.json")?;
    // Pretrained checkpoints use the exact vocabulary; no padding rows.
    config.padded_vocab_size = Some(config.vocab_size);

    let mut model = Gpt2::zeroed(config)?;
    load_weights_into(&mut model, &model_dir.join("model.safetensors"), true)?;
    log::info!("loaded pretrained weights from {}", model_dir.display());
    Ok(model)
}

/// Copies every model parameter from a safetensors file, by name. With
/// `allow_prefix`, names are also tried with a `transformer.` prefix, which
/// some HF exports carry.
fn load_weights_into(model: &mut Gpt2, weights_path: &Path, allow_prefix: bool) -> Result<()> {
    let file = File::open(weights_path)
        .with_context(|| format!("failed to open {}", weights_path.display()))?;
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("failed to mmap {}", weights_path.display()))?;
    let tensors = SafeTensors::deserialize(&mmap)
        .with_context(|| format!("invalid safetensors file {}", weights_path.display()))?;

    let mut first_err: Option<anyhow::Error> = None;
    model.visit_params(&mut |mut t| {
        if first_err.is_some() {
            return;
        }
        let view = match tensors.tensor(t.name) {
            Ok(v) => v,
            Err(_) if allow_prefix => {
                match tensors.tensor(&format!("transformer.{}", t.name)) {
                    Ok(v) => v,
                    Err(_) => {
                        first_err = Some(anyhow!("tensor {} missing from checkpoint", t.name));
                        return;
                    }
                }
            }
            Err(_) => {
                first_err = Some(anyhow!("tensor {} missing from checkpoint", t.name));
                return;
            }
        };
        if view.dtype() != Dtype::F32 {
            first_err = Some(anyhow!(
                "tensor {} has dtype {:?}, expected F32",
                t.name,
                view.dtype()
            ));
            return;
        }
        if view.shape() != t.value.shape() {
            first_err = Some(anyhow!(
                "tensor {} shape mismatch: file {:?}, model {:?}",
                t.name,
                view.shape(),
                t.value.shape()
            ));
            return;
        }
        fill_from_le_bytes(&mut t.value, view.data());
    });

    if let Some(e) = first_err {
        bail!(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tempfile::TempDir;

    fn tiny_config() -> Gpt2Config {
        Gpt2Config {
            block_size: 8,
            vocab_size: 16,
            n_layer: 2,
            n_head: 2,
            n_embd: 8,
            layer_norm_epsilon: 1e-5,
            padded_vocab_size: Some(16),
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut model = Gpt2::new(tiny_config(), 9).unwrap();

        let tokens = Array2::from_shape_vec((1, 4), vec![1u32, 2, 3, 4]).unwrap();
        let logits_before = model.forward(&tokens).unwrap();

        let path = save_checkpoint(&model, 42, dir.path()).unwrap();
        assert!(path.ends_with("model_00042.safetensors"));
        assert!(path.with_extension("json").exists());

        let (mut restored, step) = load_checkpoint(&path).unwrap();
        assert_eq!(step, 42);
        assert_eq!(restored.config.n_layer, 2);

        let logits_after = restored.forward(&tokens).unwrap();
        assert_eq!(logits_before, logits_after);
    }

    #[test]
    fn test_load_missing_sidecar_fails() {
        let dir = TempDir::new().unwrap();
        let model = Gpt2::new(tiny_config(), 0).unwrap();
        let path = save_checkpoint(&model, 1, dir.path()).unwrap();
        std::fs::remove_file(path.with_extension("json")).unwrap();

        assert!(load_checkpoint(&path).is_err());
    }

    #[test]
    fn test_load_shape_mismatch_fails() {
        let dir = TempDir::new().unwrap();
        let model = Gpt2::new(tiny_config(), 0).unwrap();
        let path = save_checkpoint(&model, 1, dir.path()).unwrap();

        // Rewrite the sidecar with an incompatible architecture.
        let bigger = Gpt2Config {
            n_embd: 16,
            n_head: 4,
            ..tiny_config()
        };
        let meta = CheckpointMeta {
            step: 1,
            config: bigger,
        };
        let file = File::create(path.with_extension("json")).unwrap();
        serde_json::to_writer(file, &meta).unwrap();

        assert!(load_checkpoint(&path).is_err());
    }

    #[test]
    fn test_gradients_not_persisted() {
        let dir = TempDir::new().unwrap();
        let mut model = Gpt2::new(tiny_config(), 0).unwrap();
        model.wte.grad.fill(3.0);

        let path = save_checkpoint(&model, 0, dir.path()).unwrap();
        let (restored, _) = load_checkpoint(&path).unwrap();
        assert!(restored.wte.grad.iter().all(|&g| g == 0.0));
    }
}
