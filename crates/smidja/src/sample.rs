//! Top-k sampling previews.

use anyhow::{bail, Result};
use ndarray::{s, Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::activations::softmax_inplace;
use crate::model::Gpt2;

pub const DEFAULT_TOP_K: usize = 50;

/// Keeps the `k` largest logits and sends everything else to `-inf`.
pub fn top_k_filtering(logits: &mut Array1<f32>, k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k - 1];
    logits.mapv_inplace(|x| if x < threshold { f32::NEG_INFINITY } else { x });
}

/// Multinomial draw from a probability vector.
pub fn sample_from_probs(probs: &Array1<f32>, rng: &mut StdRng) -> usize {
    let r: f32 = rng.gen();
    let mut cumulative = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if r < cumulative {
            return i;
        }
    }
    probs.len() - 1
}

/// Extends `prompt_tokens` to `max_length` tokens, `num_sequences` times in
/// one batch. Sampling considers only the first `vocab_size` logits and is
/// deterministic for a given seed.
pub fn generate(
    model: &mut Gpt2,
    prompt_tokens: &[u32],
    num_sequences: usize,
    max_length: usize,
    top_k: usize,
    seed: u64,
) -> Result<Vec<Vec<u32>>> {
    if prompt_tokens.is_empty() {
        bail!("cannot sample from an empty prompt");
    }
    if max_length > model.config.block_size {
        bail!(
            "max length {} exceeds block size {}",
            max_length,
            model.config.block_size
        );
    }

    let vocab_size = model.config.vocab_size;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rows: Vec<Vec<u32>> = (0..num_sequences).map(|_| prompt_tokens.to_vec()).collect();

    while rows[0].len() < max_length {
        let t = rows[0].len();
        let mut x = Array2::<u32>::zeros((num_sequences, t));
        for (r, row) in rows.iter().enumerate() {
            for (i, &tok) in row.iter().enumerate() {
                x[[r, i]] = tok;
            }
        }

        let logits = model.forward(&x)?;
        let last = logits.index_axis(Axis(1), t - 1);

        for (r, row) in rows.iter_mut().enumerate() {
            let mut row_logits = last.slice(s![r, ..vocab_size]).to_owned();
            top_k_filtering(&mut row_logits, top_k);
            if let Some(slice) = row_logits.as_slice_mut() {
                softmax_inplace(slice);
            }
            let next = sample_from_probs(&row_logits, &mut rng);
            row.push(next as u32);
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Gpt2Config;

    #[test]
    fn test_top_k_filtering_keeps_k_logits() {
        let mut logits = Array1::from_vec(vec![0.1, 0.5, 0.3, 0.9, 0.2, 0.7]);
        top_k_filtering(&mut logits, 3);

        let kept: Vec<usize> = logits
            .iter()
            .enumerate()
            .filter(|(_, &v)| v.is_finite())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(kept, vec![1, 3, 5]);
    }

    #[test]
    fn test_top_k_zero_or_large_is_identity() {
        let original = Array1::from_vec(vec![0.1, 0.5, 0.3]);

        let mut logits = original.clone();
        top_k_filtering(&mut logits, 0);
        assert_eq!(logits, original);

        let mut logits = original.clone();
        top_k_filtering(&mut logits, 10);
        assert_eq!(logits, original);
    }

    #[test]
    fn test_sample_from_probs_degenerate() {
        let probs = Array1::from_vec(vec![0.0, 0.0, 1.0, 0.0]);
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..20 {
            assert_eq!(sample_from_probs(&probs, &mut rng), 2);
        }
    }

    #[test]
    fn test_sample_from_probs_is_seeded() {
        let probs = Array1::from_vec(vec![0.25, 0.25, 0.25, 0.25]);
        let draws_a: Vec<usize> = {
            let mut rng = StdRng::seed_from_u64(42);
            (0..10).map(|_| sample_from_probs(&probs, &mut rng)).collect()
        };
        let draws_b: Vec<usize> = {
            let mut rng = StdRng::seed_from_u64(42);
            (0..10).map(|_| sample_from_probs(&probs, &mut rng)).collect()
        };
        assert_eq!(draws_a, draws_b);
    }

    #[test]
    fn test_generate_shapes_and_determinism() {
        let config = Gpt2Config {
            block_size: 16,
            vocab_size: 12,
            n_layer: 1,
            n_head: 2,
            n_embd: 8,
            layer_norm_epsilon: 1e-5,
            padded_vocab_size: Some(16),
        };
        let mut model = Gpt2::new(config, 1).unwrap();

        let prompt = [1u32, 2, 3];
        let rows = generate(&mut model, &prompt, 3, 10, 5, 42).unwrap();

        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert_eq!(row.len(), 10);
            assert_eq!(&row[..3], &prompt);
            // Padded vocab ids never sampled
            assert!(row.iter().all(|&t| t < 12));
        }

        let again = generate(&mut model, &prompt, 3, 10, 5, 42).unwrap();
        assert_eq!(rows, again);
    }

    #[test]
    fn test_generate_rejects_bad_inputs() {
        let config = Gpt2Config {
            block_size: 8,
            vocab_size: 12,
            n_layer: 1,
            n_head: 2,
            n_embd: 8,
            layer_norm_epsilon: 1e-5,
            padded_vocab_size: Some(16),
        };
        let mut model = Gpt2::new(config, 0).unwrap();

        assert!(generate(&mut model, &[], 1, 8, 5, 0).is_err());
        assert!(generate(&mut model, &[1], 1, 9, 5, 0).is_err());
    }
}
