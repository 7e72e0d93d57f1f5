//! HellaSwag sentence-completion evaluation.
//!
//! Each example is a context with four candidate endings; the model picks the
//! ending with the lowest average cross-entropy over its tokens.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use ndarray::Array2;
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::loss::{masked_completion_loss, most_likely_row};
use crate::model::Gpt2;

#[derive(Debug, Deserialize)]
pub struct HellaSwagExample {
    pub ctx: String,
    pub endings: Vec<String>,
    pub label: usize,
}

pub fn parse_line(line: &str) -> Result<HellaSwagExample> {
    let example: HellaSwagExample =
        serde_json::from_str(line).context("malformed HellaSwag JSONL line")?;
    if example.endings.is_empty() {
        bail!("HellaSwag example has no endings");
    }
    Ok(example)
}

/// Lays out candidate rows as `[num_endings, max_len]` tokens plus a mask
/// that is 1 exactly over ending tokens. Rows are zero-padded to the longest
/// context + ending.
pub fn render_rows(ctx_tokens: &[u32], ending_tokens: &[Vec<u32>]) -> (Array2<u32>, Array2<f32>) {
    let rows = ending_tokens.len();
    let max_len = ending_tokens
        .iter()
        .map(|e| ctx_tokens.len() + e.len())
        .max()
        .unwrap_or(0);

    let mut tokens = Array2::<u32>::zeros((rows, max_len));
    let mut mask = Array2::<f32>::zeros((rows, max_len));

    for (r, ending) in ending_tokens.iter().enumerate() {
        for (i, &tok) in ctx_tokens.iter().enumerate() {
            tokens[[r, i]] = tok;
        }
        for (i, &tok) in ending.iter().enumerate() {
            tokens[[r, ctx_tokens.len() + i]] = tok;
            mask[[r, ctx_tokens.len() + i]] = 1.0;
        }
    }
    (tokens, mask)
}

/// Runs the benchmark and returns accuracy in `[0, 1]`.
///
/// `limit` caps the number of examples, for quick in-training evaluations.
pub fn evaluate(
    model: &mut Gpt2,
    tokenizer: &Tokenizer,
    path: &Path,
    limit: Option<usize>,
) -> Result<f32> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut num_correct = 0usize;
    let mut num_total = 0usize;

    for line in reader.lines() {
        if limit.is_some_and(|l| num_total >= l) {
            break;
        }
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let example = parse_line(&line)?;

        let ctx_tokens = tokenizer
            .encode(example.ctx.as_str(), false)
            .map_err(|e| anyhow!("tokenization failed: {e}"))?
            .get_ids()
            .to_vec();
        let mut ending_tokens = Vec::with_capacity(example.endings.len());
        for ending in &example.endings {
            // GPT-2 BPE expects the leading space that glues the ending to
            // the context.
            let text = format!(" {}", ending);
            let ids = tokenizer
                .encode(text.as_str(), false)
                .map_err(|e| anyhow!("tokenization failed: {e}"))?
                .get_ids()
                .to_vec();
            ending_tokens.push(ids);
        }

        let (tokens, mask) = render_rows(&ctx_tokens, &ending_tokens);
        if tokens.dim().1 > model.config.block_size {
            log::warn!(
                "skipping example longer than block size ({} tokens)",
                tokens.dim().1
            );
            continue;
        }

        let logits = model.forward(&tokens)?;
        let losses = masked_completion_loss(&logits, &tokens, &mask, model.config.vocab_size);
        let pred = most_likely_row(&losses);

        num_total += 1;
        if pred == example.label {
            num_correct += 1;
        }
        if num_total % 100 == 0 {
            log::debug!(
                "hellaswag {}/{} acc {:.4}",
                num_correct,
                num_total,
                num_correct as f32 / num_total as f32
            );
        }
    }

    if num_total == 0 {
        bail!("no HellaSwag examples evaluated from {}", path.display());
    }
    Ok(num_correct as f32 / num_total as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let line = r#"{"ctx": "A man is sitting on a roof. he", "endings": ["is using wrap", "is ripping tiles off", "is holding a rubik's cube", "starts pulling up roofing"], "label": 3, "split": "val", "ind": 24}"#;
        let example = parse_line(line).unwrap();
        assert_eq!(example.ctx, "A man is sitting on a roof. he");
        assert_eq!(example.endings.len(), 4);
        assert_eq!(example.label, 3);

        assert!(parse_line("{not json").is_err());
        assert!(parse_line(r#"{"ctx": "x", "endings": [], "label": 0}"#).is_err());
    }

    #[test]
    fn test_render_rows_layout() {
        let ctx = vec![10u32, 11];
        let endings = vec![vec![20u32], vec![30u32, 31, 32]];
        let (tokens, mask) = render_rows(&ctx, &endings);

        assert_eq!(tokens.dim(), (2, 5));
        assert_eq!(mask.dim(), (2, 5));

        // Row 0: ctx + 1 ending token + zero padding
        assert_eq!(tokens.row(0).to_vec(), vec![10, 11, 20, 0, 0]);
        assert_eq!(mask.row(0).to_vec(), vec![0.0, 0.0, 1.0, 0.0, 0.0]);

        // Row 1: ctx + 3 ending tokens, no padding
        assert_eq!(tokens.row(1).to_vec(), vec![10, 11, 30, 31, 32]);
        assert_eq!(mask.row(1).to_vec(), vec![0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_mask_covers_only_ending_tokens() {
        let ctx = vec![1u32, 2, 3];
        let endings = vec![vec![4u32, 5], vec![6u32]];
        let (_, mask) = render_rows(&ctx, &endings);

        assert_eq!(mask.row(0).sum(), 2.0);
        assert_eq!(mask.row(1).sum(), 1.0);
        for r in 0..2 {
            for i in 0..3 {
                assert_eq!(mask[[r, i]], 0.0, "context position masked");
            }
        }
    }
}
