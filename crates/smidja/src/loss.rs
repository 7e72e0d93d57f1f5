//! Cross-entropy losses: the fused training loss with its logits gradient,
//! the loss-only variant for validation, and the masked completion loss used
//! for HellaSwag scoring.

use ndarray::{s, Array1, Array2, Array3, ArrayView1, Axis, Zip};

fn log_sum_exp(row: ArrayView1<f32>) -> f32 {
    let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// Fused softmax + cross-entropy.
///
/// Returns the scaled mean loss and `dloss/dlogits` in one pass:
/// `dlogits = loss_scale * (softmax(logits) - onehot(target)) / (B*T)`.
/// `loss_scale` is `1/grad_accum_steps` during training so accumulated
/// micro-batch gradients average.
pub fn cross_entropy(
    logits: &Array3<f32>,
    targets: &Array2<u32>,
    loss_scale: f32,
) -> (f32, Array3<f32>) {
    let (b, t, _) = logits.dim();
    let row_scale = loss_scale / (b * t) as f32;

    let mut dlogits = Array3::<f32>::zeros(logits.raw_dim());
    let mut losses = Array2::<f32>::zeros((b, t));

    Zip::from(dlogits.lanes_mut(Axis(2)))
        .and(logits.lanes(Axis(2)))
        .and(targets)
        .and(&mut losses)
        .par_for_each(|mut drow, row, &target, loss| {
            let lse = log_sum_exp(row);
            *loss = lse - row[target as usize];
            Zip::from(&mut drow)
                .and(&row)
                .for_each(|d, &x| *d = (x - lse).exp() * row_scale);
            drow[target as usize] -= row_scale;
        });

    let loss = losses.sum() / (b * t) as f32 * loss_scale;
    (loss, dlogits)
}

/// Mean cross-entropy without a gradient buffer, for validation.
pub fn cross_entropy_loss(logits: &Array3<f32>, targets: &Array2<u32>) -> f32 {
    let (b, t, _) = logits.dim();
    let mut losses = Array2::<f32>::zeros((b, t));

    Zip::from(logits.lanes(Axis(2)))
        .and(targets)
        .and(&mut losses)
        .par_for_each(|row, &target, loss| {
            let lse = log_sum_exp(row);
            *loss = lse - row[target as usize];
        });

    losses.sum() / (b * t) as f32
}

/// Average cross-entropy of each row's completion under shifted logits.
///
/// `mask` is 1 over completion tokens. Position `t` predicts token `t+1`, so
/// a position contributes when `mask[t+1]` is set. Only the first
/// `vocab_size` logits participate; padded vocabulary rows are ignored.
/// Rows whose mask never fires score `f32::INFINITY`.
pub fn masked_completion_loss(
    logits: &Array3<f32>,
    tokens: &Array2<u32>,
    mask: &Array2<f32>,
    vocab_size: usize,
) -> Array1<f32> {
    let (rows, t, _) = logits.dim();
    let mut avg = Array1::<f32>::zeros(rows);

    for r in 0..rows {
        let mut sum = 0.0f32;
        let mut count = 0.0f32;
        for pos in 0..t.saturating_sub(1) {
            let m = mask[[r, pos + 1]];
            if m == 0.0 {
                continue;
            }
            let row = logits.slice(s![r, pos, ..vocab_size]);
            let target = tokens[[r, pos + 1]] as usize;
            let lse = log_sum_exp(row);
            sum += (lse - row[target]) * m;
            count += m;
        }
        avg[r] = if count > 0.0 { sum / count } else { f32::INFINITY };
    }
    avg
}

/// Index of the completion with the lowest average loss.
pub fn most_likely_row(losses: &Array1<f32>) -> usize {
    let mut best = 0;
    for (i, &l) in losses.iter().enumerate() {
        if l < losses[best] {
            best = i;
        }
    }
    best
}
