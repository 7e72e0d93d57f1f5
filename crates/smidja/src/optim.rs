//! AdamW and global-norm gradient clipping.

use ndarray::{ArrayD, Zip};

use crate::model::Gpt2;

/// AdamW with decoupled weight decay.
///
/// Decay applies only to parameters with two or more dimensions (matrices and
/// embeddings); biases and LayerNorm parameters are exempt. Moment buffers
/// are allocated lazily on the first step and keyed by the model's parameter
/// visit order.
pub struct AdamW {
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    step: u64,
    m: Vec<ArrayD<f32>>,
    v: Vec<ArrayD<f32>>,
}

impl AdamW {
    pub fn new(weight_decay: f32) -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-8,
            weight_decay,
            step: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn step(&mut self, model: &mut Gpt2, lr: f32) {
        self.step += 1;
        let bc1 = 1.0 - self.beta1.powi(self.step as i32);
        let bc2 = 1.0 - self.beta2.powi(self.step as i32);

        let (beta1, beta2, eps, weight_decay) =
            (self.beta1, self.beta2, self.eps, self.weight_decay);
        let (m, v) = (&mut self.m, &mut self.v);
        let mut idx = 0usize;

        model.visit_params(&mut |mut t| {
            if m.len() == idx {
                m.push(ArrayD::zeros(t.grad.raw_dim()));
                v.push(ArrayD::zeros(t.grad.raw_dim()));
            }
            debug_assert_eq!(m[idx].shape(), t.grad.shape(), "{}", t.name);

            let decay = if t.value.ndim() >= 2 { weight_decay } else { 0.0 };
            Zip::from(m[idx].view_mut())
                .and(v[idx].view_mut())
                .and(&mut t.value)
                .and(&t.grad)
                .for_each(|mi, vi, w, &g| {
                    *mi = beta1 * *mi + (1.0 - beta1) * g;
                    *vi = beta2 * *vi + (1.0 - beta2) * g * g;
                    let mhat = *mi / bc1;
                    let vhat = *vi / bc2;
                    *w -= lr * (mhat / (vhat.sqrt() + eps) + decay * *w);
                });
            idx += 1;
        });
    }
}

/// Scales gradients so their global L2 norm does not exceed `max_norm`.
/// Returns the pre-clip norm.
pub fn clip_grad_norm(model: &mut Gpt2, max_norm: f32) -> f32 {
    let mut sumsq = 0.0f64;
    model.visit_params(&mut |t| {
        sumsq += t.grad.iter().map(|&g| (g as f64) * (g as f64)).sum::<f64>();
    });
    let norm = sumsq.sqrt() as f32;

    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        model.visit_params(&mut |mut t| {
            t.grad.mapv_inplace(|g| g * scale);
        });
    }
    norm
}
