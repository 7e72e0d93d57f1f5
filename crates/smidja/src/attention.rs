//! Causal multi-head self-attention with a fused QKV projection.

use anyhow::{bail, Result};
use ndarray::{concatenate, s, Array3, Array4, Axis, Zip};

use crate::activations::softmax_4d_inplace;
use crate::linear::Linear;
use crate::ops::matmul_4d;
use crate::param::ParamTensor;

const MASK_VALUE: f32 = -1e9;

struct Cache {
    q: Array4<f32>,
    k: Array4<f32>,
    v: Array4<f32>,
    att: Array4<f32>,
}

pub struct CausalSelfAttention {
    pub c_attn: Linear,
    pub c_proj: Linear,
    n_head: usize,
    cache: Option<Cache>,
}

/// `[B, T, C] -> [B, H, T, C/H]`
fn split_heads(x: &Array3<f32>, n_head: usize) -> Result<Array4<f32>> {
    let (b, t, c) = x.dim();
    let head_dim = c / n_head;
    let heads = x
        .view()
        .into_shape_with_order((b, t, n_head, head_dim))?
        .permuted_axes([0, 2, 1, 3]);
    Ok(heads.as_standard_layout().to_owned())
}

/// `[B, H, T, C/H] -> [B, T, C]`
fn merge_heads(x: &Array4<f32>) -> Result<Array3<f32>> {
    let (b, h, t, head_dim) = x.dim();
    let merged = x.view().permuted_axes([0, 2, 1, 3]);
    let merged = merged.as_standard_layout().to_owned();
    Ok(merged.into_shape_with_order((b, t, h * head_dim))?)
}

fn transpose_last_two(x: &Array4<f32>) -> Array4<f32> {
    x.view().permuted_axes([0, 1, 3, 2]).as_standard_layout().to_owned()
}

impl CausalSelfAttention {
    pub fn new(n_embd: usize, n_head: usize) -> Self {
        Self {
            c_attn: Linear::new(n_embd, 3 * n_embd),
            c_proj: Linear::new(n_embd, n_embd),
            n_head,
            cache: None,
        }
    }

    pub fn forward(&mut self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let (_, _, c) = x.dim();
        let head_dim = c / self.n_head;
        let scale = 1.0 / (head_dim as f32).sqrt();

        let qkv = self.c_attn.forward(x);
        let q = split_heads(&qkv.slice(s![.., .., ..c]).to_owned(), self.n_head)?;
        let k = split_heads(&qkv.slice(s![.., .., c..2 * c]).to_owned(), self.n_head)?;
        let v = split_heads(&qkv.slice(s![.., .., 2 * c..]).to_owned(), self.n_head)?;

        let k_t = transpose_last_two(&k);
        let mut scores = matmul_4d(&q, &k_t);
        scores *= scale;

        // Causal mask: position i attends to 0..=i only.
        Zip::indexed(&mut scores).par_for_each(|(_, _, i, j), s| {
            if j > i {
                *s = MASK_VALUE;
            }
        });

        softmax_4d_inplace(&mut scores);
        let att = scores;

        let ctx = matmul_4d(&att, &v);
        let y = self.c_proj.forward(&merge_heads(&ctx)?);

        self.cache = Some(Cache { q, k, v, att });
        Ok(y)
    }

    pub fn backward(&mut self, dy: &Array3<f32>) -> Result<Array3<f32>> {
        let Some(cache) = self.cache.take() else {
            bail!("attention backward called before forward");
        };
        let head_dim = cache.q.dim().3;
        let scale = 1.0 / (head_dim as f32).sqrt();

        let dctx = split_heads(&self.c_proj.backward(dy)?, self.n_head)?;

        // ctx = att @ v
        let datt = matmul_4d(&dctx, &transpose_last_two(&cache.v));
        let dv = matmul_4d(&transpose_last_two(&cache.att), &dctx);

        // Softmax backward per row: ds = att * (datt - <att, datt>). Masked
        // positions carry att == 0, so their scores gradient is zero.
        let mut ds = Array4::<f32>::zeros(datt.raw_dim());
        Zip::from(ds.lanes_mut(Axis(3)))
            .and(cache.att.lanes(Axis(3)))
            .and(datt.lanes(Axis(3)))
            .par_for_each(|mut ds_row, a_row, da_row| {
                let dot: f32 = a_row.iter().zip(da_row.iter()).map(|(&a, &d)| a * d).sum();
                Zip::from(&mut ds_row)
                    .and(&a_row)
                    .and(&da_row)
                    .for_each(|s, &a, &d| *s = a * (d - dot) * scale);
            });

        // scores = scale * q @ k^T
        let dq = matmul_4d(&ds, &cache.k);
        let dk = matmul_4d(&transpose_last_two(&ds), &cache.q);

        let dqkv = concatenate(
            Axis(2),
            &[
                merge_heads(&dq)?.view(),
                merge_heads(&dk)?.view(),
                merge_heads(&dv)?.view(),
            ],
        )?;
        let dqkv = dqkv.as_standard_layout().to_owned();
        self.c_attn.backward(&dqkv)
    }

    pub fn zero_grad(&mut self) {
        self.c_attn.zero_grad();
        self.c_proj.zero_grad();
    }

    pub fn visit_params(&mut self, prefix: &str, f: &mut dyn FnMut(ParamTensor)) {
        self.c_attn.visit_params(&format!("{prefix}.c_attn"), f);
        self.c_proj.visit_params(&format!("{prefix}.c_proj"), f);
    }

    pub fn visit_values(
        &self,
        prefix: &str,
        f: &mut dyn FnMut(&str, ndarray::ArrayViewD<f32>),
    ) {
        self.c_attn.visit_values(&format!("{prefix}.c_attn"), f);
        self.c_proj.visit_values(&format!("{prefix}.c_proj"), f);
    }
}
