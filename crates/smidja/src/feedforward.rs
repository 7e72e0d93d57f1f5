//! Position-wise MLP with tanh-approximated GELU.

use anyhow::{bail, Result};
use ndarray::Array3;

use crate::activations::{gelu, gelu_backward};
use crate::linear::Linear;
use crate::param::ParamTensor;

/// 4x expansion feed-forward block: `c_proj(gelu(c_fc(x)))`.
pub struct Mlp {
    pub c_fc: Linear,
    pub c_proj: Linear,
    /// Pre-activation from the last forward pass.
    cache: Option<Array3<f32>>,
}

impl Mlp {
    pub fn new(n_embd: usize) -> Self {
        Self {
            c_fc: Linear::new(n_embd, 4 * n_embd),
            c_proj: Linear::new(4 * n_embd, n_embd),
            cache: None,
        }
    }

    pub fn forward(&mut self, x: &Array3<f32>) -> Array3<f32> {
        let pre = self.c_fc.forward(x);
        let mut hidden = pre.clone();
        gelu(&mut hidden);
        let y = self.c_proj.forward(&hidden);
        self.cache = Some(pre);
        y
    }

    pub fn backward(&mut self, dy: &Array3<f32>) -> Result<Array3<f32>> {
        let Some(pre) = self.cache.take() else {
            bail!("mlp backward called before forward");
        };
        let dhidden = self.c_proj.backward(dy)?;
        let dpre = gelu_backward(&dhidden, &pre);
        self.c_fc.backward(&dpre)
    }

    pub fn zero_grad(&mut self) {
        self.c_fc.zero_grad();
        self.c_proj.zero_grad();
    }

    pub fn visit_params(&mut self, prefix: &str, f: &mut dyn FnMut(ParamTensor)) {
        self.c_fc.visit_params(&format!("{prefix}.c_fc"), f);
        self.c_proj.visit_params(&format!("{prefix}.c_proj"), f);
    }

    pub fn visit_values(
        &self,
        prefix: &str,
        f: &mut dyn FnMut(&str, ndarray::ArrayViewD<f32>),
    ) {
        self.c_fc.visit_values(&format!("{prefix}.c_fc"), f);
        self.c_proj.visit_values(&format!("{prefix}.c_proj"), f);
    }
}
