//! Affine projection in the HF GPT-2 Conv1D layout.

use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Array3, Axis, Ix1, Ix2};

use crate::ops::{matmul_2d, matmul_2d_transposed, matmul_3d_2d};
use crate::param::{Param, ParamTensor};

/// `y = x @ weight + bias`, with `weight` stored `[in, out]` as in the HF
/// GPT-2 Conv1D modules, so pretrained weights load without transposition.
pub struct Linear {
    pub weight: Param<Ix2>,
    pub bias: Param<Ix1>,
    cache: Option<Array3<f32>>,
}

impl Linear {
    pub fn new(in_dim: usize, out_dim: usize) -> Self {
        Self {
            weight: Param::new(Array2::zeros((in_dim, out_dim))),
            bias: Param::new(Array1::zeros(out_dim)),
            cache: None,
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.value.dim().0
    }

    pub fn out_dim(&self) -> usize {
        self.weight.value.dim().1
    }

    pub fn forward(&mut self, x: &Array3<f32>) -> Array3<f32> {
        let mut y = matmul_3d_2d(x, &self.weight.value);
        y += &self.bias.value;
        self.cache = Some(x.clone());
        y
    }

    /// Accumulates parameter gradients and returns `dx`.
    pub fn backward(&mut self, dy: &Array3<f32>) -> Result<Array3<f32>> {
        let Some(x) = self.cache.take() else {
            bail!("linear backward called before forward");
        };
        let (b, t, in_dim) = x.dim();
        let out_dim = dy.dim().2;

        let x2d = x.view().into_shape_with_order((b * t, in_dim))?;
        let dy2d = dy.view().into_shape_with_order((b * t, out_dim))?;

        // dW = x^T @ dy, [in, out]
        self.weight.grad += &matmul_2d(&x2d.t(), &dy2d);
        self.bias.grad += &dy2d.sum_axis(Axis(0));

        // dx = dy @ W^T; weight is [in, out], so it is the "[n, k]" operand.
        let dx2d = matmul_2d_transposed(&dy2d, &self.weight.value.view());
        Ok(dx2d.into_shape_with_order((b, t, in_dim))?)
    }

    pub fn zero_grad(&mut self) {
        self.weight.zero_grad();
        self.bias.zero_grad();
    }

    pub fn visit_params(&mut self, prefix: &str, f: &mut dyn FnMut(ParamTensor)) {
        self.weight.visit_mut(&format!("{prefix}.weight"), f);
        self.bias.visit_mut(&format!("{prefix}.bias"), f);
    }

    pub fn visit_values(
        &self,
        prefix: &str,
        f: &mut dyn FnMut(&str, ndarray::ArrayViewD<f32>),
    ) {
        self.weight.visit(&format!("{prefix}.weight"), f);
        self.bias.visit(&format!("{prefix}.bias"), f);
    }
}
