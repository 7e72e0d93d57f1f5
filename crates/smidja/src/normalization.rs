//! LayerNorm with cached statistics for the backward pass.

use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Array3, Axis, Ix1};

use crate::param::{Param, ParamTensor};

struct Cache {
    x: Array3<f32>,
    mean: Array2<f32>,
    rstd: Array2<f32>,
}

/// Normalizes over the channel axis of a `[batch, seq, channels]` tensor.
pub struct LayerNorm {
    pub weight: Param<Ix1>,
    pub bias: Param<Ix1>,
    pub eps: f32,
    cache: Option<Cache>,
}

impl LayerNorm {
    pub fn new(dim: usize, eps: f32) -> Self {
        Self {
            weight: Param::new(Array1::ones(dim)),
            bias: Param::new(Array1::zeros(dim)),
            eps,
            cache: None,
        }
    }

    pub fn forward(&mut self, x: &Array3<f32>) -> Array3<f32> {
        let c = x.dim().2 as f32;
        let mean = x.sum_axis(Axis(2)) / c;
        let var = x.var_axis(Axis(2), 0.0);
        let rstd = var.mapv(|v| 1.0 / (v + self.eps).sqrt());

        let mean_b = mean.view().insert_axis(Axis(2));
        let rstd_b = rstd.view().insert_axis(Axis(2));
        let y = (x - &mean_b) * &rstd_b * &self.weight.value + &self.bias.value;

        self.cache = Some(Cache {
            x: x.clone(),
            mean,
            rstd,
        });
        y
    }

    /// Accumulates `weight.grad` / `bias.grad` and returns the input gradient.
    pub fn backward(&mut self, dy: &Array3<f32>) -> Result<Array3<f32>> {
        let Some(cache) = self.cache.take() else {
            bail!("layer norm backward called before forward");
        };
        let c = cache.x.dim().2 as f32;

        let mean_b = cache.mean.view().insert_axis(Axis(2));
        let rstd_b = cache.rstd.view().insert_axis(Axis(2));
        let xhat = (&cache.x - &mean_b) * &rstd_b;

        // Parameter gradients reduce over batch and sequence.
        let dy_flat = dy.view().into_shape_with_order((dy.len() / dy.dim().2, dy.dim().2))?;
        let xhat_flat = xhat
            .view()
            .into_shape_with_order((xhat.len() / xhat.dim().2, xhat.dim().2))?;
        self.bias.grad += &dy_flat.sum_axis(Axis(0));
        self.weight.grad += &(&dy_flat * &xhat_flat).sum_axis(Axis(0));

        // dx = rstd * (dxhat - mean(dxhat) - xhat * mean(dxhat * xhat))
        let dxhat = dy * &self.weight.value;
        let mean_dxhat = (dxhat.sum_axis(Axis(2)) / c).insert_axis(Axis(2));
        let mean_dxhat_xhat = ((&dxhat * &xhat).sum_axis(Axis(2)) / c).insert_axis(Axis(2));
        let dx = (&dxhat - &mean_dxhat - &xhat * &mean_dxhat_xhat) * &rstd_b;

        Ok(dx)
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn make_input() -> Array3<f32> {
        Array3::from_shape_fn((2, 3, 4), |(b, t, c)| {
            ((b * 13 + t * 7 + c * 3) % 11) as f32 * 0.5 - 2.0
        })
    }

    #[test]
    fn test_forward_normalizes_rows() {
        let mut ln = LayerNorm::new(4, 1e-5);
        let x = make_input();
        let y = ln.forward(&x);

        for b in 0..2 {
            for t in 0..3 {
                let row = y.slice(ndarray::s![b, t, ..]);
                let mean = row.sum() / 4.0;
                let var = row.mapv(|v| (v - mean) * (v - mean)).sum() / 4.0;
                assert_relative_eq!(mean, 0.0, epsilon = 1e-5);
                assert_relative_eq!(var, 1.0, epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn test_forward_applies_affine() {
        let mut ln = LayerNorm::new(4, 1e-5);
        ln.weight.value.fill(2.0);
        ln.bias.value.fill(0.5);
        let x = make_input();
        let y = ln.forward(&x);

        for row in y.rows() {
            let mean = row.sum() / 4.0;
            assert_relative_eq!(mean, 0.5, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_backward_matches_numerical_gradient() {
        let x = make_input();
        let r = Array3::from_shape_fn((2, 3, 4), |(b, t, c)| {
            ((b + t * 5 + c * 2) % 7) as f32 * 0.3 - 0.9
        });

        // Scalar objective: sum(forward(x) * r)
        let loss = |ln: &mut LayerNorm, x: &Array3<f32>| (ln.forward(x) * &r).sum();

        let mut ln = LayerNorm::new(4, 1e-5);
        ln.weight.value = Array1::from_vec(vec![1.1, 0.9, 1.3, 0.7]);
        ln.bias.value = Array1::from_vec(vec![0.1, -0.2, 0.0, 0.3]);

        let _ = loss(&mut ln, &x);
        let dx = ln.backward(&r).unwrap();

        let h = 1e-2f32;
        for &(b, t, c) in &[(0, 0, 0), (1, 2, 3), (0, 1, 2), (1, 0, 1)] {
            let mut xp = x.clone();
            xp[[b, t, c]] += h;
            let mut xm = x.clone();
            xm[[b, t, c]] -= h;
            let numerical = (loss(&mut ln, &xp) - loss(&mut ln, &xm)) / (2.0 * h);
            assert_relative_eq!(dx[[b, t, c]], numerical, epsilon = 1e-2, max_relative = 2e-2);
        }

        // Weight gradient
        let _ = loss(&mut ln, &x);
        ln.zero_grad();
        let _ = ln.backward(&r).unwrap();
        let dweight = ln.weight.grad.clone();
        for c in 0..4 {
            let orig = ln.weight.value[c];
            ln.weight.value[c] = orig + h;
            let lp = loss(&mut ln, &x);
            ln.weight.value[c] = orig - h;
            let lm = loss(&mut ln, &x);
            ln.weight.value[c] = orig;
            let numerical = (lp - lm) / (2.0 * h);
            assert_relative_eq!(dweight[c], numerical, epsilon = 1e-2, max_relative = 2e-2);
        }
    }

    #[test]
    fn test_gradients_accumulate() {
        let mut ln = LayerNorm::new(4, 1e-5);
        let x = make_input();
        let dy = Array3::ones((2, 3, 4));

        let _ = ln.forward(&x);
        let _ = ln.backward(&dy).unwrap();
        let first = ln.bias.grad.clone();

        let _ = ln.forward(&x);
        let _ = ln.backward(&dy).unwrap();

        for c in 0..4 {
            assert_relative_eq!(ln.bias.grad[c], 2.0 * first[c], epsilon = 1e-5);
        }

        ln.zero_grad();
        assert!(ln.bias.grad.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_backward_without_forward_fails() {
        let mut ln = LayerNorm::new(4, 1e-5);
        let dy = Array3::ones((1, 1, 4));
        assert!(ln.backward(&dy).is_err());
    }
}
