//! GELU activation and softmax operations.

use libm::tanhf;
use ndarray::{s, Array3, Array4, Zip};
use rayon::prelude::*;

/// Minimum array size for parallel execution.
pub const PARALLEL_THRESHOLD: usize = 16_384;

const SQRT_2_OVER_PI: f32 = 0.7978845608;
const GELU_COEFF: f32 = 0.044715;

/// Tanh-approximated GELU, matching the GPT-2 `gelu_new` variant.
#[inline(always)]
pub fn gelu_scalar(x: f32) -> f32 {
    let x_cubed = x * x * x;
    let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x_cubed);
    0.5 * x * (1.0 + tanhf(inner))
}

/// d gelu(x) / dx for the tanh approximation.
#[inline(always)]
pub fn gelu_grad_scalar(x: f32) -> f32 {
    let x_sq = x * x;
    let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x_sq * x);
    let t = tanhf(inner);
    let d_inner = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x_sq);
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
}

/// Applies GELU in-place to a 3D array.
pub fn gelu(x: &mut Array3<f32>) {
    match x.as_slice_mut() {
        Some(slice) if slice.len() >= PARALLEL_THRESHOLD => {
            slice.par_iter_mut().for_each(|v| *v = gelu_scalar(*v));
        }
        _ => x.mapv_inplace(gelu_scalar),
    }
}

/// `dx = dy * gelu'(x)` for a cached pre-activation `x`.
pub fn gelu_backward(dy: &Array3<f32>, x: &Array3<f32>) -> Array3<f32> {
    let mut dx = Array3::<f32>::zeros(dy.raw_dim());
    if dy.len() >= PARALLEL_THRESHOLD {
        Zip::from(&mut dx)
            .and(dy)
            .and(x)
            .par_for_each(|d, &g, &v| *d = g * gelu_grad_scalar(v));
    } else {
        Zip::from(&mut dx)
            .and(dy)
            .and(x)
            .for_each(|d, &g, &v| *d = g * gelu_grad_scalar(v));
    }
    dx
}

/// Applies softmax in-place to a slice.
pub fn softmax_inplace(slice: &mut [f32]) {
    if slice.is_empty() {
        return;
    }

    let max = slice.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));

    let mut sum = 0.0;
    for v in slice.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }

    if sum > 0.0 {
        let scale = 1.0 / sum;
        for v in slice.iter_mut() {
            *v *= scale;
        }
    }
}

/// Applies softmax along the last axis of a 4D array.
pub fn softmax_4d_inplace(scores: &mut Array4<f32>) {
    let (batch_size, num_heads, q_len, _) = scores.dim();

    for b in 0..batch_size {
        for h in 0..num_heads {
            for q in 0..q_len {
                let mut row_view = scores.slice_mut(s![b, h, q, ..]);
                if let Some(slice) = row_view.as_slice_mut() {
                    softmax_inplace(slice);
                } else {
                    let max = row_view.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                    row_view.mapv_inplace(|x| (x - max).exp());
                    let sum = row_view.sum();
                    if sum > 0.0 {
                        row_view /= sum;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_gelu_scalar() {
        assert_relative_eq!(gelu_scalar(0.0), 0.0);
        // PyTorch F.gelu(x, approximate="tanh") golden values
        assert_relative_eq!(gelu_scalar(1.0), 0.841192, epsilon = 1e-5);
        assert_relative_eq!(gelu_scalar(-1.0), -0.158808, epsilon = 1e-5);
        assert_relative_eq!(gelu_scalar(2.0), 1.954598, epsilon = 1e-5);
    }

    #[test]
    fn test_gelu_grad_matches_numerical() {
        let h = 1e-3;
        for &x in &[-3.0f32, -1.0, -0.5, 0.0, 0.3, 1.0, 2.5] {
            let numerical = (gelu_scalar(x + h) - gelu_scalar(x - h)) / (2.0 * h);
            let analytic = gelu_grad_scalar(x);
            assert!(
                (numerical - analytic).abs() < 1e-3,
                "gelu grad mismatch at {}: {} vs {}",
                x,
                numerical,
                analytic
            );
        }
    }

    #[test]
    fn test_gelu_backward_shape_and_values() {
        let x = Array3::from_shape_fn((2, 3, 4), |(b, t, c)| (b + t + c) as f32 * 0.3 - 1.0);
        let dy = Array3::from_elem((2, 3, 4), 1.0f32);

        let dx = gelu_backward(&dy, &x);

        assert_eq!(dx.dim(), (2, 3, 4));
        for ((idx, &g), &v) in dx.indexed_iter().zip(x.iter()) {
            assert!(
                (g - gelu_grad_scalar(v)).abs() < 1e-6,
                "mismatch at {:?}",
                idx
            );
        }
    }

    #[test]
    fn test_softmax_inplace_basic() {
        let mut data = vec![1.0, 2.0, 3.0];
        softmax_inplace(&mut data);
        assert_relative_eq!(data[0], 0.09003057, epsilon = 1e-6);
        assert_relative_eq!(data[1], 0.24472847, epsilon = 1e-6);
        assert_relative_eq!(data[2], 0.66524094, epsilon = 1e-6);
        assert_relative_eq!(data.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_softmax_inplace_empty() {
        let mut data: Vec<f32> = vec![];
        softmax_inplace(&mut data);
        assert!(data.is_empty());
    }

    #[test]
    fn test_softmax_4d_rows_sum_to_one() {
        let mut scores = Array4::from_shape_fn((1, 2, 2, 3), |(_, h, q, k)| {
            (h * 3 + q * 2 + k) as f32 * 0.7 - 1.0
        });
        softmax_4d_inplace(&mut scores);

        for h in 0..2 {
            for q in 0..2 {
                let row = scores.slice(s![0, h, q, ..]);
                assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_softmax_numerical_stability() {
        let mut input = Array4::from_shape_vec((1, 1, 1, 3), vec![1000.0, 1001.0, 1002.0]).unwrap();
        softmax_4d_inplace(&mut input);

        assert_relative_eq!(input.sum(), 1.0, epsilon = 1e-6);
        assert!(!input.iter().any(|x| x.is_nan()));
    }
}
