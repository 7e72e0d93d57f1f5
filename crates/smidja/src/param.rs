//! Trainable parameters and the visitor used by the optimizer and checkpoints.

use ndarray::{Array, ArrayViewD, ArrayViewMutD, Dimension};

/// A weight tensor paired with its gradient accumulator.
///
/// Gradients accumulate across `backward` calls until [`Param::zero_grad`],
/// which is what makes gradient accumulation over micro-batches work.
#[derive(Debug, Clone)]
pub struct Param<D: Dimension> {
    pub value: Array<f32, D>,
    pub grad: Array<f32, D>,
}

impl<D: Dimension> Param<D> {
    pub fn new(value: Array<f32, D>) -> Self {
        let grad = Array::zeros(value.raw_dim());
        Self { value, grad }
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn visit_mut(&mut self, name: &str, f: &mut dyn FnMut(ParamTensor)) {
        f(ParamTensor {
            name,
            value: self.value.view_mut().into_dyn(),
            grad: self.grad.view_mut().into_dyn(),
        });
    }

    pub fn visit(&self, name: &str, f: &mut dyn FnMut(&str, ArrayViewD<f32>)) {
        f(name, self.value.view().into_dyn());
    }
}

/// Mutable view of one parameter, handed to visitors in a fixed order.
///
/// The visit order is deterministic for a given architecture; optimizer state
/// is keyed by it.
pub struct ParamTensor<'a> {
    pub name: &'a str,
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: ArrayViewMutD<'a, f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_zero_grad() {
        let mut p = Param::new(Array2::<f32>::ones((2, 3)));
        p.grad.fill(5.0);
        p.zero_grad();
        assert!(p.grad.iter().all(|&g| g == 0.0));
        assert!(p.value.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_visit_mut_exposes_both_buffers() {
        let mut p = Param::new(Array2::<f32>::zeros((2, 2)));
        p.visit_mut("w", &mut |mut t| {
            assert_eq!(t.name, "w");
            t.value.fill(1.0);
            t.grad.fill(2.0);
        });
        assert_eq!(p.value[[0, 0]], 1.0);
        assert_eq!(p.grad[[1, 1]], 2.0);
    }
}
