//! The GPT-2 decoder: embeddings, pre-norm transformer blocks, and the
//! weight-tied language-model head, with explicit backward passes.

use anyhow::{bail, Result};
use ndarray::{Array2, Array3, Axis, Ix2, Zip};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::attention::CausalSelfAttention;
use crate::config::Gpt2Config;
use crate::feedforward::Mlp;
use crate::normalization::LayerNorm;
use crate::ops::{matmul_2d, matmul_3d_2d, matmul_3d_2d_transposed};
use crate::param::{Param, ParamTensor};

const INIT_STD: f32 = 0.02;

/// One pre-norm transformer block: `x + attn(ln_1(x))`, then `x + mlp(ln_2(x))`.
pub struct Block {
    pub ln_1: LayerNorm,
    pub attn: CausalSelfAttention,
    pub ln_2: LayerNorm,
    pub mlp: Mlp,
}

impl Block {
    fn new(config: &Gpt2Config) -> Self {
        Self {
            ln_1: LayerNorm::new(config.n_embd, config.layer_norm_epsilon),
            attn: CausalSelfAttention::new(config.n_embd, config.n_head),
            ln_2: LayerNorm::new(config.n_embd, config.layer_norm_epsilon),
            mlp: Mlp::new(config.n_embd),
        }
    }

    fn forward(&mut self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let normed = self.ln_1.forward(x);
        let x1 = x + &self.attn.forward(&normed)?;
        let normed = self.ln_2.forward(&x1);
        let x2 = &x1 + &self.mlp.forward(&normed);
        Ok(x2)
    }

    fn backward(&mut self, dy: &Array3<f32>) -> Result<Array3<f32>> {
        // Residual branches add their gradient to the skip path.
        let dmlp = self.mlp.backward(dy)?;
        let dx1 = dy + &self.ln_2.backward(&dmlp)?;
        let dattn = self.attn.backward(&dx1)?;
        let dx = &dx1 + &self.ln_1.backward(&dattn)?;
        Ok(dx)
    }

    fn zero_grad(&mut self) {
        self.ln_1.zero_grad();
        self.attn.zero_grad();
        self.ln_2.zero_grad();
        self.mlp.zero_grad();
    }

    fn visit_params(&mut self, prefix: &str, f: &mut dyn FnMut(ParamTensor)) {
        self.ln_1.visit_params(&format!("{prefix}.ln_1"), f);
        self.attn.visit_params(&format!("{prefix}.attn"), f);
        self.ln_2.visit_params(&format!("{prefix}.ln_2"), f);
        self.mlp.visit_params(&format!("{prefix}.mlp"), f);
    }

    fn visit_values(&self, prefix: &str, f: &mut dyn FnMut(&str, ndarray::ArrayViewD<f32>)) {
        self.ln_1.visit_values(&format!("{prefix}.ln_1"), f);
        self.attn.visit_values(&format!("{prefix}.attn"), f);
        self.ln_2.visit_values(&format!("{prefix}.ln_2"), f);
        self.mlp.visit_values(&format!("{prefix}.mlp"), f);
    }
}

struct FwdCache {
    tokens: Array2<u32>,
    /// Final hidden states after `ln_f`, needed by the head backward.
    xf: Array3<f32>,
}

pub struct Gpt2 {
    pub config: Gpt2Config,
    /// Token embedding, `[padded_vocab, n_embd]`; also the LM head weight.
    pub wte: Param<Ix2>,
    /// Position embedding, `[block_size, n_embd]`.
    pub wpe: Param<Ix2>,
    pub blocks: Vec<Block>,
    pub ln_f: LayerNorm,
    cache: Option<FwdCache>,
}

impl Gpt2 {
    /// Builds a model with fresh, randomly initialized weights.
    pub fn new(config: Gpt2Config, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut model = Self::zeroed(config)?;
        model.init_weights(seed);
        Ok(model)
    }

    /// Builds a model with all-zero weights, ready to be filled from a
    /// checkpoint.
    pub fn zeroed(config: Gpt2Config) -> Result<Self> {
        config.validate()?;
        let blocks = (0..config.n_layer).map(|_| Block::new(&config)).collect();
        Ok(Self {
            wte: Param::new(Array2::zeros((config.padded_vocab(), config.n_embd))),
            wpe: Param::new(Array2::zeros((config.block_size, config.n_embd))),
            blocks,
            ln_f: LayerNorm::new(config.n_embd, config.layer_norm_epsilon),
            config,
            cache: None,
        })
    }

    fn init_weights(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0f32, INIT_STD).expect("valid stddev");
        // Residual output projections are scaled down so the variance of the
        // residual stream stays bounded with depth.
        let resid_std = INIT_STD / (2.0 * self.config.n_layer as f32).sqrt();
        let resid_normal = Normal::new(0.0f32, resid_std).expect("valid stddev");

        self.wte.value.mapv_inplace(|_| normal.sample(&mut rng));
        self.wpe.value.mapv_inplace(|_| normal.sample(&mut rng));
        for block in &mut self.blocks {
            block
                .attn
                .c_attn
                .weight
                .value
                .mapv_inplace(|_| normal.sample(&mut rng));
            block
                .attn
                .c_proj
                .weight
                .value
                .mapv_inplace(|_| resid_normal.sample(&mut rng));
            block
                .mlp
                .c_fc
                .weight
                .value
                .mapv_inplace(|_| normal.sample(&mut rng));
            block
                .mlp
                .c_proj
                .weight
                .value
                .mapv_inplace(|_| resid_normal.sample(&mut rng));
        }
    }

    pub fn num_params(&mut self) -> usize {
        let mut total = 0;
        self.visit_params(&mut |t| total += t.value.len());
        total
    }

    /// Runs the decoder over `tokens` (`[batch, seq]`) and returns logits
    /// `[batch, seq, padded_vocab]`.
    pub fn forward(&mut self, tokens: &Array2<u32>) -> Result<Array3<f32>> {
        let (b, t) = tokens.dim();
        if t > self.config.block_size {
            bail!(
                "cannot forward sequence of length {}, block size is {}",
                t,
                self.config.block_size
            );
        }
        let vocab = self.config.padded_vocab() as u32;
        if let Some(&bad) = tokens.iter().find(|&&tok| tok >= vocab) {
            bail!("token id {} out of range (vocab {})", bad, vocab);
        }

        let mut x = Array3::<f32>::zeros((b, t, self.config.n_embd));
        {
            let wte = self.wte.value.view();
            let wpe = self.wpe.value.view();
            Zip::indexed(x.lanes_mut(Axis(2)))
                .and(tokens)
                .par_for_each(|(_, ti), mut row, &tok| {
                    Zip::from(&mut row)
                        .and(&wte.row(tok as usize))
                        .and(&wpe.row(ti))
                        .for_each(|o, &e, &p| *o = e + p);
                });
        }

        for block in &mut self.blocks {
            x = block.forward(&x)?;
        }
        let xf = self.ln_f.forward(&x);

        // Weight-tied head: logits = xf @ wte^T.
        let logits = matmul_3d_2d_transposed(&xf, &self.wte.value);

        self.cache = Some(FwdCache {
            tokens: tokens.clone(),
            xf,
        });
        Ok(logits)
    }

    /// Propagates `dlogits` back through the whole network, accumulating
    /// parameter gradients. The tied embedding collects gradient from both
    /// the LM head and the token lookup.
    pub fn backward(&mut self, dlogits: &Array3<f32>) -> Result<()> {
        let Some(cache) = self.cache.take() else {
            bail!("model backward called before forward");
        };
        let (b, t, c) = cache.xf.dim();
        let vocab = dlogits.dim().2;

        let dlogits2d = dlogits.view().into_shape_with_order((b * t, vocab))?;
        let xf2d = cache.xf.view().into_shape_with_order((b * t, c))?;
        self.wte.grad += &matmul_2d(&dlogits2d.t(), &xf2d);

        let dxf = matmul_3d_2d(dlogits, &self.wte.value);
        let mut dx = self.ln_f.backward(&dxf)?;
        for block in self.blocks.iter_mut().rev() {
            dx = block.backward(&dx)?;
        }

        // Embedding backward: scatter-add rows. Serial; token collisions make
        // a parallel scatter racy.
        for ((bi, ti), &tok) in cache.tokens.indexed_iter() {
            let g = dx.slice(ndarray::s![bi, ti, ..]);
            let mut wte_row = self.wte.grad.row_mut(tok as usize);
            wte_row += &g;
            let mut wpe_row = self.wpe.grad.row_mut(ti);
            wpe_row += &g;
        }
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.wte.zero_grad();
        self.wpe.zero_grad();
        for block in &mut self.blocks {
            block.zero_grad();
        }
        self.ln_f.zero_grad();
    }

    /// Visits every parameter in a fixed, deterministic order.
    pub fn visit_params(&mut self, f: &mut dyn FnMut(ParamTensor)) {
        self.wte.visit_mut("wte.weight", f);
        self.wpe.visit_mut("wpe.weight", f);
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.visit_params(&format!("h.{i}"), f);
        }
        self.ln_f.visit_params("ln_f", f);
    }

    /// Read-only visit in the same order as [`Gpt2::visit_params`].
    pub fn visit_values(&self, f: &mut dyn FnMut(&str, ndarray::ArrayViewD<f32>)) {
        self.wte.visit("wte.weight", f);
        self.wpe.visit("wpe.weight", f);
        for (i, block) in self.blocks.iter().enumerate() {
            block.visit_values(&format!("h.{i}"), f);
        }
        self.ln_f.visit_values("ln_f", f);
    }
}
