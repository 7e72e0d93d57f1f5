//! CPU GPT-2 pretraining and evaluation engine.
//!
//! Provides the decoder with explicit backward passes, AdamW with a warmup +
//! cosine schedule, sharded token data loading, HellaSwag evaluation, top-k
//! sampling and safetensors checkpointing.

pub mod activations;
pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod eval;
pub mod feedforward;
pub mod linear;
pub mod loss;
pub mod model;
pub mod normalization;
pub mod ops;
pub mod optim;
pub mod param;
pub mod sample;
pub mod schedule;
pub mod stats;
pub mod trainer;

// Re-export commonly used items
pub use crate::{
    checkpoint::{from_pretrained, load_checkpoint, save_checkpoint},
    config::{Gpt2Config, TrainConfig},
    data::{Split, TokenShardLoader},
    model::Gpt2,
    optim::{clip_grad_norm, AdamW},
    sample::generate,
    schedule::LrSchedule,
    trainer::Trainer,
};
