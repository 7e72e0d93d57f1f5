//! Benchmark evaluation.

pub mod hellaswag;
