//! Sharded token data loading.
//!
//! Shards are raw little-endian `u16` token files (`.bin`) in a single
//! directory; a shard belongs to the train or val split when its file name
//! contains the split name. Shards are memory-mapped and visited in sorted
//! order, wrapping around cyclically.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use ndarray::Array2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct TokenShardLoader {
    shards: Vec<PathBuf>,
    batch_size: usize,
    seq_len: usize,
    rank: usize,
    world_size: usize,
    shard_idx: usize,
    mmap: Mmap,
    /// Token offset of the next batch within the current shard.
    pos: usize,
}

fn map_shard(path: &Path) -> Result<Mmap> {
    let file =
        File::open(path).with_context(|| format!("failed to open shard {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("failed to mmap shard {}", path.display()))?;
    if mmap.len() % 2 != 0 {
        bail!(
            "shard {} has odd byte length {}; expected raw u16 tokens",
            path.display(),
            mmap.len()
        );
    }
    Ok(mmap)
}

impl TokenShardLoader {
    pub fn new(
        data_dir: &Path,
        batch_size: usize,
        seq_len: usize,
        split: Split,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        let mut shards: Vec<PathBuf> = std::fs::read_dir(data_dir)
            .with_context(|| format!("failed to read data dir {}", data_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "bin")
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.contains(split.as_str()))
            })
            .collect();
        shards.sort();

        if shards.is_empty() {
            bail!(
                "no {} shards found in {}",
                split,
                data_dir.display()
            );
        }
        log::info!("found {} shards for split {}", shards.len(), split);

        let mmap = map_shard(&shards[0])?;
        let mut loader = Self {
            shards,
            batch_size,
            seq_len,
            rank,
            world_size,
            shard_idx: 0,
            mmap,
            pos: batch_size * seq_len * rank,
        };
        loader.ensure_shard_capacity()?;
        Ok(loader)
    }

    /// Rewinds to the start of the first shard.
    pub fn reset(&mut self) -> Result<()> {
        self.shard_idx = 0;
        self.mmap = map_shard(&self.shards[0])?;
        self.pos = self.batch_size * self.seq_len * self.rank;
        self.ensure_shard_capacity()
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn tokens(&self) -> &[u16] {
        bytemuck::cast_slice(&self.mmap)
    }

    fn stride(&self) -> usize {
        self.batch_size * self.seq_len * self.world_size
    }

    fn ensure_shard_capacity(&self) -> Result<()> {
        let needed = self.stride() + 1;
        if self.tokens().len() < needed {
            bail!(
                "shard {} holds {} tokens, need at least {} for B={} T={} world={}",
                self.shards[self.shard_idx].display(),
                self.tokens().len(),
                needed,
                self.batch_size,
                self.seq_len,
                self.world_size
            );
        }
        Ok(())
    }

    /// Returns the next `(x, y)` pair, each `[batch, seq]`, with `y` shifted
    /// one token ahead of `x`. Ranks stride disjoint windows of each shard.
    pub fn next_batch(&mut self) -> Result<(Array2<u32>, Array2<u32>)> {
        let need = self.batch_size * self.seq_len;
        let tokens = self.tokens();
        let window = &tokens[self.pos..self.pos + need + 1];

        let x = Array2::from_shape_vec(
            (self.batch_size, self.seq_len),
            window[..need].iter().map(|&t| t as u32).collect(),
        )?;
        let y = Array2::from_shape_vec(
            (self.batch_size, self.seq_len),
            window[1..=need].iter().map(|&t| t as u32).collect(),
        )?;

        self.pos += self.stride();
        if self.pos + self.stride() + 1 > self.tokens().len() {
            self.shard_idx = (self.shard_idx + 1) % self.shards.len();
            self.mmap = map_shard(&self.shards[self.shard_idx])?;
            self.pos = need * self.rank;
            self.ensure_shard_capacity()?;
        }
        Ok((x, y))
    }
}
