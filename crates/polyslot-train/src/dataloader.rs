//! Batch sources
//!
//! The orchestrator asks a [`BatchSourceFactory`] for a fresh [`BatchSource`]
//! every epoch, passing the file window of the phase and whether batches are
//! masked. [`ShardDataLoader`] is the file-backed source: it reads
//! pre-tokenized shards (`*.tokens`, whitespace-separated token ids) from a
//! directory, sorted by name and indexed from 0.

use crate::config::RunConfig;
use crate::window::FileWindow;
use anyhow::{Context, Result};
use polyslot_model::{MaskedToken, RawBatch, TokenContext};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Shard file extension
pub const SHARD_EXTENSION: &str = "tokens";

/// A stream of raw batches for one epoch
pub trait BatchSource {
    /// Next batch, or `None` once the epoch is exhausted
    fn next_batch(&mut self) -> Result<Option<RawBatch>>;

    /// Number of batches left, when known up front
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Creates one [`BatchSource`] per epoch
pub trait BatchSourceFactory {
    /// # Arguments
    /// * `window` - File window of the phase, `None` for a non-windowed feed
    /// * `masking` - Whether batches carry self-supervised masking
    fn open(&self, window: Option<FileWindow>, masking: bool) -> Result<Box<dyn BatchSource>>;
}

/// Masking parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskingConfig {
    /// Fraction of positions replaced by the mask token
    pub fraction: f32,
    /// Seed of the masking RNG
    pub seed: u64,
    /// Special token ids
    pub tokens: TokenContext,
}

/// List shard files of a directory, sorted by name
///
/// # Arguments
/// * `data_dir` - Directory containing shard files
///
/// # Returns
/// Sorted paths of every `*.tokens` file
pub fn list_shards(data_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(data_dir)
        .with_context(|| format!("Failed to read data directory: {}", data_dir.display()))?;

    let mut shards = Vec::new();
    for entry in entries {
        let entry = entry.context("Failed to read directory entry")?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some(SHARD_EXTENSION) {
            shards.push(path);
        }
    }
    shards.sort();
    Ok(shards)
}

/// Parse one shard into token ids
pub fn read_shard(path: &Path) -> Result<Vec<u32>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read shard: {}", path.display()))?;
    text.split_whitespace()
        .map(|tok| {
            tok.parse::<u32>()
                .with_context(|| format!("Invalid token id {:?} in {}", tok, path.display()))
        })
        .collect()
}

/// File-windowed shard reader
///
/// Every shard is cut into rows of `seq_len` tokens (a trailing partial row
/// is dropped; rows never span shards) and rows are grouped into batches of
/// `batch_size`. The last batch of an epoch may hold fewer rows.
#[derive(Debug)]
pub struct ShardDataLoader {
    pending: VecDeque<Vec<Vec<u32>>>,
    masking: Option<(MaskingConfig, StdRng)>,
}

impl ShardDataLoader {
    /// Create a loader over the shards of `window`
    ///
    /// # Arguments
    /// * `data_dir` - Directory containing shard files
    /// * `window` - File window; `None` reads every shard
    /// * `batch_size` - Rows per batch
    /// * `seq_len` - Tokens per row
    /// * `masking` - Masking parameters, `None` for unmasked batches
    pub fn new(
        data_dir: &Path,
        window: Option<FileWindow>,
        batch_size: usize,
        seq_len: usize,
        masking: Option<MaskingConfig>,
    ) -> Result<Self> {
        if batch_size == 0 || seq_len == 0 {
            anyhow::bail!("batch_size and seq_len must be greater than zero");
        }

        let shards = list_shards(data_dir)?;
        let selected = match window {
            Some(window) => {
                let max = window.max.min(shards.len());
                if max < window.max {
                    warn!(
                        %window,
                        available = shards.len(),
                        "file window extends past the last shard"
                    );
                }
                shards.get(window.min..max).unwrap_or(&[])
            }
            None => &shards[..],
        };

        let mut rows = Vec::new();
        for path in selected {
            let tokens = read_shard(path)?;
            rows.extend(tokens.chunks_exact(seq_len).map(<[u32]>::to_vec));
        }
        debug!(shards = selected.len(), rows = rows.len(), "opened shard loader");

        let mut pending = VecDeque::new();
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            pending.push_back(rows.by_ref().take(batch_size).collect());
        }

        Ok(Self {
            pending,
            masking: masking.map(|m| (m, StdRng::seed_from_u64(m.seed))),
        })
    }
}

fn mask_rows(rows: &mut [Vec<u32>], config: &MaskingConfig, rng: &mut StdRng) -> Vec<MaskedToken> {
    let mut masked = Vec::new();
    for (r, row) in rows.iter_mut().enumerate() {
        for (position, token) in row.iter_mut().enumerate() {
            let draw: f32 = rng.gen();
            if draw < config.fraction && !config.tokens.is_special(*token) {
                masked.push(MaskedToken {
                    row: r,
                    position,
                    original: *token,
                });
                *token = config.tokens.mask_id;
            }
        }
    }
    masked
}

impl BatchSource for ShardDataLoader {
    fn next_batch(&mut self) -> Result<Option<RawBatch>> {
        let Some(mut rows) = self.pending.pop_front() else {
            return Ok(None);
        };
        let batch = match &mut self.masking {
            Some((config, rng)) => {
                let masked = mask_rows(&mut rows, config, rng);
                RawBatch::with_masking(rows, masked)
            }
            None => RawBatch::new(rows),
        };
        Ok(Some(batch))
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.pending.len())
    }
}

/// Factory opening a [`ShardDataLoader`] per epoch
#[derive(Debug, Clone)]
pub struct ShardSourceFactory {
    pub data_dir: PathBuf,
    pub batch_size: usize,
    pub seq_len: usize,
    pub mask_fraction: f32,
    pub seed: u64,
    pub tokens: TokenContext,
}

impl ShardSourceFactory {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            data_dir: config.data.dir.clone(),
            batch_size: config.data.batch_size,
            seq_len: config.data.seq_len,
            mask_fraction: config.data.mask_fraction,
            seed: config.data.seed,
            tokens: config.token_context(),
        }
    }
}

impl BatchSourceFactory for ShardSourceFactory {
    fn open(&self, window: Option<FileWindow>, masking: bool) -> Result<Box<dyn BatchSource>> {
        let masking = masking.then_some(MaskingConfig {
            fraction: self.mask_fraction,
            seed: self.seed,
            tokens: self.tokens,
        });
        let loader = ShardDataLoader::new(
            &self.data_dir,
            window,
            self.batch_size,
            self.seq_len,
            masking,
        )?;
        Ok(Box::new(loader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_rows_never_masks_special_tokens() {
        let config = MaskingConfig {
            fraction: 1.0,
            seed: 1,
            tokens: TokenContext::new(16),
        };
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut rows = vec![vec![0, 5, 6], vec![7, 0, 8]];

        let masked = mask_rows(&mut rows, &config, &mut rng);

        assert_eq!(masked.len(), 4);
        assert_eq!(rows, vec![vec![0, 1, 1], vec![1, 0, 1]]);
        assert_eq!(
            masked[0],
            MaskedToken {
                row: 0,
                position: 1,
                original: 5
            }
        );
    }

    #[test]
    fn test_mask_rows_zero_fraction() {
        let config = MaskingConfig {
            fraction: 0.0,
            seed: 1,
            tokens: TokenContext::new(16),
        };
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut rows = vec![vec![4, 5, 6]];
        assert!(mask_rows(&mut rows, &config, &mut rng).is_empty());
        assert_eq!(rows, vec![vec![4, 5, 6]]);
    }
}
