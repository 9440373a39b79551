//! Raw batches and the label payloads units train on

use std::sync::Arc;

/// A position overwritten by the mask token, with the id it replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskedToken {
    pub row: usize,
    pub position: usize,
    pub original: u32,
}

#[derive(Debug, PartialEq, Eq)]
struct BatchData {
    rows: Vec<Vec<u32>>,
    masked: Vec<MaskedToken>,
}

/// Token payload produced by a batch source
///
/// Immutable once built. Cloning is cheap and shares the underlying rows, so
/// a batch can be handed to every slot of a run without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBatch {
    data: Arc<BatchData>,
}

impl RawBatch {
    /// Unmasked batch
    pub fn new(rows: Vec<Vec<u32>>) -> Self {
        Self {
            data: Arc::new(BatchData {
                rows,
                masked: Vec::new(),
            }),
        }
    }

    /// Batch whose `masked` positions have already been overwritten in `rows`
    pub fn with_masking(rows: Vec<Vec<u32>>, masked: Vec<MaskedToken>) -> Self {
        Self {
            data: Arc::new(BatchData { rows, masked }),
        }
    }

    pub fn rows(&self) -> &[Vec<u32>] {
        &self.data.rows
    }

    pub fn masked(&self) -> &[MaskedToken] {
        &self.data.masked
    }

    pub fn is_masked(&self) -> bool {
        !self.data.masked.is_empty()
    }

    /// Total number of tokens across all rows
    pub fn num_tokens(&self) -> usize {
        self.data.rows.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_tokens() == 0
    }

    /// Rows with masked positions restored to their original ids
    pub fn original_rows(&self) -> Vec<Vec<u32>> {
        let mut rows = self.data.rows.clone();
        for m in &self.data.masked {
            if let Some(slot) = rows.get_mut(m.row).and_then(|r| r.get_mut(m.position)) {
                *slot = m.original;
            }
        }
        rows
    }
}

/// A single supervised (input, target) token pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenPair {
    pub input: u32,
    pub target: u32,
}

impl TokenPair {
    pub fn new(input: u32, target: u32) -> Self {
        Self { input, target }
    }
}

/// What a unit is asked to fit during one propagate call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Labels {
    /// The batch is its own supervision (masked or next-token)
    Sequence(RawBatch),
    /// Explicit pairs extracted by a label dispatcher
    Pairs(Vec<TokenPair>),
}

impl Labels {
    /// Whether there is anything to fit
    pub fn is_empty(&self) -> bool {
        match self {
            Labels::Sequence(batch) => batch.is_empty(),
            Labels::Pairs(pairs) => pairs.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_rows() {
        let batch = RawBatch::new(vec![vec![2, 3, 4]]);
        let other = batch.clone();
        assert!(Arc::ptr_eq(&batch.data, &other.data));
        assert_eq!(other.num_tokens(), 3);
    }

    #[test]
    fn test_original_rows_restores_masked_ids() {
        let batch = RawBatch::with_masking(
            vec![vec![2, 1, 4], vec![1, 6, 7]],
            vec![
                MaskedToken { row: 0, position: 1, original: 3 },
                MaskedToken { row: 1, position: 0, original: 5 },
            ],
        );
        assert!(batch.is_masked());
        assert_eq!(batch.original_rows(), vec![vec![2, 3, 4], vec![5, 6, 7]]);
        // The batch itself is untouched.
        assert_eq!(batch.rows()[0][1], 1);
    }

    #[test]
    fn test_labels_is_empty() {
        assert!(Labels::Pairs(Vec::new()).is_empty());
        assert!(Labels::Sequence(RawBatch::new(vec![])).is_empty());
        assert!(!Labels::Pairs(vec![TokenPair::new(2, 3)]).is_empty());
    }
}
