//! Label dispatch
//!
//! For every batch each slot receives a [`LabelSet`]. An unavailable label set
//! is an expected outcome, not an error: the slot is skipped for that batch.
//!
//! Three strategies share the same contract:
//! - [`IdentityDispatcher`]: single-slot runs, the batch is the label
//! - [`LazyDispatcher`]: labels computed per slot when the slot is reached
//! - [`VectorizedDispatcher`]: relation labels for all slots computed in one
//!   pass over the batch; memory labels still come from the lazy path because
//!   they depend on the primary slot having stepped first

use crate::config::{LabelMode, RelationSpace, RunConfig};
use crate::slots::{SlotRegistry, SlotRole};
use anyhow::Result;
use polyslot_model::{Labels, RawBatch, TokenContext, TokenPair};
use std::collections::HashMap;

/// Labels of one slot for one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    pub labels: Option<Labels>,
}

impl LabelSet {
    pub fn found(labels: Labels) -> Self {
        Self {
            labels: Some(labels),
        }
    }

    pub fn unavailable() -> Self {
        Self { labels: None }
    }

    /// Pair labels, unavailable when no pair was extracted
    pub fn from_pairs(pairs: Vec<TokenPair>) -> Self {
        if pairs.is_empty() {
            Self::unavailable()
        } else {
            Self::found(Labels::Pairs(pairs))
        }
    }

    pub fn is_found(&self) -> bool {
        self.labels.is_some()
    }
}

/// Strategy producing per-slot labels
pub trait LabelDispatcher {
    /// Called once per batch before any slot steps
    fn prepare(&mut self, batch: &RawBatch) -> Result<()>;

    /// Labels for the slot at `position`
    ///
    /// Called in slot order, after every earlier slot has stepped on the same batch.
    fn labels_for(
        &mut self,
        position: usize,
        batch: &RawBatch,
        registry: &SlotRegistry,
    ) -> Result<LabelSet>;
}

/// Extracts (subject, object) pairs around relation tokens
///
/// A relation token is any delimiter of any configured space. For each
/// occurrence, the subject is the nearest ordinary token before it and the
/// object the nearest ordinary token after it, within the same row; special
/// and relation tokens are never subjects or objects. Paired spaces add a
/// second pair `(subject, vocab_size + relation token)`.
#[derive(Debug, Clone)]
pub struct RelationExtractor {
    spaces: Vec<RelationSpace>,
    owners: HashMap<u32, Vec<usize>>,
    tokens: TokenContext,
}

impl RelationExtractor {
    pub fn new(spaces: Vec<RelationSpace>, tokens: TokenContext) -> Self {
        let mut owners: HashMap<u32, Vec<usize>> = HashMap::new();
        for (i, space) in spaces.iter().enumerate() {
            for &d in &space.delimiters {
                let entry = owners.entry(d).or_default();
                if !entry.contains(&i) {
                    entry.push(i);
                }
            }
        }
        Self {
            spaces,
            owners,
            tokens,
        }
    }

    pub fn num_spaces(&self) -> usize {
        self.spaces.len()
    }

    fn is_entity(&self, token: u32) -> bool {
        !self.tokens.is_special(token) && !self.owners.contains_key(&token)
    }

    fn scan(&self, batch: &RawBatch, mut emit: impl FnMut(usize, TokenPair, Option<TokenPair>)) {
        let rows = if batch.is_masked() {
            batch.original_rows()
        } else {
            batch.rows().to_vec()
        };
        for row in &rows {
            for (p, &token) in row.iter().enumerate() {
                let Some(spaces) = self.owners.get(&token) else {
                    continue;
                };
                let subject = row[..p].iter().rev().copied().find(|&t| self.is_entity(t));
                let object = row[p + 1..].iter().copied().find(|&t| self.is_entity(t));
                let (Some(subject), Some(object)) = (subject, object) else {
                    continue;
                };
                for &space in spaces {
                    let reference = self.spaces[space].paired.then(|| {
                        TokenPair::new(subject, self.tokens.vocab_size as u32 + token)
                    });
                    emit(space, TokenPair::new(subject, object), reference);
                }
            }
        }
    }

    /// Pairs of every space in one pass
    pub fn extract_all(&self, batch: &RawBatch) -> Vec<Vec<TokenPair>> {
        let mut out = vec![Vec::new(); self.spaces.len()];
        self.scan(batch, |space, pair, reference| {
            out[space].push(pair);
            out[space].extend(reference);
        });
        out
    }

    /// Pairs of a single space
    pub fn extract_space(&self, batch: &RawBatch, space: usize) -> Vec<TokenPair> {
        let mut out = Vec::new();
        self.scan(batch, |s, pair, reference| {
            if s == space {
                out.push(pair);
                out.extend(reference);
            }
        });
        out
    }
}

/// Single-slot dispatch: the batch is its own label
#[derive(Debug, Default)]
pub struct IdentityDispatcher;

impl LabelDispatcher for IdentityDispatcher {
    fn prepare(&mut self, _batch: &RawBatch) -> Result<()> {
        Ok(())
    }

    fn labels_for(
        &mut self,
        _position: usize,
        batch: &RawBatch,
        _registry: &SlotRegistry,
    ) -> Result<LabelSet> {
        Ok(LabelSet::found(Labels::Sequence(batch.clone())))
    }
}

/// Per-slot dispatch on demand
#[derive(Debug)]
pub struct LazyDispatcher {
    extractor: RelationExtractor,
}

impl LazyDispatcher {
    pub fn new(extractor: RelationExtractor) -> Self {
        Self { extractor }
    }
}

/// Labels of a memory-layer slot: the primary slot's trace for that layer
fn memory_labels(layer: usize, registry: &SlotRegistry) -> LabelSet {
    registry
        .primary()
        .and_then(|slot| slot.unit.memory_trace(layer))
        .filter(|trace| !trace.is_empty())
        .map(|trace| LabelSet::found(Labels::Sequence(trace)))
        .unwrap_or_else(LabelSet::unavailable)
}

impl LabelDispatcher for LazyDispatcher {
    fn prepare(&mut self, _batch: &RawBatch) -> Result<()> {
        Ok(())
    }

    fn labels_for(
        &mut self,
        position: usize,
        batch: &RawBatch,
        registry: &SlotRegistry,
    ) -> Result<LabelSet> {
        Ok(match registry.slot(position).role {
            SlotRole::Primary => LabelSet::found(Labels::Sequence(batch.clone())),
            SlotRole::Memory { layer } => memory_labels(layer, registry),
            SlotRole::Relation { space, .. } => {
                LabelSet::from_pairs(self.extractor.extract_space(batch, space))
            }
        })
    }
}

/// Relation labels for all slots computed once per batch
#[derive(Debug)]
pub struct VectorizedDispatcher {
    lazy: LazyDispatcher,
    prepared: Vec<Option<Vec<TokenPair>>>,
}

impl VectorizedDispatcher {
    pub fn new(extractor: RelationExtractor) -> Self {
        Self {
            lazy: LazyDispatcher::new(extractor),
            prepared: Vec::new(),
        }
    }
}

impl LabelDispatcher for VectorizedDispatcher {
    fn prepare(&mut self, batch: &RawBatch) -> Result<()> {
        self.prepared = if self.lazy.extractor.num_spaces() == 0 {
            Vec::new()
        } else {
            self.lazy
                .extractor
                .extract_all(batch)
                .into_iter()
                .map(Some)
                .collect()
        };
        Ok(())
    }

    fn labels_for(
        &mut self,
        position: usize,
        batch: &RawBatch,
        registry: &SlotRegistry,
    ) -> Result<LabelSet> {
        match registry.slot(position).role {
            SlotRole::Relation { space, .. } => {
                let pairs = self
                    .prepared
                    .get_mut(space)
                    .and_then(Option::take)
                    .ok_or_else(|| {
                        anyhow::anyhow!("relation space {space} was not prepared for this batch")
                    })?;
                Ok(LabelSet::from_pairs(pairs))
            }
            _ => self.lazy.labels_for(position, batch, registry),
        }
    }
}

/// Dispatcher matching the configured slot layout and label mode
pub fn dispatcher_for(config: &RunConfig) -> Box<dyn LabelDispatcher> {
    if !config.run.multi_slot {
        return Box::new(IdentityDispatcher);
    }
    let extractor =
        RelationExtractor::new(config.slots.relation_spaces.clone(), config.token_context());
    match config.slots.label_mode {
        LabelMode::Vectorized => Box::new(VectorizedDispatcher::new(extractor)),
        LabelMode::Lazy => Box::new(LazyDispatcher::new(extractor)),
    }
}
