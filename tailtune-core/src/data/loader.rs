//! Finite, restartable batch sequences.
//!
//! A [`BatchSource`] hands out a fresh iterator per epoch. Sequences are
//! bounded and never resumed mid-way; a new epoch always asks for a new one.

use crate::data::dataset::ClassFrequencyTable;
use crate::error::{Result, TuneError};
use rand::SeedableRng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// One mini-batch of inputs with their class indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<I> {
    pub inputs: Vec<I>,
    pub labels: Vec<usize>,
}

impl<I> Batch<I> {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Producer of per-epoch batch sequences.
pub trait BatchSource<I> {
    /// Number of samples visited per epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Class index of every underlying sample, in storage order.
    fn labels(&self) -> Vec<usize>;

    /// A new, bounded batch sequence for `epoch`.
    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch<I>>> + '_>;
}

/// Visiting order of an [`InMemoryLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOrder {
    /// Storage order; used for evaluation.
    #[default]
    Sequential,
    /// Permutation seeded by `(seed, epoch)`.
    Shuffled,
    /// Inverse class-frequency sampling with replacement, seeded by `(seed, epoch)`.
    Weighted,
}

/// Batches over a borrowed slice of `(input, class_index)` pairs.
pub struct InMemoryLoader<'a, I> {
    items: &'a [(I, usize)],
    batch_size: usize,
    order: SampleOrder,
    seed: u64,
    sample_weights: Vec<f64>,
}

impl<'a, I: Clone> InMemoryLoader<'a, I> {
    pub fn new(items: &'a [(I, usize)], batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TuneError::config("batch_size must be at least 1"));
        }
        Ok(Self {
            items,
            batch_size,
            order: SampleOrder::Sequential,
            seed: 0,
            sample_weights: Vec::new(),
        })
    }

    pub fn shuffled(mut self, seed: u64) -> Self {
        self.order = SampleOrder::Shuffled;
        self.seed = seed;
        self
    }

    /// Draw samples with probability proportional to `1 / count(class)`.
    pub fn weighted(mut self, counts: &ClassFrequencyTable, seed: u64) -> Self {
        self.order = SampleOrder::Weighted;
        self.seed = seed;
        self.sample_weights = self
            .items
            .iter()
            .map(|(_, y)| 1.0 / counts.count(*y).max(1) as f64)
            .collect();
        self
    }

    pub fn with_order(self, order: SampleOrder, counts: &ClassFrequencyTable, seed: u64) -> Self {
        match order {
            SampleOrder::Sequential => self,
            SampleOrder::Shuffled => self.shuffled(seed),
            SampleOrder::Weighted => self.weighted(counts, seed),
        }
    }

    pub fn order(&self) -> SampleOrder {
        self.order
    }

    pub fn num_batches(&self) -> usize {
        self.items.len().div_ceil(self.batch_size)
    }

    fn epoch_rng(&self, epoch: usize) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch as u64))
    }

    fn epoch_indices(&self, epoch: usize) -> Result<Vec<usize>> {
        let n = self.items.len();
        match self.order {
            SampleOrder::Sequential => Ok((0..n).collect()),
            SampleOrder::Shuffled => {
                let mut indices: Vec<usize> = (0..n).collect();
                indices.shuffle(&mut self.epoch_rng(epoch));
                Ok(indices)
            }
            SampleOrder::Weighted => {
                if n == 0 {
                    return Ok(Vec::new());
                }
                let dist = WeightedIndex::new(&self.sample_weights)
                    .map_err(|e| TuneError::dataset(format!("weighted sampler: {e}")))?;
                let mut rng = self.epoch_rng(epoch);
                Ok((0..n).map(|_| dist.sample(&mut rng)).collect())
            }
        }
    }
}

impl<I: Clone> BatchSource<I> for InMemoryLoader<'_, I> {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn labels(&self) -> Vec<usize> {
        self.items.iter().map(|(_, y)| *y).collect()
    }

    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch<I>>> + '_> {
        let indices = match self.epoch_indices(epoch) {
            Ok(indices) => indices,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let chunks: Vec<Vec<usize>> = indices
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        Box::new(chunks.into_iter().map(move |chunk| {
            let mut inputs = Vec::with_capacity(chunk.len());
            let mut labels = Vec::with_capacity(chunk.len());
            for i in chunk {
                let (x, y) = &self.items[i];
                inputs.push(x.clone());
                labels.push(*y);
            }
            Ok(Batch { inputs, labels })
        }))
    }
}
