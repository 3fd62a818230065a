//! Data pipeline capability and an in-memory batching loader.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::error::Result;

/// A re-iterable source of pre-collated batches.
///
/// `batches` is called once per epoch (training) or once per evaluation
/// pass. Each call blocks per item until the next batch is ready.
pub trait DataLoader {
    type Batch;

    /// Number of batches one pass yields.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn batches(&mut self) -> impl Iterator<Item = Result<Self::Batch>> + '_;

    /// Re-seed any ordering randomness. Loaders without shuffling ignore it.
    fn reseed(&mut self, _seed: u64) {}
}

/// Groups a vector of examples into fixed-size batches.
///
/// Each batch is a `Vec` of cloned examples; collation into tensors is left
/// to the model. With shuffling enabled the order changes on every pass but is
/// fully determined by the seed.
#[derive(Debug, Clone)]
pub struct InMemoryLoader<T> {
    examples: Vec<T>,
    batch_size: usize,
    drop_last: bool,
    shuffle: Option<StdRng>,
}

impl<T: Clone> InMemoryLoader<T> {
    /// Sequential batches of `batch_size` (clamped to at least 1), keeping a
    /// trailing partial batch.
    pub fn new(examples: Vec<T>, batch_size: usize) -> Self {
        Self {
            examples,
            batch_size: batch_size.max(1),
            drop_last: false,
            shuffle: None,
        }
    }

    /// Discard a trailing partial batch.
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Shuffle example order on every pass, seeded with `seed`.
    pub fn shuffle(mut self, seed: u64) -> Self {
        self.shuffle = Some(StdRng::seed_from_u64(seed));
        self
    }

    pub fn num_examples(&self) -> usize {
        self.examples.len()
    }

    fn order(&mut self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        if let Some(rng) = self.shuffle.as_mut() {
            order.shuffle(rng);
        }
        order
    }
}

impl<T: Clone> DataLoader for InMemoryLoader<T> {
    type Batch = Vec<T>;

    fn len(&self) -> usize {
        let full = self.examples.len() / self.batch_size;
        let partial = self.examples.len() % self.batch_size != 0;
        if partial && !self.drop_last {
            full + 1
        } else {
            full
        }
    }

    fn batches(&mut self) -> impl Iterator<Item = Result<Self::Batch>> + '_ {
        let order = self.order();
        let mut chunks: Vec<Vec<usize>> = order
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        chunks.truncate(self.len());
        let examples = &self.examples;
        chunks
            .into_iter()
            .map(move |idx| Ok(idx.into_iter().map(|i| examples[i].clone()).collect()))
    }

    fn reseed(&mut self, seed: u64) {
        if self.shuffle.is_some() {
            self.shuffle = Some(StdRng::seed_from_u64(seed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn collect<T: Clone>(loader: &mut InMemoryLoader<T>) -> Vec<Vec<T>> {
        loader.batches().map(|b| b.unwrap()).collect()
    }

    #[test]
    fn test_sequential_batches_keep_tail() {
        let mut loader = InMemoryLoader::new(vec![1, 2, 3, 4, 5], 2);
        assert_eq!(loader.len(), 3);
        assert_eq!(collect(&mut loader), vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn test_drop_last() {
        let mut loader = InMemoryLoader::new(vec![1, 2, 3, 4, 5], 2).drop_last(true);
        assert_eq!(loader.len(), 2);
        assert_eq!(collect(&mut loader), vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn test_four_examples_batch_size_two() {
        let mut loader = InMemoryLoader::new(vec!["a", "b", "c", "d"], 2).drop_last(true);
        assert_eq!(loader.len(), 2);
        assert_eq!(collect(&mut loader).len(), 2);
    }

    #[test]
    fn test_shuffle_is_deterministic_per_seed() {
        let items: Vec<u32> = (0..32).collect();
        let mut a = InMemoryLoader::new(items.clone(), 4).shuffle(7);
        let mut b = InMemoryLoader::new(items.clone(), 4).shuffle(7);
        let first_a = collect(&mut a);
        assert_eq!(first_a, collect(&mut b));

        let mut flat: Vec<u32> = first_a.concat();
        flat.sort_unstable();
        assert_eq!(flat, items);

        // A second pass draws a new permutation from the same stream.
        assert_eq!(collect(&mut a), collect(&mut b));
    }

    #[test]
    fn test_reseed_restarts_stream() {
        let items: Vec<u32> = (0..16).collect();
        let mut a = InMemoryLoader::new(items.clone(), 4).shuffle(1);
        let mut b = InMemoryLoader::new(items, 4).shuffle(99);
        b.reseed(1);
        assert_eq!(collect(&mut a), collect(&mut b));
    }

    #[test]
    fn test_empty_loader() {
        let mut loader = InMemoryLoader::new(Vec::<u8>::new(), 3);
        assert!(loader.is_empty());
        assert!(collect(&mut loader).is_empty());
    }
}
