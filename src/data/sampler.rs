use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Hands out batches of sample indices, pass after pass.
///
/// A batch never spans two passes: the last batch of a pass may be shorter
/// than `batch_size`. With `shuffle` every pass uses a fresh permutation drawn
/// from a seeded RNG, so a sampler rebuilt with the same seed replays the
/// same order.
#[derive(Debug)]
pub struct IndexSampler {
    len: usize,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
    pass: usize,
    issued: usize,
}

impl IndexSampler {
    pub fn new(len: usize, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        let mut sampler = IndexSampler {
            len,
            batch_size: batch_size.max(1),
            shuffle,
            seed,
            rng: StdRng::seed_from_u64(seed),
            order: (0..len).collect(),
            cursor: 0,
            pass: 0,
            issued: 0,
        };
        sampler.begin_pass();
        sampler
    }

    fn begin_pass(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    /// Next batch of indices, or `None` for an empty dataset.
    pub fn next_batch(&mut self) -> Option<Vec<usize>> {
        if self.len == 0 {
            return None;
        }
        if self.cursor >= self.len {
            self.pass += 1;
            self.begin_pass();
        }
        let end = (self.cursor + self.batch_size).min(self.len);
        let batch = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        self.issued += 1;
        Some(batch)
    }

    /// Rewind to the first pass of the original seed.
    pub fn reset(&mut self) {
        *self = IndexSampler::new(self.len, self.batch_size, self.shuffle, self.seed);
    }

    pub fn batches_per_pass(&self) -> usize {
        self.len.div_ceil(self.batch_size)
    }

    /// Zero-based number of the pass the last batch came from.
    pub fn pass(&self) -> usize {
        self.pass
    }

    /// Total batches handed out so far.
    pub fn batches_issued(&self) -> usize {
        self.issued
    }
}

impl Iterator for IndexSampler {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}
