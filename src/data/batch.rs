use ndarray::{ArrayD, Axis, IxDyn};

use super::source::{PatchSource, Sample};
use crate::error::QueueError;

/// Dense `f32` tensor in `N x H x W x C` layout.
pub type Tensor = ArrayD<f32>;

/// A stack of samples with their source indices, in order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub lr: Tensor,
    pub hr: Tensor,
    pub indices: Vec<usize>,
}

impl Batch {
    /// Stack samples along a new leading axis. Returns `None` when empty.
    ///
    /// All samples must come from the same source and so share one shape.
    pub fn from_samples(samples: &[Sample]) -> Option<Self> {
        let first = samples.first()?;
        let lr = stack(samples.iter().map(|s| &s.lr), first.lr.shape(), samples.len());
        let hr = stack(samples.iter().map(|s| &s.hr), first.hr.shape(), samples.len());
        Some(Batch {
            lr,
            hr,
            indices: samples.iter().map(|s| s.index).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

fn stack<'a>(
    items: impl Iterator<Item = &'a ndarray::Array3<f32>>,
    item_shape: &[usize],
    n: usize,
) -> Tensor {
    let mut shape = Vec::with_capacity(item_shape.len() + 1);
    shape.push(n);
    shape.extend_from_slice(item_shape);
    let mut out = ArrayD::zeros(IxDyn(&shape));
    for (i, item) in items.enumerate() {
        out.index_axis_mut(Axis(0), i).assign(&item.view().into_dyn());
    }
    out
}

/// Anything the training loops can pull batches from.
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<Batch, QueueError>;
}

/// Threadless, in-order batches over a source, cycling at the end of a pass.
///
/// Used for validation so every evaluation sees the same samples.
pub struct SequentialBatches<'a> {
    source: &'a PatchSource,
    batch_size: usize,
    cursor: usize,
}

impl<'a> SequentialBatches<'a> {
    pub fn new(source: &'a PatchSource, batch_size: usize) -> Self {
        SequentialBatches {
            source,
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }

    pub fn batches_per_pass(&self) -> usize {
        self.source.len().div_ceil(self.batch_size)
    }
}

impl BatchSource for SequentialBatches<'_> {
    fn next_batch(&mut self) -> Result<Batch, QueueError> {
        let len = self.source.len();
        if len == 0 {
            return Err(QueueError::Closed);
        }
        if self.cursor >= len {
            self.cursor = 0;
        }
        let end = (self.cursor + self.batch_size).min(len);
        let samples = (self.cursor..end)
            .map(|i| self.source.get(i))
            .collect::<Result<Vec<_>, _>>()?;
        self.cursor = end;
        Batch::from_samples(&samples).ok_or(QueueError::Closed)
    }
}
