//! Scripted models for exercising the loops without a real network.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};

use crate::data::{Batch, BatchSource, Tensor};
use crate::error::{ModelError, QueueError};
use crate::model::{Metrics, TrainableModel};

#[derive(Debug, Clone, PartialEq)]
pub struct TrainCall {
    pub input_shape: Vec<usize>,
    pub target_shapes: Vec<Vec<usize>>,
    /// First value of the last target, enough to tell ones from zeros.
    pub last_target_head: Option<f32>,
    pub trainable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockKind {
    /// Upsamples spatial axes by the factor.
    Generator(usize),
    Discriminator,
    Combined,
}

pub struct MockModel {
    pub name: String,
    pub kind: MockKind,
    pub output: Vec<usize>,
    pub lr: f64,
    /// Bumped by every trainable step, persisted by `save_weights`.
    pub version: usize,
    pub train_loss: f32,
    pub train_calls: Vec<TrainCall>,
    pub predict_calls: usize,
    /// Losses returned by successive `test_on_batch` calls; the last repeats.
    pub validation_losses: VecDeque<f32>,
    pub fail_train_at: Option<usize>,
    pub fail_save: bool,
    pub predict_shape_override: Option<Vec<usize>>,
    pub saved: RefCell<Vec<PathBuf>>,
    pub loaded: Vec<PathBuf>,
    last_validation: f32,
}

impl MockModel {
    fn build(name: &str, kind: MockKind, output: Vec<usize>) -> Self {
        MockModel {
            name: name.to_string(),
            kind,
            output,
            lr: 1e-4,
            version: 0,
            train_loss: 1.0,
            train_calls: Vec::new(),
            predict_calls: 0,
            validation_losses: VecDeque::new(),
            fail_train_at: None,
            fail_save: false,
            predict_shape_override: None,
            saved: RefCell::new(Vec::new()),
            loaded: Vec::new(),
            last_validation: 1.0,
        }
    }

    pub fn generator(factor: usize) -> Self {
        Self::build("generator", MockKind::Generator(factor), Vec::new())
    }

    pub fn discriminator(output: &[usize]) -> Self {
        Self::build("discriminator", MockKind::Discriminator, output.to_vec())
    }

    pub fn combined() -> Self {
        Self::build("combined", MockKind::Combined, Vec::new())
    }

    pub fn with_validation_losses(mut self, losses: &[f32]) -> Self {
        self.validation_losses = losses.iter().copied().collect();
        self
    }
}

impl TrainableModel for MockModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self) -> Vec<usize> {
        self.output.clone()
    }

    fn train_on_batch(
        &mut self,
        inputs: &Tensor,
        targets: &[&Tensor],
        trainable: bool,
    ) -> Result<Metrics, ModelError> {
        if self.fail_train_at == Some(self.train_calls.len()) {
            return Err("scripted training failure".into());
        }
        self.train_calls.push(TrainCall {
            input_shape: inputs.shape().to_vec(),
            target_shapes: targets.iter().map(|t| t.shape().to_vec()).collect(),
            last_target_head: targets.last().and_then(|t| t.iter().next().copied()),
            trainable,
        });
        if trainable {
            self.version += 1;
        }
        Ok(Metrics::from_loss(self.train_loss))
    }

    fn test_on_batch(&mut self, _inputs: &Tensor, _targets: &[&Tensor]) -> Result<Metrics, ModelError> {
        if let Some(loss) = self.validation_losses.pop_front() {
            self.last_validation = loss;
        }
        Ok(Metrics::from_loss(self.last_validation))
    }

    fn predict(&mut self, inputs: &Tensor) -> Result<Tensor, ModelError> {
        self.predict_calls += 1;
        let shape = match (&self.predict_shape_override, self.kind) {
            (Some(shape), _) => shape.clone(),
            (None, MockKind::Generator(f)) => {
                let s = inputs.shape();
                vec![s[0], s[1] * f, s[2] * f, s[3]]
            }
            (None, _) => {
                let mut shape = vec![inputs.shape()[0]];
                shape.extend_from_slice(&self.output);
                shape
            }
        };
        Ok(ArrayD::zeros(IxDyn(&shape)))
    }

    fn save_weights(&self, path: &Path) -> Result<(), ModelError> {
        if self.fail_save {
            return Err("disk full".into());
        }
        std::fs::write(path, self.version.to_string())?;
        self.saved.borrow_mut().push(path.to_path_buf());
        Ok(())
    }

    fn load_weights(&mut self, path: &Path) -> Result<(), ModelError> {
        self.version = std::fs::read_to_string(path)?.trim().parse()?;
        self.loaded.push(path.to_path_buf());
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Batch source with scripted sizes and unique, increasing indices.
pub struct ScriptedBatches {
    batch_size: usize,
    sizes: VecDeque<usize>,
    lr_shape: [usize; 3],
    factor: usize,
    next_index: usize,
    pub served: Vec<Vec<usize>>,
}

impl ScriptedBatches {
    pub fn new(batch_size: usize, lr_shape: [usize; 3], factor: usize) -> Self {
        ScriptedBatches {
            batch_size,
            sizes: VecDeque::new(),
            lr_shape,
            factor,
            next_index: 0,
            served: Vec::new(),
        }
    }

    /// Sizes of the first batches; later ones fall back to `batch_size`.
    pub fn with_sizes(mut self, sizes: &[usize]) -> Self {
        self.sizes = sizes.iter().copied().collect();
        self
    }
}

impl BatchSource for ScriptedBatches {
    fn next_batch(&mut self) -> Result<Batch, QueueError> {
        let n = self.sizes.pop_front().unwrap_or(self.batch_size);
        let [h, w, c] = self.lr_shape;
        let indices: Vec<usize> = (self.next_index..self.next_index + n).collect();
        self.next_index += n;
        self.served.push(indices.clone());
        Ok(Batch {
            lr: ArrayD::from_elem(IxDyn(&[n, h, w, c]), 0.5),
            hr: ArrayD::from_elem(IxDyn(&[n, h * self.factor, w * self.factor, c]), 0.25),
            indices,
        })
    }
}
