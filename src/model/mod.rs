//! The contract between the training loops and externally-built models.
//!
//! The loops never look inside a model: they feed `N x H x W x C` tensors,
//! read back named metrics, and ask the model to persist itself. Architectures,
//! losses and optimizers live behind [`TrainableModel`].

pub mod burn_bridge;
mod metrics;

use std::path::Path;

pub use metrics::Metrics;

pub use crate::data::Tensor;
use crate::data::BatchSource;
use crate::error::{ModelError, Stage, TrainingError};

/// A compiled, trainable model.
///
/// `trainable` is the freeze flag of a single step: the adversarial loop
/// trains the discriminator with `true` and then steps the combined
/// generator graph with `false`, which must leave the discriminator's
/// weights untouched.
pub trait TrainableModel {
    fn name(&self) -> &str;

    /// Output shape of one sample, without the batch axis.
    fn output_shape(&self) -> Vec<usize>;

    fn train_on_batch(
        &mut self,
        inputs: &Tensor,
        targets: &[&Tensor],
        trainable: bool,
    ) -> Result<Metrics, ModelError>;

    fn test_on_batch(&mut self, inputs: &Tensor, targets: &[&Tensor]) -> Result<Metrics, ModelError>;

    fn predict(&mut self, inputs: &Tensor) -> Result<Tensor, ModelError>;

    /// Mean test metrics over `steps` batches, with LR inputs and HR targets.
    fn evaluate(
        &mut self,
        source: &mut dyn BatchSource,
        steps: usize,
    ) -> Result<Metrics, TrainingError> {
        let mut history = Vec::with_capacity(steps);
        for _ in 0..steps {
            let batch = source
                .next_batch()
                .map_err(|e| TrainingError::queue(Stage::Validation, e))?;
            let metrics = self
                .test_on_batch(&batch.lr, &[&batch.hr])
                .map_err(|e| TrainingError::model(Stage::Validation, e))?;
            history.push(metrics);
        }
        Ok(Metrics::mean(&history))
    }

    fn save_weights(&self, path: &Path) -> Result<(), ModelError>;

    fn load_weights(&mut self, path: &Path) -> Result<(), ModelError>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}
