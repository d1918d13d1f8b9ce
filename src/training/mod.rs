//! Training orchestration: the pretraining and adversarial loops, the
//! observer policy that drives checkpoints, rate decay and early stopping,
//! and the [`Trainer`](trainer::Trainer) facade that wires them to config.

pub mod adversarial;
pub mod metrics;
pub mod policy;
pub mod pretrain;
mod state;
pub mod tensorboard;
pub mod trainer;
pub mod visualize;

#[cfg(test)]
pub(crate) mod testing;

use tracing::info;

pub use adversarial::{AdversarialLoop, AdversarialSettings, GanModels, Phase};
pub use policy::TrainingPolicy;
pub use tensorboard::TensorBoardObserver;
pub use pretrain::{PretrainLoop, PretrainSettings};
pub use state::{StopReason, TrainingState, TrainingSummary};
pub use trainer::Trainer;

use crate::data::{Batch, BatchSource, PatchSource, SequentialBatches};
use crate::error::{Stage, TrainingError};
use crate::model::{Metrics, TrainableModel};
use metrics::{timed, TimingMetrics};

/// Pull one batch, charging the wait to `timing`.
pub(crate) fn draw_batch(
    batches: &mut dyn BatchSource,
    stage: Stage,
    timing: &mut TimingMetrics,
) -> Result<Batch, TrainingError> {
    let (batch, waited) = timed(|| batches.next_batch());
    timing.record_wait(waited);
    batch.map_err(|e| TrainingError::queue(stage, e))
}

/// Set a model's starting learning rate from configuration.
pub(crate) fn apply_configured_rate(model: &mut dyn TrainableModel, lr: f64) {
    let old = model.learning_rate();
    if old != lr {
        info!("{}: configured learning rate {old:.3e} -> {lr:.3e}", model.name());
    }
    model.set_learning_rate(lr);
}

/// Scale a model's learning rate, never below `min_lr`. Returns the new rate.
pub(crate) fn apply_decay(model: &mut dyn TrainableModel, factor: f64, min_lr: f64) -> f64 {
    let old = model.learning_rate();
    let new = policy::decayed_rate(old, factor, min_lr);
    if new != old {
        model.set_learning_rate(new);
        info!("{}: learning rate {old:.3e} -> {new:.3e}", model.name());
    }
    new
}

/// Evaluate the generator on a validation split in fixed order.
///
/// `steps = None` covers one full pass over the split.
pub(crate) fn validate(
    generator: &mut dyn TrainableModel,
    source: &PatchSource,
    batch_size: usize,
    steps: Option<usize>,
) -> Result<Metrics, TrainingError> {
    let mut batches = SequentialBatches::new(source, batch_size);
    let steps = steps.unwrap_or_else(|| batches.batches_per_pass()).max(1);
    generator.evaluate(&mut batches, steps)
}
