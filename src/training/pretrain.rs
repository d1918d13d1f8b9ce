use tracing::{info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::AppConfig;
use crate::data::{BatchSource, PatchSource};
use crate::error::{Stage, TrainingError};
use crate::model::TrainableModel;

use super::metrics::{timed, TimingMetrics};
use super::policy::{Flow, PolicyAction, TrainingPolicy};
use super::state::{StopReason, TrainingState, TrainingSummary};
use super::visualize::Visualization;
use super::{apply_decay, draw_batch, validate};

#[derive(Debug, Clone)]
pub struct PretrainSettings {
    pub epochs: usize,
    pub steps_per_epoch: usize,
    /// Validation batches per epoch; `None` runs one full pass.
    pub steps_per_validation: Option<usize>,
    pub validation_batch_size: usize,
}

impl PretrainSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        PretrainSettings {
            epochs: config.pretrain.epochs,
            steps_per_epoch: config.pretrain.steps_per_epoch,
            steps_per_validation: config.pretrain.steps_per_validation,
            validation_batch_size: config.data.batch_size,
        }
    }
}

/// Supervised generator-only training.
///
/// Each epoch runs `steps_per_epoch` steps, validates when a validation split
/// is attached, then hands the state to the policy. An early stop restores the
/// best checkpoint before returning.
pub struct PretrainLoop<'a> {
    settings: PretrainSettings,
    policy: TrainingPolicy,
    checkpoints: &'a CheckpointManager,
    validation: Option<&'a PatchSource>,
    visualization: Option<Visualization<'a>>,
}

impl<'a> PretrainLoop<'a> {
    pub fn new(
        settings: PretrainSettings,
        policy: TrainingPolicy,
        checkpoints: &'a CheckpointManager,
    ) -> Self {
        PretrainLoop {
            settings,
            policy,
            checkpoints,
            validation: None,
            visualization: None,
        }
    }

    pub fn with_validation(mut self, source: &'a PatchSource) -> Self {
        self.validation = Some(source);
        self
    }

    pub fn with_visualization(mut self, visualization: Visualization<'a>) -> Self {
        self.visualization = Some(visualization);
        self
    }

    pub fn run(
        &mut self,
        generator: &mut dyn TrainableModel,
        batches: &mut dyn BatchSource,
    ) -> Result<TrainingSummary, TrainingError> {
        let PretrainLoop {
            settings,
            policy,
            checkpoints,
            validation,
            visualization,
        } = self;

        let mut state = TrainingState::new(generator.learning_rate(), None);
        let mut timing = TimingMetrics::new();
        let mut stop_reason = StopReason::Completed;
        let mut epochs_run = 0;
        info!(
            "pretraining {} for {} epoch(s) of {} step(s)",
            generator.name(),
            settings.epochs,
            settings.steps_per_epoch
        );

        for epoch in 0..settings.epochs {
            state.epoch = epoch;
            timing.reset_window();
            for _ in 0..settings.steps_per_epoch {
                let batch = draw_batch(batches, Stage::TrainStep, &mut timing)?;
                let (metrics, elapsed) =
                    timed(|| generator.train_on_batch(&batch.lr, &[&batch.hr], true));
                timing.record_step(elapsed);
                let metrics = metrics.map_err(|e| TrainingError::model(Stage::TrainStep, e))?;
                state.generator_history.push(metrics);
            }
            let (train, _) = state.close_window();
            epochs_run += 1;

            if let Some(source) = *validation {
                let (result, elapsed) = timed(|| {
                    validate(
                        generator,
                        source,
                        settings.validation_batch_size,
                        settings.steps_per_validation,
                    )
                });
                timing.record_overhead(elapsed);
                state.record_validation(result?);
            }

            info!(
                "Epoch {}/{} | Time: {:.1}s | loss: {} | val: {} | lr: {:.3e} | {:.1} steps/s, wait {:.1} ms",
                epoch + 1,
                settings.epochs,
                timing.window_elapsed().as_secs_f32(),
                train,
                state
                    .validation
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                state.generator_lr,
                timing.steps_per_sec(),
                timing.avg_wait_ms()
            );

            let flow = policy.dispatch(&mut state, |action, state| -> Result<Flow, TrainingError> {
                Ok(match action {
                    PolicyAction::Continue => Flow::Continue,
                    PolicyAction::Checkpoint(_) => {
                        match checkpoints.save_pretrain(&*generator, state) {
                            Ok(path) => info!("saved generator to {}", path.display()),
                            Err(e) => warn!("checkpoint at epoch {} failed: {e}", state.epoch),
                        }
                        Flow::Continue
                    }
                    PolicyAction::DecayLearningRate { factor, min_lr } => {
                        state.generator_lr = apply_decay(generator, factor, min_lr);
                        Flow::Continue
                    }
                    PolicyAction::Snapshot => {
                        if let Some(vis) = visualization.as_mut() {
                            // numbered by completed epochs
                            vis.snapshot(generator, state.epoch + 1)?;
                        }
                        Flow::Continue
                    }
                    PolicyAction::Stop { restore_best } => {
                        info!("early stopping at epoch {}", state.epoch + 1);
                        if restore_best {
                            match checkpoints.restore_pretrain(generator) {
                                Ok(_) => info!("restored best generator weights"),
                                Err(e) => warn!("could not restore best weights: {e}"),
                            }
                        }
                        Flow::Stop
                    }
                })
            })?;
            if flow == Flow::Stop {
                stop_reason = StopReason::EarlyStopped;
                break;
            }
        }

        info!(
            "pretraining finished after {} epoch(s) in {:.1}s",
            epochs_run,
            timing.elapsed().as_secs_f32()
        );
        Ok(TrainingSummary {
            epochs_run,
            stop_reason,
            best_validation_loss: state.best_validation_loss,
            state,
        })
    }
}
