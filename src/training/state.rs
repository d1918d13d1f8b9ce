use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointMetrics;
use crate::model::Metrics;

/// Mutable progress shared by a loop and its observers.
///
/// Histories hold per-step metrics since the last logging window and are not
/// persisted; everything else is written into checkpoint metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingState {
    pub epoch: usize,
    #[serde(skip)]
    pub generator_history: Vec<Metrics>,
    #[serde(skip)]
    pub discriminator_history: Vec<Metrics>,
    /// Window means from the most recent log.
    pub last_generator: Option<Metrics>,
    pub last_discriminator: Option<Metrics>,
    pub validation: Option<Metrics>,
    pub best_validation_loss: Option<f32>,
    pub generator_lr: f64,
    pub discriminator_lr: Option<f64>,
}

impl TrainingState {
    pub fn new(generator_lr: f64, discriminator_lr: Option<f64>) -> Self {
        TrainingState {
            generator_lr,
            discriminator_lr,
            ..Default::default()
        }
    }

    /// The quantity observers monitor: validation loss when a validation
    /// split exists, otherwise the latest windowed generator loss.
    pub fn monitored_loss(&self) -> Option<f32> {
        self.validation
            .as_ref()
            .or(self.last_generator.as_ref())
            .and_then(Metrics::loss)
    }

    /// Store a validation result; returns whether it is a new best.
    pub fn record_validation(&mut self, metrics: Metrics) -> bool {
        let loss = metrics.loss();
        self.validation = Some(metrics);
        match (loss, self.best_validation_loss) {
            (Some(loss), Some(best)) if loss >= best => false,
            (Some(loss), _) => {
                self.best_validation_loss = Some(loss);
                true
            }
            (None, _) => false,
        }
    }

    /// Average and clear the per-step histories.
    pub fn close_window(&mut self) -> (Metrics, Metrics) {
        let generator = Metrics::mean(&self.generator_history);
        let discriminator = Metrics::mean(&self.discriminator_history);
        self.generator_history.clear();
        self.discriminator_history.clear();
        self.last_generator = Some(generator.clone());
        self.last_discriminator = (!discriminator.is_empty()).then(|| discriminator.clone());
        (generator, discriminator)
    }

    pub fn checkpoint_metrics(&self) -> CheckpointMetrics {
        CheckpointMetrics {
            generator_loss: self.last_generator.as_ref().and_then(Metrics::loss),
            discriminator_loss: self.last_discriminator.as_ref().and_then(Metrics::loss),
            validation_loss: self.validation.as_ref().and_then(Metrics::loss),
            best_validation_loss: self.best_validation_loss,
        }
    }
}

/// Why a loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    EarlyStopped,
}

/// Outcome of a finished training run.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub epochs_run: usize,
    pub stop_reason: StopReason,
    pub best_validation_loss: Option<f32>,
    pub state: TrainingState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_validation_tracks_best() {
        let mut state = TrainingState::new(1e-4, None);
        assert!(state.record_validation(Metrics::from_loss(0.5)));
        assert!(!state.record_validation(Metrics::from_loss(0.7)));
        assert!(state.record_validation(Metrics::from_loss(0.3)));
        assert_eq!(state.best_validation_loss, Some(0.3));
        assert_eq!(state.monitored_loss(), Some(0.3));
    }

    #[test]
    fn test_close_window_averages_and_clears() {
        let mut state = TrainingState::new(1e-4, Some(1e-4));
        state.generator_history.push(Metrics::from_loss(1.0));
        state.generator_history.push(Metrics::from_loss(2.0));
        state.discriminator_history.push(Metrics::from_loss(0.5));
        let (g, d) = state.close_window();
        assert_eq!(g.loss(), Some(1.5));
        assert_eq!(d.loss(), Some(0.5));
        assert!(state.generator_history.is_empty());
        assert_eq!(state.checkpoint_metrics().generator_loss, Some(1.5));
    }

    #[test]
    fn test_monitored_loss_prefers_validation() {
        let mut state = TrainingState::new(1e-4, None);
        assert_eq!(state.monitored_loss(), None);
        state.generator_history.push(Metrics::from_loss(2.0));
        state.close_window();
        assert_eq!(state.monitored_loss(), Some(2.0));
        state.record_validation(Metrics::from_loss(0.4));
        assert_eq!(state.monitored_loss(), Some(0.4));
    }

    #[test]
    fn test_histories_are_not_serialized() {
        let mut state = TrainingState::new(1e-4, None);
        state.epoch = 12;
        state.generator_history.push(Metrics::from_loss(1.0));
        let json = serde_json::to_string(&state).unwrap();
        let back: TrainingState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.epoch, 12);
        assert!(back.generator_history.is_empty());
    }
}
