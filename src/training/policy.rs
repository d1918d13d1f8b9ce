//! Cross-cutting rules consulted at the end of every epoch or iteration.
//!
//! Each observer looks at the [`TrainingState`] and answers with one
//! [`PolicyAction`]. The loop applies that action before asking the next
//! observer, so a checkpoint written by one rule is visible to the rules
//! after it.

use crate::config::{AdversarialConfig, PretrainConfig};

use super::state::TrainingState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Monitored metric improved.
    Best,
    /// Fixed cadence, regardless of metrics.
    Periodic,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PolicyAction {
    Continue,
    Checkpoint(CheckpointKind),
    /// Multiply every learning rate the loop owns by `factor`, not going
    /// below `min_lr`; rates already at or below the floor are left alone.
    DecayLearningRate { factor: f64, min_lr: f64 },
    Snapshot,
    Stop { restore_best: bool },
}

/// Whether the loop keeps going after an action was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub trait TrainingObserver {
    fn name(&self) -> &'static str;

    fn on_iteration_end(&mut self, state: &TrainingState) -> PolicyAction;
}

/// The rate a [`PolicyAction::DecayLearningRate`] moves `lr` to.
pub fn decayed_rate(lr: f64, factor: f64, min_lr: f64) -> f64 {
    if lr <= min_lr {
        lr
    } else {
        (lr * factor).max(min_lr)
    }
}

/// Rate in effect for `epoch` under a step schedule, given the rate before it.
pub fn step_decay(epoch: usize, lr: f64, decay_step: usize, factor: f64) -> f64 {
    if epoch > 0 && decay_step > 0 && epoch % decay_step == 0 {
        lr * factor
    } else {
        lr
    }
}

/// Stop after `patience` evaluations without improvement and ask for the best
/// weights back.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f32,
    best: f32,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        EarlyStopping {
            patience,
            min_delta: 0.0,
            best: f32::INFINITY,
            wait: 0,
        }
    }

    pub fn with_min_delta(mut self, min_delta: f32) -> Self {
        self.min_delta = min_delta;
        self
    }

    pub fn best(&self) -> f32 {
        self.best
    }
}

impl TrainingObserver for EarlyStopping {
    fn name(&self) -> &'static str {
        "early_stopping"
    }

    fn on_iteration_end(&mut self, state: &TrainingState) -> PolicyAction {
        let Some(loss) = state.monitored_loss() else {
            return PolicyAction::Continue;
        };
        if loss - self.min_delta < self.best {
            self.best = loss;
            self.wait = 0;
            return PolicyAction::Continue;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            PolicyAction::Stop { restore_best: true }
        } else {
            PolicyAction::Continue
        }
    }
}

/// Reduce the learning rate when the monitored loss stalls.
#[derive(Debug, Clone)]
pub struct PlateauDecay {
    patience: usize,
    factor: f64,
    min_lr: f64,
    min_delta: f32,
    best: f32,
    wait: usize,
}

impl PlateauDecay {
    pub fn new(patience: usize, factor: f64, min_lr: f64) -> Self {
        PlateauDecay {
            patience,
            factor,
            min_lr,
            min_delta: 1e-4,
            best: f32::INFINITY,
            wait: 0,
        }
    }
}

impl TrainingObserver for PlateauDecay {
    fn name(&self) -> &'static str {
        "plateau_decay"
    }

    fn on_iteration_end(&mut self, state: &TrainingState) -> PolicyAction {
        let Some(loss) = state.monitored_loss() else {
            return PolicyAction::Continue;
        };
        if loss < self.best - self.min_delta {
            self.best = loss;
            self.wait = 0;
            return PolicyAction::Continue;
        }
        self.wait += 1;
        // at the floor the counter keeps running, so a later improvement resets it
        if self.wait >= self.patience && state.generator_lr > self.min_lr {
            self.wait = 0;
            return PolicyAction::DecayLearningRate {
                factor: self.factor,
                min_lr: self.min_lr,
            };
        }
        PolicyAction::Continue
    }
}

/// Scale the learning rate every `decay_step` epochs.
///
/// Runs at the end of epoch `e` and schedules the rate for epoch `e + 1`.
#[derive(Debug, Clone)]
pub struct StepDecay {
    decay_step: usize,
    factor: f64,
}

impl StepDecay {
    pub fn new(decay_step: usize, factor: f64) -> Self {
        StepDecay { decay_step, factor }
    }
}

impl TrainingObserver for StepDecay {
    fn name(&self) -> &'static str {
        "step_decay"
    }

    fn on_iteration_end(&mut self, state: &TrainingState) -> PolicyAction {
        let next = state.epoch + 1;
        if step_decay(next, 1.0, self.decay_step, self.factor) != 1.0 {
            PolicyAction::DecayLearningRate {
                factor: self.factor,
                min_lr: 0.0,
            }
        } else {
            PolicyAction::Continue
        }
    }
}

/// Checkpoint whenever the monitored loss reaches a new minimum.
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    best: f32,
}

impl BestCheckpoint {
    pub fn new() -> Self {
        BestCheckpoint {
            best: f32::INFINITY,
        }
    }
}

impl Default for BestCheckpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingObserver for BestCheckpoint {
    fn name(&self) -> &'static str {
        "best_checkpoint"
    }

    fn on_iteration_end(&mut self, state: &TrainingState) -> PolicyAction {
        match state.monitored_loss() {
            Some(loss) if loss < self.best => {
                self.best = loss;
                PolicyAction::Checkpoint(CheckpointKind::Best)
            }
            _ => PolicyAction::Continue,
        }
    }
}

/// Checkpoint whenever `epoch % frequency == 0`.
#[derive(Debug, Clone)]
pub struct PeriodicCheckpoint {
    frequency: usize,
}

impl PeriodicCheckpoint {
    pub fn new(frequency: usize) -> Self {
        PeriodicCheckpoint {
            frequency: frequency.max(1),
        }
    }
}

impl TrainingObserver for PeriodicCheckpoint {
    fn name(&self) -> &'static str {
        "periodic_checkpoint"
    }

    fn on_iteration_end(&mut self, state: &TrainingState) -> PolicyAction {
        if state.epoch % self.frequency == 0 {
            PolicyAction::Checkpoint(CheckpointKind::Periodic)
        } else {
            PolicyAction::Continue
        }
    }
}

/// Request a visualization snapshot on a fixed cadence.
#[derive(Debug, Clone)]
pub struct SnapshotCadence {
    frequency: usize,
    offset: usize,
}

impl SnapshotCadence {
    /// Due when `epoch % frequency == 0`.
    pub fn every(frequency: usize) -> Self {
        SnapshotCadence {
            frequency: frequency.max(1),
            offset: 0,
        }
    }

    /// Due when `(epoch + 1) % frequency == 0`, i.e. after every
    /// `frequency` completed epochs.
    pub fn after_completed(frequency: usize) -> Self {
        SnapshotCadence {
            frequency: frequency.max(1),
            offset: 1,
        }
    }
}

impl TrainingObserver for SnapshotCadence {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn on_iteration_end(&mut self, state: &TrainingState) -> PolicyAction {
        if (state.epoch + self.offset) % self.frequency == 0 {
            PolicyAction::Snapshot
        } else {
            PolicyAction::Continue
        }
    }
}

/// Ordered list of observers.
#[derive(Default)]
pub struct TrainingPolicy {
    observers: Vec<Box<dyn TrainingObserver>>,
}

impl TrainingPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: impl TrainingObserver + 'static) -> Self {
        self.push(Box::new(observer));
        self
    }

    pub fn push(&mut self, observer: Box<dyn TrainingObserver>) {
        self.observers.push(observer);
    }

    /// Consult `observer` before every other rule.
    pub fn push_front(&mut self, observer: Box<dyn TrainingObserver>) {
        self.observers.insert(0, observer);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.observers.iter().map(|o| o.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Pretraining rules: best checkpoint, plateau decay, step decay, early
    /// stop, then the test snapshot after every `print_frequency` epochs.
    pub fn pretrain(config: &PretrainConfig, snapshots: bool) -> Self {
        let policy = TrainingPolicy::new()
            .with(BestCheckpoint::new())
            .with(PlateauDecay::new(
                config.plateau_patience,
                config.plateau_factor,
                config.min_lr,
            ))
            .with(StepDecay::new(config.lr_decay_step, config.lr_decay_factor))
            .with(EarlyStopping::new(config.early_stop_patience));
        if snapshots {
            policy.with(SnapshotCadence::after_completed(config.print_frequency))
        } else {
            policy
        }
    }

    /// Adversarial rules: optional step decay, test snapshots, periodic and
    /// optional best-of checkpoints.
    pub fn adversarial(config: &AdversarialConfig, snapshots: bool) -> Self {
        let mut policy = TrainingPolicy::new();
        if let Some(step) = config.lr_decay_step {
            policy = policy.with(StepDecay::new(step, config.lr_decay_factor));
        }
        if snapshots {
            policy = policy.with(SnapshotCadence::every(config.log_test_frequency));
        }
        if let Some(frequency) = config.log_weight_frequency {
            policy = policy.with(PeriodicCheckpoint::new(frequency));
        }
        if config.keep_best {
            policy = policy.with(BestCheckpoint::new());
        }
        policy
    }

    /// Run every observer in order, handing each action to `apply` before the
    /// next observer is consulted. Stops early when `apply` returns
    /// [`Flow::Stop`].
    pub fn dispatch<E>(
        &mut self,
        state: &mut TrainingState,
        mut apply: impl FnMut(PolicyAction, &mut TrainingState) -> Result<Flow, E>,
    ) -> Result<Flow, E> {
        for observer in self.observers.iter_mut() {
            let action = observer.on_iteration_end(state);
            if action == PolicyAction::Continue {
                continue;
            }
            tracing::debug!("{} -> {:?} at epoch {}", observer.name(), action, state.epoch);
            if apply(action, state)? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }
}
