use std::borrow::Cow;

use ndarray::{concatenate, ArrayD, Axis, IxDyn, Slice};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::AppConfig;
use crate::data::{BatchSource, PatchSource, Tensor};
use crate::error::{Stage, TrainingError};
use crate::model::{Metrics, TrainableModel};

use super::metrics::{timed, TimingMetrics};
use super::policy::{CheckpointKind, Flow, PolicyAction, TrainingPolicy};
use super::state::{StopReason, TrainingState, TrainingSummary};
use super::visualize::Visualization;
use super::{apply_decay, draw_batch, validate};

/// The three compiled models of an adversarial run.
///
/// `combined` is the generator stacked on a frozen discriminator, trained on
/// `[content, adversarial]` targets; it shares weights with `generator`.
pub struct GanModels<'m> {
    pub generator: &'m mut dyn TrainableModel,
    pub discriminator: &'m mut dyn TrainableModel,
    pub combined: &'m mut dyn TrainableModel,
}

#[derive(Debug, Clone)]
pub struct AdversarialSettings {
    pub epochs: usize,
    pub first_epoch: usize,
    pub batch_size: usize,
    pub print_frequency: usize,
    pub steps_per_validation: usize,
}

impl AdversarialSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        AdversarialSettings {
            epochs: config.adversarial.epochs,
            first_epoch: config.adversarial.first_epoch,
            batch_size: config.data.batch_size,
            print_frequency: config.adversarial.print_frequency,
            steps_per_validation: config.adversarial.steps_per_validation,
        }
    }
}

/// Where an adversarial iteration currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    DiscriminatorStep,
    GeneratorStep,
    Log,
    Validate,
    Policy,
    Terminated,
}

/// Real/fake label tensors, built once per run at full batch size.
pub struct DiscriminatorTargets {
    batch_size: usize,
    real: Tensor,
    fake: Tensor,
    stacked: Tensor,
}

impl DiscriminatorTargets {
    pub fn new(batch_size: usize, output_shape: &[usize]) -> Self {
        let shape = label_shape(batch_size, output_shape);
        let real = ArrayD::ones(IxDyn(&shape));
        let fake = ArrayD::zeros(IxDyn(&shape));
        let mut stacked_shape = shape;
        stacked_shape[0] *= 2;
        // ones over the first half, zeros over the second
        let stacked = ArrayD::from_shape_fn(IxDyn(&stacked_shape), |idx| {
            if idx[0] < batch_size {
                1.0
            } else {
                0.0
            }
        });
        DiscriminatorTargets {
            batch_size,
            real,
            fake,
            stacked,
        }
    }

    fn check(&self, b: usize, stage: Stage) -> Result<(), TrainingError> {
        if b == 0 || b > self.batch_size {
            return Err(TrainingError::shape_mismatch(
                stage,
                self.real.shape(),
                &label_shape(b, &self.real.shape()[1..]),
            ));
        }
        Ok(())
    }

    /// All-ones labels for a batch of `b`.
    pub fn real(&self, b: usize) -> Result<Cow<'_, Tensor>, TrainingError> {
        self.check(b, Stage::GeneratorStep)?;
        if b == self.batch_size {
            return Ok(Cow::Borrowed(&self.real));
        }
        Ok(Cow::Owned(
            self.real.slice_axis(Axis(0), Slice::from(0..b)).to_owned(),
        ))
    }

    /// `[real(b); fake(b)]`, matching a `[hr; generated]` input of `2b` rows.
    pub fn stacked(&self, b: usize) -> Result<Cow<'_, Tensor>, TrainingError> {
        self.check(b, Stage::DiscriminatorStep)?;
        if b == self.batch_size {
            return Ok(Cow::Borrowed(&self.stacked));
        }
        let real = self.real.slice_axis(Axis(0), Slice::from(0..b));
        let fake = self.fake.slice_axis(Axis(0), Slice::from(0..b));
        let stacked = concatenate(Axis(0), &[real.view(), fake.view()]).map_err(|_| {
            TrainingError::shape_mismatch(Stage::DiscriminatorStep, real.shape(), fake.shape())
        })?;
        Ok(Cow::Owned(stacked))
    }
}

fn label_shape(batch: usize, output_shape: &[usize]) -> Vec<usize> {
    let mut shape = Vec::with_capacity(output_shape.len() + 1);
    shape.push(batch);
    shape.extend_from_slice(output_shape);
    shape
}

/// Alternating discriminator/generator training.
///
/// Every iteration draws two independent batches: one for the discriminator
/// step and a fresh one for the generator step. Runs a fixed number of
/// iterations from `first_epoch`, with no convergence-based stop.
pub struct AdversarialLoop<'a> {
    settings: AdversarialSettings,
    policy: TrainingPolicy,
    checkpoints: &'a CheckpointManager,
    validation: Option<&'a PatchSource>,
    visualization: Option<Visualization<'a>>,
    phase: Phase,
}

impl<'a> AdversarialLoop<'a> {
    pub fn new(
        settings: AdversarialSettings,
        policy: TrainingPolicy,
        checkpoints: &'a CheckpointManager,
    ) -> Self {
        AdversarialLoop {
            settings,
            policy,
            checkpoints,
            validation: None,
            visualization: None,
            phase: Phase::Init,
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

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
    }

    fn discriminator_step(
        &mut self,
        models: &mut GanModels<'_>,
        batches: &mut dyn BatchSource,
        targets: &DiscriminatorTargets,
        timing: &mut TimingMetrics,
    ) -> Result<Metrics, TrainingError> {
        self.enter(Phase::DiscriminatorStep);
        let stage = Stage::DiscriminatorStep;
        let batch = draw_batch(batches, stage, timing)?;
        let labels = targets.stacked(batch.len())?;

        let (result, elapsed) = timed(|| {
            let generated = models
                .generator
                .predict(&batch.lr)
                .map_err(|e| TrainingError::model(stage, e))?;
            if generated.shape() != batch.hr.shape() {
                return Err(TrainingError::shape_mismatch(
                    stage,
                    batch.hr.shape(),
                    generated.shape(),
                ));
            }
            let inputs = concatenate(Axis(0), &[batch.hr.view(), generated.view()]).map_err(|_| {
                TrainingError::shape_mismatch(stage, batch.hr.shape(), generated.shape())
            })?;
            models
                .discriminator
                .train_on_batch(&inputs, &[labels.as_ref()], true)
                .map_err(|e| TrainingError::model(stage, e))
        });
        timing.record_step(elapsed);
        result
    }

    fn generator_step(
        &mut self,
        models: &mut GanModels<'_>,
        batches: &mut dyn BatchSource,
        targets: &DiscriminatorTargets,
        timing: &mut TimingMetrics,
    ) -> Result<Metrics, TrainingError> {
        self.enter(Phase::GeneratorStep);
        let stage = Stage::GeneratorStep;
        // a fresh batch, independent of the discriminator's
        let batch = draw_batch(batches, stage, timing)?;
        let real = targets.real(batch.len())?;

        let (result, elapsed) = timed(|| {
            models
                .combined
                .train_on_batch(&batch.lr, &[&batch.hr, real.as_ref()], false)
        });
        timing.record_step(elapsed);
        result.map_err(|e| TrainingError::model(stage, e))
    }

    fn apply_policy(
        &mut self,
        models: &mut GanModels<'_>,
        state: &mut TrainingState,
    ) -> Result<Flow, TrainingError> {
        self.enter(Phase::Policy);
        let AdversarialLoop {
            policy,
            checkpoints,
            visualization,
            ..
        } = self;

        policy.dispatch(state, |action, state| -> Result<Flow, TrainingError> {
            Ok(match action {
                PolicyAction::Continue => Flow::Continue,
                PolicyAction::Checkpoint(kind) => {
                    let best = kind == CheckpointKind::Best;
                    match checkpoints.save_adversarial(
                        &*models.generator,
                        &*models.discriminator,
                        state,
                        best,
                    ) {
                        Ok(path) => info!(
                            "saved weights at iteration {} ({})",
                            state.epoch,
                            path.display()
                        ),
                        Err(e) => warn!("checkpoint at iteration {} failed: {e}", state.epoch),
                    }
                    Flow::Continue
                }
                PolicyAction::DecayLearningRate { factor, min_lr } => {
                    state.generator_lr = apply_decay(&mut *models.combined, factor, min_lr);
                    state.discriminator_lr =
                        Some(apply_decay(&mut *models.discriminator, factor, min_lr));
                    Flow::Continue
                }
                PolicyAction::Snapshot => {
                    if let Some(vis) = visualization.as_mut() {
                        vis.snapshot(&mut *models.generator, state.epoch)?;
                    }
                    Flow::Continue
                }
                PolicyAction::Stop { restore_best } => {
                    if restore_best {
                        if let Err(e) = checkpoints.restore_adversarial(
                            &mut *models.generator,
                            &mut *models.discriminator,
                            true,
                        ) {
                            warn!("could not restore best weights: {e}");
                        }
                    }
                    Flow::Stop
                }
            })
        })
    }

    pub fn run(
        &mut self,
        mut models: GanModels<'_>,
        batches: &mut dyn BatchSource,
    ) -> Result<TrainingSummary, TrainingError> {
        self.enter(Phase::Init);
        let settings = self.settings.clone();
        let print_frequency = settings.print_frequency.max(1);
        let targets =
            DiscriminatorTargets::new(settings.batch_size, &models.discriminator.output_shape());
        let mut state = TrainingState::new(
            models.combined.learning_rate(),
            Some(models.discriminator.learning_rate()),
        );
        let mut timing = TimingMetrics::new();
        let mut stop_reason = StopReason::Completed;
        let mut epochs_run = 0;
        let last = settings.first_epoch + settings.epochs;
        info!(
            "adversarial training: iterations {}..{} with batch size {}",
            settings.first_epoch, last, settings.batch_size
        );

        for epoch in settings.first_epoch..last {
            state.epoch = epoch;
            let d = self.discriminator_step(&mut models, batches, &targets, &mut timing)?;
            state.discriminator_history.push(d);
            let g = self.generator_step(&mut models, batches, &targets, &mut timing)?;
            state.generator_history.push(g);
            epochs_run += 1;

            if epoch % print_frequency == 0 {
                self.enter(Phase::Log);
                let (g, d) = state.close_window();
                info!(
                    "Epoch {}/{} | Time: {:.1}s | generator: {} | discriminator: {}",
                    epoch,
                    last,
                    timing.window_elapsed().as_secs_f32(),
                    g,
                    d
                );
                debug!(
                    "{:.1} steps/s, batch wait {:.1} ms, step {:.1} ms",
                    timing.steps_per_sec(),
                    timing.avg_wait_ms(),
                    timing.avg_step_ms()
                );
                timing.reset_window();

                if let Some(source) = self.validation {
                    self.enter(Phase::Validate);
                    let (result, elapsed) = timed(|| {
                        validate(
                            &mut *models.generator,
                            source,
                            settings.batch_size,
                            Some(settings.steps_per_validation),
                        )
                    });
                    timing.record_overhead(elapsed);
                    let metrics = result?;
                    info!("validation: {metrics}");
                    state.record_validation(metrics);
                }
            }

            let (flow, elapsed) = timed(|| self.apply_policy(&mut models, &mut state));
            timing.record_overhead(elapsed);
            if flow? == Flow::Stop {
                stop_reason = StopReason::EarlyStopped;
                break;
            }
        }

        self.enter(Phase::Terminated);
        info!(
            "adversarial training finished after {} iteration(s) in {:.1}s",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointManagerConfig;
    use crate::data::testing::write_gradient_images;
    use crate::data::{Colorspace, CropMode, MediaType, PatchSourceConfig};
    use crate::training::policy::{BestCheckpoint, PeriodicCheckpoint, StepDecay};
    use crate::training::testing::{MockModel, ScriptedBatches};
    use std::path::Path;

    const DISC_OUT: [usize; 3] = [6, 6, 1];

    struct Fixture {
        generator: MockModel,
        discriminator: MockModel,
        combined: MockModel,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                generator: MockModel::generator(4),
                discriminator: MockModel::discriminator(&DISC_OUT),
                combined: MockModel::combined(),
            }
        }

        fn models(&mut self) -> GanModels<'_> {
            GanModels {
                generator: &mut self.generator,
                discriminator: &mut self.discriminator,
                combined: &mut self.combined,
            }
        }
    }

    fn manager(dir: &Path) -> CheckpointManager {
        CheckpointManager::new(CheckpointManagerConfig {
            weights_dir: dir.join("model"),
            model_name: "SRGAN".to_string(),
            upscaling_factor: 4,
        })
    }

    fn settings(epochs: usize) -> AdversarialSettings {
        AdversarialSettings {
            epochs,
            first_epoch: 0,
            batch_size: 4,
            print_frequency: 1,
            steps_per_validation: 1,
        }
    }

    fn batches() -> ScriptedBatches {
        ScriptedBatches::new(4, [6, 6, 3], 4)
    }

    #[test]
    fn test_label_shapes_and_freeze_flags() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = manager(dir.path());
        let mut fx = Fixture::new();
        let mut adversarial = AdversarialLoop::new(settings(1), TrainingPolicy::new(), &checkpoints);
        adversarial.run(fx.models(), &mut batches()).unwrap();

        let d = &fx.discriminator.train_calls[0];
        assert_eq!(d.input_shape, vec![8, 24, 24, 3]);
        assert_eq!(d.target_shapes, vec![vec![8, 6, 6, 1]]);
        assert_eq!(d.last_target_head, Some(1.0));
        assert!(d.trainable);

        let g = &fx.combined.train_calls[0];
        assert_eq!(g.input_shape, vec![4, 6, 6, 3]);
        assert_eq!(g.target_shapes, vec![vec![4, 24, 24, 3], vec![4, 6, 6, 1]]);
        assert_eq!(g.last_target_head, Some(1.0));
        assert!(!g.trainable);

        assert_eq!(fx.generator.predict_calls, 1);
        assert_eq!(adversarial.phase(), Phase::Terminated);
    }

    #[test]
    fn test_stacked_labels_are_real_then_fake() {
        let targets = DiscriminatorTargets::new(3, &[2]);
        let full = targets.stacked(3).unwrap();
        assert_eq!(full.shape(), &[6, 2]);
        assert_eq!(full.iter().copied().collect::<Vec<_>>(), vec![1., 1., 1., 1., 1., 1., 0., 0., 0., 0., 0., 0.]);

        let tail = targets.stacked(1).unwrap();
        assert_eq!(tail.iter().copied().collect::<Vec<_>>(), vec![1., 1., 0., 0.]);
        assert_eq!(targets.real(2).unwrap().shape(), &[2, 2]);
        assert!(targets.real(4).is_err());
        assert!(targets.stacked(0).is_err());
    }

    #[test]
    fn test_tail_batches_reslice_labels() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = manager(dir.path());
        let mut fx = Fixture::new();
        let mut source = batches().with_sizes(&[3, 2]);
        AdversarialLoop::new(settings(2), TrainingPolicy::new(), &checkpoints)
            .run(fx.models(), &mut source)
            .unwrap();

        assert_eq!(fx.discriminator.train_calls[0].input_shape[0], 6);
        assert_eq!(fx.discriminator.train_calls[0].target_shapes, vec![vec![6, 6, 6, 1]]);
        assert_eq!(fx.combined.train_calls[0].target_shapes[1], vec![2, 6, 6, 1]);
        // back to full batches afterwards
        assert_eq!(fx.discriminator.train_calls[1].target_shapes, vec![vec![8, 6, 6, 1]]);
    }

    #[test]
    fn test_oversized_batch_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = manager(dir.path());
        let mut fx = Fixture::new();
        let mut adversarial = AdversarialLoop::new(settings(3), TrainingPolicy::new(), &checkpoints);
        let err = adversarial
            .run(fx.models(), &mut batches().with_sizes(&[5]))
            .unwrap_err();
        assert!(matches!(
            err,
            TrainingError::ShapeMismatch { stage: Stage::DiscriminatorStep, .. }
        ));
        assert_eq!(adversarial.phase(), Phase::DiscriminatorStep);
        assert!(fx.discriminator.train_calls.is_empty());
    }

    #[test]
    fn test_generator_output_must_match_hr() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = manager(dir.path());
        let mut fx = Fixture::new();
        fx.generator.predict_shape_override = Some(vec![4, 12, 12, 3]);
        let err = AdversarialLoop::new(settings(1), TrainingPolicy::new(), &checkpoints)
            .run(fx.models(), &mut batches())
            .unwrap_err();
        match err {
            TrainingError::ShapeMismatch { stage, expected, got } => {
                assert_eq!(stage, Stage::DiscriminatorStep);
                assert_eq!(expected, vec![4, 24, 24, 3]);
                assert_eq!(got, vec![4, 12, 12, 3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_two_fresh_batches_per_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = manager(dir.path());
        let mut fx = Fixture::new();
        let mut source = batches();
        AdversarialLoop::new(settings(3), TrainingPolicy::new(), &checkpoints)
            .run(fx.models(), &mut source)
            .unwrap();

        assert_eq!(source.served.len(), 6);
        let mut all: Vec<usize> = source.served.concat();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 24);
    }

    #[test]
    fn test_checkpoint_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = manager(dir.path());
        let mut fx = Fixture::new();
        let policy = TrainingPolicy::new().with(PeriodicCheckpoint::new(2));
        AdversarialLoop::new(settings(5), policy, &checkpoints)
            .run(fx.models(), &mut batches())
            .unwrap();

        // iterations 0, 2 and 4
        assert_eq!(fx.generator.saved.borrow().len(), 3);
        assert_eq!(fx.discriminator.saved.borrow().len(), 3);
        assert!(dir.path().join("model/SRGAN_generator_4X").exists());
        assert!(dir.path().join("model/SRGAN_discriminator_4X").exists());
        let meta = checkpoints.latest_adversarial().unwrap().unwrap();
        assert_eq!(meta.epoch, 4);
        // the discriminator trained once per iteration before each save
        assert_eq!(std::fs::read_to_string(dir.path().join("model/SRGAN_discriminator_4X")).unwrap(), "5");
    }

    #[test]
    fn test_resumed_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = manager(dir.path());
        let mut fx = Fixture::new();
        let mut s = settings(3);
        s.first_epoch = 10;
        let policy = TrainingPolicy::new().with(PeriodicCheckpoint::new(2));
        let summary = AdversarialLoop::new(s, policy, &checkpoints)
            .run(fx.models(), &mut batches())
            .unwrap();
        assert_eq!(summary.epochs_run, 3);
        assert_eq!(summary.state.epoch, 12);
        assert_eq!(fx.generator.saved.borrow().len(), 2);
    }

    #[test]
    fn test_failed_checkpoint_does_not_stop_training() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = manager(dir.path());
        let mut fx = Fixture::new();
        fx.generator.fail_save = true;
        let policy = TrainingPolicy::new().with(PeriodicCheckpoint::new(1));
        let summary = AdversarialLoop::new(settings(3), policy, &checkpoints)
            .run(fx.models(), &mut batches())
            .unwrap();
        assert_eq!(summary.epochs_run, 3);
        assert_eq!(summary.stop_reason, StopReason::Completed);
    }

    #[test]
    fn test_optional_rate_decay_scales_both_models() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = manager(dir.path());
        let mut fx = Fixture::new();
        let policy = TrainingPolicy::new().with(StepDecay::new(2, 0.5));
        let summary = AdversarialLoop::new(settings(5), policy, &checkpoints)
            .run(fx.models(), &mut batches())
            .unwrap();
        assert!((fx.combined.lr - 2.5e-5).abs() < 1e-12);
        assert!((fx.discriminator.lr - 2.5e-5).abs() < 1e-12);
        assert_eq!(summary.state.discriminator_lr, Some(fx.discriminator.lr));
    }

    #[test]
    fn test_generator_failure_names_stage() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = manager(dir.path());
        let mut fx = Fixture::new();
        fx.combined.fail_train_at = Some(1);
        let err = AdversarialLoop::new(settings(4), TrainingPolicy::new(), &checkpoints)
            .run(fx.models(), &mut batches())
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::GeneratorStep));
        assert_eq!(fx.discriminator.train_calls.len(), 2);
    }

    #[test]
    fn test_validation_on_log_iterations_with_best_weights() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_gradient_images(data.path(), 4, 24, 24);
        let config = PatchSourceConfig::new(MediaType::Image, 24, 24, 4, 3, Colorspace::Rgb)
            .unwrap()
            .with_crop_mode(CropMode::Deterministic { seed: 2 });
        let validation = PatchSource::open(data.path(), config).unwrap();
        let checkpoints = manager(out.path());

        let mut fx = Fixture::new();
        fx.generator = MockModel::generator(4).with_validation_losses(&[0.5, 0.4]);
        let mut s = settings(4);
        s.print_frequency = 2;
        let policy = TrainingPolicy::new().with(BestCheckpoint::new());
        let summary = AdversarialLoop::new(s, policy, &checkpoints)
            .with_validation(&validation)
            .run(fx.models(), &mut batches())
            .unwrap();

        assert_eq!(summary.best_validation_loss, Some(0.4));
        // validated at iterations 0 and 2, each an improvement
        assert_eq!(fx.generator.saved.borrow().len(), 2);
        assert!(out.path().join("model/SRGAN_generator_4X_best").exists());
        assert!(!out.path().join("model/SRGAN_generator_4X").exists());
    }
}
