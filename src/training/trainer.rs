use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::checkpoint::{CheckpointManager, CheckpointManagerConfig, CheckpointMetadata};
use crate::config::AppConfig;
use crate::data::{CropMode, FailurePolicy, PatchSource, PatchSourceConfig, PrefetchConfig, PrefetchQueue};
use crate::error::{Stage, TrainingError};
use crate::model::TrainableModel;
use crate::training::adversarial::{AdversarialLoop, AdversarialSettings, GanModels};
use crate::training::policy::TrainingPolicy;
use crate::training::pretrain::{PretrainLoop, PretrainSettings};
use crate::training::tensorboard::{event_writer, TensorBoardObserver};
use crate::training::visualize::{Visualization, VisualizationSink};
use crate::training::{apply_configured_rate, TrainingSummary};

/// Builds the dataset splits and checkpoint layout from an [`AppConfig`] and
/// runs either training stage against caller-supplied models.
///
/// The training split is wrapped in a [`PrefetchQueue`] that only lives for
/// the duration of one `train_*` call.
pub struct Trainer {
    config: AppConfig,
    checkpoints: CheckpointManager,
    train: Arc<PatchSource>,
    validation: Option<PatchSource>,
    test: Option<PatchSource>,
}

impl Trainer {
    pub fn new(config: AppConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let model = &config.model;
        let data = &config.data;
        let patches = PatchSourceConfig::new(
            data.media_type,
            model.hr_height,
            model.hr_width,
            model.upscaling_factor,
            model.channels,
            model.colorspace,
        )?;
        info!(
            "{} x{}: LR {}x{} -> HR {}x{}, {} channel(s)",
            model.name,
            model.upscaling_factor,
            model.lr_width(),
            model.lr_height(),
            model.hr_width,
            model.hr_height,
            model.channels
        );

        let train = open_split(
            "train",
            &data.train_path,
            patches.clone().with_crops_per_image(data.crops_per_image),
        )?;
        // evaluation splits always see the same crops; test keeps one per file
        let fixed = patches.with_crop_mode(CropMode::Deterministic { seed: data.seed });
        let validation = data
            .validation_path
            .as_deref()
            .map(|path| {
                open_split(
                    "validation",
                    path,
                    fixed.clone().with_crops_per_image(data.crops_per_image),
                )
            })
            .transpose()?;
        let test = data
            .test_path
            .as_deref()
            .map(|path| open_split("test", path, fixed.clone()))
            .transpose()?;

        let checkpoints = CheckpointManager::new(CheckpointManagerConfig {
            weights_dir: config.paths.weights_dir.clone(),
            model_name: model.name.clone(),
            upscaling_factor: model.upscaling_factor,
        });

        Ok(Trainer {
            config,
            checkpoints,
            train: Arc::new(train),
            validation,
            test,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn train_source(&self) -> &Arc<PatchSource> {
        &self.train
    }

    pub fn validation_source(&self) -> Option<&PatchSource> {
        self.validation.as_ref()
    }

    pub fn test_source(&self) -> Option<&PatchSource> {
        self.test.as_ref()
    }

    /// Queue settings for the training split.
    pub fn prefetch_config(&self, shuffle: bool) -> PrefetchConfig {
        let data = &self.config.data;
        PrefetchConfig {
            workers: data.workers,
            max_queue_size: data.max_queue_size,
            batch_size: data.batch_size,
            shuffle,
            seed: data.seed,
            failure_policy: FailurePolicy::Retry {
                max_attempts: data.max_decode_attempts,
            },
            timeout: data.queue_timeout(),
        }
    }

    fn visualization<'a>(
        &'a self,
        sink: Option<&'a mut dyn VisualizationSink>,
    ) -> Option<Visualization<'a>> {
        let sink = sink?;
        let test_source = self.test.as_ref()?;
        Some(Visualization {
            sink,
            test_source,
            output_dir: self.config.paths.test_output_dir.clone(),
            model_name: self.config.model.name.clone(),
        })
    }

    /// Prepend TensorBoard logging to `policy` when `paths.tensorboard_dir`
    /// is set.
    fn with_tensorboard(
        &self,
        mut policy: TrainingPolicy,
        run: &str,
    ) -> Result<TrainingPolicy, TrainingError> {
        if let Some(root) = &self.config.paths.tensorboard_dir {
            let writer = event_writer(root, run)?;
            policy.push_front(Box::new(TensorBoardObserver::new(
                writer,
                self.config.paths.tensorboard_update_freq,
            )));
        }
        Ok(policy)
    }

    /// Supervised pretraining of the generator alone, starting at
    /// `model.gen_lr`.
    pub fn train_generator<'a>(
        &'a self,
        generator: &mut dyn TrainableModel,
        sink: Option<&'a mut dyn VisualizationSink>,
    ) -> Result<TrainingSummary, TrainingError> {
        apply_configured_rate(generator, self.config.model.gen_lr);
        let visualization = self.visualization(sink);
        let policy = self.with_tensorboard(
            TrainingPolicy::pretrain(&self.config.pretrain, visualization.is_some()),
            &format!("{}_pretrain", self.config.model.name),
        )?;
        let mut pretrain = PretrainLoop::new(
            PretrainSettings::from_config(&self.config),
            policy,
            &self.checkpoints,
        );
        if let Some(validation) = &self.validation {
            pretrain = pretrain.with_validation(validation);
        }
        if let Some(visualization) = visualization {
            pretrain = pretrain.with_visualization(visualization);
        }

        PrefetchQueue::scoped(Arc::clone(&self.train), self.prefetch_config(false), |queue| {
            pretrain.run(generator, queue)
        })
    }

    /// Load the weights written by [`train_generator`](Self::train_generator).
    pub fn load_pretrained(
        &self,
        generator: &mut dyn TrainableModel,
    ) -> Result<Option<CheckpointMetadata>, TrainingError> {
        let metadata = self.checkpoints.restore_pretrain(generator)?;
        info!(
            "loaded pretrained generator from {}",
            self.checkpoints.pretrain_weights_path().display()
        );
        Ok(metadata)
    }

    /// Adversarial training. With `resume`, the latest adversarial pair and
    /// its learning rates are restored and iteration numbering continues
    /// after the saved one; otherwise the combined model starts at
    /// `model.gen_lr` and the discriminator at `model.dis_lr`.
    ///
    /// `model.loss_weights` must already be compiled into `combined`; they
    /// are only logged here.
    pub fn train_srgan<'a>(
        &'a self,
        mut models: GanModels<'_>,
        sink: Option<&'a mut dyn VisualizationSink>,
        resume: bool,
    ) -> Result<TrainingSummary, TrainingError> {
        let model = &self.config.model;
        info!(
            "combined loss weights: content {}, adversarial {}",
            model.loss_weights[0], model.loss_weights[1]
        );
        let mut settings = AdversarialSettings::from_config(&self.config);
        let mut restored = false;
        if resume {
            if let Some(meta) = self.checkpoints.latest_adversarial()? {
                restored = true;
                self.checkpoints.restore_adversarial(
                    &mut *models.generator,
                    &mut *models.discriminator,
                    false,
                )?;
                models.combined.set_learning_rate(meta.learning_rates.generator);
                if let Some(lr) = meta.learning_rates.discriminator {
                    models.discriminator.set_learning_rate(lr);
                }
                settings.first_epoch = meta.epoch + 1;
                info!("resuming adversarial training at iteration {}", settings.first_epoch);
            }
        }
        if !restored {
            apply_configured_rate(&mut *models.combined, model.gen_lr);
            apply_configured_rate(&mut *models.discriminator, model.dis_lr);
        }

        let visualization = self.visualization(sink);
        let policy = self.with_tensorboard(
            TrainingPolicy::adversarial(&self.config.adversarial, visualization.is_some()),
            &model.name,
        )?;
        let mut adversarial = AdversarialLoop::new(settings, policy, &self.checkpoints);
        if let Some(validation) = &self.validation {
            adversarial = adversarial.with_validation(validation);
        }
        if let Some(visualization) = visualization {
            adversarial = adversarial.with_visualization(visualization);
        }

        PrefetchQueue::scoped(Arc::clone(&self.train), self.prefetch_config(true), |queue| {
            adversarial.run(models, queue)
        })
    }
}

fn open_split(
    split: &str,
    path: &Path,
    config: PatchSourceConfig,
) -> Result<PatchSource, TrainingError> {
    let source = PatchSource::open(path, config).map_err(|e| TrainingError::Data {
        stage: Stage::Setup,
        source: e,
    })?;
    info!(
        "{split} split: {} file(s), {} sample(s) from {}",
        source.file_count(),
        source.len(),
        path.display()
    );
    Ok(source)
}
