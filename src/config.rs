use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::data::{Colorspace, MediaType};
use crate::error::ConfigError;

/// Upscaling factors the generator architectures support.
pub const SUPPORTED_FACTORS: [u32; 3] = [2, 4, 8];

/// Reject upscaling factors other than 2, 4 and 8.
pub fn validate_upscaling_factor(factor: u32) -> Result<(), ConfigError> {
    if SUPPORTED_FACTORS.contains(&factor) {
        Ok(())
    } else {
        Err(ConfigError::UpscalingFactor(factor))
    }
}

/// Model-level settings shared by both training loops.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub upscaling_factor: u32,
    pub channels: usize,
    pub colorspace: Colorspace,
    pub hr_height: u32,
    pub hr_width: u32,
    pub gen_lr: f64,
    pub dis_lr: f64,
    /// Content and adversarial loss weights of the combined generator graph.
    pub loss_weights: [f32; 2],
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            name: "SRGAN".to_string(),
            upscaling_factor: 4,
            channels: 3,
            colorspace: Colorspace::Rgb,
            hr_height: 96,
            hr_width: 96,
            gen_lr: 1e-4,
            dis_lr: 1e-4,
            loss_weights: [0.006, 1e-4],
        }
    }
}

impl ModelConfig {
    pub fn lr_height(&self) -> u32 {
        self.hr_height / self.upscaling_factor
    }

    pub fn lr_width(&self) -> u32 {
        self.hr_width / self.upscaling_factor
    }
}

/// Dataset locations and prefetch settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub train_path: PathBuf,
    pub validation_path: Option<PathBuf>,
    pub test_path: Option<PathBuf>,
    pub media_type: MediaType,
    pub batch_size: usize,
    pub workers: usize,
    pub max_queue_size: usize,
    pub crops_per_image: usize,
    pub seed: u64,
    /// Attempts per training sample before a decode failure becomes fatal.
    pub max_decode_attempts: usize,
    pub queue_timeout_secs: Option<u64>,
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            train_path: PathBuf::from("data/train"),
            validation_path: None,
            test_path: None,
            media_type: MediaType::Image,
            batch_size: 16,
            workers: 4,
            max_queue_size: 10,
            crops_per_image: 2,
            seed: 42,
            max_decode_attempts: 8,
            queue_timeout_secs: None,
        }
    }
}

impl DataConfig {
    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout_secs.map(Duration::from_secs)
    }
}

/// Generator-only pretraining settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PretrainConfig {
    pub epochs: usize,
    pub steps_per_epoch: usize,
    /// Validation batches per epoch; `None` runs a full pass.
    pub steps_per_validation: Option<usize>,
    pub print_frequency: usize,
    pub early_stop_patience: usize,
    pub plateau_patience: usize,
    pub plateau_factor: f64,
    pub min_lr: f64,
    pub lr_decay_step: usize,
    pub lr_decay_factor: f64,
}

impl Default for PretrainConfig {
    fn default() -> Self {
        PretrainConfig {
            epochs: 100,
            steps_per_epoch: 2000,
            steps_per_validation: Some(10),
            print_frequency: 1,
            early_stop_patience: 500,
            plateau_patience: 50,
            plateau_factor: 0.5,
            min_lr: 1e-5,
            lr_decay_step: 100,
            lr_decay_factor: 0.5,
        }
    }
}

/// Adversarial (SRGAN) training settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AdversarialConfig {
    pub epochs: usize,
    pub first_epoch: usize,
    pub print_frequency: usize,
    pub steps_per_validation: usize,
    pub log_weight_frequency: Option<usize>,
    pub log_test_frequency: usize,
    /// Also keep `*_best` weights whenever validation loss improves.
    pub keep_best: bool,
    pub lr_decay_step: Option<usize>,
    pub lr_decay_factor: f64,
}

impl Default for AdversarialConfig {
    fn default() -> Self {
        AdversarialConfig {
            epochs: 100_000,
            first_epoch: 0,
            print_frequency: 1,
            steps_per_validation: 1000,
            log_weight_frequency: Some(1000),
            log_test_frequency: 500,
            keep_best: false,
            lr_decay_step: None,
            lr_decay_factor: 0.5,
        }
    }
}

/// Output locations.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub weights_dir: PathBuf,
    pub test_output_dir: PathBuf,
    /// TensorBoard event root; runs log to `<dir>/<model.name>`. Unset
    /// disables TensorBoard.
    pub tensorboard_dir: Option<PathBuf>,
    /// Iterations between TensorBoard writes.
    pub tensorboard_update_freq: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            weights_dir: PathBuf::from("model"),
            test_output_dir: PathBuf::from("images/samples"),
            tensorboard_dir: None,
            tensorboard_update_freq: 10,
        }
    }
}

/// Top-level application configuration, loadable from TOML.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub data: DataConfig,
    pub pretrain: PretrainConfig,
    pub adversarial: AdversarialConfig,
    pub paths: PathsConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!("config file '{}' not found, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let model = &self.model;
        validate_upscaling_factor(model.upscaling_factor)?;
        model.colorspace.validate_channels(model.channels)?;

        if model.name.trim().is_empty() {
            return Err(ConfigError::Validation("model.name must not be empty".into()));
        }
        if model.hr_height == 0 || model.hr_width == 0 {
            return Err(ConfigError::Validation(
                "model.hr_height and model.hr_width must be > 0".into(),
            ));
        }
        if model.hr_height % model.upscaling_factor != 0
            || model.hr_width % model.upscaling_factor != 0
        {
            return Err(ConfigError::Validation(format!(
                "model HR size {}x{} must be divisible by the upscaling factor {}",
                model.hr_width, model.hr_height, model.upscaling_factor
            )));
        }
        if model.gen_lr <= 0.0 || model.dis_lr <= 0.0 {
            return Err(ConfigError::Validation(
                "model.gen_lr and model.dis_lr must be > 0".into(),
            ));
        }
        if model.loss_weights.iter().any(|w| *w < 0.0) {
            return Err(ConfigError::Validation(
                "model.loss_weights must be >= 0".into(),
            ));
        }

        let data = &self.data;
        if data.batch_size == 0 {
            return Err(ConfigError::Validation("data.batch_size must be > 0".into()));
        }
        if data.workers == 0 {
            return Err(ConfigError::Validation("data.workers must be >= 1".into()));
        }
        if data.max_queue_size == 0 {
            return Err(ConfigError::Validation(
                "data.max_queue_size must be >= 1".into(),
            ));
        }
        if data.crops_per_image == 0 {
            return Err(ConfigError::Validation(
                "data.crops_per_image must be >= 1".into(),
            ));
        }
        if data.max_decode_attempts == 0 {
            return Err(ConfigError::Validation(
                "data.max_decode_attempts must be >= 1".into(),
            ));
        }
        if data.queue_timeout_secs == Some(0) {
            return Err(ConfigError::Validation(
                "data.queue_timeout_secs must be > 0 when set".into(),
            ));
        }

        let pre = &self.pretrain;
        if pre.steps_per_epoch == 0 {
            return Err(ConfigError::Validation(
                "pretrain.steps_per_epoch must be > 0".into(),
            ));
        }
        if pre.steps_per_validation == Some(0) {
            return Err(ConfigError::Validation(
                "pretrain.steps_per_validation must be > 0 when set".into(),
            ));
        }
        if pre.print_frequency == 0 {
            return Err(ConfigError::Validation(
                "pretrain.print_frequency must be > 0".into(),
            ));
        }
        if pre.lr_decay_step == 0 {
            return Err(ConfigError::Validation(
                "pretrain.lr_decay_step must be > 0".into(),
            ));
        }
        for (name, factor) in [
            ("pretrain.plateau_factor", pre.plateau_factor),
            ("pretrain.lr_decay_factor", pre.lr_decay_factor),
            ("adversarial.lr_decay_factor", self.adversarial.lr_decay_factor),
        ] {
            if factor <= 0.0 || factor > 1.0 {
                return Err(ConfigError::Validation(format!("{name} must be in (0, 1]")));
            }
        }
        if pre.min_lr < 0.0 {
            return Err(ConfigError::Validation("pretrain.min_lr must be >= 0".into()));
        }

        let adv = &self.adversarial;
        if adv.print_frequency == 0 {
            return Err(ConfigError::Validation(
                "adversarial.print_frequency must be > 0".into(),
            ));
        }
        if adv.steps_per_validation == 0 {
            return Err(ConfigError::Validation(
                "adversarial.steps_per_validation must be > 0".into(),
            ));
        }
        if adv.log_test_frequency == 0 {
            return Err(ConfigError::Validation(
                "adversarial.log_test_frequency must be > 0".into(),
            ));
        }
        if adv.log_weight_frequency == Some(0) {
            return Err(ConfigError::Validation(
                "adversarial.log_weight_frequency must be > 0 when set".into(),
            ));
        }
        if adv.lr_decay_step == Some(0) {
            return Err(ConfigError::Validation(
                "adversarial.lr_decay_step must be > 0 when set".into(),
            ));
        }
        if self.paths.tensorboard_update_freq == 0 {
            return Err(ConfigError::Validation(
                "paths.tensorboard_update_freq must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a TOML string with all default values (useful for creating
    /// example config files).
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&AppConfig::default())
    }
}
