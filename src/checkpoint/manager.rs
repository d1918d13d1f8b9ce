use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::checkpoint::metadata::{CheckpointMetadata, CheckpointStage, LearningRates};
use crate::error::CheckpointError;
use crate::model::TrainableModel;
use crate::training::TrainingState;

/// Configuration for the checkpoint manager.
#[derive(Debug, Clone)]
pub struct CheckpointManagerConfig {
    pub weights_dir: PathBuf,
    pub model_name: String,
    pub upscaling_factor: u32,
}

/// Names, writes and restores weight files plus their JSON metadata.
///
/// Weights are named `{name}_{f}X` after pretraining and
/// `{name}_generator_{f}X` / `{name}_discriminator_{f}X` during adversarial
/// training, so a pretrained generator can be picked up by name.
pub struct CheckpointManager {
    config: CheckpointManagerConfig,
}

impl CheckpointManager {
    pub fn new(config: CheckpointManagerConfig) -> Self {
        CheckpointManager { config }
    }

    pub fn weights_dir(&self) -> &Path {
        &self.config.weights_dir
    }

    fn weights_path(&self, role: Option<&str>, best: bool) -> PathBuf {
        let name = &self.config.model_name;
        let f = self.config.upscaling_factor;
        let mut file = match role {
            Some(role) => format!("{name}_{role}_{f}X"),
            None => format!("{name}_{f}X"),
        };
        if best {
            file.push_str("_best");
        }
        self.config.weights_dir.join(file)
    }

    pub fn pretrain_weights_path(&self) -> PathBuf {
        self.weights_path(None, false)
    }

    pub fn generator_weights_path(&self, best: bool) -> PathBuf {
        self.weights_path(Some("generator"), best)
    }

    pub fn discriminator_weights_path(&self, best: bool) -> PathBuf {
        self.weights_path(Some("discriminator"), best)
    }

    /// `<weights>.json`, next to the weights file.
    pub fn metadata_path(weights: &Path) -> PathBuf {
        let mut name = OsString::from(weights.as_os_str());
        name.push(".json");
        PathBuf::from(name)
    }

    /// Save the pretrained generator.
    pub fn save_pretrain(
        &self,
        generator: &dyn TrainableModel,
        state: &TrainingState,
    ) -> Result<PathBuf, CheckpointError> {
        fs::create_dir_all(&self.config.weights_dir)?;
        let path = self.pretrain_weights_path();
        save_model(generator, &path)?;
        let metadata = self.build_metadata(CheckpointStage::Pretrain, &path, None, state);
        self.write_metadata(&path, &metadata)?;
        Ok(path)
    }

    /// Save both adversarial models; `best` writes the `*_best` variants.
    pub fn save_adversarial(
        &self,
        generator: &dyn TrainableModel,
        discriminator: &dyn TrainableModel,
        state: &TrainingState,
        best: bool,
    ) -> Result<PathBuf, CheckpointError> {
        fs::create_dir_all(&self.config.weights_dir)?;
        let gen_path = self.generator_weights_path(best);
        let dis_path = self.discriminator_weights_path(best);
        save_model(generator, &gen_path)?;
        save_model(discriminator, &dis_path)?;

        let stage = if best {
            CheckpointStage::AdversarialBest
        } else {
            CheckpointStage::Adversarial
        };
        let metadata = self.build_metadata(stage, &gen_path, Some(&dis_path), state);
        self.write_metadata(&gen_path, &metadata)?;
        Ok(gen_path)
    }

    /// Reload the pretrained generator written by [`save_pretrain`](Self::save_pretrain).
    pub fn restore_pretrain(
        &self,
        generator: &mut dyn TrainableModel,
    ) -> Result<Option<CheckpointMetadata>, CheckpointError> {
        let path = self.pretrain_weights_path();
        load_model(generator, &path)?;
        self.read_metadata_if_present(&path)
    }

    /// Reload an adversarial pair, the latest or the `*_best` one.
    pub fn restore_adversarial(
        &self,
        generator: &mut dyn TrainableModel,
        discriminator: &mut dyn TrainableModel,
        best: bool,
    ) -> Result<Option<CheckpointMetadata>, CheckpointError> {
        let gen_path = self.generator_weights_path(best);
        load_model(generator, &gen_path)?;
        load_model(discriminator, &self.discriminator_weights_path(best))?;
        self.read_metadata_if_present(&gen_path)
    }

    /// Metadata of the latest adversarial checkpoint, if one exists.
    pub fn latest_adversarial(&self) -> Result<Option<CheckpointMetadata>, CheckpointError> {
        self.read_metadata_if_present(&self.generator_weights_path(false))
    }

    pub fn load_metadata(&self, weights: &Path) -> Result<CheckpointMetadata, CheckpointError> {
        let meta_path = Self::metadata_path(weights);
        let json = fs::read_to_string(&meta_path).map_err(|e| CheckpointError::MetadataRead {
            path: meta_path.clone(),
            source: e,
        })?;
        serde_json::from_str(&json).map_err(|e| CheckpointError::MetadataParse {
            path: meta_path,
            source: e,
        })
    }

    fn read_metadata_if_present(
        &self,
        weights: &Path,
    ) -> Result<Option<CheckpointMetadata>, CheckpointError> {
        if Self::metadata_path(weights).exists() {
            self.load_metadata(weights).map(Some)
        } else {
            Ok(None)
        }
    }

    fn build_metadata(
        &self,
        stage: CheckpointStage,
        generator: &Path,
        discriminator: Option<&Path>,
        state: &TrainingState,
    ) -> CheckpointMetadata {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        CheckpointMetadata {
            model_name: self.config.model_name.clone(),
            stage,
            epoch: state.epoch,
            timestamp,
            upscaling_factor: self.config.upscaling_factor,
            generator_weights: file_name(generator),
            discriminator_weights: discriminator.map(file_name),
            metrics: state.checkpoint_metrics(),
            learning_rates: LearningRates {
                generator: state.generator_lr,
                discriminator: state.discriminator_lr,
            },
        }
    }

    fn write_metadata(
        &self,
        weights: &Path,
        metadata: &CheckpointMetadata,
    ) -> Result<(), CheckpointError> {
        let final_path = Self::metadata_path(weights);
        let mut tmp = final_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, serde_json::to_string_pretty(metadata)?)?;
        // atomic rename
        fs::rename(&tmp, &final_path)?;
        Ok(())
    }
}

fn save_model(model: &dyn TrainableModel, path: &Path) -> Result<(), CheckpointError> {
    model
        .save_weights(path)
        .map_err(|e| CheckpointError::ModelSave {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn load_model(model: &mut dyn TrainableModel, path: &Path) -> Result<(), CheckpointError> {
    model
        .load_weights(path)
        .map_err(|e| CheckpointError::ModelLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
