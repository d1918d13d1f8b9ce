use serde::{Deserialize, Serialize};

/// Which training phase wrote a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStage {
    Pretrain,
    Adversarial,
    AdversarialBest,
}

/// Loss snapshot at checkpoint time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetrics {
    pub generator_loss: Option<f32>,
    pub discriminator_loss: Option<f32>,
    pub validation_loss: Option<f32>,
    pub best_validation_loss: Option<f32>,
}

/// Optimizer state needed to resume with the same schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRates {
    pub generator: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<f64>,
}

/// Companion JSON written next to the generator weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub model_name: String,
    pub stage: CheckpointStage,
    pub epoch: usize,
    pub timestamp: u64,
    pub upscaling_factor: u32,
    pub generator_weights: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator_weights: Option<String>,
    pub metrics: CheckpointMetrics,
    pub learning_rates: LearningRates,
}
