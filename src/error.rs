use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Error type returned by external model implementations.
pub type ModelError = Box<dyn std::error::Error + Send + Sync>;

/// Pipeline stage a training failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Decode,
    TrainStep,
    DiscriminatorStep,
    GeneratorStep,
    Validation,
    Snapshot,
    Checkpoint,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::Decode => "decode",
            Stage::TrainStep => "train step",
            Stage::DiscriminatorStep => "discriminator step",
            Stage::GeneratorStep => "generator step",
            Stage::Validation => "validation",
            Stage::Snapshot => "snapshot",
            Stage::Checkpoint => "checkpoint",
        };
        f.write_str(name)
    }
}

/// Errors raised while scanning, decoding or cropping media.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error(
        "frame of {path} is {width}x{height}, smaller than the {crop_width}x{crop_height} HR crop"
    )]
    Shape {
        path: PathBuf,
        width: u32,
        height: u32,
        crop_width: u32,
        crop_height: u32,
    },

    #[error("sample index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no {media} files found under {path}")]
    EmptyDataset { path: PathBuf, media: &'static str },
}

impl DataError {
    pub fn decode(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        DataError::Decode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors surfaced by the prefetch queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("no batch ready after {0:?}")]
    Timeout(Duration),

    #[error("prefetch queue is closed")]
    Closed,

    #[error("prefetch queue was not started")]
    NotStarted,

    #[error("worker failed: {0}")]
    Worker(#[from] DataError),
}

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to read metadata from {path}: {source}")]
    MetadataRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse metadata from {path}: {source}")]
    MetadataParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to save weights to {path}: {reason}")]
    ModelSave { path: PathBuf, reason: String },

    #[error("failed to load weights from {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during training.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("shape mismatch in {stage}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        stage: Stage,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("model failure in {stage}: {source}")]
    Model {
        stage: Stage,
        source: ModelError,
    },

    #[error("batch queue failure in {stage}: {source}")]
    Queue { stage: Stage, source: QueueError },

    #[error("data failure in {stage}: {source}")]
    Data { stage: Stage, source: DataError },

    #[error("failed to write {path}: {reason}")]
    Artifact {
        stage: Stage,
        path: PathBuf,
        reason: String,
    },

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl TrainingError {
    pub fn model(stage: Stage, source: ModelError) -> Self {
        TrainingError::Model { stage, source }
    }

    pub fn shape_mismatch(stage: Stage, expected: &[usize], got: &[usize]) -> Self {
        TrainingError::ShapeMismatch {
            stage,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    pub fn queue(stage: Stage, source: QueueError) -> Self {
        // worker failures are decode failures regardless of who was waiting
        let stage = match source {
            QueueError::Worker(_) => Stage::Decode,
            _ => stage,
        };
        TrainingError::Queue { stage, source }
    }

    /// Stage the failure belongs to, if it is tied to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            TrainingError::ShapeMismatch { stage, .. }
            | TrainingError::Model { stage, .. }
            | TrainingError::Queue { stage, .. }
            | TrainingError::Data { stage, .. }
            | TrainingError::Artifact { stage, .. } => Some(*stage),
            TrainingError::Checkpoint(_) => Some(Stage::Checkpoint),
            TrainingError::Config(_) => Some(Stage::Setup),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("upscaling factor must be 2, 4 or 8, got {0}")]
    UpscalingFactor(u32),

    #[error("colorspace {colorspace} needs {expected} channel(s), got {channels}")]
    Channels {
        colorspace: &'static str,
        expected: usize,
        channels: usize,
    },

    #[error("config validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error_display() {
        let err = DataError::Shape {
            path: PathBuf::from("a.png"),
            width: 32,
            height: 40,
            crop_width: 96,
            crop_height: 96,
        };
        assert_eq!(
            err.to_string(),
            "frame of a.png is 32x40, smaller than the 96x96 HR crop"
        );
    }

    #[test]
    fn test_training_error_names_stage() {
        let err = TrainingError::shape_mismatch(Stage::DiscriminatorStep, &[4, 6, 6, 1], &[6, 6, 6, 1]);
        assert_eq!(
            err.to_string(),
            "shape mismatch in discriminator step: expected [4, 6, 6, 1], got [6, 6, 6, 1]"
        );
        assert_eq!(err.stage(), Some(Stage::DiscriminatorStep));
    }

    #[test]
    fn test_queue_error_in_decode_stage() {
        let err = TrainingError::Queue {
            stage: Stage::Decode,
            source: QueueError::Worker(DataError::decode("x.jpg", "truncated")),
        };
        assert_eq!(
            err.to_string(),
            "batch queue failure in decode: worker failed: failed to decode x.jpg: truncated"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::UpscalingFactor(3);
        assert_eq!(err.to_string(), "upscaling factor must be 2, 4 or 8, got 3");
        let err = ConfigError::Validation("data.batch_size must be > 0".to_string());
        assert_eq!(
            err.to_string(),
            "config validation error: data.batch_size must be > 0"
        );
    }
}
