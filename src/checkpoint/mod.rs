mod manager;
mod metadata;

pub use manager::{CheckpointManager, CheckpointManagerConfig};
pub use metadata::{CheckpointMetadata, CheckpointMetrics, CheckpointStage, LearningRates};
