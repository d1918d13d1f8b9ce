//! # srgan-train
//!
//! Training orchestration for SRGAN-style super-resolution models. The crate
//! feeds LR/HR patch pairs to externally built models and drives generator
//! pretraining and alternating adversarial training around them.
//!
//! ## Modules
//!
//! - [`data`] — Media scanning and decoding, patch extraction, prefetch queue
//! - [`model`] — The `TrainableModel` contract, metrics, Burn tensor bridge
//! - [`training`] — Pretraining and adversarial loops, observer policy, trainer
//! - [`checkpoint`] — Weight naming, metadata persistence and resume
//! - [`config`] — TOML configuration loading and validation
//! - [`error`] — Structured error types

#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod training;

pub use config::AppConfig;
pub use data::{Batch, BatchSource, PatchSource, PatchSourceConfig, PrefetchQueue, Tensor};
pub use error::{Stage, TrainingError};
pub use model::{Metrics, TrainableModel};
pub use training::Trainer;
