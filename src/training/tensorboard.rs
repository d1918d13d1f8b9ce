//! TensorBoard scalar logging as a training observer.

use std::fs;
use std::path::{Path, PathBuf};

use tensorboard_rs::summary_writer::SummaryWriter;

use crate::error::{Stage, TrainingError};
use crate::model::Metrics;

use super::policy::{PolicyAction, TrainingObserver};
use super::state::TrainingState;

/// Destination for `(tag, value, step)` scalars.
pub trait ScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize);

    fn flush(&mut self);
}

impl ScalarSink for SummaryWriter {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) {
        SummaryWriter::add_scalar(self, tag, value, step);
    }

    fn flush(&mut self) {
        SummaryWriter::flush(self);
    }
}

/// Event-file writer for run `model_name` under `root`.
pub fn event_writer(root: &Path, model_name: &str) -> Result<SummaryWriter, TrainingError> {
    let logdir: PathBuf = root.join(model_name);
    fs::create_dir_all(&logdir).map_err(|e| TrainingError::Artifact {
        stage: Stage::Setup,
        path: logdir.clone(),
        reason: e.to_string(),
    })?;
    tracing::info!("tensorboard logs: {}", logdir.display());
    Ok(SummaryWriter::new(&logdir))
}

/// Writes generator, discriminator and validation scalars every
/// `update_freq` iterations. Never changes the course of training.
pub struct TensorBoardObserver<W> {
    sink: W,
    update_freq: usize,
}

impl<W: ScalarSink> TensorBoardObserver<W> {
    pub fn new(sink: W, update_freq: usize) -> Self {
        TensorBoardObserver {
            sink,
            update_freq: update_freq.max(1),
        }
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    fn write_group(&mut self, group: &str, metrics: Option<&Metrics>, step: usize) -> usize {
        let Some(metrics) = metrics else {
            return 0;
        };
        for (name, value) in metrics.iter() {
            self.sink.add_scalar(&format!("{group}/{name}"), value, step);
        }
        metrics.len()
    }
}

impl<W: ScalarSink> TrainingObserver for TensorBoardObserver<W> {
    fn name(&self) -> &'static str {
        "tensorboard"
    }

    fn on_iteration_end(&mut self, state: &TrainingState) -> PolicyAction {
        if state.epoch % self.update_freq != 0 {
            return PolicyAction::Continue;
        }
        let step = state.epoch;
        // the open window's newest step, else the last closed window
        let generator = state.generator_history.last().or(state.last_generator.as_ref());
        let discriminator = state
            .discriminator_history
            .last()
            .or(state.last_discriminator.as_ref());
        let written = self.write_group("generator", generator, step)
            + self.write_group("discriminator", discriminator, step)
            + self.write_group("validation", state.validation.as_ref(), step);
        if written > 0 {
            self.sink.flush();
        }
        PolicyAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorded {
        scalars: Vec<(String, f32, usize)>,
        flushes: usize,
    }

    impl ScalarSink for Recorded {
        fn add_scalar(&mut self, tag: &str, value: f32, step: usize) {
            self.scalars.push((tag.to_string(), value, step));
        }

        fn flush(&mut self) {
            self.flushes += 1;
        }
    }

    fn state(epoch: usize) -> TrainingState {
        let mut state = TrainingState::new(1e-4, Some(1e-4));
        state.epoch = epoch;
        state
    }

    #[test]
    fn test_writes_named_scalars_on_cadence() {
        let mut observer = TensorBoardObserver::new(Recorded::default(), 10);
        for epoch in 0..25 {
            let mut s = state(epoch);
            s.generator_history.push(
                Metrics::from_loss(epoch as f32)
                    .with("content_loss", 0.5)
                    .with("adversarial_loss", 0.25),
            );
            s.discriminator_history.push(Metrics::from_loss(0.7));
            assert_eq!(observer.on_iteration_end(&s), PolicyAction::Continue);
        }

        let sink = observer.sink();
        let steps: Vec<usize> = sink
            .scalars
            .iter()
            .filter(|(tag, _, _)| tag == "generator/loss")
            .map(|(_, _, step)| *step)
            .collect();
        assert_eq!(steps, vec![0, 10, 20]);
        assert_eq!(sink.flushes, 3);
        assert!(sink
            .scalars
            .contains(&("generator/content_loss".to_string(), 0.5, 20)));
        assert!(sink
            .scalars
            .contains(&("discriminator/loss".to_string(), 0.7, 10)));
        assert!(!sink.scalars.iter().any(|(tag, _, _)| tag.starts_with("validation/")));
    }

    #[test]
    fn test_falls_back_to_closed_window_and_validation() {
        let mut observer = TensorBoardObserver::new(Recorded::default(), 1);
        let mut s = state(3);
        s.last_generator = Some(Metrics::from_loss(0.2));
        s.validation = Some(Metrics::from_loss(0.3));
        observer.on_iteration_end(&s);

        assert_eq!(
            observer.sink().scalars,
            vec![
                ("generator/loss".to_string(), 0.2, 3),
                ("validation/loss".to_string(), 0.3, 3),
            ]
        );
    }

    #[test]
    fn test_nothing_to_write_skips_flush() {
        let mut observer = TensorBoardObserver::new(Recorded::default(), 1);
        observer.on_iteration_end(&state(0));
        assert_eq!(observer.sink().flushes, 0);
    }

    #[test]
    fn test_event_writer_creates_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = event_writer(dir.path(), "SRGAN").unwrap();
        writer.add_scalar("generator/loss", 0.1, 0);
        writer.flush();
        assert!(dir.path().join("SRGAN").is_dir());
    }
}
