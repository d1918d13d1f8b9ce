use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use ndarray::{ArrayView3, Axis};

use crate::data::patch::{denormalize_hr, denormalize_lr};
use crate::data::{Colorspace, PatchSource};
use crate::error::{Stage, TrainingError};
use crate::model::TrainableModel;

/// Receives qualitative test output during training.
///
/// Snapshots are observational: a sink must not change model weights.
pub trait VisualizationSink {
    fn write(
        &mut self,
        generator: &mut dyn TrainableModel,
        test_source: &PatchSource,
        output_dir: &Path,
        iteration: usize,
        model_name: &str,
    ) -> Result<Vec<PathBuf>, TrainingError>;
}

/// A sink plus the test split and output location it writes for.
pub struct Visualization<'a> {
    pub sink: &'a mut dyn VisualizationSink,
    pub test_source: &'a PatchSource,
    pub output_dir: PathBuf,
    pub model_name: String,
}

impl Visualization<'_> {
    /// Write a snapshot for `iteration`.
    ///
    /// Failing to write the image files is logged and training goes on; a
    /// test sample that fails to decode or a generator failure is returned.
    pub fn snapshot(
        &mut self,
        generator: &mut dyn TrainableModel,
        iteration: usize,
    ) -> Result<(), TrainingError> {
        match self.sink.write(
            generator,
            self.test_source,
            &self.output_dir,
            iteration,
            &self.model_name,
        ) {
            Ok(paths) => {
                tracing::info!(
                    "wrote {} test image(s) to {}",
                    paths.len(),
                    self.output_dir.display()
                );
                Ok(())
            }
            Err(e @ TrainingError::Artifact { .. }) => {
                tracing::warn!("snapshot at iteration {iteration} failed: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Writes one PNG per test sample: nearest-upscaled LR, generator output and
/// HR side by side.
#[derive(Debug, Clone)]
pub struct ComparisonGridSink {
    max_images: usize,
}

impl ComparisonGridSink {
    pub fn new(max_images: usize) -> Self {
        ComparisonGridSink {
            max_images: max_images.max(1),
        }
    }
}

impl Default for ComparisonGridSink {
    fn default() -> Self {
        Self::new(4)
    }
}

impl VisualizationSink for ComparisonGridSink {
    fn write(
        &mut self,
        generator: &mut dyn TrainableModel,
        test_source: &PatchSource,
        output_dir: &Path,
        iteration: usize,
        model_name: &str,
    ) -> Result<Vec<PathBuf>, TrainingError> {
        fs::create_dir_all(output_dir).map_err(|e| artifact(output_dir, e))?;
        let colorspace = test_source.config().colorspace();
        let factor = test_source.config().upscaling_factor() as usize;

        let mut written = Vec::new();
        for index in 0..test_source.len().min(self.max_images) {
            let sample = test_source.get(index).map_err(|e| TrainingError::Data {
                stage: Stage::Snapshot,
                source: e,
            })?;
            let input = sample.lr.clone().insert_axis(Axis(0)).into_dyn();
            let output = generator
                .predict(&input)
                .map_err(|e| TrainingError::model(Stage::Snapshot, e))?;

            let mut expected = vec![1];
            expected.extend_from_slice(sample.hr.shape());
            if output.shape() != expected.as_slice() {
                return Err(TrainingError::shape_mismatch(
                    Stage::Snapshot,
                    &expected,
                    output.shape(),
                ));
            }
            let sr = output
                .index_axis(Axis(0), 0)
                .into_dimensionality::<ndarray::Ix3>()
                .map_err(|e| artifact(output_dir, e))?;

            let (h, w, _) = sample.hr.dim();
            let mut strip = RgbImage::new((w * 3) as u32, h as u32);
            for y in 0..h {
                for x in 0..w {
                    let lr_px = pixel(sample.lr.view(), y / factor, x / factor, colorspace, denormalize_lr);
                    let sr_px = pixel(sr, y, x, colorspace, denormalize_hr);
                    let hr_px = pixel(sample.hr.view(), y, x, colorspace, denormalize_hr);
                    strip.put_pixel(x as u32, y as u32, lr_px);
                    strip.put_pixel((w + x) as u32, y as u32, sr_px);
                    strip.put_pixel((2 * w + x) as u32, y as u32, hr_px);
                }
            }

            let path = output_dir.join(format!("{model_name}_{iteration:07}_{index}.png"));
            strip.save(&path).map_err(|e| artifact(&path, e))?;
            written.push(path);
        }
        tracing::debug!("wrote {} snapshot(s) for iteration {}", written.len(), iteration);
        Ok(written)
    }
}

fn pixel(
    view: ArrayView3<f32>,
    y: usize,
    x: usize,
    colorspace: Colorspace,
    denormalize: fn(f32) -> f32,
) -> Rgb<u8> {
    let px: Vec<f32> = view.slice(ndarray::s![y, x, ..]).iter().map(|v| denormalize(*v)).collect();
    let rgb = colorspace.to_rgb(&px);
    Rgb(rgb.map(|v| v.round().clamp(0.0, 255.0) as u8))
}

fn artifact(path: &Path, reason: impl std::fmt::Display) -> TrainingError {
    TrainingError::Artifact {
        stage: Stage::Snapshot,
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::testing::write_gradient_images;
    use crate::data::{CropMode, MediaType, PatchSourceConfig};
    use crate::training::testing::MockModel;

    fn test_source(dir: &Path, count: usize) -> PatchSource {
        write_gradient_images(dir, count, 32, 32);
        let config = PatchSourceConfig::new(MediaType::Image, 32, 32, 4, 3, Colorspace::Rgb)
            .unwrap()
            .with_crop_mode(CropMode::Deterministic { seed: 0 });
        PatchSource::open(dir, config).unwrap()
    }

    #[test]
    fn test_writes_strips() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let source = test_source(data.path(), 3);
        let mut generator = MockModel::generator(4);

        let mut sink = ComparisonGridSink::new(2);
        let paths = sink
            .write(&mut generator, &source, out.path(), 500, "SRGAN")
            .unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("SRGAN_0000500_0.png"));
        let img = image::open(&paths[1]).unwrap();
        assert_eq!((img.width(), img.height()), (96, 32));
        assert_eq!(generator.predict_calls, 2);
        assert_eq!(generator.version, 0);
    }

    fn visualization<'a>(
        sink: &'a mut ComparisonGridSink,
        source: &'a PatchSource,
        out: &Path,
    ) -> Visualization<'a> {
        Visualization {
            sink,
            test_source: source,
            output_dir: out.to_path_buf(),
            model_name: "SRGAN".to_string(),
        }
    }

    #[test]
    fn test_corrupt_test_image_is_fatal() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_gradient_images(data.path(), 1, 32, 32);
        // sorts before img_000.png
        fs::write(data.path().join("broken.png"), b"not a png").unwrap();
        let config = PatchSourceConfig::new(MediaType::Image, 32, 32, 4, 3, Colorspace::Rgb)
            .unwrap()
            .with_crop_mode(CropMode::Deterministic { seed: 0 });
        let source = PatchSource::open(data.path(), config).unwrap();
        let mut sink = ComparisonGridSink::new(2);
        let mut generator = MockModel::generator(4);

        let err = visualization(&mut sink, &source, out.path())
            .snapshot(&mut generator, 3)
            .unwrap_err();
        assert!(matches!(err, TrainingError::Data { stage: Stage::Snapshot, .. }));
    }

    #[test]
    fn test_unwritable_output_only_warns() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let source = test_source(data.path(), 1);
        let blocker = out.path().join("samples");
        fs::write(&blocker, b"a file, not a directory").unwrap();
        let mut sink = ComparisonGridSink::new(1);
        let mut generator = MockModel::generator(4);

        visualization(&mut sink, &source, &blocker)
            .snapshot(&mut generator, 0)
            .unwrap();
    }

    #[test]
    fn test_generator_failure_is_fatal() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let source = test_source(data.path(), 1);
        let mut sink = ComparisonGridSink::new(1);
        let mut generator = MockModel::generator(4);
        generator.predict_shape_override = Some(vec![1, 8, 8, 3]);

        let err = visualization(&mut sink, &source, out.path())
            .snapshot(&mut generator, 0)
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Snapshot));
    }

    #[test]
    fn test_rejects_wrong_generator_output() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let source = test_source(data.path(), 1);
        let mut generator = MockModel::generator(2);

        let err = ComparisonGridSink::default()
            .write(&mut generator, &source, out.path(), 0, "SRGAN")
            .unwrap_err();
        assert!(matches!(err, TrainingError::ShapeMismatch { stage: Stage::Snapshot, .. }));
    }
}
