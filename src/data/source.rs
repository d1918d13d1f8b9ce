use std::path::{Path, PathBuf};

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::media::{decode_image, decode_video_frame, scan_media, Colorspace, MediaFile, MediaType};
use super::patch::{box_downsample, crop, normalize_hr, normalize_lr, random_window};
use crate::config::validate_upscaling_factor;
use crate::error::{ConfigError, DataError};

/// How crop windows (and video frames) are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropMode {
    /// Fresh random window on every read.
    Random,
    /// Window derived from `(seed, index)`, identical across reads.
    Deterministic { seed: u64 },
}

/// One LR/HR training pair, both `H x W x C`.
#[derive(Debug, Clone)]
pub struct Sample {
    pub index: usize,
    /// Values in [0, 1].
    pub lr: Array3<f32>,
    /// Values in [-1, 1].
    pub hr: Array3<f32>,
}

/// Validated geometry and sampling settings of a [`PatchSource`].
#[derive(Debug, Clone)]
pub struct PatchSourceConfig {
    media_type: MediaType,
    hr_height: u32,
    hr_width: u32,
    upscaling_factor: u32,
    channels: usize,
    colorspace: Colorspace,
    crops_per_image: usize,
    crop_mode: CropMode,
}

impl PatchSourceConfig {
    pub fn new(
        media_type: MediaType,
        hr_height: u32,
        hr_width: u32,
        upscaling_factor: u32,
        channels: usize,
        colorspace: Colorspace,
    ) -> Result<Self, ConfigError> {
        validate_upscaling_factor(upscaling_factor)?;
        colorspace.validate_channels(channels)?;
        if hr_height == 0
            || hr_width == 0
            || hr_height % upscaling_factor != 0
            || hr_width % upscaling_factor != 0
        {
            return Err(ConfigError::Validation(format!(
                "HR patch {hr_width}x{hr_height} must be non-empty and divisible by {upscaling_factor}"
            )));
        }
        Ok(PatchSourceConfig {
            media_type,
            hr_height,
            hr_width,
            upscaling_factor,
            channels,
            colorspace,
            crops_per_image: 1,
            crop_mode: CropMode::Random,
        })
    }

    pub fn with_crops_per_image(mut self, crops: usize) -> Self {
        self.crops_per_image = crops.max(1);
        self
    }

    pub fn with_crop_mode(mut self, mode: CropMode) -> Self {
        self.crop_mode = mode;
        self
    }

    pub fn lr_shape(&self) -> [usize; 3] {
        let f = self.upscaling_factor;
        [
            (self.hr_height / f) as usize,
            (self.hr_width / f) as usize,
            self.channels,
        ]
    }

    pub fn hr_shape(&self) -> [usize; 3] {
        [self.hr_height as usize, self.hr_width as usize, self.channels]
    }

    pub fn upscaling_factor(&self) -> u32 {
        self.upscaling_factor
    }

    pub fn colorspace(&self) -> Colorspace {
        self.colorspace
    }

    pub fn crops_per_image(&self) -> usize {
        self.crops_per_image
    }

    pub fn crop_mode(&self) -> CropMode {
        self.crop_mode
    }
}

/// Random-access source of LR/HR patch pairs over a directory of media.
///
/// Index `i` addresses crop `i % crops_per_image` of file `i / crops_per_image`.
/// The source is immutable after construction and safe to share across
/// worker threads.
#[derive(Debug)]
pub struct PatchSource {
    root: PathBuf,
    files: Vec<MediaFile>,
    config: PatchSourceConfig,
}

impl PatchSource {
    /// Scan `root` for media of the configured type.
    pub fn open(root: impl AsRef<Path>, config: PatchSourceConfig) -> Result<Self, DataError> {
        let root = root.as_ref();
        let files = scan_media(root, config.media_type)?
            .into_iter()
            .map(MediaFile::new)
            .collect::<Vec<_>>();
        tracing::debug!(
            "indexed {} {} file(s) under {}",
            files.len(),
            config.media_type.label(),
            root.display()
        );
        Ok(PatchSource {
            root: root.to_path_buf(),
            files,
            config,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len() * self.config.crops_per_image
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &PatchSourceConfig {
        &self.config
    }

    /// Read sample `index` using the thread-local RNG for random crops.
    pub fn get(&self, index: usize) -> Result<Sample, DataError> {
        self.get_with_rng(index, &mut rand::rng())
    }

    /// Read sample `index`, drawing random crops from `rng`.
    ///
    /// Deterministic sources ignore `rng` and derive the window from the index.
    pub fn get_with_rng<R: Rng>(&self, index: usize, rng: &mut R) -> Result<Sample, DataError> {
        match self.config.crop_mode {
            CropMode::Random => self.extract(index, rng),
            CropMode::Deterministic { seed } => {
                let mut rng = StdRng::seed_from_u64(index_seed(seed, index));
                self.extract(index, &mut rng)
            }
        }
    }

    fn extract<R: Rng>(&self, index: usize, rng: &mut R) -> Result<Sample, DataError> {
        let len = self.len();
        if index >= len {
            return Err(DataError::IndexOutOfRange { index, len });
        }
        let file = &self.files[index / self.config.crops_per_image];
        let frame = self.decode(file, rng)?;

        let (height, width, channels) = frame.dim();
        if channels != self.config.channels {
            return Err(DataError::decode(
                file.path(),
                format!(
                    "decoded {channels} channel(s), expected {}",
                    self.config.channels
                ),
            ));
        }
        let [crop_h, crop_w, _] = self.config.hr_shape();
        if height < crop_h || width < crop_w {
            return Err(DataError::Shape {
                path: file.path().to_path_buf(),
                width: width as u32,
                height: height as u32,
                crop_width: self.config.hr_width,
                crop_height: self.config.hr_height,
            });
        }

        let (y, x) = random_window(rng, height, width, crop_h, crop_w);
        let mut hr = crop(&frame, y, x, crop_h, crop_w);
        let mut lr = box_downsample(hr.view(), self.config.upscaling_factor as usize);
        normalize_lr(&mut lr);
        normalize_hr(&mut hr);
        Ok(Sample { index, lr, hr })
    }

    fn decode<R: Rng>(&self, file: &MediaFile, rng: &mut R) -> Result<Array3<f32>, DataError> {
        match self.config.media_type {
            MediaType::Image => decode_image(file.path(), self.config.colorspace),
            MediaType::Video => {
                let info = file.video_info()?;
                let frame_index = rng.random_range(0..info.frame_count);
                decode_video_frame(file.path(), info, frame_index, self.config.colorspace)
            }
        }
    }
}

fn index_seed(seed: u64, index: usize) -> u64 {
    seed ^ (index as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
