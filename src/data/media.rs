use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use ndarray::Array3;

use crate::error::{ConfigError, DataError};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "webm", "264"];

/// Kind of media a dataset split is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[serde(alias = "i")]
    Image,
    #[serde(alias = "v")]
    Video,
}

impl MediaType {
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            MediaType::Image => IMAGE_EXTENSIONS,
            MediaType::Video => VIDEO_EXTENSIONS,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
        }
    }
}

/// Working colorspace of decoded frames.
///
/// Frames are converted right after decoding, before any crop is taken.
/// `YCbCr` follows the full-range BT.601 (JPEG) matrix; `Luma` keeps only Y.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colorspace {
    Rgb,
    YCbCr,
    Luma,
}

impl Colorspace {
    pub fn channels(self) -> usize {
        match self {
            Colorspace::Rgb | Colorspace::YCbCr => 3,
            Colorspace::Luma => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Colorspace::Rgb => "rgb",
            Colorspace::YCbCr => "ycbcr",
            Colorspace::Luma => "luma",
        }
    }

    pub fn validate_channels(self, channels: usize) -> Result<(), ConfigError> {
        if channels == self.channels() {
            Ok(())
        } else {
            Err(ConfigError::Channels {
                colorspace: self.name(),
                expected: self.channels(),
                channels,
            })
        }
    }

    /// Convert one RGB pixel (0..=255 scale) into `out`, which holds
    /// `self.channels()` values.
    pub fn from_rgb(self, [r, g, b]: [f32; 3], out: &mut [f32]) {
        match self {
            Colorspace::Rgb => out.copy_from_slice(&[r, g, b]),
            Colorspace::YCbCr => {
                out[0] = 0.299 * r + 0.587 * g + 0.114 * b;
                out[1] = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
                out[2] = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
            }
            Colorspace::Luma => out[0] = 0.299 * r + 0.587 * g + 0.114 * b,
        }
    }

    /// Inverse of [`Colorspace::from_rgb`]; luma is replicated to gray.
    pub fn to_rgb(self, px: &[f32]) -> [f32; 3] {
        match self {
            Colorspace::Rgb => [px[0], px[1], px[2]],
            Colorspace::YCbCr => {
                let (y, cb, cr) = (px[0], px[1] - 128.0, px[2] - 128.0);
                [
                    y + 1.402 * cr,
                    y - 0.344_136 * cb - 0.714_136 * cr,
                    y + 1.772 * cb,
                ]
            }
            Colorspace::Luma => [px[0], px[0], px[0]],
        }
    }
}

/// Convert packed RGB24 bytes into an `H x W x C` frame in `colorspace`.
pub fn rgb_to_frame(width: u32, height: u32, rgb: &[u8], colorspace: Colorspace) -> Array3<f32> {
    let (w, h, c) = (width as usize, height as usize, colorspace.channels());
    let mut frame = Array3::<f32>::zeros((h, w, c));
    let mut px = [0.0f32; 3];
    for (i, chunk) in rgb.chunks_exact(3).take(w * h).enumerate() {
        let (y, x) = (i / w, i % w);
        colorspace.from_rgb(
            [chunk[0] as f32, chunk[1] as f32, chunk[2] as f32],
            &mut px[..c],
        );
        for (ch, value) in px[..c].iter().enumerate() {
            frame[[y, x, ch]] = *value;
        }
    }
    frame
}

/// Decode a still image into an `H x W x C` frame (0..=255 scale).
pub fn decode_image(path: &Path, colorspace: Colorspace) -> Result<Array3<f32>, DataError> {
    let rgb = image::open(path)
        .map_err(|e| DataError::decode(path, e))?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    Ok(rgb_to_frame(width, height, rgb.as_raw(), colorspace))
}

/// Stream properties needed to address individual video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub frame_count: usize,
    /// Frame rate as `num / den`; `None` when the container does not report one.
    pub frame_rate: Option<(u32, u32)>,
}

impl VideoInfo {
    /// Presentation time of `frame_index` in seconds, if the rate is known.
    pub fn frame_time(&self, frame_index: usize) -> Option<f64> {
        let (num, den) = self.frame_rate?;
        Some(frame_index as f64 * den as f64 / num as f64)
    }
}

fn parse_rate(field: &str) -> Option<(u32, u32)> {
    let (num, den) = field.trim().split_once('/')?;
    let num: u32 = num.parse().ok()?;
    let den: u32 = den.parse().ok()?;
    (num > 0 && den > 0).then_some((num, den))
}

/// Parse `ffprobe -of csv=p=0` output of `width,height,r_frame_rate,nb_read_frames`.
pub fn parse_probe_output(output: &str) -> Option<VideoInfo> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let mut fields = line.trim().trim_end_matches(',').split(',');
    let width = fields.next()?.trim().parse().ok()?;
    let height = fields.next()?.trim().parse().ok()?;
    let frame_rate = parse_rate(fields.next()?);
    let frame_count: usize = fields.next()?.trim().parse().ok()?;
    if frame_count == 0 {
        return None;
    }
    Some(VideoInfo {
        width,
        height,
        frame_count,
        frame_rate,
    })
}

/// Probe a video's size, frame rate and exact frame count with `ffprobe`.
pub fn probe_video(path: &Path) -> Result<VideoInfo, DataError> {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-select_streams", "v:0", "-count_frames"])
        .args(["-show_entries", "stream=width,height,r_frame_rate,nb_read_frames"])
        .args(["-of", "csv=p=0"])
        .arg(path)
        .output()
        .map_err(|e| DataError::decode(path, format!("failed to run ffprobe: {e}")))?;
    if !output.status.success() {
        return Err(DataError::decode(
            path,
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&stdout)
        .ok_or_else(|| DataError::decode(path, format!("unexpected ffprobe output {stdout:?}")))
}

/// `ffmpeg` arguments around `-i <path>` that yield exactly frame `frame_index`.
///
/// With a known rate the input is seeked to the frame's timestamp, so only the
/// frames since the preceding keyframe are decoded. Otherwise every frame up
/// to the target goes through a `select` filter.
fn frame_selection_args(info: &VideoInfo, frame_index: usize) -> (Vec<String>, Vec<String>) {
    match info.frame_time(frame_index) {
        Some(t) => (
            vec!["-ss".to_string(), format!("{t:.6}")],
            vec!["-frames:v".to_string(), "1".to_string()],
        ),
        None => (
            Vec::new(),
            vec![
                "-vf".to_string(),
                format!("select=eq(n\\,{frame_index})"),
                "-vsync".to_string(),
                "0".to_string(),
                "-frames:v".to_string(),
                "1".to_string(),
            ],
        ),
    }
}

/// Decode frame `frame_index` of a video as RGB24 through `ffmpeg`.
pub fn decode_video_frame(
    path: &Path,
    info: VideoInfo,
    frame_index: usize,
    colorspace: Colorspace,
) -> Result<Array3<f32>, DataError> {
    let (before_input, after_input) = frame_selection_args(&info, frame_index);
    let output = Command::new("ffmpeg")
        .args(["-v", "error"])
        .args(&before_input)
        .arg("-i")
        .arg(path)
        .args(&after_input)
        .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
        .output()
        .map_err(|e| DataError::decode(path, format!("failed to run ffmpeg: {e}")))?;
    if !output.status.success() {
        return Err(DataError::decode(
            path,
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }
    let expected = info.width as usize * info.height as usize * 3;
    if output.stdout.len() < expected {
        return Err(DataError::decode(
            path,
            format!(
                "frame {frame_index} truncated: {} of {expected} bytes",
                output.stdout.len()
            ),
        ));
    }
    Ok(rgb_to_frame(info.width, info.height, &output.stdout, colorspace))
}

/// One entry of a dataset's file index.
///
/// Video stream info is probed on first use and then shared by every worker.
#[derive(Debug)]
pub struct MediaFile {
    path: PathBuf,
    video: OnceLock<VideoInfo>,
}

impl MediaFile {
    pub fn new(path: PathBuf) -> Self {
        MediaFile {
            path,
            video: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn video_info(&self) -> Result<VideoInfo, DataError> {
        if let Some(info) = self.video.get() {
            return Ok(*info);
        }
        let info = probe_video(&self.path)?;
        Ok(*self.video.get_or_init(|| info))
    }
}

/// Recursively collect media files of `media_type` under `root`, sorted by path.
pub fn scan_media(root: &Path, media_type: MediaType) -> Result<Vec<PathBuf>, DataError> {
    let mut files = Vec::new();
    if root.is_file() {
        if has_extension(root, media_type) {
            files.push(root.to_path_buf());
        }
    } else {
        scan_recursive(root, media_type, &mut files)?;
    }
    if files.is_empty() {
        return Err(DataError::EmptyDataset {
            path: root.to_path_buf(),
            media: media_type.label(),
        });
    }
    files.sort();
    Ok(files)
}

fn scan_recursive(dir: &Path, media_type: MediaType, files: &mut Vec<PathBuf>) -> Result<(), DataError> {
    let entries = fs::read_dir(dir).map_err(|e| DataError::Scan {
        path: dir.to_path_buf(),
        source: e,
    })?;
    for entry in entries {
        let path = entry
            .map_err(|e| DataError::Scan {
                path: dir.to_path_buf(),
                source: e,
            })?
            .path();
        if path.is_dir() {
            scan_recursive(&path, media_type, files)?;
        } else if has_extension(&path, media_type) {
            files.push(path);
        }
    }
    Ok(())
}

fn has_extension(path: &Path, media_type: MediaType) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            media_type.extensions().contains(&e.as_str())
        })
        .unwrap_or(false)
}
