//! Dataset access: media decoding, patch extraction and batch prefetching.

mod batch;
pub mod media;
pub mod patch;
mod prefetch;
mod sampler;
mod source;

pub use batch::{Batch, BatchSource, SequentialBatches, Tensor};
pub use media::{Colorspace, MediaType};
pub use prefetch::{FailurePolicy, PrefetchConfig, PrefetchQueue};
pub use sampler::IndexSampler;
pub use source::{CropMode, PatchSource, PatchSourceConfig, Sample};

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    /// Write `count` RGB PNGs of `width x height` with distinct gradients.
    pub fn write_gradient_images(dir: &Path, count: usize, width: u32, height: u32) {
        for i in 0..count {
            let img = image::RgbImage::from_fn(width, height, |x, y| {
                image::Rgb([
                    ((x * 255) / width.max(1)) as u8,
                    ((y * 255) / height.max(1)) as u8,
                    ((i * 37) % 256) as u8,
                ])
            });
            img.save(dir.join(format!("img_{i:03}.png"))).unwrap();
        }
    }
}
