use ndarray::{s, Array3, ArrayView3};
use rand::Rng;

/// Pick the top-left corner of a `crop_h x crop_w` window inside a
/// `frame_h x frame_w` frame. The caller guarantees the crop fits.
pub fn random_window<R: Rng>(
    rng: &mut R,
    frame_h: usize,
    frame_w: usize,
    crop_h: usize,
    crop_w: usize,
) -> (usize, usize) {
    let y = rng.random_range(0..=frame_h - crop_h);
    let x = rng.random_range(0..=frame_w - crop_w);
    (y, x)
}

pub fn crop(frame: &Array3<f32>, y: usize, x: usize, height: usize, width: usize) -> Array3<f32> {
    frame.slice(s![y..y + height, x..x + width, ..]).to_owned()
}

/// Average non-overlapping `factor x factor` blocks.
///
/// The HR patch dimensions must be multiples of `factor`.
pub fn box_downsample(hr: ArrayView3<f32>, factor: usize) -> Array3<f32> {
    let (h, w, c) = hr.dim();
    let (lh, lw) = (h / factor, w / factor);
    let scale = 1.0 / (factor * factor) as f32;
    Array3::from_shape_fn((lh, lw, c), |(y, x, ch)| {
        hr.slice(s![y * factor..(y + 1) * factor, x * factor..(x + 1) * factor, ch])
            .sum()
            * scale
    })
}

/// Map 0..=255 pixels to [0, 1] in place.
pub fn normalize_lr(lr: &mut Array3<f32>) {
    lr.mapv_inplace(|v| v / 255.0);
}

/// Map 0..=255 pixels to [-1, 1] in place.
pub fn normalize_hr(hr: &mut Array3<f32>) {
    hr.mapv_inplace(|v| v / 127.5 - 1.0);
}

pub fn denormalize_lr(v: f32) -> f32 {
    (v * 255.0).clamp(0.0, 255.0)
}

pub fn denormalize_hr(v: f32) -> f32 {
    ((v + 1.0) * 127.5).clamp(0.0, 255.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_box_downsample_is_exact_block_mean() {
        // 4x4 single-channel ramp, factor 2
        let hr = Array3::from_shape_fn((4, 4, 1), |(y, x, _)| (y * 4 + x) as f32);
        let lr = box_downsample(hr.view(), 2);
        assert_eq!(lr.dim(), (2, 2, 1));
        assert_eq!(lr[[0, 0, 0]], (0.0 + 1.0 + 4.0 + 5.0) / 4.0);
        assert_eq!(lr[[1, 1, 0]], (10.0 + 11.0 + 14.0 + 15.0) / 4.0);
    }

    #[test]
    fn test_box_downsample_keeps_channels_separate() {
        let hr = Array3::from_shape_fn((8, 8, 3), |(_, _, c)| c as f32 * 10.0);
        let lr = box_downsample(hr.view(), 4);
        assert_eq!(lr.dim(), (2, 2, 3));
        assert!(lr.iter().enumerate().all(|(i, v)| *v == (i % 3) as f32 * 10.0));
    }

    #[test]
    fn test_random_window_stays_inside() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let (y, x) = random_window(&mut rng, 100, 70, 96, 64);
            assert!(y <= 4 && x <= 6);
        }
        assert_eq!(random_window(&mut rng, 96, 96, 96, 96), (0, 0));
    }

    #[test]
    fn test_crop_extracts_window() {
        let frame = Array3::from_shape_fn((10, 10, 1), |(y, x, _)| (y * 10 + x) as f32);
        let patch = crop(&frame, 2, 3, 4, 5);
        assert_eq!(patch.dim(), (4, 5, 1));
        assert_eq!(patch[[0, 0, 0]], 23.0);
        assert_eq!(patch[[3, 4, 0]], 57.0);
    }

    #[test]
    fn test_normalization_ranges() {
        let mut lr = Array3::from_elem((1, 2, 1), 255.0);
        lr[[0, 0, 0]] = 0.0;
        let mut hr = lr.clone();
        normalize_lr(&mut lr);
        normalize_hr(&mut hr);
        assert_eq!(lr[[0, 0, 0]], 0.0);
        assert_eq!(lr[[0, 1, 0]], 1.0);
        assert_eq!(hr[[0, 0, 0]], -1.0);
        assert_eq!(hr[[0, 1, 0]], 1.0);
        assert_eq!(denormalize_hr(hr[[0, 1, 0]]), 255.0);
        assert_eq!(denormalize_lr(2.0), 255.0);
    }
}
