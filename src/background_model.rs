use crate::config::ForegroundConfig;
use image::{GrayImage, Luma};

const FOREGROUND: u8 = 255;
const BACKGROUND: u8 = 0;

/// KNN background subtractor over grayscale frames.
///
/// Each pixel keeps a small history of past intensities. A pixel is
/// background when at least `k_nearest` of them lie within
/// `dist2_threshold` (squared intensity distance) of the new value. One
/// history slot is overwritten every `history / samples` frames, so a lasting
/// change is absorbed after roughly `k_nearest` refreshes.
pub struct ForegroundModel {
    width: u32,
    height: u32,
    samples: Vec<u8>,
    sample_count: usize,
    k_nearest: usize,
    dist2_threshold: f32,
    update_period: u32,
    next_slot: usize,
    frame_count: u32,
    open_radius: u32,
}

impl ForegroundModel {
    pub fn new(width: u32, height: u32, config: &ForegroundConfig) -> Self {
        let sample_count = config.samples.max(1);
        Self {
            width,
            height,
            samples: Vec::new(),
            sample_count,
            k_nearest: config.k_nearest.clamp(1, sample_count),
            dist2_threshold: config.dist2_threshold,
            update_period: (config.history / sample_count as u32).max(1),
            next_slot: 0,
            frame_count: 0,
            open_radius: config.open_radius,
        }
    }

    /// Updates the model and returns the raw mask (255 = foreground).
    pub fn apply(&mut self, frame: &GrayImage) -> GrayImage {
        debug_assert_eq!(frame.dimensions(), (self.width, self.height));
        self.frame_count += 1;

        // Seed every slot from the first frame.
        if self.samples.is_empty() {
            self.samples = frame
                .as_raw()
                .iter()
                .flat_map(|&p| std::iter::repeat(p).take(self.sample_count))
                .collect();
            return GrayImage::from_pixel(self.width, self.height, Luma([BACKGROUND]));
        }

        let mut mask = GrayImage::new(self.width, self.height);
        for (idx, (&value, out)) in frame.as_raw().iter().zip(mask.iter_mut()).enumerate() {
            let history = &self.samples[idx * self.sample_count..(idx + 1) * self.sample_count];
            *out = if self.is_background(history, value) {
                BACKGROUND
            } else {
                FOREGROUND
            };
        }

        if self.frame_count % self.update_period == 0 {
            for (idx, &value) in frame.as_raw().iter().enumerate() {
                self.samples[idx * self.sample_count + self.next_slot] = value;
            }
            self.next_slot = (self.next_slot + 1) % self.sample_count;
        }

        mask
    }

    /// Updates the model and returns the mask after a morphological open.
    pub fn apply_and_clean(&mut self, frame: &GrayImage) -> GrayImage {
        let mask = self.apply(frame);
        morphological_open(&mask, self.open_radius)
    }

    fn is_background(&self, history: &[u8], value: u8) -> bool {
        let mut matches = 0;
        for &sample in history {
            let diff = sample as f32 - value as f32;
            if diff * diff <= self.dist2_threshold {
                matches += 1;
                if matches >= self.k_nearest {
                    return true;
                }
            }
        }
        false
    }

    pub fn get_frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.next_slot = 0;
        self.frame_count = 0;
    }
}

/// Erosion followed by dilation with a (2r+1)² square. Removes specks
/// smaller than the square and keeps larger regions.
pub fn morphological_open(mask: &GrayImage, radius: u32) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    let eroded = erode(mask, radius as i32);
    dilate(&eroded, radius as i32)
}

fn erode(mask: &GrayImage, radius: i32) -> GrayImage {
    neighbourhood_filter(mask, radius, 255, u8::min)
}

fn dilate(mask: &GrayImage, radius: i32) -> GrayImage {
    neighbourhood_filter(mask, radius, 0, u8::max)
}

// Out-of-bounds neighbours are skipped, so the border neither erodes nor
// dilates the mask.
fn neighbourhood_filter(mask: &GrayImage, radius: i32, init: u8, pick: fn(u8, u8) -> u8) -> GrayImage {
    let (width, height) = mask.dimensions();
    let mut result = GrayImage::new(width, height);

    for y in 0..height {
        for x in 0..width {
            let mut value = init;

            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let nx = x as i32 + dx;
                    let ny = y as i32 + dy;

                    if nx >= 0 && nx < width as i32 && ny >= 0 && ny < height as i32 {
                        value = pick(value, mask.get_pixel(nx as u32, ny as u32)[0]);
                    }
                }
            }

            result.put_pixel(x, y, Luma([value]));
        }
    }

    result
}

/// Fraction of mask pixels marked foreground.
pub fn foreground_ratio(mask: &GrayImage) -> f64 {
    let total = mask.as_raw().len();
    if total == 0 {
        return 0.0;
    }
    mask.as_raw().iter().filter(|&&p| p > 128).count() as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(value: u8) -> GrayImage {
        GrayImage::from_pixel(16, 12, Luma([value]))
    }

    #[test]
    fn test_first_frame_is_all_background() {
        let mut model = ForegroundModel::new(16, 12, &ForegroundConfig::default());
        let mask = model.apply(&flat(120));
        assert!(mask.pixels().all(|p| p[0] == BACKGROUND));
        assert_eq!(model.get_frame_count(), 1);
    }

    #[test]
    fn test_large_change_is_foreground_small_change_is_not() {
        let mut model = ForegroundModel::new(16, 12, &ForegroundConfig::default());
        model.apply(&flat(120));

        // 20^2 = 400 is inside the default 1000 threshold, 60^2 is not.
        let mut frame = flat(140);
        for y in 4..8 {
            for x in 4..8 {
                frame.put_pixel(x, y, Luma([180]));
            }
        }

        let mask = model.apply(&frame);
        assert_eq!(mask.get_pixel(0, 0)[0], BACKGROUND);
        assert_eq!(mask.get_pixel(5, 5)[0], FOREGROUND);
        assert!((foreground_ratio(&mask) - 16.0 / 192.0).abs() < 1e-9);
    }

    #[test]
    fn test_lasting_change_is_absorbed() {
        let config = ForegroundConfig {
            history: 4,
            samples: 2,
            k_nearest: 2,
            ..ForegroundConfig::default()
        };
        let mut model = ForegroundModel::new(16, 12, &config);
        model.apply(&flat(50));

        // A slot is refreshed every 2 frames, both slots hold 200 after frame 4.
        for _ in 2..=4 {
            assert!(model.apply(&flat(200)).pixels().all(|p| p[0] == FOREGROUND));
        }
        assert!(model.apply(&flat(200)).pixels().all(|p| p[0] == BACKGROUND));
    }

    #[test]
    fn test_open_removes_specks_and_keeps_blocks() {
        let mut mask = GrayImage::new(12, 12);
        mask.put_pixel(1, 1, Luma([255]));
        for y in 5..9 {
            for x in 5..9 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }

        let opened = morphological_open(&mask, 1);

        assert_eq!(opened.get_pixel(1, 1)[0], 0);
        for y in 5..9 {
            for x in 5..9 {
                assert_eq!(opened.get_pixel(x, y)[0], 255);
            }
        }
        assert_eq!(opened.get_pixel(4, 4)[0], 0);
    }

    #[test]
    fn test_reset_reseeds_from_next_frame() {
        let mut model = ForegroundModel::new(16, 12, &ForegroundConfig::default());
        model.apply(&flat(20));
        model.reset();
        assert_eq!(model.get_frame_count(), 0);
        assert!(model.apply(&flat(220)).pixels().all(|p| p[0] == BACKGROUND));
    }
}
