use background_monitor::clock::ManualClock;
use background_monitor::{BackgroundChangeDetector, DetectorConfig, FrameAnalysis, Status};
use image::{GrayImage, Luma, Rgb, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Duration;

const WIDTH: u32 = 128;
const HEIGHT: u32 = 96;

struct Harness {
    clock: ManualClock,
    detector: BackgroundChangeDetector,
}

impl Harness {
    fn new() -> Self {
        Self::sized(WIDTH, HEIGHT)
    }

    /// Detector with a short SSIM interval driven by a manual clock.
    fn sized(width: u32, height: u32) -> Self {
        let clock = ManualClock::new();
        let config = DetectorConfig {
            ssim_interval_secs: 0.1,
            ..DetectorConfig::default()
        };
        let detector = BackgroundChangeDetector::with_clock(width, height, config, clock.clone()).unwrap();
        Self { clock, detector }
    }

    fn primed(start: &RgbImage, frames: usize) -> Self {
        let mut harness = Self::sized(start.width(), start.height());
        for _ in 0..frames {
            harness.feed(start, Duration::from_millis(50));
        }
        harness
    }

    fn feed(&mut self, frame: &RgbImage, gap: Duration) -> FrameAnalysis {
        self.clock.advance(gap);
        self.detector.process_frame(frame).unwrap()
    }

    /// Feeds every frame with a gap long enough to trigger an SSIM check.
    fn feed_checked(&mut self, frames: &[RgbImage]) -> Vec<FrameAnalysis> {
        frames.iter().map(|f| self.feed(f, Duration::from_millis(150))).collect()
    }
}

fn solid(value: u8) -> RgbImage {
    solid_sized(WIDTH, HEIGHT, value)
}

fn solid_sized(width: u32, height: u32, value: u8) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([value, value, value]))
}

fn gray_to_rgb(gray: &GrayImage) -> RgbImage {
    RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
        let v = gray.get_pixel(x, y)[0];
        Rgb([v, v, v])
    })
}

/// Flat background with two 32x32 textured blobs.
fn textured_blobs() -> RgbImage {
    let mut frame = GrayImage::from_pixel(WIDTH, HEIGHT, Luma([100]));
    let origins = [(16, 16), (72, 48)];

    for (ox, oy) in origins {
        for py in 0..32 {
            for px in 0..32 {
                let value = 128.0 + 50.0 * (px as f32 / 4.0).sin() * (py as f32 / 5.0).cos();
                frame.put_pixel(ox + px, oy + py, Luma([value.round() as u8]));
            }
        }
    }

    gray_to_rgb(&frame)
}

#[test]
fn first_frame_is_initialising_regardless_of_content() {
    for frame in [solid(0), solid(255), textured_blobs()] {
        let mut harness = Harness::new();
        let analysis = harness.feed(&frame, Duration::ZERO);
        assert_eq!(analysis.status, Status::Initialising);
        assert_eq!(analysis.motion_ratio, 0.0);
        assert_eq!(analysis.ssim_score, 1.0);
    }
}

#[test]
fn uniform_brightness_shift_stays_normal() {
    let mut harness = Harness::primed(&solid(100), 5);

    let results = harness.feed_checked(&vec![solid(150); 10]);

    let last = results.last().unwrap();
    assert_eq!(last.status, Status::Normal);
    assert!(results.iter().all(|r| r.motion_ratio == 0.0));
    // Flat 100 against flat 150 keeps the luminance term around 0.92.
    assert!(last.ssim_score > 0.5 && last.ssim_score < 0.98);
}

#[test]
fn repeated_frame_has_no_motion_and_is_normal() {
    let mut harness = Harness::primed(&textured_blobs(), 1);

    for analysis in harness.feed_checked(&vec![textured_blobs(); 6]) {
        assert_eq!(analysis.motion_ratio, 0.0);
        assert_eq!(analysis.status, Status::Normal);
    }
}

#[test]
fn lighting_drop_is_reported() {
    let mut harness = Harness::primed(&solid(100), 5);

    let mut frames = vec![solid(150); 5];
    frames.extend(vec![solid(30); 5]);
    let results = harness.feed_checked(&frames);

    assert_eq!(results[4].status, Status::Normal);
    assert_eq!(results.last().unwrap().status, Status::LightingDropOrCameraBlocked);
}

/// 640x480 frame with eight white discs of radius 25 on a flat background.
/// The discs advance (40, 25) px per frame and wrap around the edges; a
/// small seeded brightness offset is added to the whole frame.
fn moving_discs(frame_number: u32) -> RgbImage {
    const BACKGROUND: u8 = 50;
    let mut rng = StdRng::seed_from_u64(frame_number as u64);
    let offset: u8 = rng.gen_range(0..5);

    let centres: Vec<(f32, f32)> = (0..8)
        .map(|i| (((frame_number * 40 + i * 80) % 640) as f32, ((frame_number * 25 + i * 50) % 480) as f32))
        .collect();

    RgbImage::from_fn(640, 480, |x, y| {
        let inside = centres
            .iter()
            .any(|&(cx, cy)| (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2) <= 25.0 * 25.0);
        let base = if inside { 255 } else { BACKGROUND };
        let v = base.saturating_add(offset);
        Rgb([v, v, v])
    })
}

#[test]
fn moving_discs_are_person_movement() {
    let mut harness = Harness::primed(&solid_sized(640, 480, 100), 5);

    let frames: Vec<RgbImage> = (0..10).map(moving_discs).collect();
    let results = harness.feed_checked(&frames);

    // The first disc frame follows the flat primer, which has no texture to
    // track, so movement is judged from the second frame on.
    for analysis in &results[1..] {
        assert!(
            (0.1..=0.6).contains(&analysis.motion_ratio),
            "motion ratio {} outside the movement band",
            analysis.motion_ratio
        );
        assert!(analysis.ssim_score > 0.5, "ssim {}", analysis.ssim_score);
        assert!(analysis.mean_brightness >= 50.0);
        assert_eq!(analysis.status, Status::PersonMovement);
    }
    assert_eq!(harness.detector.stable_count(), 0);
}

#[test]
fn new_background_is_background_changed() {
    let mut old = GrayImage::from_pixel(WIDTH, HEIGHT, Luma([60]));
    for y in 40..56 {
        for x in 40..88 {
            old.put_pixel(x, y, Luma([255]));
        }
    }
    let old = gray_to_rgb(&old);

    let mut rng = StdRng::seed_from_u64(7);
    let mut new = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([230, 230, 230]));
    for stripe in (0..HEIGHT).step_by(16) {
        let colour = Rgb([rng.gen::<u8>(), rng.gen::<u8>(), rng.gen::<u8>()]);
        for y in stripe..(stripe + 8).min(HEIGHT) {
            for x in 0..WIDTH {
                new.put_pixel(x, y, colour);
            }
        }
    }
    for pixel in new.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = channel.saturating_add(rng.gen_range(0..60));
        }
    }

    let mut harness = Harness::new();
    // No SSIM check while the old scene is shown.
    for _ in 0..5 {
        let analysis = harness.feed(&old, Duration::from_millis(10));
        assert_ne!(analysis.status, Status::BackgroundChanged);
    }

    let first_new = harness.feed(&new, Duration::from_millis(150));
    assert!(first_new.ssim_score < 0.5, "ssim {}", first_new.ssim_score);
    assert_eq!(first_new.status, Status::BackgroundChanged);

    let mut last = first_new;
    for _ in 0..4 {
        last = harness.feed(&new, Duration::from_millis(150));
    }
    assert_eq!(last.status, Status::BackgroundChanged);
    assert!(harness.detector.reference_frame().is_some_and(|r| r.get_pixel(0, 0)[0] == 60));
}

#[test]
fn slow_drift_moves_the_reference() {
    let mut harness = Harness::primed(&solid(120), 1);

    let frames: Vec<RgbImage> = (121..=135).map(solid).collect();
    let results = harness.feed_checked(&frames);

    assert!(results.iter().all(|r| r.status == Status::Normal));
    let reference = harness.detector.reference_frame().unwrap();
    assert!(reference.pixels().all(|p| p[0] == 135));
    assert_eq!(harness.detector.stable_count(), 0);
}
