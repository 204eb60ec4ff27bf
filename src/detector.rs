use crate::background_model::{foreground_ratio, ForegroundModel};
use crate::clock::{Clock, MonotonicClock};
use crate::config::DetectorConfig;
use crate::error::{DetectorError, Result};
use crate::optical_flow::DenseFlowEstimator;
use crate::similarity::{MeanStructuralSimilarity, SimilarityMeasure};
use image::{GrayImage, ImageBuffer, Luma, Rgb};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// What the detector thinks is happening in front of the camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// First frame of a session, nothing to compare against yet.
    Initialising,
    Normal,
    PersonMovement,
    BackgroundChanged,
    LightingDropOrCameraBlocked,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Initialising => "Initialising",
            Status::Normal => "Normal",
            Status::PersonMovement => "Person Movement",
            Status::BackgroundChanged => "Background Changed",
            Status::LightingDropOrCameraBlocked => "Lighting Drop / Camera Blocked",
        };
        f.write_str(label)
    }
}

/// Result of one `process_frame` call.
#[derive(Clone, Debug)]
pub struct FrameAnalysis {
    pub status: Status,
    pub motion_ratio: f64,
    /// Latest SSIM against the reference frame; may be several frames old.
    pub ssim_score: f64,
    pub mean_brightness: f64,
    /// Cleaned KNN foreground mask, for display. Not used to pick `status`.
    pub foreground_mask: Option<GrayImage>,
}

impl FrameAnalysis {
    pub fn foreground_ratio(&self) -> Option<f64> {
        self.foreground_mask.as_ref().map(foreground_ratio)
    }
}

/// Fuses optical-flow motion, SSIM drift from an adaptive reference frame
/// and brightness into a per-frame `Status`.
///
/// SSIM is only recomputed once per `ssim_interval`. Each of those checks
/// also decides whether the scene is stable; after enough stable checks in a
/// row the current frame becomes the new reference, so slow changes such as
/// daylight drift are followed while abrupt ones are flagged.
pub struct BackgroundChangeDetector {
    config: DetectorConfig,
    ssim_interval: Duration,
    width: u32,
    height: u32,
    clock: Box<dyn Clock>,
    flow: DenseFlowEstimator,
    similarity: Box<dyn SimilarityMeasure>,
    foreground: Option<ForegroundModel>,

    previous_gray: Option<GrayImage>,
    reference_frame: Option<GrayImage>,
    last_ssim_check: Duration,
    last_ssim_score: f64,
    stable_count: u32,
    brightness_history: VecDeque<f64>,
    frames_processed: u64,
}

impl BackgroundChangeDetector {
    pub fn new(width: u32, height: u32, config: DetectorConfig) -> Result<Self> {
        Self::with_clock(width, height, config, MonotonicClock::new())
    }

    pub fn with_clock(width: u32, height: u32, config: DetectorConfig, clock: impl Clock + 'static) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(DetectorError::InvalidConfig(format!(
                "session dimensions must be non-zero, got {}x{}",
                width, height
            )));
        }
        config.validate()?;

        let foreground = config
            .foreground
            .enabled
            .then(|| ForegroundModel::new(width, height, &config.foreground));
        let last_ssim_check = clock.now();

        Ok(Self {
            ssim_interval: config.ssim_interval(),
            flow: DenseFlowEstimator::new(config.flow.clone()),
            similarity: Box::new(MeanStructuralSimilarity),
            foreground,
            width,
            height,
            clock: Box::new(clock),
            previous_gray: None,
            reference_frame: None,
            last_ssim_check,
            last_ssim_score: 1.0,
            stable_count: 0,
            brightness_history: VecDeque::with_capacity(config.brightness_history_len),
            frames_processed: 0,
            config,
        })
    }

    /// Replaces the SSIM implementation.
    pub fn with_similarity(mut self, measure: impl SimilarityMeasure + 'static) -> Self {
        self.similarity = Box::new(measure);
        self
    }

    pub fn process_frame(&mut self, frame: &ImageBuffer<Rgb<u8>, Vec<u8>>) -> Result<FrameAnalysis> {
        self.check_dimensions(frame.dimensions())?;
        let gray = rgb_to_gray(frame);
        self.process_gray(&gray)
    }

    /// Processes one grayscale frame.
    ///
    /// Nothing is committed when an error is returned: the previous frame,
    /// brightness history, foreground model and SSIM state stay as they were.
    pub fn process_gray(&mut self, gray: &GrayImage) -> Result<FrameAnalysis> {
        self.check_dimensions(gray.dimensions())?;
        let mean_brightness = mean_intensity(gray);

        let Some(previous) = self.previous_gray.as_ref() else {
            let foreground_mask = self.update_foreground(gray);
            self.frames_processed += 1;
            self.previous_gray = Some(gray.clone());
            self.reference_frame = Some(gray.clone());
            self.last_ssim_score = 1.0;
            return Ok(FrameAnalysis {
                status: Status::Initialising,
                motion_ratio: 0.0,
                ssim_score: self.last_ssim_score,
                mean_brightness,
                foreground_mask,
            });
        };

        let field = self.flow.compute(previous, gray);
        let motion_ratio = field.motion_ratio(self.config.flow.magnitude_threshold);

        let now = self.clock.now();
        let check = if now.saturating_sub(self.last_ssim_check) > self.ssim_interval {
            Some(self.score_against_reference(gray)?)
        } else {
            None
        };

        let foreground_mask = self.update_foreground(gray);
        self.frames_processed += 1;
        self.previous_gray = Some(gray.clone());
        self.record_brightness(mean_brightness);
        if let Some(score) = check {
            self.apply_ssim_check(gray, score, motion_ratio, now);
        }

        Ok(FrameAnalysis {
            status: self.classify(motion_ratio, mean_brightness),
            motion_ratio,
            ssim_score: self.last_ssim_score,
            mean_brightness,
            foreground_mask,
        })
    }

    fn update_foreground(&mut self, gray: &GrayImage) -> Option<GrayImage> {
        self.foreground.as_mut().map(|model| model.apply_and_clean(gray))
    }

    /// SSIM against the reference, `None` when the measure hit a recoverable
    /// failure and the stale score should be kept.
    fn score_against_reference(&self, gray: &GrayImage) -> Result<Option<f64>> {
        let Some(reference) = &self.reference_frame else {
            return Ok(None);
        };
        match self.similarity.score(reference, gray) {
            Ok(score) => Ok(Some(score.clamp(0.0, 1.0))),
            Err(e) if e.is_recoverable() => {
                warn!("SSIM check failed, keeping previous score {:.4}: {}", self.last_ssim_score, e);
                Ok(None)
            }
            Err(e) => Err(DetectorError::Similarity(e)),
        }
    }

    fn apply_ssim_check(&mut self, gray: &GrayImage, score: Option<f64>, motion_ratio: f64, now: Duration) {
        if let Some(score) = score {
            self.last_ssim_score = score;
        }
        self.last_ssim_check = now;

        let stability = &self.config.stability;
        if motion_ratio < stability.max_motion_ratio && self.last_ssim_score > stability.min_ssim {
            self.stable_count += 1;
        } else {
            self.stable_count = 0;
        }
        debug!(
            "SSIM check at {:?}: score={:.4} motion={:.4} stable_count={}",
            now, self.last_ssim_score, motion_ratio, self.stable_count
        );

        if self.stable_count >= stability.required_checks {
            self.reference_frame = Some(gray.clone());
            self.stable_count = 0;
            debug!("Scene stable for {} checks, adopted new reference frame", stability.required_checks);
        }
    }

    /// Status for the given motion and brightness, using the latest SSIM score.
    pub fn classify(&self, motion_ratio: f64, mean_brightness: f64) -> Status {
        let t = &self.config.classification;

        if mean_brightness < t.brightness_floor {
            return Status::LightingDropOrCameraBlocked;
        }

        if (t.movement_min..=t.movement_max).contains(&motion_ratio) && self.last_ssim_score > t.ssim_floor {
            Status::PersonMovement
        } else if motion_ratio > t.background_motion || self.last_ssim_score <= t.ssim_floor {
            Status::BackgroundChanged
        } else {
            Status::Normal
        }
    }

    fn check_dimensions(&self, actual: (u32, u32)) -> Result<()> {
        let expected = (self.width, self.height);
        if actual != expected {
            return Err(DetectorError::DimensionMismatch { expected, actual });
        }
        Ok(())
    }

    fn record_brightness(&mut self, value: f64) {
        self.brightness_history.push_back(value);
        if self.brightness_history.len() > self.config.brightness_history_len {
            self.brightness_history.pop_front();
        }
    }

    /// Mean of the recent brightness values, `None` before the first frame.
    pub fn average_brightness(&self) -> Option<f64> {
        if self.brightness_history.is_empty() {
            return None;
        }
        Some(self.brightness_history.iter().sum::<f64>() / self.brightness_history.len() as f64)
    }

    pub fn reference_frame(&self) -> Option<&GrayImage> {
        self.reference_frame.as_ref()
    }

    pub fn stable_count(&self) -> u32 {
        self.stable_count
    }

    pub fn last_ssim_score(&self) -> f64 {
        self.last_ssim_score
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Back to a fresh session; the next frame reports `Initialising`.
    pub fn reset(&mut self) {
        self.previous_gray = None;
        self.reference_frame = None;
        self.last_ssim_check = self.clock.now();
        self.last_ssim_score = 1.0;
        self.stable_count = 0;
        self.brightness_history.clear();
        self.frames_processed = 0;
        if let Some(model) = &mut self.foreground {
            model.reset();
        }
    }
}

/// BT.601 luma, the same weights OpenCV uses for BGR to gray.
pub fn rgb_to_gray(rgb_img: &ImageBuffer<Rgb<u8>, Vec<u8>>) -> GrayImage {
    ImageBuffer::from_fn(rgb_img.width(), rgb_img.height(), |x, y| {
        let rgb = rgb_img.get_pixel(x, y);
        let gray_val = 0.299 * rgb[0] as f32 + 0.587 * rgb[1] as f32 + 0.114 * rgb[2] as f32;
        Luma([gray_val.round().min(255.0) as u8])
    })
}

pub fn mean_intensity(gray: &GrayImage) -> f64 {
    let pixels = gray.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }
    pixels.iter().map(|&p| p as u64).sum::<u64>() as f64 / pixels.len() as f64
}
