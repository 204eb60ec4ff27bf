use crate::detector::{BackgroundChangeDetector, FrameAnalysis, Status};
use crate::error::DetectorError;
use crate::metrics::{MetricsRecord, MetricsSink};
use crate::webcam::FrameSource;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct MonitorOptions {
    /// Stop after this many logged frames.
    pub max_rows: u64,
    /// Pause between ticks.
    pub frame_delay: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            max_rows: 10_000,
            frame_delay: Duration::from_millis(300),
        }
    }
}

/// Outcome of a single monitor tick.
#[derive(Debug)]
pub enum Tick {
    Processed(FrameAnalysis),
    /// The frame was rejected by the detector; nothing was logged for it.
    Skipped,
    /// `max_rows` frames have been logged.
    Finished,
}

#[derive(Clone, Debug, Default)]
pub struct MonitorSummary {
    pub frames_logged: u64,
    pub frames_skipped: u64,
    pub status_counts: HashMap<Status, u64>,
}

/// Drives one detector from a frame source: capture, process, log the status
/// line, record metrics, wait.
pub struct BackgroundMonitor<S: FrameSource, M: MetricsSink> {
    source: S,
    detector: BackgroundChangeDetector,
    sink: M,
    options: MonitorOptions,
    summary: MonitorSummary,
}

impl<S: FrameSource, M: MetricsSink> BackgroundMonitor<S, M> {
    pub fn new(source: S, detector: BackgroundChangeDetector, sink: M, options: MonitorOptions) -> Self {
        Self {
            source,
            detector,
            sink,
            options,
            summary: MonitorSummary::default(),
        }
    }

    pub fn tick(&mut self) -> Result<Tick> {
        if self.summary.frames_logged >= self.options.max_rows {
            return Ok(Tick::Finished);
        }

        let frame = self.source.capture_frame().context("Failed to capture frame")?;

        let analysis = match self.detector.process_frame(&frame) {
            Ok(analysis) => analysis,
            Err(e @ DetectorError::DimensionMismatch { .. }) => {
                warn!("Skipping frame: {}", e);
                self.summary.frames_skipped += 1;
                return Ok(Tick::Skipped);
            }
            Err(e) => return Err(e).context("Background detector failed"),
        };

        self.summary.frames_logged += 1;
        *self.summary.status_counts.entry(analysis.status).or_insert(0) += 1;

        info!(
            "[{:03}/{}]  Motion: {:.3} | SSIM: {:.3} | Brightness: {:.1} | Status: {}",
            self.summary.frames_logged,
            self.options.max_rows,
            analysis.motion_ratio,
            analysis.ssim_score,
            analysis.mean_brightness,
            analysis.status
        );
        self.sink.record(&MetricsRecord::from(&analysis))?;

        Ok(Tick::Processed(analysis))
    }

    /// Ticks until `max_rows` frames are logged or Ctrl-C arrives.
    pub async fn run(mut self) -> Result<MonitorSummary> {
        let (width, height) = self.source.resolution();
        info!(
            "Starting background monitor at {}x{} (max {} frames, {:?} between frames)",
            width, height, self.options.max_rows, self.options.frame_delay
        );

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            if let Tick::Finished = self.tick()? {
                info!("Reached {} logged frames - stopping monitoring", self.options.max_rows);
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.frame_delay) => {}
                _ = &mut shutdown => {
                    info!("Interrupted - stopping monitoring");
                    break;
                }
            }
        }

        Ok(self.summary)
    }

    pub fn summary(&self) -> &MonitorSummary {
        &self.summary
    }

    pub fn detector(&self) -> &BackgroundChangeDetector {
        &self.detector
    }

    pub fn into_parts(self) -> (S, BackgroundChangeDetector, M) {
        (self.source, self.detector, self.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DetectorConfig;
    use image::{Rgb, RgbImage};
    use std::collections::VecDeque;

    struct ScriptedSource {
        frames: VecDeque<RgbImage>,
    }

    impl FrameSource for ScriptedSource {
        fn capture_frame(&mut self) -> Result<RgbImage> {
            self.frames.pop_front().context("script exhausted")
        }

        fn resolution(&self) -> (u32, u32) {
            (32, 24)
        }
    }

    fn monitor(frames: Vec<RgbImage>, max_rows: u64) -> BackgroundMonitor<ScriptedSource, Vec<MetricsRecord>> {
        let detector =
            BackgroundChangeDetector::with_clock(32, 24, DetectorConfig::default(), ManualClock::new()).unwrap();
        let options = MonitorOptions {
            max_rows,
            frame_delay: Duration::ZERO,
        };
        BackgroundMonitor::new(ScriptedSource { frames: frames.into() }, detector, Vec::new(), options)
    }

    #[tokio::test]
    async fn test_run_stops_after_max_rows() {
        let frames = vec![RgbImage::from_pixel(32, 24, Rgb([120, 120, 120])); 5];
        let monitor = monitor(frames, 3);

        let summary = monitor.run().await.unwrap();

        assert_eq!(summary.frames_logged, 3);
        assert_eq!(summary.status_counts.get(&Status::Initialising), Some(&1));
        assert_eq!(summary.status_counts.get(&Status::Normal), Some(&2));
    }

    #[test]
    fn test_mismatched_frame_is_skipped_not_logged() {
        let frames = vec![
            RgbImage::from_pixel(32, 24, Rgb([120, 120, 120])),
            RgbImage::from_pixel(64, 48, Rgb([120, 120, 120])),
            RgbImage::from_pixel(32, 24, Rgb([20, 20, 20])),
        ];
        let mut monitor = monitor(frames, 10);

        assert!(matches!(monitor.tick().unwrap(), Tick::Processed(_)));
        assert!(matches!(monitor.tick().unwrap(), Tick::Skipped));
        match monitor.tick().unwrap() {
            Tick::Processed(analysis) => assert_eq!(analysis.status, Status::LightingDropOrCameraBlocked),
            other => panic!("unexpected tick {:?}", other),
        }

        assert_eq!(monitor.summary().frames_skipped, 1);
        let (_, _, records) = monitor.into_parts();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].mean_brightness, 20.0);
    }

    #[test]
    fn test_capture_failure_is_an_error() {
        let mut monitor = monitor(Vec::new(), 10);
        assert!(monitor.tick().is_err());
    }
}
