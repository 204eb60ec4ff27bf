use crate::config::DetectorConfig;
use crate::monitor::MonitorOptions;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "background-monitor")]
#[command(about = "Watches a webcam for background changes, lighting drops and movement")]
#[command(long_about = "Captures webcam frames, fuses dense optical flow, a KNN foreground mask and periodic SSIM against an adaptive reference frame into a per-frame status, and appends the metrics to a CSV log.")]
pub struct Args {
    #[arg(
        short = 'd',
        long = "device",
        default_value = "/dev/video0",
        help = "Video device path or camera index"
    )]
    pub device: String,

    #[arg(
        short = 'w',
        long = "width",
        default_value = "640",
        help = "Session frame width in pixels"
    )]
    pub width: u32,

    #[arg(
        long = "height",
        default_value = "480",
        help = "Session frame height in pixels"
    )]
    pub height: u32,

    #[arg(
        short = 'c',
        long = "config",
        help = "TOML file with detector thresholds"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long = "ssim-interval",
        help = "Seconds between SSIM checks (overrides the config file)"
    )]
    pub ssim_interval: Option<f64>,

    #[arg(
        long = "max-rows",
        default_value = "10000",
        help = "Stop after logging this many frames"
    )]
    pub max_rows: u64,

    #[arg(
        long = "frame-delay-ms",
        default_value = "300",
        help = "Delay between processed frames in milliseconds"
    )]
    pub frame_delay_ms: u64,

    #[arg(
        short = 'm',
        long = "metrics",
        default_value = "ResultsLog.csv",
        help = "CSV file the per-frame metrics are appended to"
    )]
    pub metrics: PathBuf,

    #[arg(
        long = "no-mask",
        help = "Skip the foreground mask computation"
    )]
    pub no_mask: bool,

    #[arg(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        help = "Increase verbosity level (use multiple times for more verbose output)"
    )]
    pub verbose: u8,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Config file (or defaults) with command-line overrides applied.
    pub fn detector_config(&self) -> Result<DetectorConfig> {
        let mut config = match &self.config {
            Some(path) => DetectorConfig::load(path)?,
            None => DetectorConfig::default(),
        };

        if let Some(interval) = self.ssim_interval {
            config.ssim_interval_secs = interval;
        }
        if self.no_mask {
            config.foreground.enabled = false;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            max_rows: self.max_rows,
            frame_delay: Duration::from_millis(self.frame_delay_ms),
        }
    }

    pub fn setup_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, FmtSubscriber};

        let level = match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };

        let subscriber = FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(level))
            )
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))
    }
}
