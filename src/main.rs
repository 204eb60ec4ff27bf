use anyhow::{Context, Result};
use background_monitor::cli::Args;
use background_monitor::metrics::CsvMetricsLog;
use background_monitor::monitor::BackgroundMonitor;
use background_monitor::webcam::{FrameSource, WebcamCapture};
use background_monitor::BackgroundChangeDetector;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();
    args.setup_logging()?;

    info!("Starting background-monitor");

    if let Err(e) = run_application(args).await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run_application(args: Args) -> Result<()> {
    let config = args.detector_config()?;

    let webcam = WebcamCapture::new(Some(&args.device), args.width, args.height)
        .context("Failed to initialize webcam")?;
    let (width, height) = webcam.resolution();

    let detector = BackgroundChangeDetector::new(width, height, config)
        .context("Failed to create background detector")?;
    let metrics = CsvMetricsLog::open(&args.metrics)?;
    info!("Writing metrics to {:?}", metrics.path());

    let monitor = BackgroundMonitor::new(webcam, detector, metrics, args.monitor_options());
    let summary = monitor.run().await?;

    info!(
        "Logged {} frames ({} skipped)",
        summary.frames_logged, summary.frames_skipped
    );
    for (status, count) in &summary.status_counts {
        info!("  {}: {}", status, count);
    }

    Ok(())
}
