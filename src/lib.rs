pub mod background_model;
pub mod cli;
pub mod clock;
pub mod config;
pub mod detector;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod optical_flow;
pub mod similarity;
pub mod webcam;

pub use config::DetectorConfig;
pub use detector::{BackgroundChangeDetector, FrameAnalysis, Status};
pub use error::DetectorError;
