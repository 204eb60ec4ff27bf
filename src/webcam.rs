use anyhow::Result;
use image::{imageops, ImageBuffer, Rgb, RgbImage};
use tracing::{debug, info, warn};

#[cfg(feature = "camera")]
use anyhow::Context;
#[cfg(feature = "camera")]
use nokhwa::{
    pixel_format::RgbFormat,
    utils::{CameraIndex, RequestedFormat, RequestedFormatType},
    Camera,
};

/// Anything that can hand the monitor one frame per tick.
pub trait FrameSource {
    fn capture_frame(&mut self) -> Result<ImageBuffer<Rgb<u8>, Vec<u8>>>;

    fn resolution(&self) -> (u32, u32);
}

/// Webcam capture resized to a fixed session resolution.
///
/// Without the `camera` feature, or when the device cannot be opened, this
/// serves a simulated feed so the monitor can still run.
pub struct WebcamCapture {
    #[cfg(feature = "camera")]
    camera: Option<Camera>,
    width: u32,
    height: u32,
    frame_count: u32,
    simulated: bool,
}

impl WebcamCapture {
    pub fn new(device_path: Option<&str>, width: u32, height: u32) -> Result<Self> {
        let device = device_path.unwrap_or("/dev/video0");

        #[cfg(feature = "camera")]
        {
            match Self::try_create_camera(device) {
                Ok(camera) => {
                    info!("Successfully opened webcam device: {} (resizing to {}x{})", device, width, height);
                    return Ok(Self {
                        camera: Some(camera),
                        width,
                        height,
                        frame_count: 0,
                        simulated: false,
                    });
                }
                Err(e) => {
                    warn!("Failed to open webcam device {}: {} - falling back to simulated camera feed", device, e);
                    debug!("Camera initialization failed due to: {:?}", e);
                }
            }
        }

        #[cfg(not(feature = "camera"))]
        info!("Built without camera support, using simulated feed instead of {}", device);

        Ok(Self::simulated(width, height))
    }

    pub fn simulated(width: u32, height: u32) -> Self {
        Self {
            #[cfg(feature = "camera")]
            camera: None,
            width,
            height,
            frame_count: 0,
            simulated: true,
        }
    }

    #[cfg(feature = "camera")]
    fn try_create_camera(device_path: &str) -> Result<Camera> {
        let index = if device_path.starts_with("/dev/video") {
            let num_str = device_path.strip_prefix("/dev/video").unwrap_or("0");
            CameraIndex::Index(num_str.parse().unwrap_or(0))
        } else {
            CameraIndex::Index(device_path.parse().unwrap_or(0))
        };

        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);

        let mut camera = Camera::new(index, requested)
            .context("Failed to create camera")?;

        camera.open_stream()
            .context("Failed to open camera stream")?;

        Ok(camera)
    }

    #[cfg(feature = "camera")]
    fn capture_real_frame(camera: &mut Camera) -> Result<RgbImage> {
        let frame = camera.frame()
            .context("Failed to capture camera frame")?;

        let rgb_data = frame.decode_image::<RgbFormat>()
            .context("Failed to decode camera frame")?;

        let resolution = camera.resolution();
        let buffer = ImageBuffer::from_raw(resolution.width(), resolution.height(), rgb_data.into_raw())
            .context("Failed to create image buffer from camera data")?;

        Ok(buffer)
    }

    fn generate_simulated_frame(&self) -> RgbImage {
        let mut buffer = RgbImage::new(self.width, self.height);

        let time_factor = (self.frame_count as f32 * 0.1).sin();
        let base_color = ((time_factor * 127.0 + 128.0) as u8).clamp(50, 200);

        for (x, y, pixel) in buffer.enumerate_pixels_mut() {
            let distance_from_center = (
                (x as f32 - self.width as f32 / 2.0).powi(2) +
                (y as f32 - self.height as f32 / 2.0).powi(2)
            ).sqrt() / (self.width as f32 / 2.0);

            let fade = (1.0 - distance_from_center.clamp(0.0, 1.0)) * 255.0;

            *pixel = Rgb([
                (base_color as f32 * fade / 255.0) as u8,
                ((base_color as f32 + 50.0) * fade / 255.0).min(255.0) as u8,
                ((base_color as f32 + 100.0) * fade / 255.0).min(255.0) as u8,
            ]);
        }

        buffer
    }

    fn fit_to_session(&self, frame: RgbImage) -> RgbImage {
        if frame.dimensions() == (self.width, self.height) {
            return frame;
        }
        imageops::resize(&frame, self.width, self.height, imageops::FilterType::Triangle)
    }

    pub fn stop(&mut self) -> Result<()> {
        #[cfg(feature = "camera")]
        {
            if let Some(camera) = &mut self.camera {
                camera.stop_stream()
                    .context("Failed to stop camera stream")?;
                info!("Real camera stream stopped");
                return Ok(());
            }
        }

        info!("Simulated camera stream stopped");
        Ok(())
    }

    pub fn is_simulated(&self) -> bool {
        self.simulated
    }
}

impl FrameSource for WebcamCapture {
    fn capture_frame(&mut self) -> Result<RgbImage> {
        self.frame_count += 1;

        #[cfg(feature = "camera")]
        {
            if let Some(camera) = self.camera.as_mut() {
                match Self::capture_real_frame(camera) {
                    Ok(frame) => {
                        debug!("Captured real frame {}", self.frame_count);
                        return Ok(self.fit_to_session(frame));
                    }
                    Err(e) => {
                        warn!("Failed to capture real frame: {}, falling back to simulation", e);
                        self.camera = None;
                        self.simulated = true;
                    }
                }
            }
        }

        let buffer = self.generate_simulated_frame();
        debug!("Generated simulated frame {}: {}x{}", self.frame_count, self.width, self.height);
        Ok(self.fit_to_session(buffer))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for WebcamCapture {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop camera during drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_feed_matches_resolution() {
        let mut webcam = WebcamCapture::simulated(64, 48);
        let frame = webcam.capture_frame().unwrap();
        assert_eq!(frame.dimensions(), (64, 48));
        assert_eq!(webcam.resolution(), (64, 48));
        assert!(webcam.is_simulated());
    }

    #[test]
    fn test_simulated_feed_changes_over_time() {
        let mut webcam = WebcamCapture::simulated(32, 32);
        let first = webcam.capture_frame().unwrap();
        let second = webcam.capture_frame().unwrap();
        assert_ne!(first.get_pixel(16, 16), second.get_pixel(16, 16));
    }

    #[test]
    fn test_fit_to_session_resizes_foreign_frames() {
        let webcam = WebcamCapture::simulated(64, 48);
        let resized = webcam.fit_to_session(RgbImage::new(128, 96));
        assert_eq!(resized.dimensions(), (64, 48));
    }
}
