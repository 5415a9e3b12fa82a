//! Frame-difference motion metric.
//!
//! Only the green channel is compared; it carries half the sensor's Bayer
//! sites and is the least noisy of the three.

use image::{ImageError, RgbImage};
use log::debug;

pub const MOTION_CHANNEL: usize = 1;

/// Count pixels whose green value moved by more than `threshold`.
/// Returns `None` when the frames differ in size.
pub fn changed_pixels(baseline: &RgbImage, frame: &RgbImage, threshold: u8) -> Option<u32> {
    if baseline.dimensions() != frame.dimensions() {
        return None;
    }
    let changed = baseline
        .pixels()
        .zip(frame.pixels())
        .filter(|(a, b)| a.0[MOTION_CHANNEL].abs_diff(b.0[MOTION_CHANNEL]) > threshold)
        .count();
    Some(changed as u32)
}

pub fn decode_frame(bytes: &[u8]) -> Result<RgbImage, ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionReading {
    /// `None` on the first frame or after a size change.
    pub changed: Option<u32>,
    pub motion: bool,
}

/// Keeps the previous low-resolution frame as the comparison baseline.
#[derive(Debug, Clone)]
pub struct MotionDetector {
    baseline: Option<RgbImage>,
    threshold: u8,
    sensitivity: u32,
}

impl MotionDetector {
    pub fn new(threshold: u8, sensitivity: u32) -> Self {
        Self {
            baseline: None,
            threshold,
            sensitivity,
        }
    }

    /// Compare `frame` with the baseline, then make it the new baseline.
    pub fn observe(&mut self, frame: RgbImage) -> MotionReading {
        let changed = self
            .baseline
            .as_ref()
            .and_then(|baseline| changed_pixels(baseline, &frame, self.threshold));
        if let Some(count) = changed {
            debug!("changed pixels = {}", count);
        }
        self.baseline = Some(frame);
        MotionReading {
            changed,
            motion: changed.is_some_and(|count| count > self.sensitivity),
        }
    }

    pub fn observe_bytes(&mut self, bytes: &[u8]) -> Result<MotionReading, ImageError> {
        Ok(self.observe(decode_frame(bytes)?))
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb};
    use std::io::Cursor;

    fn flat(w: u32, h: u32, green: u8) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([0, green, 0]))
    }

    #[test]
    fn threshold_is_exclusive() {
        let base = flat(4, 4, 100);
        assert_eq!(changed_pixels(&base, &flat(4, 4, 110), 10), Some(0));
        assert_eq!(changed_pixels(&base, &flat(4, 4, 111), 10), Some(16));
        assert_eq!(changed_pixels(&base, &flat(4, 4, 89), 10), Some(16));
    }

    #[test]
    fn only_green_counts() {
        let base = flat(2, 2, 50);
        let frame = RgbImage::from_pixel(2, 2, Rgb([255, 50, 255]));
        assert_eq!(changed_pixels(&base, &frame, 0), Some(0));
    }

    #[test]
    fn size_mismatch_reports_nothing() {
        assert_eq!(changed_pixels(&flat(4, 4, 0), &flat(4, 3, 0), 10), None);
    }

    #[test]
    fn detector_needs_a_baseline() {
        let mut detector = MotionDetector::new(10, 3);
        let first = detector.observe(flat(2, 2, 0));
        assert_eq!(first, MotionReading { changed: None, motion: false });
        assert!(detector.has_baseline());

        let mut frame = flat(2, 2, 0);
        for (x, y) in [(0, 0), (1, 0), (0, 1)] {
            frame.put_pixel(x, y, Rgb([0, 200, 0]));
        }
        let three = detector.observe(frame.clone());
        assert_eq!(three.changed, Some(3));
        assert!(!three.motion, "sensitivity is exclusive");

        frame.put_pixel(1, 1, Rgb([0, 200, 0]));
        let still = detector.observe(frame);
        assert_eq!(still.changed, Some(1));
    }

    #[test]
    fn decodes_bmp_frames() {
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(flat(100, 75, 42))
            .write_to(&mut bytes, ImageFormat::Bmp)
            .unwrap();

        let mut detector = MotionDetector::new(10, 30);
        detector.observe_bytes(bytes.get_ref()).unwrap();
        let reading = detector.observe(flat(100, 75, 200));
        assert_eq!(reading.changed, Some(7500));
        assert!(reading.motion);
    }
}
