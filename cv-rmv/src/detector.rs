//! FAST and Harris corner detection on gray frames.
//!
//! The tracker talks to detectors through [`FeatureDetector`], so tests and applications can plug in
//! their own. [`RmvFeatureDetector`] is the built-in implementation for both [`DetectorType`]s.

use crate::settings::DetectorSettings;
use cv_core::nalgebra::Point2;
use cv_core::Box2;
use float_ord::FloatOrd;
use image::{imageops, GrayImage};
use log::*;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The kinds of 2D point features the tracker can work with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum DetectorType {
    Fast,
    Harris,
}

impl DetectorType {
    /// Returns `true` if frames should be smoothed before running the detector on them.
    pub fn needs_smoothed_frame(self) -> bool {
        matches!(self, DetectorType::Harris)
    }

    /// Returns `true` if a cold start should begin on a downsampled frame.
    pub fn needs_pyramid_initialization(self) -> bool {
        matches!(self, DetectorType::Harris)
    }
}

/// A 2D feature detector as used by the tracker.
///
/// Detections are returned strongest first.
pub trait FeatureDetector {
    fn detector_type(&self) -> DetectorType;

    /// The parameters of this detector, also used for detecting a target number of features.
    fn settings(&self) -> DetectorSettings {
        DetectorSettings::default()
    }

    /// Detects all features with a strength of at least `threshold`.
    ///
    /// If `region` is given only features inside of it are detected. Frames that are not undistorted
    /// lose the detections close to the frame border.
    fn detect(
        &self,
        frame: &GrayImage,
        threshold: f64,
        frame_is_undistorted: bool,
        region: Option<&Box2>,
    ) -> Vec<Point2<f64>>;

    /// Detects about `target` features by adjusting the threshold, starting at `threshold`.
    ///
    /// At most `target` features are returned.
    fn detect_with_target(
        &self,
        frame: &GrayImage,
        target: usize,
        threshold: f64,
        frame_is_undistorted: bool,
        region: Option<&Box2>,
    ) -> Vec<Point2<f64>> {
        let settings = self.settings();
        let mut threshold = threshold.clamp(1.0, 255.0);
        let mut step = (threshold / 4.0).max(1.0);
        let mut direction = 0.0;
        let mut features = self.detect(frame, threshold, frame_is_undistorted, region);
        for _ in 0..settings.max_threshold_adjustments {
            if features.len() >= target
                && features.len() as f64 <= target as f64 * settings.target_tolerance
            {
                break;
            }
            let next_direction = if features.len() < target { -1.0 } else { 1.0 };
            if direction != 0.0 && next_direction != direction {
                step = (step * 0.5).max(1.0);
            }
            direction = next_direction;
            let next_threshold = (threshold + direction * step).clamp(1.0, 255.0);
            if next_threshold == threshold {
                break;
            }
            threshold = next_threshold;
            features = self.detect(frame, threshold, frame_is_undistorted, region);
        }
        trace!(
            "detected {} features for a target of {} at threshold {}",
            features.len(),
            target,
            threshold
        );
        features.truncate(target);
        features
    }
}

/// FAST and Harris corners on 8 bit grayscale frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RmvFeatureDetector {
    detector_type: DetectorType,
    settings: DetectorSettings,
}

impl RmvFeatureDetector {
    pub fn new(detector_type: DetectorType) -> Self {
        Self::with_settings(detector_type, DetectorSettings::default())
    }

    pub fn with_settings(detector_type: DetectorType, settings: DetectorSettings) -> Self {
        Self {
            detector_type,
            settings,
        }
    }
}

/// The pixel window `[x0, x1) x [y0, y1)` covered by the region.
fn pixel_window(frame: &GrayImage, region: Option<&Box2>) -> Option<(u32, u32, u32, u32)> {
    let (width, height) = frame.dimensions();
    match region {
        _ if width == 0 || height == 0 => None,
        None => Some((0, 0, width, height)),
        Some(region) if !region.is_valid() => None,
        Some(region) => {
            let x0 = region.lower.x.floor().clamp(0.0, width as f64) as u32;
            let y0 = region.lower.y.floor().clamp(0.0, height as f64) as u32;
            let x1 = (region.upper.x.ceil() + 1.0).clamp(0.0, width as f64) as u32;
            let y1 = (region.upper.y.ceil() + 1.0).clamp(0.0, height as f64) as u32;
            if x1 > x0 && y1 > y0 {
                Some((x0, y0, x1, y1))
            } else {
                None
            }
        }
    }
}

/// Scores of a `width x height` window, row major, zero for no response.
struct ResponseMap {
    width: u32,
    height: u32,
    scores: Vec<f32>,
}

impl ResponseMap {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            scores: vec![0.0; (width * height) as usize],
        }
    }

    fn get(&self, x: u32, y: u32) -> f32 {
        self.scores[(y * self.width + x) as usize]
    }

    fn set(&mut self, x: u32, y: u32, score: f32) {
        self.scores[(y * self.width + x) as usize] = score;
    }

    /// Positive responses that dominate their 3x3 neighborhood, plateaus keep their first pixel.
    fn local_maxima(&self) -> Vec<(u32, u32, f32)> {
        let mut maxima = Vec::new();
        for y in 0..self.height {
            for x in 0..self.width {
                let score = self.get(x, y);
                if score <= 0.0 {
                    continue;
                }
                let mut is_maximum = true;
                'neighborhood: for ny in y.saturating_sub(1)..=(y + 1).min(self.height - 1) {
                    for nx in x.saturating_sub(1)..=(x + 1).min(self.width - 1) {
                        if (nx, ny) == (x, y) {
                            continue;
                        }
                        let other = self.get(nx, ny);
                        let earlier = (ny, nx) < (y, x);
                        if other > score || (earlier && other == score) {
                            is_maximum = false;
                            break 'neighborhood;
                        }
                    }
                }
                if is_maximum {
                    maxima.push((x, y, score));
                }
            }
        }
        maxima
    }
}

impl RmvFeatureDetector {
    fn fast_responses(&self, window: &GrayImage, threshold: f64) -> ResponseMap {
        let mut responses = ResponseMap::new(window.width(), window.height());
        // The FAST circle has a radius of three pixels.
        if window.width() < 7 || window.height() < 7 {
            return responses;
        }
        let threshold = threshold.clamp(1.0, 255.0) as u8;
        for corner in imageproc::corners::corners_fast9(window, threshold) {
            responses.set(corner.x, corner.y, corner.score.max(f32::MIN_POSITIVE));
        }
        responses
    }

    fn harris_responses(&self, window: &GrayImage, threshold: f64) -> ResponseMap {
        let (width, height) = window.dimensions();
        let mut responses = ResponseMap::new(width, height);
        if width < 5 || height < 5 {
            return responses;
        }
        let gx = imageproc::gradients::horizontal_sobel(window);
        let gy = imageproc::gradients::vertical_sobel(window);
        let products: Vec<[f64; 3]> = gx
            .pixels()
            .zip(gy.pixels())
            .map(|(dx, dy)| {
                let (dx, dy) = (dx[0] as f64 / 8.0, dy[0] as f64 / 8.0);
                [dx * dx, dy * dy, dx * dy]
            })
            .collect();
        let k = self.settings.harris_k;
        for y in 2..height - 2 {
            for x in 2..width - 2 {
                let mut tensor = [0.0; 3];
                for ny in y - 1..=y + 1 {
                    for nx in x - 1..=x + 1 {
                        let product = products[(ny * width + nx) as usize];
                        tensor[0] += product[0];
                        tensor[1] += product[1];
                        tensor[2] += product[2];
                    }
                }
                let determinant = tensor[0] * tensor[1] - tensor[2] * tensor[2];
                let trace = tensor[0] + tensor[1];
                let strength = (determinant - k * trace * trace).max(0.0).sqrt() / 16.0;
                if strength >= threshold && strength > 0.0 {
                    responses.set(x, y, strength as f32);
                }
            }
        }
        responses
    }
}

impl FeatureDetector for RmvFeatureDetector {
    fn detector_type(&self) -> DetectorType {
        self.detector_type
    }

    fn settings(&self) -> DetectorSettings {
        self.settings
    }

    fn detect(
        &self,
        frame: &GrayImage,
        threshold: f64,
        frame_is_undistorted: bool,
        region: Option<&Box2>,
    ) -> Vec<Point2<f64>> {
        let (x0, y0, x1, y1) = match pixel_window(frame, region) {
            Some(window) => window,
            None => return Vec::new(),
        };
        // The Harris window needs context around the region for its gradients.
        let margin = match self.detector_type {
            DetectorType::Fast => 3,
            DetectorType::Harris => 2,
        };
        let (cx0, cy0) = (x0.saturating_sub(margin), y0.saturating_sub(margin));
        let (cx1, cy1) = (
            (x1 + margin).min(frame.width()),
            (y1 + margin).min(frame.height()),
        );
        let window = imageops::crop_imm(frame, cx0, cy0, cx1 - cx0, cy1 - cy0).to_image();
        let responses = match self.detector_type {
            DetectorType::Fast => self.fast_responses(&window, threshold),
            DetectorType::Harris => self.harris_responses(&window, threshold),
        };

        let border = if frame_is_undistorted {
            0
        } else {
            self.settings.border_margin
        };
        let (width, height) = frame.dimensions();
        let mut features: Vec<(Point2<f64>, f32)> = responses
            .local_maxima()
            .into_iter()
            .map(|(x, y, score)| (x + cx0, y + cy0, score))
            .filter(|&(x, y, _)| x >= x0 && x < x1 && y >= y0 && y < y1)
            .filter(|&(x, y, _)| {
                x >= border && y >= border && x + border < width && y + border < height
            })
            .map(|(x, y, score)| (Point2::new(x as f64, y as f64), score))
            .collect();
        features.sort_by_key(|&(_, score)| std::cmp::Reverse(FloatOrd(score)));
        features.into_iter().map(|(point, _)| point).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::Point2;
    use image::Luma;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A dark frame with bright squares, every square has four corners.
    fn checker_frame() -> GrayImage {
        GrayImage::from_fn(160, 120, |x, y| {
            let inside = |cx: u32, cy: u32| x >= cx && x < cx + 20 && y >= cy && y < cy + 20;
            if inside(30, 30) || inside(100, 60) {
                Luma([220])
            } else {
                Luma([20])
            }
        })
    }

    #[test]
    fn detects_square_corners() {
        for detector_type in [DetectorType::Fast, DetectorType::Harris] {
            let detector = RmvFeatureDetector::new(detector_type);
            let features = detector.detect(&checker_frame(), 20.0, true, None);
            assert!(features.len() >= 8, "{:?} found {}", detector_type, features.len());
            for corner in [Point2::new(30.0, 30.0), Point2::new(119.0, 79.0)] {
                assert!(
                    features.iter().any(|feature| (feature - corner).norm() <= 3.0),
                    "{:?} misses {}",
                    detector_type,
                    corner
                );
            }
        }
    }

    #[test]
    fn region_restricts_detections() {
        let detector = RmvFeatureDetector::new(DetectorType::Harris);
        let region = Box2::new(Point2::new(90.0, 50.0), Point2::new(130.0, 90.0));
        let features = detector.detect(&checker_frame(), 20.0, true, Some(&region));
        assert!(!features.is_empty());
        assert!(features.iter().all(|feature| region.contains(feature)));
        assert!(detector.detect(&checker_frame(), 20.0, true, Some(&Box2::invalid())).is_empty());
    }

    #[test]
    fn degenerate_frames_yield_nothing() {
        let detector = RmvFeatureDetector::new(DetectorType::Fast);
        assert!(detector.detect(&GrayImage::new(0, 0), 10.0, false, None).is_empty());
        assert!(detector.detect(&GrayImage::new(3, 3), 10.0, false, None).is_empty());
        let flat = GrayImage::from_pixel(64, 48, Luma([128]));
        assert!(detector.detect(&flat, 10.0, false, None).is_empty());
    }

    #[test]
    fn target_mode_truncates() {
        let detector = RmvFeatureDetector::new(DetectorType::Harris);
        let features = detector.detect_with_target(&checker_frame(), 4, 20.0, true, None);
        assert_eq!(features.len(), 4);
        let all = detector.detect(&checker_frame(), 20.0, true, None);
        assert!(all.len() >= 4);
    }

    /// Finds nothing and counts how often it was asked.
    struct Counting {
        passes: AtomicUsize,
        settings: DetectorSettings,
    }

    impl FeatureDetector for Counting {
        fn detector_type(&self) -> DetectorType {
            DetectorType::Fast
        }

        fn settings(&self) -> DetectorSettings {
            self.settings
        }

        fn detect(&self, _: &GrayImage, _: f64, _: bool, _: Option<&Box2>) -> Vec<Point2<f64>> {
            self.passes.fetch_add(1, Ordering::Relaxed);
            Vec::new()
        }
    }

    #[test]
    fn target_mode_follows_detector_settings() {
        let passes = |max_threshold_adjustments| {
            let detector = Counting {
                passes: AtomicUsize::new(0),
                settings: DetectorSettings {
                    max_threshold_adjustments,
                    ..DetectorSettings::default()
                },
            };
            assert!(detector.detect_with_target(&checker_frame(), 10, 20.0, true, None).is_empty());
            detector.passes.load(Ordering::Relaxed)
        };
        assert_eq!(passes(2), 3);
        // The threshold reaches its lower bound of one after 20, 15, 10 and 5.
        assert_eq!(passes(8), 5);

        let settings = DetectorSettings {
            max_threshold_adjustments: 1,
            ..DetectorSettings::default()
        };
        assert_eq!(RmvFeatureDetector::with_settings(DetectorType::Fast, settings).settings(), settings);
    }
}
