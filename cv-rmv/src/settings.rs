#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The tunable parameters of the tracker.
///
/// Pixel distances are given for a 640x480 camera and are scaled by the camera's resolution factor.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TrackerSettings {
    /// The detector threshold used for the first frame of a session
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_detector_threshold")
    )]
    pub detector_threshold: f64,
    /// The lowest threshold the adaptive detector threshold may reach
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_detector_threshold_min")
    )]
    pub detector_threshold_min: f64,
    /// The highest threshold the adaptive detector threshold may reach
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_detector_threshold_max")
    )]
    pub detector_threshold_max: f64,
    /// The amount the adaptive threshold changes after each frame
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_detector_threshold_step")
    )]
    pub detector_threshold_step: f64,
    /// The number of detections per frame the adaptive threshold aims for
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_detector_target_features")
    )]
    pub detector_target_features: usize,
    /// The threshold of the detector on the downsampled frame during pyramid initialization
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_pyramid_detector_threshold")
    )]
    pub pyramid_detector_threshold: f64,
    /// The maximal number of initialization points projected for every seed pose
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_pose_projection_features")
    )]
    pub max_pose_projection_features: usize,
    /// The number of elevation rings of the seed pose hemisphere
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_seed_rings"))]
    pub seed_rings: usize,
    /// The number of seed poses on each ring of the hemisphere
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_seed_poses_per_ring")
    )]
    pub seed_poses_per_ring: usize,
    /// The distance of the seed poses from the map center relative to the map diagonal
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_seed_distance_factor")
    )]
    pub seed_distance_factor: f64,
    /// Draws visible seed poses between 0.7 and 0.9 map diagonals from the map center instead of the hemisphere
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub random_seed_poses: bool,
    /// The number of best scoring seed poses refined during a cold start
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_cold_start_seed_poses")
    )]
    pub cold_start_seed_poses: usize,
    /// The maximal position change between two frames relative to the map diagonal, used with autoscaling
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_position_offset_factor")
    )]
    pub position_offset_factor: f64,
    /// The radius without other detections around a strong correspondence, in pixels
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_strong_empty_area_radius")
    )]
    pub strong_empty_area_radius: f64,
    /// The radius without other detections around a semi-strong correspondence, in pixels
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_semi_strong_empty_area_radius")
    )]
    pub semi_strong_empty_area_radius: f64,
    /// Semi-strong points are only classified if fewer strong points were found
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_minimal_strong_object_points")
    )]
    pub minimal_strong_object_points: usize,
    /// The rotation change in degrees to the predicted pose that triggers a third strong refinement pass
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_drift_angle_threshold")
    )]
    pub drift_angle_threshold: f64,
    /// Cold start seed poses further away from a prior orientation are skipped, in degrees
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_prior_orientation_tolerance")
    )]
    pub prior_orientation_tolerance: f64,
    /// The time budget of every random model variation round of a default cold start, in seconds
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_cold_start_timeout")
    )]
    pub cold_start_timeout: f64,
    /// The time budget of the first rounds of a pyramid cold start, in seconds
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_pyramid_timeout")
    )]
    pub pyramid_timeout: f64,
    /// The time budget of the last round of a pyramid cold start, in seconds
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_pyramid_final_timeout")
    )]
    pub pyramid_final_timeout: f64,
    /// The time budget of the rough pose strategy, doubled for its retry, in seconds
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_rough_pose_timeout")
    )]
    pub rough_pose_timeout: f64,
    /// The time budget of the sampling loop of the any-previous strategy, in seconds
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_any_previous_timeout")
    )]
    pub any_previous_timeout: f64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            detector_threshold: default_detector_threshold(),
            detector_threshold_min: default_detector_threshold_min(),
            detector_threshold_max: default_detector_threshold_max(),
            detector_threshold_step: default_detector_threshold_step(),
            detector_target_features: default_detector_target_features(),
            pyramid_detector_threshold: default_pyramid_detector_threshold(),
            max_pose_projection_features: default_max_pose_projection_features(),
            seed_rings: default_seed_rings(),
            seed_poses_per_ring: default_seed_poses_per_ring(),
            seed_distance_factor: default_seed_distance_factor(),
            random_seed_poses: false,
            cold_start_seed_poses: default_cold_start_seed_poses(),
            position_offset_factor: default_position_offset_factor(),
            strong_empty_area_radius: default_strong_empty_area_radius(),
            semi_strong_empty_area_radius: default_semi_strong_empty_area_radius(),
            minimal_strong_object_points: default_minimal_strong_object_points(),
            drift_angle_threshold: default_drift_angle_threshold(),
            prior_orientation_tolerance: default_prior_orientation_tolerance(),
            cold_start_timeout: default_cold_start_timeout(),
            pyramid_timeout: default_pyramid_timeout(),
            pyramid_final_timeout: default_pyramid_final_timeout(),
            rough_pose_timeout: default_rough_pose_timeout(),
            any_previous_timeout: default_any_previous_timeout(),
        }
    }
}

impl TrackerSettings {
    /// Moves the adaptive detector threshold one step towards the target detection count.
    ///
    /// Too few detections lower the threshold, enough detections raise it.
    pub fn adapt_detector_threshold(&self, threshold: f64, detections: usize) -> f64 {
        if detections < self.detector_target_features {
            (threshold - self.detector_threshold_step).max(self.detector_threshold_min)
        } else {
            (threshold + self.detector_threshold_step).min(self.detector_threshold_max)
        }
    }
}

/// The parameters of the built-in feature detectors.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DetectorSettings {
    /// Detections closer than this many pixels to the frame border are dropped for distorted frames
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_border_margin"))]
    pub border_margin: u32,
    /// The sensitivity factor `k` of the Harris response `det - k * trace^2`
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_harris_k"))]
    pub harris_k: f64,
    /// The maximal number of threshold adjustments when detecting a target number of features
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_threshold_adjustments")
    )]
    pub max_threshold_adjustments: usize,
    /// A detection count up to this factor times the target is accepted in target mode
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_target_tolerance")
    )]
    pub target_tolerance: f64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            border_margin: default_border_margin(),
            harris_k: default_harris_k(),
            max_threshold_adjustments: default_max_threshold_adjustments(),
            target_tolerance: default_target_tolerance(),
        }
    }
}

fn default_border_margin() -> u32 {
    4
}

fn default_harris_k() -> f64 {
    0.04
}

fn default_max_threshold_adjustments() -> usize {
    8
}

fn default_target_tolerance() -> f64 {
    1.1
}

fn default_detector_threshold() -> f64 {
    25.0
}

fn default_detector_threshold_min() -> f64 {
    5.0
}

fn default_detector_threshold_max() -> f64 {
    200.0
}

fn default_detector_threshold_step() -> f64 {
    5.0
}

fn default_detector_target_features() -> usize {
    400
}

fn default_pyramid_detector_threshold() -> f64 {
    55.0
}

fn default_max_pose_projection_features() -> usize {
    150
}

fn default_seed_rings() -> usize {
    12
}

fn default_seed_poses_per_ring() -> usize {
    12
}

fn default_seed_distance_factor() -> f64 {
    0.8
}

fn default_cold_start_seed_poses() -> usize {
    8
}

fn default_position_offset_factor() -> f64 {
    0.2
}

fn default_strong_empty_area_radius() -> f64 {
    10.0
}

fn default_semi_strong_empty_area_radius() -> f64 {
    6.0
}

fn default_minimal_strong_object_points() -> usize {
    30
}

fn default_drift_angle_threshold() -> f64 {
    2.5
}

fn default_prior_orientation_tolerance() -> f64 {
    60.0
}

fn default_cold_start_timeout() -> f64 {
    0.15
}

fn default_pyramid_timeout() -> f64 {
    0.01
}

fn default_pyramid_final_timeout() -> f64 {
    0.05
}

fn default_rough_pose_timeout() -> f64 {
    0.05
}

fn default_any_previous_timeout() -> f64 {
    0.01
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_threshold_stays_in_bounds() {
        let settings = TrackerSettings::default();
        let mut threshold = settings.detector_threshold;
        for _ in 0..100 {
            threshold = settings.adapt_detector_threshold(threshold, 0);
        }
        assert_eq!(threshold, settings.detector_threshold_min);
        for _ in 0..100 {
            threshold = settings.adapt_detector_threshold(threshold, 10_000);
        }
        assert_eq!(threshold, settings.detector_threshold_max);
        assert_eq!(settings.adapt_detector_threshold(25.0, 399), 20.0);
        assert_eq!(settings.adapt_detector_threshold(25.0, 400), 30.0);
    }
}
