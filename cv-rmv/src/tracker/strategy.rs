//! The strategies the tracker tries, in order, to determine the pose of a frame.

use super::TrackerCore;
use crate::correspondences::{determine_nearest_candidates, determine_nearest_candidates_if};
use crate::feature_map::RmvFeatureMap;
use crate::frame;
use crate::random_model_variation::{
    optimized_pose_with_one_initial_pose_if, optimized_pose_with_several_initial_poses_if,
    ErrorDetermination, VariationResult, VariationTarget,
};
use crate::randomized_pose::top_down_poses;
use crate::spatial::{determine_nearest_neighbor, determine_neighbors, distribute_to_array};
use crate::worker::Worker;
use cv_core::nalgebra::{Point2, Point3, UnitQuaternion, Vector3};
use cv_core::{Box2, CameraModel, CameraPose, Pose, WorldToCamera};
use cv_optimize::{optimize_pose_if, Estimator};
use cv_pinhole::PinholeCamera;
use image::GrayImage;
use log::*;
use rand::Rng;
use std::time::{Duration, Instant};

/// With a prediction, frames with fewer detections are not tracked at all.
const MIN_PREDICTED_DETECTIONS: usize = 10;
/// A cold start needs at least this many detections.
const MIN_COLD_START_DETECTIONS: usize = 20;

/// The ways a frame pose can be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingStrategy {
    /// Re-identifies the strong points of the previous frame around the predicted pose.
    StrongPrevious,
    /// Samples minimal sets among the previously used points near their predicted projections.
    AnyPrevious,
    /// Varies the predicted pose randomly until the map matches the detections.
    RoughPose,
    /// Starts without prior on a downsampled frame, used for detectors that need a multi-resolution start.
    ColdStartPyramid,
    /// Starts without prior on the full frame.
    ColdStartDefault,
}

impl TrackingStrategy {
    /// All strategies in the order they are attempted.
    pub const CASCADE: [TrackingStrategy; 5] = [
        TrackingStrategy::StrongPrevious,
        TrackingStrategy::AnyPrevious,
        TrackingStrategy::RoughPose,
        TrackingStrategy::ColdStartPyramid,
        TrackingStrategy::ColdStartDefault,
    ];

    /// Returns `true` for the strategies that start from the pose predicted by the motion model.
    pub fn needs_prediction(self) -> bool {
        matches!(
            self,
            TrackingStrategy::StrongPrevious | TrackingStrategy::AnyPrevious | TrackingStrategy::RoughPose
        )
    }

    pub fn is_cold_start(self) -> bool {
        !self.needs_prediction()
    }

    fn can_attempt(self, context: &FrameContext<'_>, frame: &FrameState) -> bool {
        let feature_map = context.feature_map;
        let has_prediction = frame.prediction.is_some();
        match self {
            TrackingStrategy::StrongPrevious => {
                let strong = feature_map.recent_strong_object_point_indices().len();
                let semi_strong = feature_map.recent_semi_strong_object_point_indices().len();
                has_prediction && strong >= 5 && strong + semi_strong >= 20
            }
            TrackingStrategy::AnyPrevious => {
                has_prediction
                    && frame.image_points.len() >= 30
                    && feature_map.recent_used_object_point_indices().len() >= 30
            }
            TrackingStrategy::RoughPose => has_prediction,
            TrackingStrategy::ColdStartPyramid => feature_map
                .initialization_detector_type()
                .needs_pyramid_initialization(),
            TrackingStrategy::ColdStartDefault => !feature_map
                .initialization_detector_type()
                .needs_pyramid_initialization(),
        }
    }
}

/// Everything known about the frame being tracked.
pub(crate) struct FrameContext<'a> {
    pub feature_map: &'a RmvFeatureMap,
    pub gray: &'a GrayImage,
    /// The gray frame prepared for the tracker's detector.
    pub detection_frame: &'a GrayImage,
    pub camera: &'a PinholeCamera,
    pub frame_is_undistorted: bool,
    pub prior_orientation: Option<UnitQuaternion<f64>>,
    pub worker: Option<&'a Worker>,
}

/// The state passed from one strategy to the next.
struct FrameState {
    prediction: Option<CameraPose>,
    /// Detections of the frame, strongest first.
    image_points: Vec<Point2<f64>>,
}

/// A successfully tracked frame.
pub(crate) struct Tracked {
    pub pose_if: WorldToCamera,
    pub image_points: Vec<Point2<f64>>,
    pub strategy: TrackingStrategy,
}

fn variation_target(
    valid_correspondences: usize,
    error_determination: ErrorDetermination,
    max_pixel_error: f64,
    max_translation: f64,
    max_rotation_degrees: f64,
    timeout: f64,
) -> VariationTarget {
    VariationTarget {
        valid_correspondences,
        error_determination,
        max_sqr_error: max_pixel_error * max_pixel_error,
        max_translation,
        max_rotation: max_rotation_degrees.to_radians(),
        timeout: Duration::from_secs_f64(timeout.max(0.0)),
    }
}

/// The point pairs of a variation result.
fn corresponding_points(
    result: &VariationResult,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
) -> (Vec<Point3<f64>>, Vec<Point2<f64>>) {
    result
        .correspondences
        .iter()
        .map(|&(image_index, object_index)| (object_points[object_index], image_points[image_index]))
        .unzip()
}

/// Optimizes with a Huber estimator first and removes the outliers with a Tukey estimator afterwards.
fn optimize_huber_tukey_if(
    camera: &PinholeCamera,
    pose_if: &WorldToCamera,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    huber_iterations: usize,
    tukey_iterations: usize,
) -> Option<WorldToCamera> {
    let huber = optimize_pose_if(
        camera,
        pose_if,
        object_points,
        image_points,
        Estimator::Huber,
        huber_iterations,
    )?;
    let tukey = optimize_pose_if(
        camera,
        &huber.pose,
        object_points,
        image_points,
        Estimator::Tukey,
        tukey_iterations,
    )?;
    Some(tukey.pose)
}

/// Matches the strongest image points with the projections of the strongest object points and
/// optimizes the pose with the unambiguous matches.
///
/// Returns the pose and the number of matches used.
#[allow(clippy::too_many_arguments)]
fn refine_pose_if(
    rough_pose_if: &WorldToCamera,
    camera: &PinholeCamera,
    image_points: &[Point2<f64>],
    object_points: &[Point3<f64>],
    use_image_points: usize,
    use_object_points: usize,
    search_window: f64,
    uniqueness_sqr_factor: f64,
    max_sqr_distance: f64,
) -> Option<(WorldToCamera, usize)> {
    let image_points = &image_points[..use_image_points.min(image_points.len())];
    let object_points = &object_points[..use_object_points.min(object_points.len())];
    if image_points.len() < 10 || object_points.len() < 10 {
        return None;
    }
    let (matched_object_points, matched_image_points): (Vec<Point3<f64>>, Vec<Point2<f64>>) =
        determine_nearest_candidates_if(rough_pose_if, camera, image_points, object_points, false, search_window)
            .into_iter()
            .filter(|correspondence| {
                correspondence.is_unambiguous_and_accurate(uniqueness_sqr_factor, max_sqr_distance)
            })
            .map(|correspondence| {
                (
                    object_points[correspondence.candidate_index],
                    image_points[correspondence.index],
                )
            })
            .unzip();
    if matched_image_points.len() < 5 {
        return None;
    }
    let pose_if = optimize_huber_tukey_if(
        camera,
        rough_pose_if,
        &matched_object_points,
        &matched_image_points,
        5,
        5,
    )?;
    Some((pose_if, matched_image_points.len()))
}

/// Adds the object points whose projection has one unambiguous image point nearby, with that image point.
fn add_unique_correspondences_if(
    rough_pose_if: &WorldToCamera,
    camera: &PinholeCamera,
    image_points: &[Point2<f64>],
    object_points: &[Point3<f64>],
    search_window: f64,
    uniqueness_sqr_factor: f64,
    matched_object_points: &mut Vec<Point3<f64>>,
    matched_image_points: &mut Vec<Point2<f64>>,
) {
    let visible: Vec<Point3<f64>> = object_points
        .iter()
        .filter(|point| rough_pose_if.is_in_front(point))
        .copied()
        .collect();
    let projected = camera.project_all_to_image_if(rough_pose_if, &visible, false);
    for correspondence in determine_nearest_candidates(&projected, image_points, search_window) {
        if correspondence.is_unambiguous(uniqueness_sqr_factor) {
            matched_object_points.push(visible[correspondence.index]);
            matched_image_points.push(image_points[correspondence.candidate_index]);
        }
    }
}

/// Returns `true` if the pose moved further than `offset` along any axis.
fn exceeds_offset(pose: &CameraPose, prediction: &CameraPose, offset: &Vector3<f64>) -> bool {
    let moved = pose.position() - prediction.position();
    moved.iter().zip(offset.iter()).any(|(moved, offset)| moved.abs() > *offset)
}

impl TrackerCore {
    /// Detects features with the adaptive threshold and moves the threshold towards the detection target.
    fn detect_features(&mut self, context: &FrameContext<'_>, region: Option<&Box2>) -> Vec<Point2<f64>> {
        let image_points = self.detector.detect(
            context.detection_frame,
            self.detector_threshold,
            context.frame_is_undistorted,
            region,
        );
        self.detector_threshold = self
            .settings
            .adapt_detector_threshold(self.detector_threshold, image_points.len());
        trace!(
            "detected {} features, detector threshold is now {}",
            image_points.len(),
            self.detector_threshold
        );
        image_points
    }

    /// Detects features where the map is expected to be seen from `pose`.
    fn detect_features_around(&mut self, context: &FrameContext<'_>, pose: &CameraPose) -> Vec<Point2<f64>> {
        let region = context
            .camera
            .project_box_to_image(pose, context.feature_map.bounding_box(), false);
        self.detect_features(context, region.is_valid().then_some(&region))
    }

    /// Runs the strategy cascade on a frame.
    pub(crate) fn track(&mut self, context: &FrameContext<'_>, prediction: Option<CameraPose>) -> Option<Tracked> {
        let mut frame = FrameState {
            prediction,
            image_points: Vec::new(),
        };
        if let Some(prediction) = prediction {
            frame.image_points = self.detect_features_around(context, &prediction);
            if frame.image_points.len() < MIN_PREDICTED_DETECTIONS {
                debug!(
                    "only {} features detected around the predicted pose",
                    frame.image_points.len()
                );
                return None;
            }
        }

        for strategy in TrackingStrategy::CASCADE {
            if !strategy.can_attempt(context, &frame) {
                continue;
            }
            trace!("attempting {:?}", strategy);
            let pose_if = match self.attempt(strategy, context, &mut frame) {
                Some(pose_if) => pose_if,
                None => {
                    debug!("{:?} failed", strategy);
                    continue;
                }
            };
            if let (Some(prediction), Some(offset)) = (frame.prediction, self.max_position_offset) {
                let pose = CameraPose::from_inverted_flipped(pose_if);
                if strategy.needs_prediction() && exceeds_offset(&pose, &prediction, &offset) {
                    debug!(
                        "{:?} moved the camera by {} which is more than allowed",
                        strategy,
                        (pose.position() - prediction.position()).norm()
                    );
                    continue;
                }
            }
            return Some(Tracked {
                pose_if,
                image_points: frame.image_points,
                strategy,
            });
        }
        None
    }

    fn attempt(
        &mut self,
        strategy: TrackingStrategy,
        context: &FrameContext<'_>,
        frame: &mut FrameState,
    ) -> Option<WorldToCamera> {
        match strategy {
            TrackingStrategy::StrongPrevious => {
                let prediction = frame.prediction?;
                self.strong_previous(context, &prediction.to_inverted_flipped(), &frame.image_points)
            }
            TrackingStrategy::AnyPrevious => {
                let prediction = frame.prediction?;
                self.any_previous(context, &prediction.to_inverted_flipped(), &frame.image_points)
            }
            TrackingStrategy::RoughPose => {
                let prediction = frame.prediction?;
                self.rough_pose(context, &prediction.to_inverted_flipped(), &frame.image_points)
            }
            TrackingStrategy::ColdStartPyramid => {
                let cold_pose_if = self.cold_start_pyramid(context)?;
                let cold_pose = CameraPose::from_inverted_flipped(cold_pose_if);
                frame.image_points = self.detect_features_around(context, &cold_pose);
                self.rough_pose(context, &cold_pose_if, &frame.image_points)
            }
            TrackingStrategy::ColdStartDefault => {
                if frame.image_points.is_empty() {
                    frame.image_points = self.detect_features(context, None);
                }
                self.cold_start_default(context, &frame.image_points)
            }
        }
    }

    /// Re-identifies the strong and semi-strong points of the previous frame and refines against the whole map.
    fn strong_previous(
        &mut self,
        context: &FrameContext<'_>,
        rough_pose_if: &WorldToCamera,
        image_points: &[Point2<f64>],
    ) -> Option<WorldToCamera> {
        let feature_map = context.feature_map;
        let camera = context.camera;
        let resolution_factor = camera.resolution_factor();
        let object_points = feature_map.object_points();
        let strong: Vec<Point3<f64>> = feature_map
            .recent_strong_object_point_indices()
            .iter()
            .map(|&index| object_points[index])
            .collect();
        if strong.len() < 5 || image_points.len() < 10 {
            return None;
        }

        let mut matched_object_points = Vec::new();
        let mut matched_image_points = Vec::new();
        add_unique_correspondences_if(
            rough_pose_if,
            camera,
            &image_points[..image_points.len().min(200)],
            &strong,
            self.settings.strong_empty_area_radius * resolution_factor,
            4.0 * 4.0,
            &mut matched_object_points,
            &mut matched_image_points,
        );
        let semi_strong = feature_map.recent_semi_strong_object_point_indices();
        if matched_object_points.len() <= 10 && !semi_strong.is_empty() {
            let semi_strong: Vec<Point3<f64>> = semi_strong.iter().map(|&index| object_points[index]).collect();
            add_unique_correspondences_if(
                rough_pose_if,
                camera,
                &image_points[..image_points.len().min(300)],
                &semi_strong,
                self.settings.semi_strong_empty_area_radius * resolution_factor,
                2.5 * 2.5,
                &mut matched_object_points,
                &mut matched_image_points,
            );
        }
        if matched_object_points.len() < 5 {
            return None;
        }
        trace!("re-identified {} previous points", matched_object_points.len());

        let pose_if = optimize_huber_tukey_if(
            camera,
            rough_pose_if,
            &matched_object_points,
            &matched_image_points,
            10,
            5,
        )?;

        let (pose_if, first) = refine_pose_if(
            &pose_if,
            camera,
            image_points,
            object_points,
            200,
            400,
            10.0 * resolution_factor,
            30.0 * 30.0,
            f64::MAX,
        )?;
        if first <= 5 {
            return None;
        }
        let (pose_if, second) = refine_pose_if(
            &pose_if,
            camera,
            image_points,
            object_points,
            400,
            600,
            4.0 * resolution_factor,
            2.0 * 2.0,
            f64::MAX,
        )?;
        if second <= 20 {
            return None;
        }

        let drift = rough_pose_if.rotation_angle_to(pose_if);
        if second < 150 || drift > self.settings.drift_angle_threshold.to_radians() {
            trace!(
                "third refinement with {} correspondences and a drift of {} degrees",
                second,
                drift.to_degrees()
            );
            let (pose_if, third) = refine_pose_if(
                &pose_if,
                camera,
                image_points,
                object_points,
                800,
                1000,
                4.0 * resolution_factor,
                1.5 * 1.5,
                f64::MAX,
            )?;
            return (third > 30).then_some(pose_if);
        }
        Some(pose_if)
    }

    /// Samples minimal correspondence sets among the previously used points and their nearby detections.
    fn any_previous(
        &mut self,
        context: &FrameContext<'_>,
        rough_pose_if: &WorldToCamera,
        image_points: &[Point2<f64>],
    ) -> Option<WorldToCamera> {
        const MODEL_SIZE: usize = 3;
        let feature_map = context.feature_map;
        let camera = context.camera;
        let used_count = feature_map.recent_used_object_point_indices().len().min(50);
        let search_image_points = &image_points[..image_points.len().min(100)];
        if image_points.len() < 30 || used_count < 10 {
            return None;
        }

        let used_object_points = feature_map.recent_used_object_points(used_count);
        let bins = (camera.width().min(camera.height()) / 10).max(1) as usize;
        let distribution = distribute_to_array(
            search_image_points,
            0.0,
            0.0,
            camera.width() as f64,
            camera.height() as f64,
            bins,
            bins,
        );
        let neighbor_groups: Vec<Vec<usize>> = used_object_points
            .iter()
            .map(|point| {
                if rough_pose_if.is_in_front(point) {
                    let projected = camera.project_to_image_if(rough_pose_if, point, false);
                    determine_neighbors(&projected, search_image_points, 3.0, &distribution)
                } else {
                    Vec::new()
                }
            })
            .collect();

        let mut best_pose_if = *rough_pose_if;
        let mut best_pairs: Vec<(usize, usize)> = Vec::new();
        let mut best_error = f64::MAX;
        let deadline = Instant::now() + Duration::from_secs_f64(self.settings.any_previous_timeout.max(0.0));
        let mut iterations = 0usize;
        loop {
            iterations += 1;
            let mut selected = vec![false; used_count];
            let mut sample_objects = Vec::with_capacity(MODEL_SIZE);
            let mut sample_images = Vec::with_capacity(MODEL_SIZE);
            for _ in 0..used_count {
                let candidate = self.rng.gen_range(0..used_count);
                if selected[candidate] {
                    continue;
                }
                let neighbors = &neighbor_groups[candidate];
                if !neighbors.is_empty() {
                    selected[candidate] = true;
                    let neighbor = neighbors[self.rng.gen_range(0..neighbors.len())];
                    sample_objects.push(used_object_points[candidate]);
                    sample_images.push(search_image_points[neighbor]);
                }
                if sample_objects.len() >= MODEL_SIZE {
                    break;
                }
            }

            if sample_objects.len() >= MODEL_SIZE {
                if let Some(optimized) = optimize_pose_if(
                    camera,
                    rough_pose_if,
                    &sample_objects,
                    &sample_images,
                    Estimator::Square,
                    20,
                ) {
                    let mut pairs = Vec::new();
                    let mut error = 0.0;
                    for (object_index, point) in used_object_points.iter().enumerate() {
                        if !optimized.pose.is_in_front(point) {
                            continue;
                        }
                        let projected = camera.project_to_image_if(&optimized.pose, point, false);
                        if let Some((image_index, sqr_distance)) =
                            determine_nearest_neighbor(&projected, search_image_points, 2.5, &distribution)
                        {
                            error += sqr_distance;
                            pairs.push((object_index, image_index));
                        }
                    }
                    if pairs.len() > best_pairs.len() || (pairs.len() == best_pairs.len() && error < best_error) {
                        best_pose_if = optimized.pose;
                        best_pairs = pairs;
                        best_error = error;
                    }
                }
            }

            if best_pairs.len() >= used_count * 70 / 100 || Instant::now() >= deadline {
                break;
            }
        }
        trace!(
            "any previous sampling found {} of {} points after {} iterations",
            best_pairs.len(),
            used_count,
            iterations
        );
        if best_pairs.len() < 5 {
            return None;
        }

        let (objects, images): (Vec<Point3<f64>>, Vec<Point2<f64>>) = best_pairs
            .iter()
            .map(|&(object_index, image_index)| (used_object_points[object_index], search_image_points[image_index]))
            .unzip();
        let pose_if = optimize_pose_if(camera, &best_pose_if, &objects, &images, Estimator::Square, 30)?.pose;

        let all_used_object_points = feature_map.recent_used_object_points(usize::MAX);
        let (pose_if, first) = refine_pose_if(
            &pose_if,
            camera,
            image_points,
            &all_used_object_points,
            150,
            100,
            5.0,
            3.0 * 3.0,
            1.5 * 1.5,
        )?;
        if first < 10 {
            return None;
        }
        let (pose_if, second) = refine_pose_if(
            &pose_if,
            camera,
            image_points,
            feature_map.object_points(),
            400,
            200,
            5.0,
            3.0 * 3.0,
            1.5 * 1.5,
        )?;
        (second >= 10).then_some(pose_if)
    }

    /// Varies the rough pose to harvest correspondences and refines with them against the whole map.
    fn rough_pose(
        &mut self,
        context: &FrameContext<'_>,
        rough_pose_if: &WorldToCamera,
        image_points: &[Point2<f64>],
    ) -> Option<WorldToCamera> {
        let feature_map = context.feature_map;
        let camera = context.camera;
        let resolution_factor = camera.resolution_factor();
        let object_points = feature_map.object_points();
        if image_points.len() < 5 {
            return None;
        }

        let variation_objects = &object_points[..object_points.len().min(60)];
        let variation_images = &image_points[..image_points.len().min(variation_objects.len() * 2)];
        let valid = variation_objects.len().min(variation_images.len()) * 60 / 100;
        let max_translation = feature_map.bounding_box().diagonal() * 0.05;
        let timeout = self.settings.rough_pose_timeout;

        let first = variation_target(
            valid,
            ErrorDetermination::Approximated,
            3.1 * resolution_factor,
            max_translation,
            5.0,
            timeout,
        );
        let result = optimized_pose_with_one_initial_pose_if(
            rough_pose_if,
            camera,
            variation_objects,
            variation_images,
            &first,
            &mut self.rng,
        )
        .or_else(|| {
            trace!("rough pose retries with relaxed bounds");
            let relaxed = variation_target(
                valid,
                ErrorDetermination::Approximated,
                3.1 * resolution_factor,
                max_translation * 2.0,
                10.0,
                timeout * 2.0,
            );
            optimized_pose_with_one_initial_pose_if(
                rough_pose_if,
                camera,
                variation_objects,
                variation_images,
                &relaxed,
                &mut self.rng,
            )
        })?;

        let (objects, images) = corresponding_points(&result, variation_objects, variation_images);
        if objects.len() < 5 {
            return None;
        }
        let pose_if = optimize_huber_tukey_if(camera, &result.pose_if, &objects, &images, 30, 30)?;

        let (pose_if, first) = refine_pose_if(
            &pose_if,
            camera,
            image_points,
            object_points,
            200,
            400,
            10.0 * resolution_factor,
            30.0 * 30.0,
            f64::MAX,
        )?;
        if first < 10 {
            return None;
        }
        let (pose_if, second) = refine_pose_if(
            &pose_if,
            camera,
            image_points,
            object_points,
            400,
            800,
            4.0 * resolution_factor,
            2.0 * 2.0,
            f64::MAX,
        )?;
        (second >= 10).then_some(pose_if)
    }

    /// The best scoring seed poses, skipping those too far from the prior orientation.
    fn seed_poses(
        &mut self,
        context: &FrameContext<'_>,
        image_points: &[Point2<f64>],
    ) -> Vec<CameraPose> {
        self.seed_bank_scorings += 1;
        let tolerance = self.settings.prior_orientation_tolerance.to_radians();
        let prior = context.prior_orientation;
        let near_prior = move |pose: &CameraPose| {
            prior.map_or(true, |prior| pose.orientation().angle_to(&prior) <= tolerance)
        };
        self.seed_bank.find_poses_with_minimal_error(
            image_points,
            image_points.len() * 75 / 100,
            ErrorDetermination::Approximated,
            Estimator::Tukey,
            self.settings.cold_start_seed_poses,
            Some(&near_prior),
            context.worker,
        )
    }

    /// Finds the pose without prior on the full resolution frame.
    fn cold_start_default(
        &mut self,
        context: &FrameContext<'_>,
        image_points: &[Point2<f64>],
    ) -> Option<WorldToCamera> {
        let feature_map = context.feature_map;
        let camera = context.camera;
        let object_points = feature_map.initialization_object_points();
        if image_points.len() < MIN_COLD_START_DETECTIONS {
            debug!("only {} features detected for a cold start", image_points.len());
            return None;
        }
        if self.seed_bank.width() != camera.width() || self.seed_bank.height() != camera.height() {
            debug!(
                "the seed bank was built for {}x{} frames, not {}x{}",
                self.seed_bank.width(),
                self.seed_bank.height(),
                camera.width(),
                camera.height()
            );
            return None;
        }

        let seeds = CameraPose::to_inverted_flipped_all(&self.seed_poses(context, image_points));
        let variation_images = &image_points[..(object_points.len() * 70 / 100).min(image_points.len())];
        let valid = variation_images.len() * 60 / 100;
        let resolution_factor = camera.resolution_factor();
        let timeout = self.settings.cold_start_timeout;
        debug!(
            "cold start with {} seeds, {} image points and {} object points",
            seeds.len(),
            variation_images.len(),
            object_points.len()
        );

        let rough = optimized_pose_with_several_initial_poses_if(
            &seeds,
            camera,
            object_points,
            variation_images,
            &variation_target(
                valid,
                ErrorDetermination::Approximated,
                8.5 * resolution_factor,
                0.1,
                15.0,
                timeout,
            ),
            &mut self.rng,
            context.worker,
        )?;
        let finer = optimized_pose_with_one_initial_pose_if(
            &rough.pose_if,
            camera,
            object_points,
            variation_images,
            &variation_target(
                valid,
                ErrorDetermination::Approximated,
                4.5 * resolution_factor,
                0.05,
                12.5,
                timeout,
            ),
            &mut self.rng,
        )?;
        let fine = optimized_pose_with_one_initial_pose_if(
            &finer.pose_if,
            camera,
            object_points,
            variation_images,
            &variation_target(
                valid,
                ErrorDetermination::Ambiguous,
                2.0 * resolution_factor,
                0.02,
                10.0,
                timeout,
            ),
            &mut self.rng,
        )?;

        let (objects, images) = corresponding_points(&fine, object_points, variation_images);
        let pose_if = optimize_pose_if(camera, &fine.pose_if, &objects, &images, Estimator::Huber, 30)?.pose;
        let (pose_if, _) = refine_pose_if(
            &pose_if,
            camera,
            image_points,
            feature_map.object_points(),
            200,
            400,
            10.0 * resolution_factor,
            30.0 * 30.0,
            f64::MAX,
        )?;
        let (pose_if, _) = refine_pose_if(
            &pose_if,
            camera,
            image_points,
            feature_map.object_points(),
            400,
            800,
            4.0 * resolution_factor,
            2.0 * 2.0,
            f64::MAX,
        )?;
        info!("cold start succeeded");
        Some(pose_if)
    }

    /// Finds a rough pose without prior on the frame downsampled to the seed bank resolution.
    fn cold_start_pyramid(&mut self, context: &FrameContext<'_>) -> Option<WorldToCamera> {
        let feature_map = context.feature_map;
        let camera = feature_map.initialization_camera();
        let object_points = feature_map.initialization_object_points();

        let small = frame::downsample_to(context.gray, self.seed_bank.width(), self.seed_bank.height())?;
        let small = if self.detector.detector_type().needs_smoothed_frame() {
            frame::smooth(&small)
        } else {
            small
        };
        let image_points = self.detector.detect_with_target(
            &small,
            object_points.len() * 70 / 100,
            self.settings.pyramid_detector_threshold,
            false,
            None,
        );
        if image_points.len() < MIN_COLD_START_DETECTIONS {
            debug!("only {} features detected for a pyramid cold start", image_points.len());
            return None;
        }

        let bounding_box = feature_map.initialization_bounding_box();
        let mut seeds = top_down_poses(bounding_box, bounding_box.diagonal() * self.settings.seed_distance_factor);
        seeds.extend(self.seed_poses(context, &image_points));
        let seeds = CameraPose::to_inverted_flipped_all(&seeds);

        let count = image_points.len();
        let resolution_factor = camera.resolution_factor();
        let timeout = self.settings.pyramid_timeout;
        debug!("pyramid cold start with {} seeds and {} image points", seeds.len(), count);

        let first = optimized_pose_with_several_initial_poses_if(
            &seeds,
            camera,
            object_points,
            &image_points,
            &variation_target(
                count * 65 / 100,
                ErrorDetermination::Approximated,
                16.0 * resolution_factor,
                0.3,
                30.0,
                timeout,
            ),
            &mut self.rng,
            context.worker,
        )?;
        let rounds = [
            (55, ErrorDetermination::Approximated, 13.0, 0.3, 30.0, timeout),
            (55, ErrorDetermination::Ambiguous, 9.0, 0.25, 25.0, timeout),
            (
                50,
                ErrorDetermination::Unique,
                7.0,
                0.2,
                20.0,
                self.settings.pyramid_final_timeout,
            ),
        ];
        let mut pose_if = first.pose_if;
        for (percent, error_determination, pixel_error, translation, rotation, timeout) in rounds {
            pose_if = optimized_pose_with_one_initial_pose_if(
                &pose_if,
                camera,
                object_points,
                &image_points,
                &variation_target(
                    count * percent / 100,
                    error_determination,
                    pixel_error * resolution_factor,
                    translation,
                    rotation,
                    timeout,
                ),
                &mut self.rng,
            )?
            .pose_if;
        }
        info!("pyramid cold start found a rough pose");
        Some(pose_if)
    }
}
