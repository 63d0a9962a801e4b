//! The 6-DOF tracker of a camera relative to a feature map.
//!
//! Every frame runs through a cascade of [`TrackingStrategy`]s. The strategies building on the previous
//! frame need the classification of the map points, which a background thread derives from every
//! tracked frame while the caller already processes the next one.

mod background;
mod classification;
mod strategy;

pub use background::Job;
pub use classification::{classify_object_points_if, Classification};
pub use strategy::TrackingStrategy;

use crate::detector::{DetectorType, FeatureDetector, RmvFeatureDetector};
use crate::error::TrackingError;
use crate::feature_map::RmvFeatureMap;
use crate::frame;
use crate::motion_model::MotionModel;
use crate::pose_projection::{PoseProjection, PoseProjectionSet};
use crate::randomized_pose::{hemisphere_poses, random_visible_poses};
use crate::settings::TrackerSettings;
use crate::worker::Worker;
use background::{Background, Processor};
use cv_core::nalgebra::{UnitQuaternion, Vector3};
use cv_core::{CameraModel, CameraPose};
use cv_pinhole::PinholeCamera;
use image::{DynamicImage, GenericImageView};
use log::*;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::sync::Arc;
use strategy::FrameContext;

/// The most initialization points projected for each seed pose.
const MAX_SEED_OBJECT_POINTS: usize = 150;

/// The share of the seed points a random seed pose has to see.
const RANDOM_SEED_MIN_VISIBLE_FRACTION: f64 = 0.25;

/// The pose of the camera in one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformationSample {
    /// The camera-to-world pose, looking along the negative z axis.
    pub pose: CameraPose,
    /// Always `0.0`, kept for interface compatibility.
    pub confidence: f64,
}

/// Everything the strategies change while tracking, apart from the feature map.
pub(crate) struct TrackerCore {
    detector: Box<dyn FeatureDetector + Send>,
    settings: TrackerSettings,
    detector_threshold: f64,
    seed_bank: PoseProjectionSet,
    rng: Pcg64,
    max_position_offset: Option<Vector3<f64>>,
    seed_bank_scorings: usize,
}

/// Tracks a monocular camera against an [`RmvFeatureMap`].
pub struct RmvTracker {
    core: TrackerCore,
    motion_model: MotionModel,
    last_strategy: Option<TrackingStrategy>,
    background: Background,
}

impl RmvTracker {
    /// Creates a tracker with a built-in detector and default settings.
    pub fn new(detector_type: DetectorType) -> Self {
        Self::with_detector(Box::new(RmvFeatureDetector::new(detector_type)), TrackerSettings::default())
    }

    /// Creates a tracker with any detector.
    pub fn with_detector(detector: Box<dyn FeatureDetector + Send>, settings: TrackerSettings) -> Self {
        let processor: Arc<Processor> = Arc::new(move |feature_map: &mut RmvFeatureMap, job: &Job| {
            let classification = classify_object_points_if(
                &job.pose_if,
                &job.camera,
                feature_map.object_points(),
                &job.image_points,
                &settings,
            );
            trace!(
                "classified {} strong, {} semi-strong and {} used points",
                classification.strong.len(),
                classification.semi_strong.len(),
                classification.used.len()
            );
            feature_map.set_most_recent_object_point_indices(
                classification.strong,
                classification.semi_strong,
                classification.used,
            );
        });
        Self::with_processor(detector, settings, processor)
    }

    fn with_processor(
        detector: Box<dyn FeatureDetector + Send>,
        settings: TrackerSettings,
        processor: Arc<Processor>,
    ) -> Self {
        Self {
            core: TrackerCore {
                detector,
                settings,
                detector_threshold: settings.detector_threshold,
                seed_bank: PoseProjectionSet::new(),
                rng: Pcg64::seed_from_u64(0),
                max_position_offset: None,
                seed_bank_scorings: 0,
            },
            motion_model: MotionModel::new(),
            last_strategy: None,
            background: Background::new(processor),
        }
    }

    /// Replaces the feature map and rebuilds the seed poses of the cold start.
    ///
    /// `rng` seeds the tracker's own generator. With `autoscale_offset` a pose further than a fifth of the
    /// map diagonal from its prediction is rejected by the strategies building on the previous frame.
    pub fn set_feature_map(&mut self, feature_map: RmvFeatureMap, rng: &mut impl Rng, autoscale_offset: bool) {
        self.set_feature_map_with_worker(feature_map, rng, autoscale_offset, None);
    }

    /// Like [`RmvTracker::set_feature_map`], drawing random seed poses on the worker's threads.
    pub fn set_feature_map_with_worker(
        &mut self,
        feature_map: RmvFeatureMap,
        rng: &mut impl Rng,
        autoscale_offset: bool,
        worker: Option<&Worker>,
    ) {
        self.background.wait_until_idle();
        self.core.rng = Pcg64::seed_from_u64(rng.gen());

        let settings = self.core.settings;
        let bounding_box = feature_map.initialization_bounding_box();
        let camera = feature_map.initialization_camera();
        let object_points = feature_map.initialization_object_points();
        let object_points = &object_points[..object_points
            .len()
            .min(MAX_SEED_OBJECT_POINTS)
            .min(settings.max_pose_projection_features)];
        let diagonal = bounding_box.diagonal();
        let poses = if settings.random_seed_poses {
            random_visible_poses(
                camera,
                bounding_box,
                object_points,
                &mut self.core.rng,
                diagonal * 0.7,
                diagonal * 0.9,
                RANDOM_SEED_MIN_VISIBLE_FRACTION,
                settings.seed_rings * (settings.seed_poses_per_ring + 1),
                worker,
            )
        } else {
            hemisphere_poses(
                bounding_box,
                &mut self.core.rng,
                diagonal * settings.seed_distance_factor,
                settings.seed_rings,
                settings.seed_poses_per_ring,
            )
        };
        let mut seed_bank = PoseProjectionSet::new();
        seed_bank.set_dimension(camera.width(), camera.height());
        for pose in poses {
            seed_bank.add_pose_projection(PoseProjection::new(pose, camera, object_points, false));
        }
        debug!(
            "built {} seed poses for {}x{} frames",
            seed_bank.len(),
            camera.width(),
            camera.height()
        );
        self.core.seed_bank = seed_bank;

        self.core.max_position_offset = autoscale_offset
            .then(|| Vector3::repeat(feature_map.bounding_box().diagonal() * settings.position_offset_factor));
        self.motion_model.reset();
        self.last_strategy = None;

        let mut shared = self.background.lock();
        shared.feature_map = Some(feature_map);
    }

    /// Bounds the per-axis movement between the predicted and the tracked position, `None` disables the check.
    pub fn set_max_position_offset(&mut self, offset: Option<Vector3<f64>>) {
        self.core.max_position_offset = offset;
    }

    pub fn max_position_offset(&self) -> Option<Vector3<f64>> {
        self.core.max_position_offset
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.core.settings
    }

    /// The current adaptive detector threshold.
    pub fn detector_threshold(&self) -> f64 {
        self.core.detector_threshold
    }

    /// The strategy that tracked the last frame, `None` if it was lost.
    pub fn last_strategy(&self) -> Option<TrackingStrategy> {
        self.last_strategy
    }

    /// How often the seed bank has been scored, once per attempted cold start.
    pub fn seed_bank_scorings(&self) -> usize {
        self.core.seed_bank_scorings
    }

    pub fn seed_bank(&self) -> &PoseProjectionSet {
        &self.core.seed_bank
    }

    /// Returns `true` if the next frame starts from a predicted pose.
    pub fn has_motion_model(&self) -> bool {
        self.motion_model.is_valid()
    }

    /// Blocks until the classification of the last tracked frame has been written to the map.
    pub fn wait_for_background(&self) {
        self.background.wait_until_idle();
    }

    /// Calls `f` with the feature map once no classification is running, `None` if no map is set.
    pub fn with_feature_map<R>(&self, f: impl FnOnce(&RmvFeatureMap) -> R) -> Option<R> {
        self.background.wait_until_idle();
        self.background.lock().feature_map.as_ref().map(f)
    }

    /// Determines the camera pose of a frame.
    ///
    /// `prior_orientation` restricts the seed poses of a cold start to those close to it.
    pub fn determine_poses(
        &mut self,
        frame: &DynamicImage,
        camera: &PinholeCamera,
        frame_is_undistorted: bool,
        prior_orientation: Option<UnitQuaternion<f64>>,
        worker: Option<&Worker>,
    ) -> Result<TransformationSample, TrackingError> {
        if !camera.is_valid() {
            return Err(TrackingError::InvalidCamera);
        }
        let (frame_width, frame_height) = frame.dimensions();
        if frame_width != camera.width() || frame_height != camera.height() {
            return Err(TrackingError::FrameMismatch {
                frame_width,
                frame_height,
                camera_width: camera.width(),
                camera_height: camera.height(),
            });
        }

        self.background.wait_until_idle();
        let state = self.background.state();
        let shared = state.0.lock();
        let feature_map = shared.feature_map.as_ref().ok_or(TrackingError::NoFeatureMap)?;

        let gray = frame::to_gray(frame);
        let smoothed = self
            .core
            .detector
            .detector_type()
            .needs_smoothed_frame()
            .then(|| frame::smooth(&gray));
        let context = FrameContext {
            feature_map,
            gray: &gray,
            detection_frame: smoothed.as_ref().unwrap_or(&gray),
            camera,
            frame_is_undistorted,
            prior_orientation,
            worker,
        };
        let tracked = self.core.track(&context, self.motion_model.predicted_pose());
        drop(shared);

        match tracked {
            Some(tracked) => {
                let pose = CameraPose::from_inverted_flipped(tracked.pose_if);
                debug!(
                    "{:?} tracked the camera at {:?} with {} detections",
                    tracked.strategy,
                    pose.position(),
                    tracked.image_points.len()
                );
                self.background.post(Job {
                    pose_if: tracked.pose_if,
                    camera: *camera,
                    image_points: tracked.image_points,
                });
                self.motion_model.update(pose);
                self.last_strategy = Some(tracked.strategy);
                Ok(TransformationSample { pose, confidence: 0.0 })
            }
            None => {
                if self.motion_model.is_valid() {
                    info!("lost track after {} frames", self.motion_model.updates());
                }
                self.motion_model.reset();
                self.last_strategy = None;
                Err(TrackingError::TrackingLost)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::{Point2, Point3, Rotation3};
    use cv_core::Box2;
    use image::GrayImage;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    /// Returns the same detections for every frame.
    struct Fixed(Arc<Mutex<Vec<Point2<f64>>>>);

    impl FeatureDetector for Fixed {
        fn detector_type(&self) -> DetectorType {
            DetectorType::Fast
        }

        fn detect(&self, _: &GrayImage, _: f64, _: bool, region: Option<&Box2>) -> Vec<Point2<f64>> {
            self.0
                .lock()
                .iter()
                .filter(|point| region.map_or(true, |region| region.contains(point)))
                .copied()
                .collect()
        }
    }

    fn camera() -> PinholeCamera {
        PinholeCamera::from_fov_x(640, 480, 60f64.to_radians())
    }

    fn object_points() -> Vec<Point3<f64>> {
        let mut rng = Pcg64::seed_from_u64(3);
        (0..200)
            .map(|_| Point3::new(rng.gen_range(-0.15..0.15), 0.0, rng.gen_range(-0.1..0.1)))
            .collect()
    }

    fn truth() -> CameraPose {
        CameraPose::look_at(Point3::new(0.003, 0.29, -0.002), Point3::origin(), -Vector3::z()).unwrap()
    }

    fn moved(pose: &CameraPose, translation: Vector3<f64>, rotation: Vector3<f64>) -> CameraPose {
        CameraPose::from_parts(
            pose.position().coords + translation,
            Rotation3::from_scaled_axis(rotation) * pose.rotation(),
        )
    }

    fn observe(object_points: &[Point3<f64>], pose: &CameraPose) -> Vec<Point2<f64>> {
        camera()
            .project_all_to_image_if(&pose.to_inverted_flipped(), object_points, false)
            .into_iter()
            .filter(|point| camera().is_inside(point))
            .collect()
    }

    fn scene() -> (RmvFeatureMap, Vec<Point2<f64>>) {
        let object_points = object_points();
        let image_points = observe(&object_points, &truth());
        let map = RmvFeatureMap::new(object_points, camera(), DetectorType::Fast).unwrap();
        (map, image_points)
    }

    fn assert_close(pose: &CameraPose, expected: &CameraPose) {
        let distance = (pose.position() - expected.position()).norm();
        assert!(distance < 0.001, "position is off by {} m", distance);
        assert!(pose.rotation_angle_to(expected).to_degrees() < 0.2);
    }

    fn settings() -> TrackerSettings {
        TrackerSettings {
            cold_start_timeout: 5.0,
            pyramid_timeout: 2.0,
            pyramid_final_timeout: 2.0,
            rough_pose_timeout: 2.0,
            any_previous_timeout: 1.0,
            ..TrackerSettings::default()
        }
    }

    fn frame() -> DynamicImage {
        DynamicImage::new_luma8(640, 480)
    }

    #[test]
    fn frames_are_checked_before_tracking() {
        let mut tracker = RmvTracker::new(DetectorType::Fast);
        assert_eq!(
            tracker.determine_poses(&frame(), &camera(), true, None, None),
            Err(TrackingError::NoFeatureMap)
        );
        assert_eq!(
            tracker.determine_poses(&DynamicImage::new_luma8(320, 240), &camera(), true, None, None),
            Err(TrackingError::FrameMismatch {
                frame_width: 320,
                frame_height: 240,
                camera_width: 640,
                camera_height: 480,
            })
        );
    }

    #[test]
    fn feature_map_builds_seed_bank() {
        let (map, _) = scene();
        let mut tracker = RmvTracker::new(DetectorType::Fast);
        tracker.set_feature_map(map, &mut Pcg64::seed_from_u64(1), true);
        let settings = TrackerSettings::default();
        assert_eq!(tracker.seed_bank().len(), settings.seed_rings * settings.seed_poses_per_ring);
        assert_eq!((tracker.seed_bank().width(), tracker.seed_bank().height()), (640, 480));
        let diagonal = (0.3f64.powi(2) + 0.2f64.powi(2)).sqrt();
        let offset = tracker.max_position_offset().unwrap();
        assert!((offset.x - diagonal * settings.position_offset_factor).abs() < 0.01);
    }

    #[test]
    fn random_seed_bank_sees_the_map() {
        let (map, _) = scene();
        let settings = TrackerSettings {
            random_seed_poses: true,
            ..TrackerSettings::default()
        };
        let mut tracker = RmvTracker::with_detector(Box::new(Fixed(Arc::default())), settings);
        let worker = Worker::new(2).unwrap();
        tracker.set_feature_map_with_worker(map, &mut Pcg64::seed_from_u64(1), true, Some(&worker));
        assert_eq!(tracker.seed_bank().len(), settings.seed_rings * (settings.seed_poses_per_ring + 1));
        // 150 seed points are projected for every pose.
        assert!(tracker.seed_bank().projections().iter().all(|projection| projection.len() >= 38));
    }

    #[test]
    fn slow_classification_is_awaited_before_next_frame() {
        let (map, image_points) = scene();
        let detections = Arc::new(Mutex::new(image_points));
        let finished = Arc::new(Mutex::new(None));
        let processor: Arc<Processor> = {
            let finished = finished.clone();
            Arc::new(move |feature_map: &mut RmvFeatureMap, job: &Job| {
                std::thread::sleep(Duration::from_millis(300));
                let classification = classify_object_points_if(
                    &job.pose_if,
                    &job.camera,
                    feature_map.object_points(),
                    &job.image_points,
                    &TrackerSettings::default(),
                );
                feature_map.set_most_recent_object_point_indices(
                    classification.strong,
                    classification.semi_strong,
                    classification.used,
                );
                *finished.lock() = Some(Instant::now());
            })
        };
        let mut tracker = RmvTracker::with_processor(Box::new(Fixed(detections)), settings(), processor);
        tracker.set_feature_map(map, &mut Pcg64::seed_from_u64(1), true);

        tracker.determine_poses(&frame(), &camera(), true, None, None).unwrap();
        assert_eq!(tracker.last_strategy(), Some(TrackingStrategy::ColdStartDefault));
        tracker.determine_poses(&frame(), &camera(), true, None, None).unwrap();
        // The second frame only starts once the classification of the first one is complete.
        assert!(finished.lock().is_some());
        assert_eq!(tracker.last_strategy(), Some(TrackingStrategy::StrongPrevious));
    }

    /// Tracks the first frame from `truth()` and the second one from `next`.
    fn track_twice(tracker: &mut RmvTracker, detections: &Mutex<Vec<Point2<f64>>>, next: &CameraPose) -> CameraPose {
        let object_points = object_points();
        *detections.lock() = observe(&object_points, &truth());
        tracker.determine_poses(&frame(), &camera(), true, None, None).unwrap();
        assert_eq!(tracker.last_strategy(), Some(TrackingStrategy::ColdStartDefault));
        *detections.lock() = observe(&object_points, next);
        tracker.determine_poses(&frame(), &camera(), true, None, None).unwrap().pose
    }

    #[test]
    fn used_points_alone_track_with_any_previous() {
        let (map, _) = scene();
        let detections = Arc::new(Mutex::new(Vec::new()));
        let processor: Arc<Processor> = Arc::new(|feature_map: &mut RmvFeatureMap, job: &Job| {
            let classification = classify_object_points_if(
                &job.pose_if,
                &job.camera,
                feature_map.object_points(),
                &job.image_points,
                &TrackerSettings::default(),
            );
            feature_map.set_most_recent_object_point_indices(Vec::new(), Vec::new(), classification.used);
        });
        let mut tracker = RmvTracker::with_processor(Box::new(Fixed(detections.clone())), settings(), processor);
        tracker.set_feature_map(map, &mut Pcg64::seed_from_u64(1), true);

        // Every used point stays within a pixel of its previous position.
        let next = moved(&truth(), Vector3::new(0.0004, 0.0, -0.0003), Vector3::zeros());
        let pose = track_twice(&mut tracker, &detections, &next);
        assert_eq!(tracker.last_strategy(), Some(TrackingStrategy::AnyPrevious));
        assert_close(&pose, &next);
    }

    #[test]
    fn unclassified_map_tracks_with_rough_pose() {
        let (map, _) = scene();
        let detections = Arc::new(Mutex::new(Vec::new()));
        let processor: Arc<Processor> = Arc::new(|_: &mut RmvFeatureMap, _: &Job| {});
        let mut tracker = RmvTracker::with_processor(Box::new(Fixed(detections.clone())), settings(), processor);
        tracker.set_feature_map(map, &mut Pcg64::seed_from_u64(1), true);

        let next = moved(&truth(), Vector3::new(0.002, 0.0, 0.001), Vector3::new(0.0, 0.004, 0.0));
        let pose = track_twice(&mut tracker, &detections, &next);
        assert_eq!(tracker.last_strategy(), Some(TrackingStrategy::RoughPose));
        assert_close(&pose, &next);
    }

    #[test]
    fn harris_map_starts_with_pyramid() {
        let object_points = object_points();
        let detections = Arc::new(Mutex::new(observe(&object_points, &truth())));
        let map = RmvFeatureMap::new(object_points, camera(), DetectorType::Harris).unwrap();
        let mut tracker = RmvTracker::with_detector(Box::new(Fixed(detections)), settings());
        tracker.set_feature_map(map, &mut Pcg64::seed_from_u64(1), true);

        let sample = tracker.determine_poses(&frame(), &camera(), true, None, None).unwrap();
        assert_eq!(tracker.last_strategy(), Some(TrackingStrategy::ColdStartPyramid));
        assert_eq!(tracker.seed_bank_scorings(), 1);
        assert_close(&sample.pose, &truth());
    }
}
