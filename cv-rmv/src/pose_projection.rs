//! Seed poses with precomputed projections of the map, scored against the detections of a frame.

use crate::random_model_variation::ErrorDetermination;
use crate::spatial::{distribute_to_array, ideal_bins, DistributionArray};
use crate::worker::Worker;
use cv_core::nalgebra::{Point2, Point3};
use cv_core::{CameraModel, CameraPose};
use cv_optimize::{Estimator, POSE_PARAMETERS};
use cv_pinhole::PinholeCamera;
use float_ord::FloatOrd;
use rayon::prelude::*;

/// The size of the grid bins of a projection for a 640x480 camera.
const PROJECTION_BIN_SIZE: f64 = 20.0;

/// The smallest squared sigma used by the robust estimators while scoring.
const MIN_SQR_SIGMA: f64 = 1.0;

/// The object points as seen from one camera pose.
#[derive(Debug, Clone)]
pub struct PoseProjection {
    pose: CameraPose,
    image_points: Vec<Point2<f64>>,
    distribution: DistributionArray,
}

impl PoseProjection {
    /// Projects the object points, keeping those in front of the camera and inside the frame.
    pub fn new(pose: CameraPose, camera: &PinholeCamera, object_points: &[Point3<f64>], distort: bool) -> Self {
        let pose_if = pose.to_inverted_flipped();
        let image_points: Vec<Point2<f64>> = object_points
            .iter()
            .filter(|point| pose_if.is_in_front(point))
            .map(|point| camera.project_to_image_if(&pose_if, point, distort))
            .filter(|point| camera.is_inside(point))
            .collect();
        let (width, height) = (camera.width() as f64, camera.height() as f64);
        let (horizontal_bins, vertical_bins) =
            ideal_bins(width, height, PROJECTION_BIN_SIZE * camera.resolution_factor());
        let distribution =
            distribute_to_array(&image_points, 0.0, 0.0, width, height, horizontal_bins, vertical_bins);
        Self {
            pose,
            image_points,
            distribution,
        }
    }

    pub fn pose(&self) -> &CameraPose {
        &self.pose
    }

    pub fn image_points(&self) -> &[Point2<f64>] {
        &self.image_points
    }

    pub fn len(&self) -> usize {
        self.image_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_points.is_empty()
    }

    /// Squared distance of every image point to its nearest projected point.
    ///
    /// The approximated and the unique search only look into the 3x3 neighborhood of grid bins and cap
    /// the error at the squared bin diagonal.
    fn nearest_sqr_errors(&self, image_points: &[Point2<f64>], kind: ErrorDetermination) -> Vec<f64> {
        let cap = self.distribution.bin_width().powi(2) + self.distribution.bin_height().powi(2);
        match kind {
            ErrorDetermination::Approximated => {
                image_points
                    .iter()
                    .map(|image_point| {
                        self.distribution
                            .indices_in_neighborhood(image_point)
                            .map(|index| (self.image_points[index] - image_point).norm_squared())
                            .fold(cap, f64::min)
                    })
                    .collect()
            }
            ErrorDetermination::Ambiguous => image_points
                .iter()
                .map(|image_point| {
                    self.image_points
                        .iter()
                        .map(|projected| (projected - image_point).norm_squared())
                        .fold(f64::MAX, f64::min)
                })
                .collect(),
            ErrorDetermination::Unique => {
                let pairs = kind.pairs(image_points, &self.image_points, &self.distribution, cap);
                let unpaired = image_points.len() - pairs.len();
                pairs
                    .into_iter()
                    .map(|pair| pair.sqr_distance)
                    .chain(std::iter::repeat(cap).take(unpaired))
                    .collect()
            }
        }
    }

    /// The robust average error of the `number` image points closest to a projected point.
    ///
    /// The result is `f64::MAX` if no object point is visible from this pose.
    pub fn minimal_average_sqr_error(
        &self,
        image_points: &[Point2<f64>],
        number: usize,
        kind: ErrorDetermination,
        estimator: Estimator,
    ) -> f64 {
        if self.image_points.is_empty() || image_points.is_empty() {
            return f64::MAX;
        }
        let mut sqr_errors = self.nearest_sqr_errors(image_points, kind);
        if sqr_errors.is_empty() {
            return f64::MAX;
        }
        sqr_errors.sort_unstable_by_key(|&sqr_error| FloatOrd(sqr_error));
        sqr_errors.truncate(number.max(1));
        let sqr_sigma = if estimator.needs_sigma() {
            Estimator::sqr_sigma(&sqr_errors, POSE_PARAMETERS, MIN_SQR_SIGMA)
        } else {
            0.0
        };
        sqr_errors
            .iter()
            .map(|&sqr_error| estimator.robust_error(sqr_error, sqr_sigma))
            .sum::<f64>()
            / sqr_errors.len() as f64
    }
}

/// The seed bank: a set of pose projections for one camera resolution.
#[derive(Debug, Clone, Default)]
pub struct PoseProjectionSet {
    width: u32,
    height: u32,
    projections: Vec<PoseProjection>,
}

impl PoseProjectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The frame size the projections belong to.
    pub fn set_dimension(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn add_pose_projection(&mut self, projection: PoseProjection) {
        self.projections.push(projection);
    }

    pub fn clear(&mut self) {
        self.projections.clear();
    }

    pub fn len(&self) -> usize {
        self.projections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }

    pub fn projections(&self) -> &[PoseProjection] {
        &self.projections
    }

    /// The pose of the projection matching the image points best, with its error.
    pub fn find_pose_with_minimal_error(
        &self,
        image_points: &[Point2<f64>],
        number: usize,
        kind: ErrorDetermination,
        estimator: Estimator,
    ) -> Option<(CameraPose, f64)> {
        self.projections
            .iter()
            .map(|projection| {
                (
                    *projection.pose(),
                    projection.minimal_average_sqr_error(image_points, number, kind, estimator),
                )
            })
            .filter(|&(_, error)| error < f64::MAX)
            .min_by_key(|&(_, error)| FloatOrd(error))
    }

    /// The poses of the `count` best matching projections, best first.
    ///
    /// Projections whose pose is rejected by `filter` are not scored.
    #[allow(clippy::too_many_arguments)]
    pub fn find_poses_with_minimal_error(
        &self,
        image_points: &[Point2<f64>],
        number: usize,
        kind: ErrorDetermination,
        estimator: Estimator,
        count: usize,
        filter: Option<&(dyn Fn(&CameraPose) -> bool + Sync)>,
        worker: Option<&Worker>,
    ) -> Vec<CameraPose> {
        let score = |projection: &PoseProjection| {
            if filter.map_or(true, |filter| filter(projection.pose())) {
                Some((
                    *projection.pose(),
                    projection.minimal_average_sqr_error(image_points, number, kind, estimator),
                ))
            } else {
                None
            }
        };
        let mut scored: Vec<(CameraPose, f64)> = match worker {
            Some(worker) => worker.install(|| self.projections.par_iter().filter_map(score).collect()),
            None => self.projections.iter().filter_map(score).collect(),
        };
        scored.retain(|&(_, error)| error < f64::MAX);
        scored.sort_by_key(|&(_, error)| FloatOrd(error));
        scored.into_iter().take(count).map(|(pose, _)| pose).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::Vector3;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn object_points() -> Vec<Point3<f64>> {
        let mut rng = Pcg64::seed_from_u64(4);
        (0..150)
            .map(|_| Point3::new(rng.gen_range(-0.15..0.15), 0.0, rng.gen_range(-0.1..0.1)))
            .collect()
    }

    fn top_down(roll_up: Vector3<f64>) -> CameraPose {
        CameraPose::look_at(Point3::new(0.0, 0.3, 0.0), Point3::origin(), roll_up).unwrap()
    }

    #[test]
    fn projection_keeps_visible_points() {
        let camera = PinholeCamera::from_fov_x(640, 480, 60f64.to_radians());
        let points = object_points();
        let projection = PoseProjection::new(top_down(-Vector3::z()), &camera, &points, false);
        assert_eq!(projection.len(), points.len());
        let away = CameraPose::look_at(Point3::new(0.0, 0.3, 0.0), Point3::new(0.0, 1.0, 0.0), Vector3::z()).unwrap();
        assert!(PoseProjection::new(away, &camera, &points, false).is_empty());
    }

    #[test]
    fn exact_projection_has_no_error() {
        let camera = PinholeCamera::from_fov_x(640, 480, 60f64.to_radians());
        let points = object_points();
        let projection = PoseProjection::new(top_down(-Vector3::z()), &camera, &points, false);
        let image_points = projection.image_points().to_vec();
        for kind in [
            ErrorDetermination::Approximated,
            ErrorDetermination::Ambiguous,
            ErrorDetermination::Unique,
        ] {
            for estimator in [Estimator::Square, Estimator::Huber, Estimator::Tukey] {
                let error = projection.minimal_average_sqr_error(&image_points, 100, kind, estimator);
                assert!(error < 1e-9, "{:?} {:?}: {}", kind, estimator, error);
            }
        }
    }

    #[test]
    fn best_seed_is_found() {
        let camera = PinholeCamera::from_fov_x(640, 480, 60f64.to_radians());
        let points = object_points();
        let truth = CameraPose::look_at(Point3::new(0.005, 0.31, 0.0), Point3::origin(), -Vector3::z()).unwrap();
        let image_points = camera.project_all_to_image_if(&truth.to_inverted_flipped(), &points, false);

        let mut set = PoseProjectionSet::new();
        set.set_dimension(640, 480);
        for up in [Vector3::x(), -Vector3::x(), Vector3::z(), -Vector3::z()] {
            set.add_pose_projection(PoseProjection::new(top_down(up), &camera, &points, false));
        }
        assert_eq!(set.len(), 4);

        let (best, _) = set
            .find_pose_with_minimal_error(&image_points, 110, ErrorDetermination::Approximated, Estimator::Tukey)
            .unwrap();
        assert_eq!(best, *set.projections()[3].pose());

        let worker = Worker::new(2).unwrap();
        for worker in [None, Some(&worker)] {
            let poses = set.find_poses_with_minimal_error(
                &image_points,
                110,
                ErrorDetermination::Approximated,
                Estimator::Tukey,
                2,
                None,
                worker,
            );
            assert_eq!(poses.len(), 2);
            assert_eq!(poses[0], *set.projections()[3].pose());
        }

        let not_best = |pose: &CameraPose| *pose != top_down(-Vector3::z());
        let poses = set.find_poses_with_minimal_error(
            &image_points,
            110,
            ErrorDetermination::Approximated,
            Estimator::Tukey,
            4,
            Some(&not_best),
            None,
        );
        assert_eq!(poses.len(), 3);
        assert!(poses.iter().all(|pose| not_best(pose)));
    }
}
