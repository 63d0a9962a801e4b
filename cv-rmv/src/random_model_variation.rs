//! Pose search between a 3D and a 2D point cloud without known correspondences.
//!
//! Starting from an initial pose the camera is moved and rotated randomly within given bounds. Every
//! candidate pose projects the object points and is scored by the average squared distance between
//! the best matching points of both clouds. A variation is kept if it lowers that error. The bounds
//! shrink while no improvement is found, so the search turns from exploring into refining.

use crate::spatial::{distribute_to_array, ideal_bins, DistributionArray};
use crate::worker::Worker;
use cv_core::nalgebra::{Point2, Point3, Rotation3, Unit, Vector3};
use cv_core::{CameraModel, CameraPose, WorldToCamera};
use cv_pinhole::PinholeCamera;
use float_ord::FloatOrd;
use log::*;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Consecutive failed variations before the variation bounds are halved.
const FAILURES_BEFORE_SHRINKING: usize = 20;

/// The smallest fraction of the variation bounds used.
const MIN_VARIATION_SCALE: f64 = 1.0 / 64.0;

/// The size of the grid bins pairing both clouds for a 640x480 camera.
const PAIRING_BIN_SIZE: f64 = 32.0;

/// How the point pairs between two clouds without known correspondences are determined.
///
/// The smaller cloud is the query cloud, the larger one holds the candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDetermination {
    /// Every query in turn takes the nearest candidate not taken yet.
    Approximated,
    /// Every query takes its nearest candidate, a candidate may be taken several times.
    Ambiguous,
    /// The globally closest pairs are formed first, every point is part of at most one pair.
    Unique,
}

/// A pair of a query and a candidate with their squared distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PointPair {
    pub query: usize,
    pub candidate: usize,
    pub sqr_distance: f64,
}

/// The candidates of the grid neighborhood of one query closer than `max_sqr_distance`.
fn local_pairs<'a>(
    query_index: usize,
    query: &'a Point2<f64>,
    candidates: &'a [Point2<f64>],
    distribution: &'a DistributionArray,
    max_sqr_distance: f64,
) -> impl Iterator<Item = PointPair> + 'a {
    distribution
        .indices_in_neighborhood(query)
        .map(move |candidate| PointPair {
            query: query_index,
            candidate,
            sqr_distance: (candidates[candidate] - query).norm_squared(),
        })
        .filter(move |pair| pair.sqr_distance < max_sqr_distance)
}

impl ErrorDetermination {
    /// Pairs the queries with the candidates, sorted by ascending distance.
    ///
    /// `distribution` holds the candidates, only the 3x3 bin neighborhood of a query is searched and
    /// candidates at `max_sqr_distance` or farther are ignored. Queries without a candidate left are not
    /// part of the result.
    pub(crate) fn pairs(
        self,
        queries: &[Point2<f64>],
        candidates: &[Point2<f64>],
        distribution: &DistributionArray,
        max_sqr_distance: f64,
    ) -> Vec<PointPair> {
        let mut pairs = match self {
            ErrorDetermination::Approximated => {
                let mut taken = vec![false; candidates.len()];
                let mut pairs = Vec::with_capacity(queries.len());
                for (query_index, query) in queries.iter().enumerate() {
                    let nearest = local_pairs(query_index, query, candidates, distribution, max_sqr_distance)
                        .filter(|pair| !taken[pair.candidate])
                        .min_by_key(|pair| FloatOrd(pair.sqr_distance));
                    if let Some(pair) = nearest {
                        taken[pair.candidate] = true;
                        pairs.push(pair);
                    }
                }
                pairs
            }
            ErrorDetermination::Ambiguous => queries
                .iter()
                .enumerate()
                .filter_map(|(query_index, query)| {
                    local_pairs(query_index, query, candidates, distribution, max_sqr_distance)
                        .min_by_key(|pair| FloatOrd(pair.sqr_distance))
                })
                .collect(),
            ErrorDetermination::Unique => {
                let mut local: Vec<PointPair> = queries
                    .iter()
                    .enumerate()
                    .flat_map(|(query_index, query)| {
                        local_pairs(query_index, query, candidates, distribution, max_sqr_distance)
                    })
                    .collect();
                local.sort_unstable_by_key(|pair| FloatOrd(pair.sqr_distance));
                let mut used_queries = vec![false; queries.len()];
                let mut used_candidates = vec![false; candidates.len()];
                local
                    .into_iter()
                    .filter(|pair| {
                        if used_queries[pair.query] || used_candidates[pair.candidate] {
                            false
                        } else {
                            used_queries[pair.query] = true;
                            used_candidates[pair.candidate] = true;
                            true
                        }
                    })
                    .collect()
            }
        };
        pairs.sort_by_key(|pair| FloatOrd(pair.sqr_distance));
        pairs
    }
}

/// The goal and the bounds of one pose search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariationTarget {
    /// The number of point pairs whose average error is minimized.
    pub valid_correspondences: usize,
    pub error_determination: ErrorDetermination,
    /// The search succeeds once the average squared pixel error of the pairs is at most this.
    pub max_sqr_error: f64,
    /// The largest translation of a variation along each axis, in map units.
    pub max_translation: f64,
    /// The largest rotation of a variation, in radians.
    pub max_rotation: f64,
    pub timeout: Duration,
}

/// A pose found by the search.
#[derive(Debug, Clone, PartialEq)]
pub struct VariationResult {
    pub pose_if: WorldToCamera,
    /// The average squared pixel error of the best `valid_correspondences` pairs.
    pub sqr_error: f64,
    /// The `(image_index, object_index)` pairs behind the error, best first.
    pub correspondences: Vec<(usize, usize)>,
}

/// Scores poses by pairing the projected object points with the image points.
///
/// Both clouds are paired inside a uniform grid over the camera frame. A pair is at most one bin size
/// apart, every missing pair among the best `valid_correspondences` counts with the squared bin size.
struct Matcher<'a> {
    camera: &'a PinholeCamera,
    object_points: &'a [Point3<f64>],
    image_points: &'a [Point2<f64>],
    error_determination: ErrorDetermination,
    valid_correspondences: usize,
    bins: (usize, usize),
    max_sqr_distance: f64,
    image_distribution: DistributionArray,
}

impl<'a> Matcher<'a> {
    fn new(
        camera: &'a PinholeCamera,
        object_points: &'a [Point3<f64>],
        image_points: &'a [Point2<f64>],
        target: &VariationTarget,
    ) -> Self {
        let (width, height) = (camera.width() as f64, camera.height() as f64);
        let bins = ideal_bins(width, height, PAIRING_BIN_SIZE * camera.resolution_factor());
        let image_distribution = distribute_to_array(image_points, 0.0, 0.0, width, height, bins.0, bins.1);
        let max_sqr_distance = image_distribution
            .bin_width()
            .min(image_distribution.bin_height())
            .powi(2);
        Self {
            camera,
            object_points,
            image_points,
            error_determination: target.error_determination,
            valid_correspondences: target.valid_correspondences,
            bins,
            max_sqr_distance,
            image_distribution,
        }
    }

    fn images_are_queries(&self) -> bool {
        self.image_points.len() <= self.object_points.len()
    }

    /// The `(image_index, object_index, sqr_error)` of the best pairs, at most `valid_correspondences`.
    ///
    /// Only object points projecting into the frame take part. Returns `None` if fewer of them are visible
    /// than pairs are needed while they are the queries.
    fn pairs(&self, pose_if: &WorldToCamera) -> Option<Vec<(usize, usize, f64)>> {
        let (object_indices, projected): (Vec<usize>, Vec<Point2<f64>>) = self
            .object_points
            .iter()
            .enumerate()
            .filter(|(_, point)| pose_if.is_in_front(point))
            .map(|(index, point)| (index, self.camera.project_to_image_if(pose_if, point, false)))
            .filter(|(_, point)| self.camera.is_inside(point))
            .unzip();
        let mut pairs: Vec<(usize, usize, f64)> = if self.images_are_queries() {
            let (width, height) = (self.camera.width() as f64, self.camera.height() as f64);
            let distribution = distribute_to_array(&projected, 0.0, 0.0, width, height, self.bins.0, self.bins.1);
            self.error_determination
                .pairs(self.image_points, &projected, &distribution, self.max_sqr_distance)
                .into_iter()
                .map(|pair| (pair.query, object_indices[pair.candidate], pair.sqr_distance))
                .collect()
        } else {
            if projected.len() < self.valid_correspondences {
                return None;
            }
            self.error_determination
                .pairs(&projected, self.image_points, &self.image_distribution, self.max_sqr_distance)
                .into_iter()
                .map(|pair| (pair.candidate, object_indices[pair.query], pair.sqr_distance))
                .collect()
        };
        pairs.truncate(self.valid_correspondences);
        Some(pairs)
    }

    fn error(&self, pose_if: &WorldToCamera) -> f64 {
        match self.pairs(pose_if) {
            Some(pairs) => {
                let missing = self.valid_correspondences - pairs.len();
                let sum = pairs.iter().map(|&(_, _, sqr_error)| sqr_error).sum::<f64>();
                (sum + missing as f64 * self.max_sqr_distance) / self.valid_correspondences as f64
            }
            None => f64::MAX,
        }
    }

    fn result(&self, pose_if: WorldToCamera, sqr_error: f64) -> VariationResult {
        VariationResult {
            pose_if,
            sqr_error,
            correspondences: self
                .pairs(&pose_if)
                .unwrap_or_default()
                .into_iter()
                .map(|(image_index, object_index, _)| (image_index, object_index))
                .collect(),
        }
    }
}

/// A random rigid variation of the camera within the scaled bounds.
fn vary_pose(pose_if: &WorldToCamera, target: &VariationTarget, scale: f64, rng: &mut impl Rng) -> WorldToCamera {
    let pose = CameraPose::from_inverted_flipped(*pose_if);
    let max_translation = target.max_translation * scale;
    let translation = if max_translation > 0.0 {
        Vector3::from_fn(|_, _| rng.gen_range(-max_translation..=max_translation))
    } else {
        Vector3::zeros()
    };
    let max_rotation = target.max_rotation * scale;
    let rotation = if max_rotation > 0.0 {
        let axis = Unit::new_normalize(Vector3::from_fn(|_, _| rng.gen_range(-1.0..=1.0)) + Vector3::new(0.0, 0.0, 1e-12));
        Rotation3::from_axis_angle(&axis, rng.gen_range(-max_rotation..=max_rotation))
    } else {
        Rotation3::identity()
    };
    CameraPose::from_parts(pose.position().coords + translation, rotation * pose.rotation()).to_inverted_flipped()
}

/// Searches from one initial pose until the target error is reached, the deadline passed or `stop` was raised.
fn search(
    matcher: &Matcher<'_>,
    initial_pose_if: &WorldToCamera,
    target: &VariationTarget,
    deadline: Instant,
    stop: Option<&AtomicBool>,
    rng: &mut impl Rng,
) -> (WorldToCamera, f64) {
    let mut best_pose = *initial_pose_if;
    let mut best_error = matcher.error(&best_pose);
    let mut scale = 1.0;
    let mut failures = 0;
    let mut iterations = 0usize;
    while best_error > target.max_sqr_error
        && Instant::now() < deadline
        && !stop.map_or(false, |stop| stop.load(Ordering::Relaxed))
    {
        iterations += 1;
        let candidate_pose = vary_pose(&best_pose, target, scale, rng);
        let candidate_error = matcher.error(&candidate_pose);
        if candidate_error < best_error {
            best_pose = candidate_pose;
            best_error = candidate_error;
            scale = 1.0;
            failures = 0;
        } else {
            failures += 1;
            if failures >= FAILURES_BEFORE_SHRINKING {
                scale = (scale * 0.5).max(MIN_VARIATION_SCALE);
                failures = 0;
            }
        }
    }
    trace!(
        "random model variation stopped after {} iterations with error {}",
        iterations,
        best_error
    );
    (best_pose, best_error)
}

fn matcher<'a>(
    camera: &'a PinholeCamera,
    object_points: &'a [Point3<f64>],
    image_points: &'a [Point2<f64>],
    target: &VariationTarget,
) -> Option<Matcher<'a>> {
    let queries = object_points.len().min(image_points.len());
    (target.valid_correspondences > 0 && target.valid_correspondences <= queries)
        .then(|| Matcher::new(camera, object_points, image_points, target))
}

/// Determines a pose whose best `target.valid_correspondences` point pairs have an average squared error
/// of at most `target.max_sqr_error`, starting from one pose.
///
/// The smaller of both clouds is matched against the larger one. Returns `None` if the target was not
/// reached within the timeout.
pub fn optimized_pose_with_one_initial_pose_if(
    initial_pose_if: &WorldToCamera,
    camera: &PinholeCamera,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    target: &VariationTarget,
    rng: &mut impl Rng,
) -> Option<VariationResult> {
    let matcher = matcher(camera, object_points, image_points, target)?;
    let deadline = Instant::now() + target.timeout;
    let (pose_if, sqr_error) = search(&matcher, initial_pose_if, target, deadline, None, rng);
    (sqr_error <= target.max_sqr_error).then(|| matcher.result(pose_if, sqr_error))
}

/// Spreads the bits of a seed index over the whole word.
fn mix(index: usize) -> u64 {
    (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Like [`optimized_pose_with_one_initial_pose_if`] for several initial poses, returning the best result.
///
/// Every initial pose gets its own generator seeded from `rng` and its index. With a worker all poses are
/// searched concurrently for the whole timeout and the first pose reaching the target stops the others,
/// without a worker the timeout is split between the poses.
pub fn optimized_pose_with_several_initial_poses_if(
    initial_poses_if: &[WorldToCamera],
    camera: &PinholeCamera,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    target: &VariationTarget,
    rng: &mut impl Rng,
    worker: Option<&Worker>,
) -> Option<VariationResult> {
    let matcher = matcher(camera, object_points, image_points, target)?;
    if initial_poses_if.is_empty() {
        return None;
    }
    let master: u64 = rng.gen();

    let (pose_if, sqr_error) = match worker {
        Some(worker) => {
            let deadline = Instant::now() + target.timeout;
            let stop = AtomicBool::new(false);
            let best: Mutex<Option<(WorldToCamera, f64)>> = Mutex::new(None);
            worker.install(|| {
                initial_poses_if.par_iter().enumerate().for_each(|(index, initial_pose_if)| {
                    let mut seed_rng = Pcg64::seed_from_u64(master ^ mix(index));
                    let (pose_if, sqr_error) =
                        search(&matcher, initial_pose_if, target, deadline, Some(&stop), &mut seed_rng);
                    if sqr_error <= target.max_sqr_error {
                        stop.store(true, Ordering::Relaxed);
                    }
                    let mut best = best.lock();
                    if best.map_or(true, |(_, best_error)| sqr_error < best_error) {
                        *best = Some((pose_if, sqr_error));
                    }
                });
            });
            best.into_inner()?
        }
        None => {
            let budget = target.timeout / initial_poses_if.len() as u32;
            let mut best: Option<(WorldToCamera, f64)> = None;
            for (index, initial_pose_if) in initial_poses_if.iter().enumerate() {
                let mut seed_rng = Pcg64::seed_from_u64(master ^ mix(index));
                let deadline = Instant::now() + budget;
                let (pose_if, sqr_error) =
                    search(&matcher, initial_pose_if, target, deadline, None, &mut seed_rng);
                if best.map_or(true, |(_, best_error)| sqr_error < best_error) {
                    best = Some((pose_if, sqr_error));
                }
                if sqr_error <= target.max_sqr_error {
                    break;
                }
            }
            best?
        }
    };

    (sqr_error <= target.max_sqr_error).then(|| matcher.result(pose_if, sqr_error))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene() -> (PinholeCamera, CameraPose, Vec<Point3<f64>>, Vec<Point2<f64>>) {
        let camera = PinholeCamera::from_fov_x(640, 480, 60f64.to_radians());
        let pose = CameraPose::look_at(Point3::new(0.01, 0.3, 0.005), Point3::origin(), -Vector3::z()).unwrap();
        let mut rng = Pcg64::seed_from_u64(11);
        let object_points: Vec<_> = (0..120)
            .map(|_| Point3::new(rng.gen_range(-0.15..0.15), 0.0, rng.gen_range(-0.1..0.1)))
            .collect();
        let image_points = camera.project_all_to_image_if(&pose.to_inverted_flipped(), &object_points, false);
        (camera, pose, object_points, image_points)
    }

    fn disturbed(pose: &CameraPose) -> WorldToCamera {
        CameraPose::from_parts(
            pose.position().coords + Vector3::new(0.006, 0.0, -0.004),
            Rotation3::from_scaled_axis(Vector3::new(0.0, 0.015, 0.0)) * pose.rotation(),
        )
        .to_inverted_flipped()
    }

    fn target(error_determination: ErrorDetermination, pixel_error: f64) -> VariationTarget {
        VariationTarget {
            valid_correspondences: 72,
            error_determination,
            max_sqr_error: pixel_error * pixel_error,
            max_translation: 0.02,
            max_rotation: 5f64.to_radians(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn finds_pose_within_target() {
        let (camera, pose, object_points, image_points) = scene();
        for error_determination in [
            ErrorDetermination::Approximated,
            ErrorDetermination::Ambiguous,
            ErrorDetermination::Unique,
        ] {
            let target = target(error_determination, 3.0);
            let mut rng = Pcg64::seed_from_u64(1);
            let result = optimized_pose_with_one_initial_pose_if(
                &disturbed(&pose),
                &camera,
                &object_points,
                &image_points[..80],
                &target,
                &mut rng,
            )
            .unwrap();
            assert!(result.sqr_error <= target.max_sqr_error);
            assert!(result.correspondences.len() >= target.valid_correspondences);
            // Correct pairs dominate, the image points are the projections of the first object points.
            let correct = result
                .correspondences
                .iter()
                .filter(|&&(image_index, object_index)| image_index == object_index)
                .count();
            assert!(correct >= 60, "{:?}: {}", error_determination, correct);
        }
    }

    #[test]
    fn grid_pairs_agree_with_exhaustive_nearest() {
        let mut rng = Pcg64::seed_from_u64(5);
        let mut cloud = |count: usize| -> Vec<Point2<f64>> {
            (0..count)
                .map(|_| Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)))
                .collect()
        };
        let queries = cloud(300);
        let candidates = cloud(500);
        let (horizontal_bins, vertical_bins) = ideal_bins(640.0, 480.0, PAIRING_BIN_SIZE);
        let distribution = distribute_to_array(&candidates, 0.0, 0.0, 640.0, 480.0, horizontal_bins, vertical_bins);
        let max_sqr_distance = distribution.bin_width().min(distribution.bin_height()).powi(2);

        let pairs = ErrorDetermination::Ambiguous.pairs(&queries, &candidates, &distribution, max_sqr_distance);
        for (query_index, query) in queries.iter().enumerate() {
            let nearest = candidates
                .iter()
                .map(|candidate| (candidate - query).norm_squared())
                .fold(f64::MAX, f64::min);
            let pair = pairs.iter().find(|pair| pair.query == query_index);
            if nearest < max_sqr_distance {
                assert_eq!(pair.map(|pair| pair.sqr_distance), Some(nearest));
            } else {
                assert!(pair.is_none());
            }
        }

        let unique = ErrorDetermination::Unique.pairs(&queries, &candidates, &distribution, max_sqr_distance);
        assert!(unique.windows(2).all(|pair| pair[0].sqr_distance <= pair[1].sqr_distance));
        let mut used_queries = vec![false; queries.len()];
        let mut used_candidates = vec![false; candidates.len()];
        for pair in &unique {
            assert!(pair.sqr_distance < max_sqr_distance);
            assert!(!std::mem::replace(&mut used_queries[pair.query], true));
            assert!(!std::mem::replace(&mut used_candidates[pair.candidate], true));
        }
    }

    #[test]
    fn large_map_pairs_only_points_inside_frame() {
        let camera = PinholeCamera::from_fov_x(640, 480, 60f64.to_radians());
        let pose = CameraPose::look_at(Point3::new(0.01, 0.3, 0.005), Point3::origin(), -Vector3::z()).unwrap();
        let pose_if = pose.to_inverted_flipped();
        let mut rng = Pcg64::seed_from_u64(12);
        // Only about a third of the map is visible.
        let object_points: Vec<_> = (0..1000)
            .map(|_| Point3::new(rng.gen_range(-0.3..0.3), 0.0, rng.gen_range(-0.25..0.25)))
            .collect();
        let (visible, image_points): (Vec<usize>, Vec<Point2<f64>>) = object_points
            .iter()
            .enumerate()
            .map(|(index, point)| (index, camera.project_to_image_if(&pose_if, point, false)))
            .filter(|(_, point)| camera.is_inside(point))
            .unzip();
        let start = CameraPose::from_parts(
            pose.position().coords + Vector3::new(0.002, 0.0, -0.001),
            Rotation3::from_scaled_axis(Vector3::new(0.0, 0.004, 0.0)) * pose.rotation(),
        )
        .to_inverted_flipped();
        let target = VariationTarget {
            valid_correspondences: image_points.len() * 60 / 100,
            error_determination: ErrorDetermination::Unique,
            max_sqr_error: 4.0,
            max_translation: 0.01,
            max_rotation: 2f64.to_radians(),
            timeout: Duration::from_secs(5),
        };

        let result =
            optimized_pose_with_one_initial_pose_if(&start, &camera, &object_points, &image_points, &target, &mut rng)
                .unwrap();
        assert_eq!(result.correspondences.len(), target.valid_correspondences);
        let correct = result
            .correspondences
            .iter()
            .filter(|&&(image_index, object_index)| visible[image_index] == object_index)
            .count();
        assert!(correct * 10 >= target.valid_correspondences * 9, "only {} correct", correct);
        assert!(result.correspondences.iter().all(|&(_, object_index)| {
            camera.is_inside(&camera.project_to_image_if(&result.pose_if, &object_points[object_index], false))
        }));
    }

    #[test]
    fn several_poses_with_and_without_worker() {
        let (camera, pose, object_points, image_points) = scene();
        let far = CameraPose::look_at(Point3::new(0.2, 0.2, 0.2), Point3::origin(), Vector3::y())
            .unwrap()
            .to_inverted_flipped();
        let initial = [far, disturbed(&pose), far];
        let target = target(ErrorDetermination::Ambiguous, 3.0);
        let worker = Worker::new(2).unwrap();
        for worker in [None, Some(&worker)] {
            let mut rng = Pcg64::seed_from_u64(2);
            let result = optimized_pose_with_several_initial_poses_if(
                &initial,
                &camera,
                &object_points,
                &image_points[..80],
                &target,
                &mut rng,
                worker,
            )
            .unwrap();
            assert!(result.sqr_error <= target.max_sqr_error);
        }
    }

    #[test]
    fn unreachable_target_fails() {
        let (camera, pose, object_points, image_points) = scene();
        let mut rng = Pcg64::seed_from_u64(3);
        let mut target = target(ErrorDetermination::Unique, 3.0);
        target.valid_correspondences = 81;
        assert!(optimized_pose_with_one_initial_pose_if(
            &pose.to_inverted_flipped(),
            &camera,
            &object_points,
            &image_points[..80],
            &target,
            &mut rng,
        )
        .is_none());

        target.valid_correspondences = 70;
        target.timeout = Duration::from_millis(20);
        // Looks away from the map, no object point is in front of the camera.
        let nowhere = CameraPose::look_at(Point3::new(0.0, 0.3, 0.0), Point3::new(0.0, 1.0, 0.0), Vector3::z())
            .unwrap()
            .to_inverted_flipped();
        assert!(optimized_pose_with_one_initial_pose_if(
            &nowhere,
            &camera,
            &object_points,
            &image_points[..80],
            &target,
            &mut rng,
        )
        .is_none());
    }
}
