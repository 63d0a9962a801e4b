//! Correspondence candidates between two 2D point clouds and their validation.

use crate::spatial::{distribute_to_array, ideal_bins, DistributionArray};
use cv_core::nalgebra::{Point2, Point3};
use cv_core::{CameraModel, Line2, WorldToCamera};
use cv_optimize::median;
use cv_pinhole::PinholeCamera;

/// The size of the grid bins used when a search builds its own grid.
const SEARCH_BIN_SIZE: f64 = 20.0;

/// A query point with its best and second best candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedundantCorrespondence {
    /// Index of the query point.
    pub index: usize,
    /// Index of the nearest candidate.
    pub candidate_index: usize,
    pub candidate_sqr_distance: f64,
    /// Index and squared distance of the second nearest candidate, if one was in range.
    pub second: Option<(usize, f64)>,
}

impl RedundantCorrespondence {
    /// The second candidate is at least `uniqueness_sqr_factor` times further away than the first one.
    ///
    /// A correspondence without second candidate is not unique.
    pub fn is_unique(&self, uniqueness_sqr_factor: f64) -> bool {
        self.second.map_or(false, |(_, second_sqr_distance)| {
            second_sqr_distance >= uniqueness_sqr_factor * self.candidate_sqr_distance
        })
    }

    pub fn is_unique_and_accurate(&self, uniqueness_sqr_factor: f64, max_sqr_distance: f64) -> bool {
        self.candidate_sqr_distance <= max_sqr_distance && self.is_unique(uniqueness_sqr_factor)
    }

    /// Like [`RedundantCorrespondence::is_unique`], but a missing second candidate is accepted.
    pub fn is_unambiguous(&self, uniqueness_sqr_factor: f64) -> bool {
        self.second.map_or(true, |(_, second_sqr_distance)| {
            second_sqr_distance >= uniqueness_sqr_factor * self.candidate_sqr_distance
        })
    }

    pub fn is_unambiguous_and_accurate(&self, uniqueness_sqr_factor: f64, max_sqr_distance: f64) -> bool {
        self.candidate_sqr_distance <= max_sqr_distance && self.is_unambiguous(uniqueness_sqr_factor)
    }
}

#[derive(Default)]
struct BestTwo {
    best: Option<(usize, f64)>,
    second: Option<(usize, f64)>,
}

impl BestTwo {
    fn offer(&mut self, index: usize, sqr_distance: f64) {
        match self.best {
            Some((_, best)) if sqr_distance >= best => {
                if self.second.map_or(true, |(_, second)| sqr_distance < second) {
                    self.second = Some((index, sqr_distance));
                }
            }
            _ => {
                self.second = self.best;
                self.best = Some((index, sqr_distance));
            }
        }
    }

    fn into_correspondence(self, index: usize) -> Option<RedundantCorrespondence> {
        self.best.map(|(candidate_index, candidate_sqr_distance)| RedundantCorrespondence {
            index,
            candidate_index,
            candidate_sqr_distance,
            second: self.second,
        })
    }
}

/// Finds the two nearest candidates within `search_window_radius` of every query point by brute force.
///
/// Query points without any candidate in range are omitted.
pub fn determine_nearest_candidates(
    query_points: &[Point2<f64>],
    candidate_points: &[Point2<f64>],
    search_window_radius: f64,
) -> Vec<RedundantCorrespondence> {
    let sqr_radius = search_window_radius * search_window_radius;
    query_points
        .iter()
        .enumerate()
        .filter_map(|(index, query)| {
            let mut best = BestTwo::default();
            for (candidate_index, candidate) in candidate_points.iter().enumerate() {
                let sqr_distance = (candidate - query).norm_squared();
                if sqr_distance <= sqr_radius {
                    best.offer(candidate_index, sqr_distance);
                }
            }
            best.into_correspondence(index)
        })
        .collect()
}

/// Like [`determine_nearest_candidates`], using a grid over a `width x height` area for the search.
pub fn determine_nearest_candidates_in_area(
    query_points: &[Point2<f64>],
    candidate_points: &[Point2<f64>],
    width: u32,
    height: u32,
    search_window_radius: f64,
) -> Vec<RedundantCorrespondence> {
    let distribution = candidate_distribution(candidate_points, width, height);
    determine_nearest_candidates_with_distribution(
        query_points,
        candidate_points,
        search_window_radius,
        &distribution,
    )
}

/// Like [`determine_nearest_candidates`], using an existing grid of the candidate points.
pub fn determine_nearest_candidates_with_distribution(
    query_points: &[Point2<f64>],
    candidate_points: &[Point2<f64>],
    search_window_radius: f64,
    distribution: &DistributionArray,
) -> Vec<RedundantCorrespondence> {
    let sqr_radius = search_window_radius * search_window_radius;
    query_points
        .iter()
        .enumerate()
        .filter_map(|(index, query)| {
            let mut best = BestTwo::default();
            for candidate_index in distribution.indices_around(query, search_window_radius) {
                let sqr_distance = (candidate_points[candidate_index] - query).norm_squared();
                if sqr_distance <= sqr_radius {
                    best.offer(candidate_index, sqr_distance);
                }
            }
            best.into_correspondence(index)
        })
        .collect()
}

/// Finds candidates near every query point, where the query point must also lie close to the
/// candidate's predicted line.
pub fn determine_nearest_candidates_along_lines(
    query_points: &[Point2<f64>],
    candidate_points: &[Point2<f64>],
    candidate_lines: &[Line2],
    width: u32,
    height: u32,
    search_window_radius: f64,
    max_line_sqr_distance: f64,
) -> Vec<RedundantCorrespondence> {
    debug_assert_eq!(candidate_points.len(), candidate_lines.len());
    let distribution = candidate_distribution(candidate_points, width, height);
    let sqr_radius = search_window_radius * search_window_radius;
    query_points
        .iter()
        .enumerate()
        .filter_map(|(index, query)| {
            let mut best = BestTwo::default();
            for candidate_index in distribution.indices_around(query, search_window_radius) {
                if candidate_lines[candidate_index].sqr_distance(query) > max_line_sqr_distance {
                    continue;
                }
                let sqr_distance = (candidate_points[candidate_index] - query).norm_squared();
                if sqr_distance <= sqr_radius {
                    best.offer(candidate_index, sqr_distance);
                }
            }
            best.into_correspondence(index)
        })
        .collect()
}

/// Projects the object points and finds the two nearest projections for every image point.
///
/// Object points behind the camera are never candidates. Candidate indices refer to `object_points`.
pub fn determine_nearest_candidates_if(
    pose_if: &WorldToCamera,
    camera: &PinholeCamera,
    image_points: &[Point2<f64>],
    object_points: &[Point3<f64>],
    distort: bool,
    search_window_radius: f64,
) -> Vec<RedundantCorrespondence> {
    let (indices, projected): (Vec<usize>, Vec<Point2<f64>>) = object_points
        .iter()
        .enumerate()
        .filter(|(_, point)| pose_if.is_in_front(point))
        .map(|(index, point)| (index, camera.project_to_image_if(pose_if, point, distort)))
        .unzip();
    let mut correspondences = determine_nearest_candidates_in_area(
        image_points,
        &projected,
        camera.width(),
        camera.height(),
        search_window_radius,
    );
    for correspondence in &mut correspondences {
        correspondence.candidate_index = indices[correspondence.candidate_index];
        if let Some((second, _)) = correspondence.second.as_mut() {
            *second = indices[*second];
        }
    }
    correspondences
}

fn candidate_distribution(candidate_points: &[Point2<f64>], width: u32, height: u32) -> DistributionArray {
    let (horizontal_bins, vertical_bins) = ideal_bins(width as f64, height as f64, SEARCH_BIN_SIZE);
    distribute_to_array(
        candidate_points,
        0.0,
        0.0,
        width as f64,
        height as f64,
        horizontal_bins,
        vertical_bins,
    )
}

/// Indices of the correspondences whose object point lies in front and projects within `sqrt(max_sqr_error)`
/// of its image point.
pub fn determine_valid_correspondences_if(
    pose_if: &WorldToCamera,
    camera: &PinholeCamera,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    distort: bool,
    max_sqr_error: f64,
) -> Vec<usize> {
    object_points
        .iter()
        .zip(image_points)
        .enumerate()
        .filter(|(_, (object_point, image_point))| {
            pose_if.is_in_front(object_point)
                && (camera.project_to_image_if(pose_if, object_point, distort) - *image_point).norm_squared()
                    <= max_sqr_error
        })
        .map(|(index, _)| index)
        .collect()
}

/// Removes all correspondences not accepted by [`determine_valid_correspondences_if`], keeping the order.
pub fn remove_invalid_correspondences_if(
    pose_if: &WorldToCamera,
    camera: &PinholeCamera,
    object_points: &mut Vec<Point3<f64>>,
    image_points: &mut Vec<Point2<f64>>,
    distort: bool,
    max_sqr_error: f64,
) {
    let valid = determine_valid_correspondences_if(
        pose_if,
        camera,
        object_points,
        image_points,
        distort,
        max_sqr_error,
    );
    for (target, &source) in valid.iter().enumerate() {
        object_points[target] = object_points[source];
        image_points[target] = image_points[source];
    }
    object_points.truncate(valid.len());
    image_points.truncate(valid.len());
}

/// Indices of the point pairs whose squared distance is at most `threshold_factor` times the median.
///
/// The upper median is used and factors below one are treated as one. Filtering the result again
/// recomputes the median from the survivors and may remove more pairs, only
/// [`filter_correspondences_by_threshold`] with the threshold of the first pass leaves it unchanged.
pub fn filter_valid_correspondences(
    first_points: &[Point2<f64>],
    second_points: &[Point2<f64>],
    threshold_factor: f64,
) -> Vec<usize> {
    let subset: Vec<usize> = (0..first_points.len().min(second_points.len())).collect();
    filter_valid_correspondences_subset(first_points, second_points, &subset, threshold_factor)
}

/// Like [`filter_valid_correspondences`] for the pairs selected by `subset`, returning entries of `subset`.
pub fn filter_valid_correspondences_subset(
    first_points: &[Point2<f64>],
    second_points: &[Point2<f64>],
    subset: &[usize],
    threshold_factor: f64,
) -> Vec<usize> {
    match valid_correspondence_threshold(first_points, second_points, subset, threshold_factor) {
        Some(sqr_threshold) => filter_correspondences_by_threshold(first_points, second_points, subset, sqr_threshold),
        None => Vec::new(),
    }
}

/// The squared distance threshold of [`filter_valid_correspondences_subset`], `None` for an empty subset.
pub fn valid_correspondence_threshold(
    first_points: &[Point2<f64>],
    second_points: &[Point2<f64>],
    subset: &[usize],
    threshold_factor: f64,
) -> Option<f64> {
    let sqr_distances: Vec<f64> = subset
        .iter()
        .map(|&index| (first_points[index] - second_points[index]).norm_squared())
        .collect();
    median(&sqr_distances).map(|median| median * threshold_factor.max(1.0))
}

/// The entries of `subset` whose pairs are at most `sqr_threshold` apart.
pub fn filter_correspondences_by_threshold(
    first_points: &[Point2<f64>],
    second_points: &[Point2<f64>],
    subset: &[usize],
    sqr_threshold: f64,
) -> Vec<usize> {
    subset
        .iter()
        .copied()
        .filter(|&index| (first_points[index] - second_points[index]).norm_squared() <= sqr_threshold)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::{Vector2, Vector3};
    use cv_core::CameraPose;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn random_points(rng: &mut Pcg64, count: usize) -> Vec<Point2<f64>> {
        (0..count)
            .map(|_| Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)))
            .collect()
    }

    #[test]
    fn candidates_are_in_range_and_nearest() {
        let mut rng = Pcg64::seed_from_u64(7);
        let queries = random_points(&mut rng, 100);
        let candidates = random_points(&mut rng, 300);
        let radius = 25.0;
        let brute = determine_nearest_candidates(&queries, &candidates, radius);
        let grid = determine_nearest_candidates_in_area(&queries, &candidates, 640, 480, radius);
        assert_eq!(brute, grid);
        for correspondence in &grid {
            let query = queries[correspondence.index];
            assert!(correspondence.candidate_sqr_distance <= radius * radius);
            for (index, candidate) in candidates.iter().enumerate() {
                if index != correspondence.candidate_index {
                    assert!((candidate - query).norm_squared() >= correspondence.candidate_sqr_distance);
                }
            }
            if let Some((second, second_sqr_distance)) = correspondence.second {
                assert!(second_sqr_distance <= radius * radius);
                assert!(second_sqr_distance >= correspondence.candidate_sqr_distance);
                assert_ne!(second, correspondence.candidate_index);
            }
        }
    }

    #[test]
    fn uniqueness() {
        let lonely = RedundantCorrespondence {
            index: 0,
            candidate_index: 3,
            candidate_sqr_distance: 1.0,
            second: None,
        };
        assert!(!lonely.is_unique(4.0));
        assert!(lonely.is_unambiguous(4.0));
        assert!(!lonely.is_unambiguous_and_accurate(4.0, 0.5));

        let pair = RedundantCorrespondence {
            second: Some((5, 4.0)),
            ..lonely
        };
        assert!(pair.is_unique(4.0));
        assert!(!pair.is_unique(4.5));
        assert!(pair.is_unique_and_accurate(4.0, 1.0));
        assert!(!pair.is_unique_and_accurate(4.0, 0.9));
    }

    #[test]
    fn line_constraint_rejects_off_line_candidates() {
        let candidates = [Point2::new(100.0, 100.0), Point2::new(104.0, 100.0)];
        let lines = [
            Line2::through(Point2::new(100.0, 100.0), Point2::new(110.0, 100.0)).unwrap(),
            Line2::through(Point2::new(104.0, 100.0), Point2::new(104.0, 110.0)).unwrap(),
        ];
        let queries = [Point2::new(102.5, 100.0)];
        let all = determine_nearest_candidates_in_area(&queries, &candidates, 640, 480, 5.0);
        assert_eq!(all[0].candidate_index, 1);
        let along = determine_nearest_candidates_along_lines(&queries, &candidates, &lines, 640, 480, 5.0, 1.0);
        assert_eq!(along[0].candidate_index, 0);
        assert_eq!(along[0].second, None);
    }

    #[test]
    fn filter_removes_outliers_once() {
        let mut rng = Pcg64::seed_from_u64(3);
        let first = random_points(&mut rng, 50);
        let mut second: Vec<_> = first
            .iter()
            .map(|point| point + Vector2::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
            .collect();
        second[4].x += 50.0;
        second[17].y -= 80.0;
        let valid = filter_valid_correspondences(&first, &second, 9.0);
        assert!(!valid.contains(&4));
        assert!(!valid.contains(&17));
        assert!(valid.len() >= 45);

        let all: Vec<usize> = (0..first.len()).collect();
        let threshold = valid_correspondence_threshold(&first, &second, &all, 9.0).unwrap();
        assert_eq!(filter_correspondences_by_threshold(&first, &second, &all, threshold), valid);
        assert_eq!(filter_correspondences_by_threshold(&first, &second, &valid, threshold), valid);
        assert!(filter_valid_correspondences(&[], &[], 2.0).is_empty());
    }

    #[test]
    fn refiltering_recomputes_the_median() {
        let first = vec![Point2::origin(); 7];
        let second: Vec<Point2<f64>> = (1..=7).map(|k| Point2::new((k as f64).sqrt(), 0.0)).collect();
        let all: Vec<usize> = (0..7).collect();

        // The upper median of 1..=7 is 4, the threshold 4.8.
        let threshold = valid_correspondence_threshold(&first, &second, &all, 1.2).unwrap();
        assert!((threshold - 4.8).abs() < 1e-9);
        let valid = filter_valid_correspondences_subset(&first, &second, &all, 1.2);
        assert_eq!(valid, vec![0, 1, 2, 3]);

        // The same threshold keeps every survivor.
        assert_eq!(filter_correspondences_by_threshold(&first, &second, &valid, threshold), valid);
        // A second relative pass uses the median 3 of the survivors.
        assert_eq!(filter_valid_correspondences_subset(&first, &second, &valid, 1.2), vec![0, 1, 2]);
    }

    #[test]
    fn validation_against_pose() {
        let camera = PinholeCamera::from_fov_x(640, 480, 60f64.to_radians());
        let pose_if = CameraPose::look_at(Point3::new(0.0, 0.5, 0.0), Point3::origin(), -Vector3::z())
            .unwrap()
            .to_inverted_flipped();
        let mut object_points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.1, 0.0, 0.05),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let mut image_points = camera.project_all_to_image_if(&pose_if, &object_points, false);
        image_points[1].x += 3.0;
        assert_eq!(
            determine_valid_correspondences_if(&pose_if, &camera, &object_points, &image_points, false, 1.5 * 1.5),
            vec![0]
        );
        remove_invalid_correspondences_if(&pose_if, &camera, &mut object_points, &mut image_points, false, 10.0);
        assert_eq!(object_points.len(), 2);
        assert_eq!(image_points.len(), 2);

        let correspondences =
            determine_nearest_candidates_if(&pose_if, &camera, &image_points, &object_points, false, 5.0);
        assert_eq!(correspondences.len(), 2);
        assert_eq!(correspondences[1].candidate_index, 1);
    }
}
