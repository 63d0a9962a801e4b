//! Classification of the map points seen in a tracked frame.

use crate::correspondences::determine_nearest_candidates_if;
use crate::settings::TrackerSettings;
use crate::spatial::{determine_minimal_sqr_distance, distribute_to_array};
use cv_core::nalgebra::{Point2, Point3};
use cv_core::{CameraModel, WorldToCamera};
use cv_pinhole::PinholeCamera;
use std::collections::BTreeSet;

/// The strongest image points considered for strong and semi-strong points.
const MAX_STRONG_IMAGE_POINTS: usize = 200;
/// The strongest object points considered for strong and semi-strong points.
const MAX_STRONG_OBJECT_POINTS: usize = 400;
const MAX_USED_IMAGE_POINTS: usize = 400;
const MAX_USED_OBJECT_POINTS: usize = 800;

/// The grid bins used for the empty area test are about this many pixels wide.
const EMPTY_AREA_BIN_SIZE: u32 = 20;

/// Ascending, disjoint object point index sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Unique, accurate and isolated correspondences.
    pub strong: Vec<usize>,
    /// Weaker correspondences, only searched if too few strong points were found.
    pub semi_strong: Vec<usize>,
    /// Every object point with an unambiguous correspondence, may overlap the other sets.
    pub used: Vec<usize>,
}

/// Classifies the object points by how reliably they correspond to the image points under a fine pose.
pub fn classify_object_points_if(
    pose_if: &WorldToCamera,
    camera: &PinholeCamera,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    settings: &TrackerSettings,
) -> Classification {
    if object_points.is_empty() || image_points.is_empty() {
        return Classification::default();
    }
    let resolution_factor = camera.resolution_factor();

    let strong_image_points = &image_points[..image_points.len().min(MAX_STRONG_IMAGE_POINTS)];
    let bins = (camera.width().min(camera.height()) / EMPTY_AREA_BIN_SIZE).max(1) as usize;
    let image_distribution = distribute_to_array(
        strong_image_points,
        0.0,
        0.0,
        camera.width() as f64,
        camera.height() as f64,
        bins,
        bins,
    );
    let is_isolated = |index: usize, radius: f64| {
        determine_minimal_sqr_distance(strong_image_points, index, &image_distribution)
            > (radius * resolution_factor).powi(2)
    };

    let correspondences = determine_nearest_candidates_if(
        pose_if,
        camera,
        strong_image_points,
        &object_points[..object_points.len().min(MAX_STRONG_OBJECT_POINTS)],
        false,
        10.0 * resolution_factor,
    );

    let strong: BTreeSet<usize> = correspondences
        .iter()
        .filter(|correspondence| {
            correspondence.is_unambiguous_and_accurate(10.0 * 10.0, (2.0 * resolution_factor).powi(2))
                && is_isolated(correspondence.index, settings.strong_empty_area_radius)
        })
        .map(|correspondence| correspondence.candidate_index)
        .collect();

    let semi_strong: BTreeSet<usize> = if strong.len() < settings.minimal_strong_object_points {
        correspondences
            .iter()
            .filter(|correspondence| {
                !strong.contains(&correspondence.candidate_index)
                    && correspondence.is_unambiguous_and_accurate(5.0 * 5.0, (4.0 * resolution_factor).powi(2))
                    && is_isolated(correspondence.index, settings.semi_strong_empty_area_radius)
            })
            .map(|correspondence| correspondence.candidate_index)
            .collect()
    } else {
        BTreeSet::new()
    };

    let used: BTreeSet<usize> = determine_nearest_candidates_if(
        pose_if,
        camera,
        &image_points[..image_points.len().min(MAX_USED_IMAGE_POINTS)],
        &object_points[..object_points.len().min(MAX_USED_OBJECT_POINTS)],
        false,
        4.0 * resolution_factor,
    )
    .iter()
    .filter(|correspondence| correspondence.is_unambiguous(2.0 * 2.0))
    .map(|correspondence| correspondence.candidate_index)
    .collect();

    Classification {
        strong: strong.into_iter().collect(),
        semi_strong: semi_strong.into_iter().collect(),
        used: used.into_iter().collect(),
    }
}
