//! Camera poses around a feature map, used as seeds when no prior pose is known.

use crate::worker::Worker;
use cv_core::nalgebra::{Point3, Vector3};
use cv_core::{Box3, CameraModel, CameraPose};
use cv_pinhole::PinholeCamera;
use parking_lot::Mutex;
use rand::Rng;
use std::f64::consts::{FRAC_PI_2, PI};

/// How often rejected random poses are redrawn.
const MAX_VISIBLE_POSE_ROUNDS: usize = 10;

/// The smallest number of candidate poses checked by one thread.
const VISIBILITY_CHUNK: usize = 8;

/// The up hint of a camera looking straight down whose image is rolled by `roll`.
fn top_down_up(roll: f64) -> Vector3<f64> {
    Vector3::new(roll.sin(), 0.0, -roll.cos())
}

/// Poses on a hemisphere of radius `distance` above the center of the bounding box, all looking at the center.
///
/// Ring `r` of `1..=rings` has an elevation of `90° * r / rings`, so the last ring looks straight down and
/// its azimuth turns into a roll of the image. All other rings are rotated by a random azimuth offset.
pub fn hemisphere_poses(
    bounding_box: &Box3,
    rng: &mut impl Rng,
    distance: f64,
    rings: usize,
    poses_per_ring: usize,
) -> Vec<CameraPose> {
    let center = bounding_box.center();
    let azimuth_step = 2.0 * PI / poses_per_ring.max(1) as f64;
    let mut poses = Vec::with_capacity(rings * poses_per_ring);
    for ring in 1..=rings {
        let elevation = FRAC_PI_2 * ring as f64 / rings as f64;
        let top = ring == rings;
        let offset = if top {
            0.0
        } else {
            rng.gen_range(0.0..azimuth_step)
        };
        for index in 0..poses_per_ring {
            let azimuth = offset + azimuth_step * index as f64;
            let pose = if top {
                CameraPose::look_at(center + Vector3::y() * distance, center, top_down_up(azimuth))
            } else {
                let direction = Vector3::new(
                    elevation.cos() * azimuth.sin(),
                    elevation.sin(),
                    elevation.cos() * azimuth.cos(),
                );
                CameraPose::look_at(center + direction * distance, center, Vector3::y())
            };
            poses.extend(pose);
        }
    }
    poses
}

/// Random poses on the upper hemisphere shell between `min_distance` and `max_distance` from the box center.
pub fn random_poses_around(
    bounding_box: &Box3,
    rng: &mut impl Rng,
    min_distance: f64,
    max_distance: f64,
    count: usize,
) -> Vec<CameraPose> {
    let center = bounding_box.center();
    let mut poses = Vec::with_capacity(count);
    while poses.len() < count {
        let height: f64 = rng.gen_range(0.1..=1.0);
        let azimuth = rng.gen_range(0.0..2.0 * PI);
        let horizontal = (1.0 - height * height).sqrt();
        let direction = Vector3::new(horizontal * azimuth.sin(), height, horizontal * azimuth.cos());
        let distance = if max_distance > min_distance {
            rng.gen_range(min_distance..max_distance)
        } else {
            min_distance
        };
        let up = if height > 0.99 {
            top_down_up(rng.gen_range(0.0..2.0 * PI))
        } else {
            Vector3::y()
        };
        poses.extend(CameraPose::look_at(center + direction * distance, center, up));
    }
    poses
}

/// Random poses from [`random_poses_around`] that see at least `min_visible_fraction` of `object_points`.
///
/// Rejected poses are redrawn for a limited number of rounds, so fewer than `count` poses are returned
/// for a map that is hardly visible from the shell. The visibility checks are split between the threads
/// of `worker`.
#[allow(clippy::too_many_arguments)]
pub fn random_visible_poses(
    camera: &PinholeCamera,
    bounding_box: &Box3,
    object_points: &[Point3<f64>],
    rng: &mut impl Rng,
    min_distance: f64,
    max_distance: f64,
    min_visible_fraction: f64,
    count: usize,
    worker: Option<&Worker>,
) -> Vec<CameraPose> {
    let min_visible = (object_points.len() as f64 * min_visible_fraction).ceil() as usize;
    let sees_enough = |pose: &CameraPose| {
        let pose_if = pose.to_inverted_flipped();
        object_points
            .iter()
            .filter(|point| pose_if.is_in_front(point))
            .filter(|point| camera.is_inside(&camera.project_to_image_if(&pose_if, point, false)))
            .count()
            >= min_visible
    };

    let mut poses = Vec::with_capacity(count);
    for _ in 0..MAX_VISIBLE_POSE_ROUNDS {
        if poses.len() >= count {
            break;
        }
        let candidates = random_poses_around(bounding_box, rng, min_distance, max_distance, count - poses.len());
        let accepted = Mutex::new(Vec::with_capacity(candidates.len()));
        let check = |start: usize, size: usize| {
            let visible: Vec<usize> = (start..start + size)
                .filter(|&index| sees_enough(&candidates[index]))
                .collect();
            accepted.lock().extend(visible);
        };
        match worker {
            Some(worker) => worker.execute_function(check, 0, candidates.len(), VISIBILITY_CHUNK),
            None => check(0, candidates.len()),
        }
        let mut accepted = accepted.into_inner();
        accepted.sort_unstable();
        poses.extend(accepted.into_iter().map(|index| candidates[index]));
    }
    poses
}

/// Four poses looking straight down at the box center from `distance`, with rolls of 0°, 90°, 180° and 270°.
pub fn top_down_poses(bounding_box: &Box3, distance: f64) -> Vec<CameraPose> {
    let center = bounding_box.center();
    (0..4)
        .filter_map(|quarter| {
            CameraPose::look_at(
                center + Vector3::y() * distance,
                center,
                top_down_up(FRAC_PI_2 * quarter as f64),
            )
        })
        .collect()
}
