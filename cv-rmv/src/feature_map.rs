//! The 3D feature map a camera is tracked against, with the optional initialization subset for cold starts.
//!
//! A map is either given as object points or derived from a reference image of a planar pattern.

use crate::detector::{DetectorType, FeatureDetector, RmvFeatureDetector};
use crate::error::MapError;
use crate::frame;
use cv_core::nalgebra::{Point3, Vector2};
use cv_core::Box3;
use cv_pinhole::PinholeCamera;
use image::DynamicImage;
use log::*;

/// The detector threshold used for reference images.
const REFERENCE_DETECTOR_THRESHOLD: f64 = 30.0;

/// Object points used only for cold starts, usually a smaller and more distinctive set than the map.
#[derive(Debug, Clone)]
struct InitializationFeatures {
    object_points: Vec<Point3<f64>>,
    bounding_box: Box3,
    camera: PinholeCamera,
    detector_type: DetectorType,
}

/// The 3D reference points a camera is tracked against.
///
/// The object points are ordered by descending feature strength. Beside the points the map holds the
/// classification of the points found in the most recent frame, which is rewritten after every
/// successfully tracked frame.
#[derive(Debug, Clone)]
pub struct RmvFeatureMap {
    object_points: Vec<Point3<f64>>,
    bounding_box: Box3,
    camera: PinholeCamera,
    detector_type: DetectorType,
    initialization: Option<InitializationFeatures>,
    recent_strong_object_point_indices: Vec<usize>,
    recent_semi_strong_object_point_indices: Vec<usize>,
    recent_used_object_point_indices: Vec<usize>,
}

/// Detects features in a reference image and places them on the `y = 0` plane.
///
/// The image center lands on the origin, image `x` along world `x` and image `y` along world `z`.
fn planar_points_from_image(
    image: &DynamicImage,
    dimension: Vector2<f64>,
    detector_type: DetectorType,
    max_features: usize,
) -> Result<Vec<Point3<f64>>, MapError> {
    if !(dimension.x > 0.0) || !(dimension.y >= 0.0) {
        return Err(MapError::InvalidDimension(dimension.x, dimension.y));
    }
    let gray = frame::to_gray(image);
    let (width, height) = (gray.width() as f64, gray.height() as f64);
    if gray.width() == 0 || gray.height() == 0 {
        return Err(MapError::NoFeatures);
    }
    let dimension_y = if dimension.y == 0.0 {
        dimension.x * height / width
    } else {
        dimension.y
    };
    let gray = if detector_type.needs_smoothed_frame() {
        frame::smooth(&gray)
    } else {
        gray
    };
    let features = RmvFeatureDetector::new(detector_type).detect_with_target(
        &gray,
        max_features,
        REFERENCE_DETECTOR_THRESHOLD,
        true,
        None,
    );
    if features.is_empty() {
        return Err(MapError::NoFeatures);
    }
    debug!(
        "placed {} features of a {}x{} reference image on a {}x{} plane",
        features.len(),
        width,
        height,
        dimension.x,
        dimension_y
    );
    Ok(features
        .iter()
        .map(|feature| {
            Point3::new(
                (feature.x / width - 0.5) * dimension.x,
                0.0,
                (feature.y / height - 0.5) * dimension_y,
            )
        })
        .collect())
}

fn is_ascending_and_bounded(indices: &[usize], len: usize) -> bool {
    indices.windows(2).all(|pair| pair[0] < pair[1]) && indices.last().map_or(true, |&last| last < len)
}

impl RmvFeatureMap {
    /// Creates a map from 3D points ordered by descending strength.
    ///
    /// `camera` and `detector_type` describe how the points were observed.
    pub fn new(
        object_points: Vec<Point3<f64>>,
        camera: PinholeCamera,
        detector_type: DetectorType,
    ) -> Result<Self, MapError> {
        if object_points.is_empty() {
            return Err(MapError::Empty);
        }
        let bounding_box = Box3::from_points(&object_points);
        Ok(Self {
            object_points,
            bounding_box,
            camera,
            detector_type,
            initialization: None,
            recent_strong_object_point_indices: Vec::new(),
            recent_semi_strong_object_point_indices: Vec::new(),
            recent_used_object_point_indices: Vec::new(),
        })
    }

    /// Creates a planar map from the features of a reference image.
    ///
    /// `dimension` is the physical size of the image, a zero height is derived from the aspect ratio.
    pub fn from_image(
        image: &DynamicImage,
        dimension: Vector2<f64>,
        camera: PinholeCamera,
        detector_type: DetectorType,
        max_features: usize,
    ) -> Result<Self, MapError> {
        let object_points = planar_points_from_image(image, dimension, detector_type, max_features)?;
        Self::new(object_points, camera, detector_type)
    }

    /// Uses a separate set of points for cold starts.
    pub fn set_initialization_features(
        &mut self,
        object_points: Vec<Point3<f64>>,
        camera: PinholeCamera,
        detector_type: DetectorType,
    ) -> Result<(), MapError> {
        if object_points.is_empty() {
            return Err(MapError::Empty);
        }
        self.initialization = Some(InitializationFeatures {
            bounding_box: Box3::from_points(&object_points),
            object_points,
            camera,
            detector_type,
        });
        Ok(())
    }

    /// Uses the features of a reference image for cold starts, see [`RmvFeatureMap::from_image`].
    pub fn set_initialization_features_from_image(
        &mut self,
        image: &DynamicImage,
        dimension: Vector2<f64>,
        camera: PinholeCamera,
        detector_type: DetectorType,
        max_features: usize,
    ) -> Result<(), MapError> {
        let object_points = planar_points_from_image(image, dimension, detector_type, max_features)?;
        self.set_initialization_features(object_points, camera, detector_type)
    }

    pub fn object_points(&self) -> &[Point3<f64>] {
        &self.object_points
    }

    pub fn bounding_box(&self) -> &Box3 {
        &self.bounding_box
    }

    pub fn camera(&self) -> &PinholeCamera {
        &self.camera
    }

    pub fn detector_type(&self) -> DetectorType {
        self.detector_type
    }

    pub fn initialization_object_points(&self) -> &[Point3<f64>] {
        self.initialization
            .as_ref()
            .map_or(&self.object_points, |initialization| &initialization.object_points)
    }

    pub fn initialization_bounding_box(&self) -> &Box3 {
        self.initialization
            .as_ref()
            .map_or(&self.bounding_box, |initialization| &initialization.bounding_box)
    }

    pub fn initialization_camera(&self) -> &PinholeCamera {
        self.initialization
            .as_ref()
            .map_or(&self.camera, |initialization| &initialization.camera)
    }

    pub fn initialization_detector_type(&self) -> DetectorType {
        self.initialization
            .as_ref()
            .map_or(self.detector_type, |initialization| initialization.detector_type)
    }

    pub fn is_valid(&self) -> bool {
        !self.object_points.is_empty() && self.bounding_box.is_valid()
    }

    /// Replaces the classification of the most recent frame.
    ///
    /// All index sets must be ascending and within the map, strong and semi-strong indices must be disjoint.
    pub fn set_most_recent_object_point_indices(
        &mut self,
        strong: Vec<usize>,
        semi_strong: Vec<usize>,
        used: Vec<usize>,
    ) {
        let len = self.object_points.len();
        debug_assert!(is_ascending_and_bounded(&strong, len));
        debug_assert!(is_ascending_and_bounded(&semi_strong, len));
        debug_assert!(is_ascending_and_bounded(&used, len));
        debug_assert!(strong.iter().all(|index| semi_strong.binary_search(index).is_err()));
        self.recent_strong_object_point_indices = strong;
        self.recent_semi_strong_object_point_indices = semi_strong;
        self.recent_used_object_point_indices = used;
    }

    pub fn clear_most_recent_object_point_indices(&mut self) {
        self.recent_strong_object_point_indices.clear();
        self.recent_semi_strong_object_point_indices.clear();
        self.recent_used_object_point_indices.clear();
    }

    pub fn recent_strong_object_point_indices(&self) -> &[usize] {
        &self.recent_strong_object_point_indices
    }

    pub fn recent_semi_strong_object_point_indices(&self) -> &[usize] {
        &self.recent_semi_strong_object_point_indices
    }

    pub fn recent_used_object_point_indices(&self) -> &[usize] {
        &self.recent_used_object_point_indices
    }

    /// The object points of the first `max` used indices.
    pub fn recent_used_object_points(&self, max: usize) -> Vec<Point3<f64>> {
        self.recent_used_object_point_indices
            .iter()
            .take(max)
            .map(|&index| self.object_points[index])
            .collect()
    }
}
