//! This crate plugs into `cv-core` and provides a pinhole camera model with optional lens distortion.
//! It projects world points into pixel coordinates for both of the pose conventions defined in `cv-core`
//! and can produce copies of itself at other image resolutions, which the tracker needs for its image pyramid.

use cv_core::nalgebra::{Matrix3, Point2, Point3, Vector2};
use cv_core::{CameraModel, WorldToCamera};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// This contains intrinsic camera parameters as per
/// [this Wikipedia page](https://en.wikipedia.org/wiki/Camera_resectioning#Intrinsic_parameters).
///
/// For a high quality camera, this may be sufficient to normalize image coordinates.
/// Undistortion may also be necessary to normalize image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIntrinsics {
    pub focals: Vector2<f64>,
    pub principal_point: Point2<f64>,
    pub skew: f64,
}

impl CameraIntrinsics {
    /// Creates camera intrinsics that would create an identity intrinsic matrix.
    /// This would imply that the pixel positions have an origin at `0,0`,
    /// the pixel distance unit is the focal length, pixels are square,
    /// and there is no skew.
    pub fn identity() -> Self {
        Self {
            focals: Vector2::new(1.0, 1.0),
            skew: 0.0,
            principal_point: Point2::new(0.0, 0.0),
        }
    }

    pub fn focals(self, focals: Vector2<f64>) -> Self {
        Self { focals, ..self }
    }

    pub fn focal(self, focal: f64) -> Self {
        Self {
            focals: Vector2::new(focal, focal),
            ..self
        }
    }

    pub fn principal_point(self, principal_point: Point2<f64>) -> Self {
        Self {
            principal_point,
            ..self
        }
    }

    pub fn skew(self, skew: f64) -> Self {
        Self { skew, ..self }
    }

    #[rustfmt::skip]
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focals.x,  self.skew,      self.principal_point.x,
            0.0,            self.focals.y,  self.principal_point.y,
            0.0,            0.0,            1.0,
        )
    }

    /// Takes in a point from an image in pixel coordinates and
    /// converts it to normalized image coordinates.
    ///
    /// ```
    /// use cv_pinhole::CameraIntrinsics;
    /// use cv_core::nalgebra::{Vector2, Point2};
    /// let intrinsics = CameraIntrinsics {
    ///     focals: Vector2::new(800.0, 900.0),
    ///     principal_point: Point2::new(500.0, 600.0),
    ///     skew: 1.7,
    /// };
    /// let kp = Point2::new(471.0, 322.0);
    /// let nkp = intrinsics.normalize(kp);
    /// let calibration_matrix = intrinsics.matrix();
    /// let distance = (kp.to_homogeneous() - calibration_matrix * nkp.to_homogeneous()).norm();
    /// assert!(distance < 0.1);
    /// ```
    pub fn normalize(&self, point: Point2<f64>) -> Point2<f64> {
        let centered = point - self.principal_point;
        let y = centered.y / self.focals.y;
        let x = (centered.x - self.skew * y) / self.focals.x;
        Point2::new(x, y)
    }

    /// Converts normalized image coordinates back into pixel coordinates.
    ///
    /// ```
    /// use cv_pinhole::CameraIntrinsics;
    /// use cv_core::nalgebra::{Vector2, Point2};
    /// let intrinsics = CameraIntrinsics {
    ///     focals: Vector2::new(800.0, 900.0),
    ///     principal_point: Point2::new(500.0, 600.0),
    ///     skew: 1.7,
    /// };
    /// let kp = Point2::new(471.0, 322.0);
    /// let ukp = intrinsics.denormalize(intrinsics.normalize(kp));
    /// assert!((kp - ukp).norm() < 1e-6);
    /// ```
    pub fn denormalize(&self, normalized: Point2<f64>) -> Point2<f64> {
        let y = normalized.y * self.focals.y;
        let x = normalized.x * self.focals.x + self.skew * normalized.y;
        Point2::new(x, y) + self.principal_point.coords
    }
}

/// Radial (`k1`, `k2`) and tangential (`p1`, `p2`) lens distortion applied to normalized image coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct RadialTangentialDistortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
}

impl RadialTangentialDistortion {
    pub fn is_zero(&self) -> bool {
        self.k1 == 0.0 && self.k2 == 0.0 && self.p1 == 0.0 && self.p2 == 0.0
    }

    /// Distorts a normalized image point.
    pub fn distort(&self, normalized: Point2<f64>) -> Point2<f64> {
        let (x, y) = (normalized.x, normalized.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
        Point2::new(
            x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x),
            y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y,
        )
    }
}

/// A pinhole camera with a fixed image resolution.
///
/// The camera is immutable during a tracking session and is passed by reference.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct PinholeCamera {
    width: u32,
    height: u32,
    intrinsics: CameraIntrinsics,
    distortion: RadialTangentialDistortion,
}

impl PinholeCamera {
    pub fn new(width: u32, height: u32, intrinsics: CameraIntrinsics) -> Self {
        Self {
            width,
            height,
            intrinsics,
            distortion: RadialTangentialDistortion::default(),
        }
    }

    /// Creates a camera with square pixels and a centered principal point from its horizontal field of view.
    pub fn from_fov_x(width: u32, height: u32, fov_x: f64) -> Self {
        let focal = width as f64 * 0.5 / (fov_x * 0.5).tan();
        Self::new(
            width,
            height,
            CameraIntrinsics::identity()
                .focal(focal)
                .principal_point(Point2::new(width as f64 * 0.5, height as f64 * 0.5)),
        )
    }

    #[must_use]
    pub fn with_distortion(self, distortion: RadialTangentialDistortion) -> Self {
        Self { distortion, ..self }
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    pub fn distortion(&self) -> &RadialTangentialDistortion {
        &self.distortion
    }

    pub fn has_distortion(&self) -> bool {
        !self.distortion.is_zero()
    }

    pub fn is_valid(&self) -> bool {
        self.width != 0
            && self.height != 0
            && self.intrinsics.focals.x > 0.0
            && self.intrinsics.focals.y > 0.0
    }

    /// Returns a copy of this camera for another resolution of the same image.
    ///
    /// Focal lengths and principal point are scaled with the resolution change, the distortion is kept.
    ///
    /// ```
    /// use cv_pinhole::PinholeCamera;
    /// let camera = PinholeCamera::from_fov_x(640, 480, 1.0);
    /// let half = camera.with_resolution(320, 240);
    /// assert!((half.intrinsics().focals.x * 2.0 - camera.intrinsics().focals.x).abs() < 1e-9);
    /// ```
    #[must_use]
    pub fn with_resolution(&self, width: u32, height: u32) -> Self {
        let scale_x = width as f64 / self.width as f64;
        let scale_y = height as f64 / self.height as f64;
        let intrinsics = CameraIntrinsics {
            focals: Vector2::new(
                self.intrinsics.focals.x * scale_x,
                self.intrinsics.focals.y * scale_y,
            ),
            principal_point: Point2::new(
                self.intrinsics.principal_point.x * scale_x,
                self.intrinsics.principal_point.y * scale_y,
            ),
            skew: self.intrinsics.skew * scale_x,
        };
        Self {
            width,
            height,
            intrinsics,
            distortion: self.distortion,
        }
    }

    /// Scale applied to pixel thresholds so they behave alike for all image resolutions.
    ///
    /// This is `1.0` for a 640x480 image.
    pub fn resolution_factor(&self) -> f64 {
        ((self.width as f64 * self.height as f64) / (640.0 * 480.0)).sqrt()
    }

    /// Projects a point given in inverted-flipped camera coordinates.
    pub fn project_camera_point(&self, camera_point: &Point3<f64>, distort: bool) -> Point2<f64> {
        let normalized = Point2::new(camera_point.x / camera_point.z, camera_point.y / camera_point.z);
        let normalized = if distort && self.has_distortion() {
            self.distortion.distort(normalized)
        } else {
            normalized
        };
        self.intrinsics.denormalize(normalized)
    }

    /// Returns `true` if the world point lies in front of the inverted-flipped camera.
    pub fn is_object_point_in_front_if(pose_if: &WorldToCamera, point: &Point3<f64>) -> bool {
        pose_if.is_in_front(point)
    }

    /// Back-projects a pixel onto the plane at the given inverted-flipped depth, in camera coordinates.
    ///
    /// Distortion is ignored.
    pub fn unproject_at_depth(&self, point: Point2<f64>, depth: f64) -> Point3<f64> {
        let normalized = self.intrinsics.normalize(point);
        Point3::new(normalized.x * depth, normalized.y * depth, depth)
    }
}

impl CameraModel for PinholeCamera {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn project_to_image_if(&self, pose_if: &WorldToCamera, point: &Point3<f64>, distort: bool) -> Point2<f64> {
        self.project_camera_point(&(pose_if.0 * point), distort)
    }
}
