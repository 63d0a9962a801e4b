use derive_more::{AsMut, AsRef, From, Into};
use nalgebra::{
    IsometryMatrix3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3, Vector6,
};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// This trait is implemented by the rigid transformations between world and camera space:
///
/// * [`CameraToWorld`] - Transforms inverted-flipped camera points into world points
/// * [`WorldToCamera`] - Transforms world points into inverted-flipped camera points
pub trait Pose: From<IsometryMatrix3<f64>> + Clone + Copy {
    type Inverse: Pose;

    /// Retrieve the isometry.
    fn isometry(self) -> IsometryMatrix3<f64>;

    /// Creates a pose with no change in position or orientation.
    fn identity() -> Self {
        IsometryMatrix3::identity().into()
    }

    /// Takes the inverse of the pose.
    fn inverse(self) -> Self::Inverse {
        self.isometry().inverse().into()
    }

    /// Create the pose from rotation and translation.
    fn from_parts(translation: Vector3<f64>, rotation: Rotation3<f64>) -> Self {
        IsometryMatrix3::from_parts(translation.into(), rotation).into()
    }

    /// Retrieve the se(3) representation of the pose.
    ///
    /// The translation comes first, followed by the scaled axis of the rotation.
    fn se3(self) -> Vector6<f64> {
        let isometry = self.isometry();
        let t = isometry.translation.vector;
        let r = isometry.rotation.scaled_axis();
        Vector6::new(t.x, t.y, t.z, r.x, r.y, r.z)
    }

    /// Set the se(3) representation of the pose.
    fn from_se3(se3: Vector6<f64>) -> Self {
        let translation = se3.xyz();
        let rotation = Rotation3::from_scaled_axis(Vector3::new(se3[3], se3[4], se3[5]));
        Self::from_parts(translation, rotation)
    }

    /// Transform the given point.
    fn transform(self, input: Point3<f64>) -> Point3<f64> {
        self.isometry() * input
    }

    /// The angle in radians between the rotations of two poses.
    fn rotation_angle_to(self, other: Self) -> f64 {
        self.isometry()
            .rotation
            .angle_to(&other.isometry().rotation)
    }
}

/// The inverted-flipped pose of a camera.
///
/// This maps world points into camera space, where the camera looks along positive `z`,
/// `x` points right and `y` points down. A world point `p` lies in front of the camera
/// if the `z` coordinate of `pose * p` is positive.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldToCamera(pub IsometryMatrix3<f64>);

impl Pose for WorldToCamera {
    type Inverse = CameraToWorld;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

impl WorldToCamera {
    /// Returns `true` if the world point lies strictly in front of the camera.
    #[inline]
    pub fn is_in_front(&self, point: &Point3<f64>) -> bool {
        (self.0 * point).z > f64::EPSILON
    }
}

/// The inverse of [`WorldToCamera`].
///
/// This transforms inverted-flipped camera points (with depth as `z`) into world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraToWorld(pub IsometryMatrix3<f64>);

impl Pose for CameraToWorld {
    type Inverse = WorldToCamera;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

/// The standard pose of a camera.
///
/// This transforms points from camera space into world space. The camera looks along its negative
/// `z` axis, `x` points right and `y` points up. The translation is the position of the camera.
///
/// This is the convention in which poses are handed to and returned from the tracker.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraPose(pub IsometryMatrix3<f64>);

#[rustfmt::skip]
fn flip() -> Rotation3<f64> {
    Rotation3::from_matrix_unchecked(Matrix3::new(
        1.0,  0.0,  0.0,
        0.0, -1.0,  0.0,
        0.0,  0.0, -1.0,
    ))
}

impl CameraPose {
    pub fn identity() -> Self {
        Self(IsometryMatrix3::identity())
    }

    pub fn from_parts(position: Vector3<f64>, rotation: Rotation3<f64>) -> Self {
        Self(IsometryMatrix3::from_parts(position.into(), rotation))
    }

    /// Creates a camera located at `position` looking towards `target`.
    ///
    /// `up` is a hint for the upward direction of the image. Returns `None` if the viewing
    /// direction is degenerate or parallel to `up`.
    pub fn look_at(position: Point3<f64>, target: Point3<f64>, up: Vector3<f64>) -> Option<Self> {
        let z_axis = (position - target).try_normalize(f64::EPSILON)?;
        let x_axis = up.cross(&z_axis).try_normalize(1e-9)?;
        let y_axis = z_axis.cross(&x_axis);
        let rotation =
            Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[x_axis, y_axis, z_axis]));
        Some(Self::from_parts(position.coords, rotation))
    }

    /// The position of the camera in world coordinates.
    pub fn position(&self) -> Point3<f64> {
        self.0.translation.vector.into()
    }

    pub fn rotation(&self) -> Rotation3<f64> {
        self.0.rotation
    }

    pub fn orientation(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_rotation_matrix(&self.0.rotation)
    }

    /// The viewing direction of the camera in world coordinates.
    pub fn viewing_direction(&self) -> Vector3<f64> {
        -self.0.rotation.matrix().column(2).into_owned()
    }

    /// Converts the standard pose into the inverted-flipped pose.
    pub fn to_inverted_flipped(self) -> WorldToCamera {
        WorldToCamera(IsometryMatrix3::from_parts(Translation3::identity(), flip()) * self.0.inverse())
    }

    /// Converts an inverted-flipped pose back into the standard pose.
    pub fn from_inverted_flipped(pose_if: WorldToCamera) -> Self {
        Self(pose_if.0.inverse() * IsometryMatrix3::from_parts(Translation3::identity(), flip()))
    }

    /// Converts a slice of standard poses.
    pub fn to_inverted_flipped_all(poses: &[CameraPose]) -> Vec<WorldToCamera> {
        poses.iter().map(|pose| pose.to_inverted_flipped()).collect()
    }

    /// The angle in radians between the orientations of two poses.
    pub fn rotation_angle_to(&self, other: &CameraPose) -> f64 {
        self.0.rotation.angle_to(&other.0.rotation)
    }
}

impl From<CameraPose> for WorldToCamera {
    fn from(pose: CameraPose) -> Self {
        pose.to_inverted_flipped()
    }
}

impl From<WorldToCamera> for CameraPose {
    fn from(pose_if: WorldToCamera) -> Self {
        CameraPose::from_inverted_flipped(pose_if)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn inverted_flipped_round_trip() {
        let pose = CameraPose::from_parts(
            Vector3::new(0.1, 0.4, -0.2),
            Rotation3::from_scaled_axis(Vector3::new(-1.2, 0.3, 0.05)),
        );
        let recovered = CameraPose::from_inverted_flipped(pose.to_inverted_flipped());
        assert_relative_eq!(pose.0.to_homogeneous(), recovered.0.to_homogeneous(), epsilon = 1e-12);
    }

    #[test]
    fn point_ahead_has_positive_depth() {
        let pose = CameraPose::look_at(
            Point3::new(0.0, 0.5, 0.0),
            Point3::origin(),
            -Vector3::z(),
        )
        .unwrap();
        assert_relative_eq!(pose.viewing_direction(), -Vector3::y(), epsilon = 1e-12);

        let pose_if = pose.to_inverted_flipped();
        assert!(pose_if.is_in_front(&Point3::new(0.05, 0.0, 0.05)));
        assert!(!pose_if.is_in_front(&Point3::new(0.0, 1.0, 0.0)));

        // Image y points down, so world -z (the up hint) must map to negative camera y.
        let camera_point = pose_if.transform(Point3::new(0.0, 0.0, -0.1));
        assert!(camera_point.y < 0.0);
    }

    #[test]
    fn se3_round_trip() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(1.0, -2.0, 3.0),
            Rotation3::from_scaled_axis(Vector3::new(0.2, -0.1, 0.4)),
        );
        let recovered = WorldToCamera::from_se3(pose.se3());
        assert_relative_eq!(pose.0.to_homogeneous(), recovered.0.to_homogeneous(), epsilon = 1e-12);
    }

    #[test]
    fn look_at_rejects_degenerate_up() {
        assert!(CameraPose::look_at(Point3::new(0.0, 1.0, 0.0), Point3::origin(), Vector3::y()).is_none());
    }
}
