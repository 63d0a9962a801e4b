use crate::{Box2, Box3, CameraPose, WorldToCamera};
use nalgebra::{Point2, Point3};

/// Allows projection of world points into the pixel coordinates of an image.
///
/// The image origin is the upper left corner of the upper left pixel, `x` points right and `y` points down.
pub trait CameraModel {
    /// Width of the image in pixels.
    fn width(&self) -> u32;

    /// Height of the image in pixels.
    fn height(&self) -> u32;

    /// Projects a world point with an inverted-flipped pose.
    ///
    /// The point must lie in front of the camera for the result to be meaningful.
    fn project_to_image_if(&self, pose_if: &WorldToCamera, point: &Point3<f64>, distort: bool) -> Point2<f64>;

    /// Projects a world point with a standard pose.
    fn project_to_image(&self, pose: &CameraPose, point: &Point3<f64>, distort: bool) -> Point2<f64> {
        self.project_to_image_if(&pose.to_inverted_flipped(), point, distort)
    }

    /// Projects a batch of world points with an inverted-flipped pose.
    fn project_all_to_image_if(
        &self,
        pose_if: &WorldToCamera,
        points: &[Point3<f64>],
        distort: bool,
    ) -> Vec<Point2<f64>> {
        points
            .iter()
            .map(|point| self.project_to_image_if(pose_if, point, distort))
            .collect()
    }

    /// Projects the eight corners of a box and returns their 2D bounding box.
    ///
    /// Corners behind the camera are ignored; an invalid box is returned if all of them are.
    fn project_box_to_image(&self, pose: &CameraPose, bounding_box: &Box3, distort: bool) -> Box2 {
        let pose_if = pose.to_inverted_flipped();
        Box2::from_points(
            bounding_box
                .corners()
                .iter()
                .filter(|corner| pose_if.is_in_front(corner))
                .map(|corner| self.project_to_image_if(&pose_if, corner, distort)),
        )
    }

    /// Checks whether the image point lies inside the image area.
    fn is_inside(&self, point: &Point2<f64>) -> bool {
        point.x >= 0.0
            && point.y >= 0.0
            && point.x < self.width() as f64
            && point.y < self.height() as f64
    }
}
