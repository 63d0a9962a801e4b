use crate::Estimator;
use cv_core::nalgebra::{
    storage::Owned, DVector, Dyn, Matrix2x3, Matrix3, OMatrix, Point2, Point3, Vector3, Vector6,
    U6,
};
use cv_core::{Pose, WorldToCamera};
use cv_pinhole::PinholeCamera;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use log::*;

/// Smallest squared pixel sigma used when reweighting, keeps exact data from collapsing all weights.
const MIN_SQR_SIGMA: f64 = 1e-6;

/// The result of a successful pose optimization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizedPose {
    /// The optimized inverted-flipped pose.
    pub pose: WorldToCamera,
    /// Average squared pixel error of the initial pose.
    pub initial_sqr_error: f64,
    /// Average squared pixel error of the optimized pose.
    pub final_sqr_error: f64,
}

/// Minimizes the weighted reprojection error of an inverted-flipped pose.
///
/// The parameters are the translation followed by the scaled rotation axis of the pose.
#[derive(Clone)]
struct WorldToCameraProblem<'a> {
    camera: &'a PinholeCamera,
    object_points: &'a [Point3<f64>],
    image_points: &'a [Point2<f64>],
    /// Square roots of the robust weights, one per correspondence.
    sqrt_weights: Vec<f64>,
    params: Vector6<f64>,
}

impl<'a> WorldToCameraProblem<'a> {
    fn pose(&self) -> WorldToCamera {
        WorldToCamera::from_se3(self.params)
    }
}

impl<'a> LeastSquaresProblem<f64, Dyn, U6> for WorldToCameraProblem<'a> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U6>;
    type ParameterStorage = Owned<f64, U6>;

    fn set_params(&mut self, x: &Vector6<f64>) {
        self.params = *x;
    }

    fn params(&self) -> Vector6<f64> {
        self.params
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let pose = self.pose();
        let mut residuals = DVector::zeros(self.object_points.len() * 2);
        for (index, ((object_point, image_point), &weight)) in self
            .object_points
            .iter()
            .zip(self.image_points)
            .zip(&self.sqrt_weights)
            .enumerate()
        {
            let camera_point = pose.transform(*object_point);
            // Points behind the camera do not contribute.
            if camera_point.z <= f64::EPSILON {
                continue;
            }
            let delta = self.camera.project_camera_point(&camera_point, false) - image_point;
            residuals[index * 2] = delta.x * weight;
            residuals[index * 2 + 1] = delta.y * weight;
        }
        Some(residuals)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U6>> {
        let pose = self.pose();
        let intrinsics = self.camera.intrinsics();
        let (fx, fy, skew) = (intrinsics.focals.x, intrinsics.focals.y, intrinsics.skew);
        let left_jacobian = so3_left_jacobian(&Vector3::new(self.params[3], self.params[4], self.params[5]));

        let mut jacobian = OMatrix::<f64, Dyn, U6>::zeros(self.object_points.len() * 2);
        for (index, (object_point, &weight)) in self.object_points.iter().zip(&self.sqrt_weights).enumerate() {
            let rotated = pose.0.rotation * object_point.coords;
            let camera_point = rotated + pose.0.translation.vector;
            let (x, y, z) = (camera_point.x, camera_point.y, camera_point.z);
            if z <= f64::EPSILON {
                continue;
            }
            let inv_z = 1.0 / z;
            let inv_z2 = inv_z * inv_z;

            // d(pixel)/d(camera point)
            #[rustfmt::skip]
            let dp_dc = Matrix2x3::new(
                fx * inv_z, skew * inv_z, -(fx * x + skew * y) * inv_z2,
                0.0,        fy * inv_z,   -fy * y * inv_z2,
            );

            // d(camera point)/d(rotation) through a left perturbation of the rotation
            let dc_dr = -rotated.cross_matrix() * left_jacobian;

            let dp_dt = dp_dc * weight;
            let dp_dr = dp_dc * dc_dr * weight;
            for row in 0..2 {
                for column in 0..3 {
                    jacobian[(index * 2 + row, column)] = dp_dt[(row, column)];
                    jacobian[(index * 2 + row, column + 3)] = dp_dr[(row, column)];
                }
            }
        }
        Some(jacobian)
    }
}

/// The left Jacobian of SO(3) at the scaled axis `phi`.
fn so3_left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let skew = phi.cross_matrix();
    if theta < 1e-8 {
        return Matrix3::identity() + skew * 0.5;
    }
    let theta2 = theta * theta;
    Matrix3::identity()
        + skew * ((1.0 - theta.cos()) / theta2)
        + skew * skew * ((theta - theta.sin()) / (theta2 * theta))
}

/// Squared pixel errors of all correspondences, points behind the camera get `f64::MAX`.
pub fn sqr_errors_if(
    camera: &PinholeCamera,
    pose_if: &WorldToCamera,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
) -> Vec<f64> {
    object_points
        .iter()
        .zip(image_points)
        .map(|(object_point, image_point)| {
            let camera_point = pose_if.transform(*object_point);
            if camera_point.z <= f64::EPSILON {
                f64::MAX
            } else {
                (camera.project_camera_point(&camera_point, false) - image_point).norm_squared()
            }
        })
        .collect()
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Optimizes an inverted-flipped camera pose so that the object points project onto the image points.
///
/// `iterations` bounds the number of Levenberg-Marquardt iterations. For the robust estimators the
/// iterations are split into reweighting rounds of at most five iterations each.
///
/// Returns `None` for fewer than three correspondences, mismatched inputs or a numerical failure.
pub fn optimize_pose_if(
    camera: &PinholeCamera,
    initial_pose_if: &WorldToCamera,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    estimator: Estimator,
    iterations: usize,
) -> Option<OptimizedPose> {
    if object_points.len() != image_points.len() || object_points.len() < 3 || iterations == 0 {
        return None;
    }

    let initial_sqr_errors = sqr_errors_if(camera, initial_pose_if, object_points, image_points);
    let initial_sqr_error = average(&initial_sqr_errors);

    let (rounds, patience) = if estimator.needs_sigma() {
        let rounds = (iterations + 4) / 5;
        (rounds, (iterations / rounds).max(1))
    } else {
        (1, iterations)
    };

    let mut pose = *initial_pose_if;
    let mut sqr_errors = initial_sqr_errors;
    for _ in 0..rounds {
        let problem = WorldToCameraProblem {
            camera,
            object_points,
            image_points,
            sqrt_weights: estimator
                .robust_weights(&sqr_errors, MIN_SQR_SIGMA)
                .into_iter()
                .map(f64::sqrt)
                .collect(),
            params: pose.se3(),
        };
        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(patience)
            .minimize(problem);
        match report.termination {
            TerminationReason::User(reason)
            | TerminationReason::Numerical(reason)
            | TerminationReason::WrongDimensions(reason) => {
                debug!("pose optimization failed: {}", reason);
                return None;
            }
            TerminationReason::NoParameters | TerminationReason::NoResiduals => return None,
            _ => {}
        }
        if problem.params.iter().any(|value| !value.is_finite()) {
            return None;
        }
        let next = problem.pose();
        let change = (next.se3() - pose.se3()).norm();
        pose = next;
        sqr_errors = sqr_errors_if(camera, &pose, object_points, image_points);
        trace!(
            "pose optimization round with {:?} finished after {} evaluations, change {}",
            estimator,
            report.number_of_evaluations,
            change
        );
        if change < 1e-12 {
            break;
        }
    }

    Some(OptimizedPose {
        pose,
        initial_sqr_error,
        final_sqr_error: average(&sqr_errors),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cv_core::CameraPose;
    use cv_core::nalgebra::Rotation3;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn scene() -> (PinholeCamera, CameraPose, Vec<Point3<f64>>, Vec<Point2<f64>>) {
        use cv_core::CameraModel;
        let camera = PinholeCamera::from_fov_x(640, 480, 60f64.to_radians());
        let pose = CameraPose::look_at(Point3::new(0.05, 0.35, 0.1), Point3::origin(), -Vector3::z()).unwrap();
        let mut rng = Pcg64::seed_from_u64(0);
        let object_points: Vec<_> = (0..50)
            .map(|_| Point3::new(rng.gen_range(-0.15..0.15), 0.0, rng.gen_range(-0.1..0.1)))
            .collect();
        let image_points = camera.project_all_to_image_if(&pose.to_inverted_flipped(), &object_points, false);
        (camera, pose, object_points, image_points)
    }

    fn disturbed(pose: &CameraPose) -> WorldToCamera {
        CameraPose::from_parts(
            pose.position().coords + Vector3::new(0.01, -0.005, 0.008),
            Rotation3::from_scaled_axis(Vector3::new(0.02, 0.01, -0.03)) * pose.rotation(),
        )
        .to_inverted_flipped()
    }

    #[test]
    fn left_jacobian_is_identity_at_zero() {
        assert_relative_eq!(so3_left_jacobian(&Vector3::zeros()), Matrix3::identity());
    }

    #[test]
    fn recovers_pose_from_exact_correspondences() {
        let (camera, pose, object_points, image_points) = scene();
        for estimator in [Estimator::Square, Estimator::Huber, Estimator::Tukey] {
            let optimized =
                optimize_pose_if(&camera, &disturbed(&pose), &object_points, &image_points, estimator, 30).unwrap();
            assert!(optimized.final_sqr_error < 1e-8, "{:?}: {}", estimator, optimized.final_sqr_error);
            assert!(optimized.initial_sqr_error > optimized.final_sqr_error);
            let recovered = CameraPose::from_inverted_flipped(optimized.pose);
            assert!((recovered.position() - pose.position()).norm() < 1e-6);
        }
    }

    #[test]
    fn tukey_rejects_outliers() {
        let (camera, pose, object_points, mut image_points) = scene();
        for point in image_points.iter_mut().take(5) {
            point.x += 40.0;
            point.y -= 25.0;
        }
        let optimized = optimize_pose_if(
            &camera,
            &disturbed(&pose),
            &object_points,
            &image_points,
            Estimator::Huber,
            30,
        )
        .and_then(|huber| {
            optimize_pose_if(&camera, &huber.pose, &object_points, &image_points, Estimator::Tukey, 30)
        })
        .unwrap();
        let recovered = CameraPose::from_inverted_flipped(optimized.pose);
        assert!((recovered.position() - pose.position()).norm() < 1e-4);
    }

    #[test]
    fn rejects_too_few_correspondences() {
        let (camera, pose, object_points, image_points) = scene();
        let pose_if = pose.to_inverted_flipped();
        assert!(optimize_pose_if(&camera, &pose_if, &object_points[..2], &image_points[..2], Estimator::Square, 10).is_none());
        assert!(optimize_pose_if(&camera, &pose_if, &object_points[..5], &image_points[..4], Estimator::Square, 10).is_none());
    }
}
