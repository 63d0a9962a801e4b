//! Non-linear refinement of a single camera pose from 2D/3D point correspondences.
//!
//! The optimizer works on inverted-flipped poses ([`cv_core::WorldToCamera`]) and minimizes pixel
//! reprojection errors with Levenberg-Marquardt. Robust [`Estimator`]s are realized by iteratively
//! reweighting the residuals between Levenberg-Marquardt runs.

mod estimator;
mod single_view_optimizer;

pub use estimator::*;
pub use single_view_optimizer::*;
