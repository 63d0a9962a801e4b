//! # Rust CV Core
//!
//! This library provides the common abstractions and types shared by the pose tracking crates in this
//! workspace. This includes camera model traits, the two camera pose conventions, and the small
//! bounding-box and line primitives used for image regions.
//!
//! ## Pose conventions
//!
//! Two conventions are used for the pose of a camera and both appear throughout the workspace:
//!
//! * [`CameraPose`] is the "standard" pose. It transforms points from camera space into world space.
//!   The camera looks along its negative `z` axis and its `y` axis points up.
//! * [`WorldToCamera`] is the "inverted-flipped" pose. It transforms points from world space into camera
//!   space, where the camera looks along its positive `z` axis and its `y` axis points down. This is the
//!   convention all of the projection math uses, because the projected pixel is simply `K * (x/z, y/z, 1)`.
//!
//! Converting between the two is cheap:
//!
//! ```text
//! inverted_flipped = flip * standard^-1
//! flip             = diag(1, -1, -1)
//! ```
//!
//! ```
//! use cv_core::{CameraPose, WorldToCamera};
//! use cv_core::nalgebra::{Point3, Vector3};
//! let pose = CameraPose::look_at(Point3::new(0.0, 1.0, 0.0), Point3::origin(), -Vector3::z()).unwrap();
//! let pose_if: WorldToCamera = pose.into();
//! // The origin is one unit in front of the camera.
//! assert!((pose_if.0 * Point3::origin() - Point3::new(0.0, 0.0, 1.0)).norm() < 1e-9);
//! ```

mod camera;
mod geometry;
mod pose;

pub use camera::*;
pub use geometry::*;
pub use nalgebra;
pub use pose::*;
