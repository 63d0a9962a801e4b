//! This crate tracks the 6-DOF pose of a monocular camera relative to a known map of 3D feature points.
//!
//! The camera is found without any prior pose by scoring a bank of seed poses against the detected
//! features and refining the best ones with random model variation, a randomized hill climb over the
//! pose that minimizes the distance between detections and projected map points. Once found, every frame
//! starts from the previous pose and re-identifies the map points that were reliable in the last frame.
//!
//! Start with [`RmvTracker`] and [`RmvFeatureMap`].

mod correspondences;
mod detector;
mod error;
mod feature_map;
pub mod frame;
mod motion_model;
mod pose_projection;
mod random_model_variation;
mod randomized_pose;
mod settings;
mod spatial;
mod tracker;
mod worker;

pub use correspondences::*;
pub use detector::*;
pub use error::*;
pub use feature_map::*;
pub use motion_model::*;
pub use pose_projection::*;
pub use random_model_variation::*;
pub use randomized_pose::*;
pub use settings::*;
pub use spatial::*;
pub use tracker::*;
pub use worker::*;
