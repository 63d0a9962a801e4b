use thiserror::Error;

/// Errors while building a feature map.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("the feature map does not contain any object points")]
    Empty,
    #[error("no features could be detected in the reference image")]
    NoFeatures,
    #[error("the physical dimension of the reference image must be positive, got {0}x{1}")]
    InvalidDimension(f64, f64),
}

/// Reasons why a frame did not produce a pose.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackingError {
    #[error("no feature map has been set")]
    NoFeatureMap,
    #[error("the frame is {frame_width}x{frame_height} but the camera expects {camera_width}x{camera_height}")]
    FrameMismatch {
        frame_width: u32,
        frame_height: u32,
        camera_width: u32,
        camera_height: u32,
    },
    #[error("the camera is invalid")]
    InvalidCamera,
    #[error("no tracking strategy could determine the camera pose")]
    TrackingLost,
}
