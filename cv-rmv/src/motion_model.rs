use cv_core::CameraPose;

/// Predicts the camera pose of the next frame from the last tracked frames.
///
/// The prediction is the most recent pose. A reset forgets it, so the next frame has no prediction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionModel {
    pose: Option<CameraPose>,
    updates: usize,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, pose: CameraPose) {
        self.pose = Some(pose);
        self.updates += 1;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn predicted_pose(&self) -> Option<CameraPose> {
        self.pose
    }

    pub fn is_valid(&self) -> bool {
        self.pose.is_some()
    }

    /// The number of consecutive frames tracked since the last reset.
    pub fn updates(&self) -> usize {
        self.updates
    }
}
