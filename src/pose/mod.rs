pub mod estimator;
pub mod keypoint;

pub use estimator::{NullEstimator, PoseEstimator, ReplayEstimator, UnavailableEstimator};
pub use keypoint::{
    Keypoint, Keypoint3d, KeypointIndex, Pose2d, Pose3d, SKELETON_EDGES,
};
