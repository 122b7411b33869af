pub mod capture;
pub mod source;

pub use capture::{run_capture, spawn_capture};
pub use source::{CameraSettings, FrameSource, SyntheticCamera};
