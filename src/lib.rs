pub mod adapter;
pub mod buffer;
pub mod calibration;
pub mod camera;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pose;
pub mod supervisor;
pub mod triangulation;
