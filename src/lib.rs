//! Undistort Tools Library
//!
//! A Rust library for turning calibrated structure-from-motion
//! reconstructions into undistorted, pinhole-equivalent ones. It covers:
//! - Camera models with projection and unprojection: perspective,
//!   Brown-Conrady, fisheye (two and four coefficient) and spherical
//! - Normalization of distorted cameras into perspective equivalents
//! - Cube-face view synthesis for spherical panoramas, grouped per rig
//! - Re-keying of feature tracks onto the undistorted shots
//! - Parallel resampling of source imagery into the new views
//! - Collection and alignment of submodel reconstructions
//!
//! The undistortion pipeline entry point is [`undistort::run_undistort`];
//! submodel alignment runs through [`align::align_submodels`].

pub mod align;
pub mod camera;
pub mod dataset;
pub mod geometry;
pub mod map;
pub mod undistort;

// Re-export commonly used types
pub use camera::{
    BrownCamera, Camera, CameraModel, CameraModelError, FisheyeCamera, FisheyeOpencvCamera,
    Intrinsics, PerspectiveCamera, Projection, Resolution, SphericalCamera,
};

pub use map::{Reconstruction, Shot, TracksManager};

pub use undistort::{
    undistort_reconstruction_set, RigInstanceCounter, UndistortError, UndistortedSet,
};
