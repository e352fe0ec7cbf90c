//! Core primitives for `panorec`.
//!
//! This crate contains:
//! - linear algebra type aliases and rotation helpers (`Real`, `Mat4`, ...),
//! - the pinhole intrinsics utilities used throughout the recorder,
//! - the [`Frame`] type with its lazily loaded pixel buffer,
//! - the [`RecorderGraph`] target lattice and its generator,
//! - recorder configuration types.
//!
//! The alignment algorithms live in `pano-align`, the sink pipeline in
//! `pano-recorder`, and both are re-exported via the top-level `pano` crate.

/// Linear algebra type aliases and rotation helpers.
pub mod math;
/// Pinhole intrinsics utilities.
pub mod camera;
/// Captured frames and pixel buffers.
pub mod frame;
/// The recording-target graph on the sphere.
pub mod graph;
/// Recorder configuration.
pub mod config;
/// Synthetic frame generators for tests and examples.
pub mod synthetic;

pub use camera::*;
pub use config::*;
pub use frame::*;
pub use graph::*;
pub use math::*;
