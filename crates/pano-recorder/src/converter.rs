//! Coordinate-frame conversion.
//!
//! Sensors report poses in the device frame; the stitcher works in a frame
//! where the user's start pose is the identity. The converter maps every
//! incoming frame into the stitcher frame and offers the inverse for UI
//! readback. Frames whose extrinsics are not rigid are dropped here.

use pano_core::{is_valid_pose, Frame, Mat4};
use tracing::warn;

use crate::sink::Sink;

/// `base · zero · m⁻¹ · base⁻¹`: device pose into the stitcher frame.
pub fn to_stitcher(base: &Mat4, zero: &Mat4, m: &Mat4) -> Mat4 {
    let base_inv = base.try_inverse().unwrap_or_else(Mat4::identity);
    let inv = m.try_inverse().unwrap_or_else(Mat4::identity);
    base * zero * inv * base_inv
}

/// Inverse of [`to_stitcher`], for poses handed back to the UI.
pub fn from_stitcher(base: &Mat4, zero: &Mat4, m: &Mat4) -> Mat4 {
    let base_inv = base.try_inverse().unwrap_or_else(Mat4::identity);
    let zero_inv = zero.try_inverse().unwrap_or_else(Mat4::identity);
    (zero_inv * base_inv * m * base)
        .try_inverse()
        .unwrap_or_else(Mat4::identity)
}

/// Maps device poses into the stitcher frame and forwards downstream.
pub struct CoordinateConverter<S: Sink<Frame>> {
    base: Mat4,
    zero: Mat4,
    downstream: S,
    dropped: u64,
}

impl<S: Sink<Frame>> CoordinateConverter<S> {
    pub fn new(base: Mat4, zero: Mat4, downstream: S) -> Self {
        Self {
            base,
            zero,
            downstream,
            dropped: 0,
        }
    }

    /// Device pose into the stitcher frame.
    pub fn convert_to_stitcher(&self, m: &Mat4) -> Mat4 {
        to_stitcher(&self.base, &self.zero, m)
    }

    /// Stitcher-frame pose back into device coordinates.
    pub fn convert_from_stitcher(&self, m: &Mat4) -> Mat4 {
        from_stitcher(&self.base, &self.zero, m)
    }

    /// Frames dropped because their extrinsics were not rigid transforms.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl<S: Sink<Frame>> Sink<Frame> for CoordinateConverter<S> {
    fn push(&mut self, mut frame: Frame) {
        if !is_valid_pose(&frame.original) {
            self.dropped += 1;
            warn!(id = frame.id, "frame extrinsics fail the rigidity check");
            return;
        }
        frame.original = self.convert_to_stitcher(&frame.original);
        frame.adjusted = frame.original;
        self.downstream.push(frame);
    }

    fn finish(&mut self) {
        self.downstream.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectSink;
    use pano_core::{angle_between, intrinsics, rotation_y, FrameSource};

    fn frame(pose: Mat4) -> Frame {
        Frame::new(
            0,
            intrinsics(400.0, 400.0, 320.0, 320.0),
            pose,
            FrameSource::None,
        )
    }

    #[test]
    fn start_pose_maps_to_identity() {
        let zero = rotation_y(0.7);
        let mut converter =
            CoordinateConverter::new(Mat4::identity(), zero, CollectSink::default());
        // A frame at the zero pose: base · zero · zero⁻¹ · base⁻¹ = I.
        converter.push(frame(zero));
        let converted = &converter.downstream.items[0];
        assert!(angle_between(&converted.original, &Mat4::identity()) < 1e-9);
    }

    #[test]
    fn roundtrip_through_ui_frame() {
        let base = rotation_y(0.3);
        let zero = rotation_y(-0.2);
        let converter = CoordinateConverter::new(base, zero, CollectSink::<Frame>::default());
        let pose = rotation_y(1.1);
        let there = converter.convert_to_stitcher(&pose);
        let back = converter.convert_from_stitcher(&there);
        assert!(angle_between(&pose, &back) < 1e-9);
    }

    #[test]
    fn invalid_pose_is_dropped() {
        let mut converter =
            CoordinateConverter::new(Mat4::identity(), Mat4::identity(), CollectSink::default());
        let mut bad = rotation_y(0.4);
        bad[(0, 0)] += 0.5;
        converter.push(frame(bad));
        assert!(converter.downstream.items.is_empty());
        assert_eq!(converter.dropped(), 1);
    }
}
