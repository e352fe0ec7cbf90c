//! Pairwise frame correlation: angular offset between two overlapping frames.
//!
//! The correlator predicts the overlap region of two frames from their
//! poses, measures the actual pixel displacement of the region contents
//! with the pyramid aligner, and reports the *corrective* offset: the
//! rotation to apply to the first frame so its pose agrees with the image
//! evidence. A pair whose poses already explain the pixels reports an
//! offset near zero, which is what makes ring closure idempotent.

use pano_core::{angular_offset, horizontal_fov, rotation_part, vertical_fov, Frame, Real, Vec3};
use tracing::debug;

use crate::planar::{Correlator, ErrorMetric, PyramidAligner};

/// Why a match was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectionReason {
    /// Predicted overlap region smaller than the configured minimum.
    NoOverlap,
    /// Best offset sits on the search window boundary.
    OutOfWindow,
    /// Correlation landscape too flat around the minimum.
    DeviationTest,
}

/// Outcome of matching two frames.
#[derive(Clone, Copy, Debug)]
pub struct CorrelationResult {
    pub valid: bool,
    /// Residual pixel displacement beyond the pose prediction, in the
    /// corrective sign convention.
    pub offset: (i32, i32),
    /// Corrective angular offset for the first frame; `x` is pitch, `y`
    /// is yaw.
    pub angular_offset: Vec3,
    pub rejection: Option<RejectionReason>,
    /// `√variance / n` over the pooled correlation landscape.
    pub correlation_coefficient: Real,
    /// Overlap region size in pixels.
    pub overlap: u32,
}

impl CorrelationResult {
    fn rejected(reason: RejectionReason, overlap: u32) -> Self {
        Self {
            valid: false,
            offset: (0, 0),
            angular_offset: Vec3::zeros(),
            rejection: Some(reason),
            correlation_coefficient: 0.0,
            overlap,
        }
    }
}

/// Minimum normalised variance around the minimum for the deviation test.
pub const DEVIATION_MIN_VARIANCE: Real = 0.02;

/// Tuning knobs of the pairwise correlator.
#[derive(Clone, Copy, Debug)]
pub struct CorrelatorSettings {
    /// Minimum overlap dimension in pixels; capped at 4 by the matcher.
    pub min_overlap: u32,
    /// Reject matches with a flat correlation landscape.
    pub deviation_test: bool,
    /// Border added around the predicted overlap, as a fraction of its
    /// size, to absorb pose error.
    pub pad: Real,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            min_overlap: 4,
            deviation_test: false,
            pad: 0.2,
        }
    }
}

/// Pixel ranges of the overlap along one axis, in each image, plus the
/// overlap centre in `a`'s pixel-angle coordinates.
struct AxisOverlap {
    a0: i64,
    a1: i64,
    b0: i64,
    b1: i64,
    center: Real,
}

/// Overlap of two views along one image axis, computed in angle space.
///
/// `delta` is the centre of `b`'s angular coverage expressed in `a`'s
/// pixel-angle coordinates, `fov` the coverage of either view, `size` the
/// image dimension, `c` the principal point and `focal` the focal length
/// in pixels. Working in angles keeps the prediction honest near the edge
/// of the field of view, where the planar `tan` mapping stretches.
fn axis_overlap(delta: Real, fov: Real, size: i64, c: Real, focal: Real) -> Option<AxisOverlap> {
    let half = fov / 2.0;
    let lo = (-half).max(delta - half);
    let hi = half.min(delta + half);
    if hi <= lo {
        return None;
    }
    let to_px = |angle: Real| -> i64 { (c + focal * angle.tan()).round() as i64 };
    let a0 = to_px(lo).clamp(0, size);
    let a1 = to_px(hi).clamp(0, size);
    let b0 = to_px(lo - delta).clamp(0, size);
    let b1 = to_px(hi - delta).clamp(0, size);
    Some(AxisOverlap {
        a0,
        a1,
        b0,
        b1,
        center: (lo + hi) / 2.0,
    })
}

/// Measures the angular drift between two overlapping frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct PairwiseCorrelator {
    settings: CorrelatorSettings,
}

impl PairwiseCorrelator {
    pub fn new(settings: CorrelatorSettings) -> Self {
        Self { settings }
    }

    /// Match on the pose-predicted overlap regions.
    pub fn match_frames(&self, a: &Frame, b: &Frame) -> CorrelationResult {
        self.match_impl(a, b, false)
    }

    /// Match on whole images, for ring closure where the pose prediction
    /// spans the ring wrap-around.
    pub fn match_whole(&self, a: &Frame, b: &Frame) -> CorrelationResult {
        self.match_impl(a, b, true)
    }

    fn match_impl(&self, a: &Frame, b: &Frame, force_whole_image: bool) -> CorrelationResult {
        let (Some(pa), Some(pb)) = (a.pixels(), b.pixels()) else {
            debug!(a = a.id, b = b.id, "match on unloaded frames");
            return CorrelationResult::rejected(RejectionReason::NoOverlap, 0);
        };

        let k = a.scaled_intrinsics();
        let (w, h) = (pa.width() as i64, pa.height() as i64);
        // Sensor half-extents mapped through the focal length; both equal
        // the focal length when the principal point is centred.
        let hx = k[(0, 0)] * w as Real / (2.0 * k[(0, 2)]);
        let hy = k[(0, 0)] * h as Real / (2.0 * k[(1, 2)]);
        let (cx, cy) = (k[(0, 2)], k[(1, 2)]);

        let expected = angular_offset(&a.adjusted, &b.adjusted);
        // Centre of b's coverage in a's pixel-angle coordinates. Horizontal
        // pixel angles grow with yaw, vertical ones against pitch.
        let delta_x = expected.y;
        let delta_y = -expected.x;

        let (crop_a, crop_b, origin_a, origin_b, pred) = if force_whole_image {
            let pred_x = (-hx * expected.y.tan()).round() as i64;
            let pred_y = (hy * expected.x.tan()).round() as i64;
            (
                pa.clone(),
                pb.clone(),
                (0i64, 0i64),
                (0i64, 0i64),
                (pred_x, pred_y),
            )
        } else {
            let view_angle = {
                let za = rotation_part(&a.adjusted) * Vec3::z();
                let zb = rotation_part(&b.adjusted) * Vec3::z();
                za.dot(&zb).clamp(-1.0, 1.0).acos()
            };
            if view_angle >= horizontal_fov(&k).max(vertical_fov(&k)) {
                return CorrelationResult::rejected(RejectionReason::NoOverlap, 0);
            }

            let min_dim = self.settings.min_overlap.min(4) as i64;
            let Some(ox) = axis_overlap(delta_x, horizontal_fov(&k), w, cx, hx) else {
                return CorrelationResult::rejected(RejectionReason::NoOverlap, 0);
            };
            let Some(oy) = axis_overlap(delta_y, vertical_fov(&k), h, cy, hy) else {
                return CorrelationResult::rejected(RejectionReason::NoOverlap, 0);
            };
            if (ox.a1 - ox.a0).min(ox.b1 - ox.b0) < min_dim
                || (oy.a1 - oy.a0).min(oy.b1 - oy.b0) < min_dim
            {
                return CorrelationResult::rejected(RejectionReason::NoOverlap, 0);
            }

            let pad_x = ((ox.a1 - ox.a0) as Real * self.settings.pad) as i64;
            let pad_y = ((oy.a1 - oy.a0) as Real * self.settings.pad) as i64;
            let (wb, hb) = (pb.width() as i64, pb.height() as i64);

            let (ax0, ax1) = ((ox.a0 - pad_x).max(0), (ox.a1 + pad_x).min(w));
            let (ay0, ay1) = ((oy.a0 - pad_y).max(0), (oy.a1 + pad_y).min(h));
            let (bx0, bx1) = ((ox.b0 - pad_x).max(0), (ox.b1 + pad_x).min(wb));
            let (by0, by1) = ((oy.b0 - pad_y).max(0), (oy.b1 + pad_y).min(hb));

            let crop_a = pa.crop(
                ax0 as u32,
                ay0 as u32,
                (ax1 - ax0) as u32,
                (ay1 - ay0) as u32,
            );
            let crop_b = pb.crop(
                bx0 as u32,
                by0 as u32,
                (bx1 - bx0) as u32,
                (by1 - by0) as u32,
            );
            // Displacement the poses predict for content at the overlap
            // centre, between the full images.
            let pred_x = (hx * ((ox.center - delta_x).tan() - ox.center.tan())).round() as i64;
            let pred_y = (hy * ((oy.center - delta_y).tan() - oy.center.tan())).round() as i64;
            (crop_a, crop_b, (ax0, ay0), (bx0, by0), (pred_x, pred_y))
        };

        let overlap = crop_a.width().min(crop_b.width()) * crop_a.height().min(crop_b.height());

        let aligner = PyramidAligner::new(Correlator::Normed(ErrorMetric::LeastSquares));
        let found = aligner.align(&crop_a, &crop_b);

        // Residual displacement beyond the pose prediction.
        let rx = (origin_b.0 - origin_a.0 + found.offset.0 as i64 - pred.0) as i32;
        let ry = (origin_b.1 - origin_a.1 + found.offset.1 as i64 - pred.1) as i32;

        let wx = (crop_a.width().max(crop_b.width()) as Real * 0.5) as i32;
        let wy = (crop_a.height().max(crop_b.height()) as Real * 0.5) as i32;
        if found.offset.0.abs() >= wx.max(1) || found.offset.1.abs() >= wy.max(1) {
            return CorrelationResult::rejected(RejectionReason::OutOfWindow, overlap);
        }

        let coefficient = if found.n > 0 {
            found.variance.sqrt() / found.n as Real
        } else {
            0.0
        };
        if self.settings.deviation_test && coefficient < DEVIATION_MIN_VARIANCE {
            return CorrelationResult::rejected(RejectionReason::DeviationTest, overlap);
        }

        // Convert the residual to corrective angles at the overlap centre of
        // the second image, where the content actually sits.
        let xc = origin_b.0 as Real + crop_b.width() as Real / 2.0;
        let yc = origin_b.1 as Real + crop_b.height() as Real / 2.0;
        let yaw = ((xc + rx as Real - cx) / hx).atan() - ((xc - cx) / hx).atan();
        let pitch = -(((yc + ry as Real - cy) / hy).atan() - ((yc - cy) / hy).atan());

        CorrelationResult {
            valid: true,
            offset: (rx, ry),
            angular_offset: Vec3::new(pitch, yaw, 0.0),
            rejection: None,
            correlation_coefficient: coefficient,
            overlap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pano_core::{intrinsics, rotation_x, rotation_y, synthetic, FrameSource, Mat4, PixelBuffer};

    const SIZE: u32 = 96;

    fn frame_with(id: u64, true_pose: Mat4, claimed_pose: Mat4) -> Frame {
        let k = intrinsics(400.0, 400.0, 320.0, 320.0);
        let mut frame = Frame::new(id, k, claimed_pose, FrameSource::None);
        frame.attach_pixels(synthetic::render_view(&k, &true_pose, SIZE, SIZE));
        frame
    }

    fn frame_at(id: u64, true_yaw: Real, pose_yaw: Real) -> Frame {
        frame_with(id, rotation_y(true_yaw), rotation_y(pose_yaw))
    }

    #[test]
    fn consistent_pair_reports_near_zero() {
        let a = frame_at(0, 0.0, 0.0);
        let b = frame_at(1, 0.25, 0.25);
        let result = PairwiseCorrelator::default().match_frames(&a, &b);
        assert!(result.valid, "rejected: {:?}", result.rejection);
        assert!(result.offset.0.abs() <= 2);
        assert!(result.angular_offset.y.abs() < 0.04);
    }

    #[test]
    fn measures_pose_error_of_first_frame() {
        // Frame a claims 0.05 rad more yaw than its image shows.
        let a = frame_at(0, 0.0, 0.05);
        let b = frame_at(1, 0.25, 0.25);
        let result = PairwiseCorrelator::default().match_frames(&a, &b);
        assert!(result.valid, "rejected: {:?}", result.rejection);
        assert!(
            (result.angular_offset.y + 0.05).abs() < 0.025,
            "yaw correction {} should be near -0.05",
            result.angular_offset.y
        );
    }

    #[test]
    fn symmetric_up_to_sign() {
        let a = frame_at(0, 0.0, 0.02);
        let b = frame_at(1, 0.3, 0.3);
        let correlator = PairwiseCorrelator::default();
        let ab = correlator.match_frames(&a, &b);
        let ba = correlator.match_frames(&b, &a);
        assert!(ab.valid && ba.valid);
        assert!((ab.offset.0 + ba.offset.0).abs() <= 1);
        assert!((ab.offset.1 + ba.offset.1).abs() <= 1);
    }

    #[test]
    fn cross_ring_pair_is_matchable() {
        // A frame of an upper ring against the equator frame below it.
        let pitch = 0.8;
        let a = frame_with(0, rotation_x(pitch), rotation_x(pitch));
        let b = frame_with(1, Mat4::identity(), Mat4::identity());
        let result = PairwiseCorrelator::default().match_frames(&a, &b);
        assert!(result.valid, "rejected: {:?}", result.rejection);
        assert!(result.offset.1.abs() <= 3);
    }

    #[test]
    fn intensity_scaling_moves_offset_at_most_one_pixel() {
        let a = frame_at(0, 0.0, 0.0);
        let b = frame_at(1, 0.25, 0.25);
        let correlator = PairwiseCorrelator::default();
        let base = correlator.match_frames(&a, &b);

        for gain in [0.9, 1.1] {
            let pixels = b.pixels().unwrap();
            let scaled: Vec<u8> = pixels
                .as_bytes()
                .iter()
                .map(|&v| ((v as Real * gain).min(255.0)) as u8)
                .collect();
            let mut b2 = b.clone();
            b2.attach_pixels(PixelBuffer::new(SIZE, SIZE, scaled).unwrap());
            let result = correlator.match_frames(&a, &b2);
            assert!(result.valid);
            assert!((result.offset.0 - base.offset.0).abs() <= 1);
            assert!((result.offset.1 - base.offset.1).abs() <= 1);
        }
    }

    #[test]
    fn rejects_disjoint_frames() {
        let a = frame_at(0, 0.0, 0.0);
        let b = frame_at(1, 2.5, 2.5);
        let result = PairwiseCorrelator::default().match_frames(&a, &b);
        assert!(!result.valid);
        assert_eq!(result.rejection, Some(RejectionReason::NoOverlap));
    }

    #[test]
    fn unloaded_frames_are_rejected() {
        let k = intrinsics(400.0, 400.0, 320.0, 320.0);
        let a = Frame::new(0, k, Mat4::identity(), FrameSource::None);
        let b = frame_at(1, 0.1, 0.1);
        let result = PairwiseCorrelator::default().match_frames(&a, &b);
        assert!(!result.valid);
    }
}
