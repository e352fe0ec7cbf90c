//! Pinhole intrinsics utilities.
//!
//! Intrinsics are plain 3×3 matrices with focal lengths on the diagonal and
//! the principal point in the last column, matching what capture sources
//! report. The helpers here never mutate a frame's stored intrinsics; scaled
//! copies are produced on demand.

use crate::math::{Mat3, Real};

/// Build an intrinsics matrix from focal length and principal point.
pub fn intrinsics(fx: Real, fy: Real, cx: Real, cy: Real) -> Mat3 {
    Mat3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0)
}

/// Horizontal field of view of an intrinsics matrix, `2·atan2(cx, fx)`.
pub fn horizontal_fov(k: &Mat3) -> Real {
    2.0 * k[(0, 2)].atan2(k[(0, 0)])
}

/// Vertical field of view of an intrinsics matrix, `2·atan2(cy, fx)`.
pub fn vertical_fov(k: &Mat3) -> Real {
    2.0 * k[(1, 2)].atan2(k[(0, 0)])
}

/// Whether the sensor is taller than wide.
pub fn is_portrait(k: &Mat3) -> bool {
    k[(1, 2)] > k[(0, 2)]
}

/// Rescale intrinsics to an image of `width × height` pixels.
///
/// The focal length is scaled by the ratio of the new width to the sensor
/// width implied by the principal point; the principal point is recentred.
pub fn scale_to_image(k: &Mat3, width: u32, height: u32) -> Mat3 {
    let scale = width as Real / (k[(0, 2)] * 2.0);
    intrinsics(
        k[(0, 0)] * scale,
        k[(1, 1)] * scale,
        width as Real / 2.0,
        height as Real / 2.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fov_of_square_sensor() {
        let k = intrinsics(400.0, 400.0, 320.0, 320.0);
        let expected = 2.0 * (320.0f64 / 400.0).atan();
        assert!((horizontal_fov(&k) - expected).abs() < 1e-12);
        assert!((vertical_fov(&k) - expected).abs() < 1e-12);
        assert!(!is_portrait(&k));
    }

    #[test]
    fn scaling_preserves_fov() {
        let k = intrinsics(400.0, 400.0, 320.0, 240.0);
        let scaled = scale_to_image(&k, 160, 120);
        assert!((horizontal_fov(&scaled) - horizontal_fov(&k)).abs() < 1e-12);
        assert!((scaled[(0, 2)] - 80.0).abs() < 1e-12);
        assert!((scaled[(1, 2)] - 60.0).abs() < 1e-12);
    }
}
