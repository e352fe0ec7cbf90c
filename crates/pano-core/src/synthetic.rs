//! Synthetic scenes and sweeps.
//!
//! This module is public so workspace test suites can share it. It renders
//! deterministic views of a fixed procedural sphere texture, which gives the
//! correlators real structure to lock onto without any image assets.

use crate::camera::scale_to_image;
use crate::frame::{Frame, FrameSource, PixelBuffer};
use crate::math::{rotation_part, rotation_x, rotation_y, Mat3, Mat4, Real, Vec3};

/// Smooth multi-frequency texture over viewing directions.
///
/// Channels differ in phase so colour stays meaningful after conversion to
/// intensity differences.
fn shade(dir: &Vec3, channel: usize) -> u8 {
    let p = channel as Real * 2.1;
    let v = 0.5
        + 0.24 * (3.0 * dir.x + 2.0 * dir.y - 1.5 * dir.z + p).sin()
        + 0.14 * (9.0 * dir.x + 5.0 * dir.y - 3.0 * dir.z + p).sin()
        + 0.10 * (17.0 * dir.x - 6.0 * dir.y + 11.0 * dir.z + 1.3 + p).sin()
        + 0.07 * (29.0 * dir.x + 23.0 * dir.y + 5.0 * dir.z + 0.7).sin();
    (v.clamp(0.0, 1.0) * 255.0) as u8
}

/// Render the procedural sphere as seen from `pose`.
pub fn render_view(intrinsics: &Mat3, pose: &Mat4, width: u32, height: u32) -> PixelBuffer {
    let k = scale_to_image(intrinsics, width, height);
    let (fx, fy) = (k[(0, 0)], k[(1, 1)]);
    let (cx, cy) = (k[(0, 2)], k[(1, 2)]);
    let r = rotation_part(pose);

    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            let cam = Vec3::new(
                (x as Real + 0.5 - cx) / fx,
                (y as Real + 0.5 - cy) / fy,
                1.0,
            )
            .normalize();
            let world = r * cam;
            for channel in 0..3 {
                data.push(shade(&world, channel));
            }
        }
    }
    PixelBuffer::new(width, height, data).expect("buffer size matches")
}

/// Poses equally spaced around yaw at the given ring pitch.
pub fn sweep_poses(n: usize, pitch: Real) -> Vec<Mat4> {
    (0..n)
        .map(|i| rotation_y(std::f64::consts::TAU * i as Real / n as Real) * rotation_x(pitch))
        .collect()
}

/// Frames of a sweep, with rendered pixel buffers attached.
///
/// Frame ids start at `first_id` and increase by one per frame.
pub fn sweep_frames(
    intrinsics: &Mat3,
    poses: &[Mat4],
    width: u32,
    height: u32,
    first_id: u64,
) -> Vec<Frame> {
    poses
        .iter()
        .enumerate()
        .map(|(i, pose)| {
            let mut frame = Frame::new(first_id + i as u64, *intrinsics, *pose, FrameSource::None);
            frame.attach_pixels(render_view(intrinsics, pose, width, height));
            frame
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::intrinsics;

    #[test]
    fn rendering_is_deterministic() {
        let k = intrinsics(400.0, 400.0, 320.0, 320.0);
        let a = render_view(&k, &Mat4::identity(), 32, 32);
        let b = render_view(&k, &Mat4::identity(), 32, 32);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn views_change_with_pose() {
        let k = intrinsics(400.0, 400.0, 320.0, 320.0);
        let a = render_view(&k, &Mat4::identity(), 32, 32);
        let b = render_view(&k, &rotation_y(0.3), 32, 32);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn sweep_covers_full_circle() {
        let poses = sweep_poses(30, 0.0);
        assert_eq!(poses.len(), 30);
        let k = intrinsics(400.0, 400.0, 320.0, 320.0);
        let frames = sweep_frames(&k, &poses, 16, 16, 100);
        assert_eq!(frames[0].id, 100);
        assert!(frames.iter().all(|f| f.is_loaded()));
    }
}
