//! Mathematical utilities and type definitions.
//!
//! Poses are right-handed 4×4 rigid transforms mapping camera coordinates
//! into the stitcher reference frame; the rotation part lives in the upper
//! left 3×3 block. Yaw is a rotation about +Y, pitch about +X, roll about +Z.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector2, Vector3};

/// Scalar type used throughout the library (currently `f64`).
pub type Real = f64;

/// 2D vector with [`Real`] components.
pub type Vec2 = Vector2<Real>;
/// 3D vector with [`Real`] components.
pub type Vec3 = Vector3<Real>;
/// 3×3 matrix with [`Real`] entries.
pub type Mat3 = Matrix3<Real>;
/// 4×4 matrix with [`Real`] entries.
pub type Mat4 = Matrix4<Real>;

/// Homogeneous rotation about the X axis (pitch).
pub fn rotation_x(a: Real) -> Mat4 {
    let (s, c) = a.sin_cos();
    Mat4::new(
        1.0, 0.0, 0.0, 0.0, //
        0.0, c, -s, 0.0, //
        0.0, s, c, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    )
}

/// Homogeneous rotation about the Y axis (yaw).
pub fn rotation_y(a: Real) -> Mat4 {
    let (s, c) = a.sin_cos();
    Mat4::new(
        c, 0.0, s, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        -s, 0.0, c, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    )
}

/// Homogeneous rotation about the Z axis (roll).
pub fn rotation_z(a: Real) -> Mat4 {
    let (s, c) = a.sin_cos();
    Mat4::new(
        c, -s, 0.0, 0.0, //
        s, c, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    )
}

/// Upper-left 3×3 rotation block of a pose.
pub fn rotation_part(m: &Mat4) -> Mat3 {
    m.fixed_view::<3, 3>(0, 0).into_owned()
}

/// Embed a 3×3 rotation into a homogeneous 4×4 pose.
pub fn from_rotation(r: &Mat3) -> Mat4 {
    let mut m = Mat4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    m
}

/// Extract `(pitch, yaw, roll)` angles from the rotation part of a pose.
///
/// Component order matches the rotation axes: `x` is the angle about X
/// (pitch), `y` about Y (yaw), `z` about Z (roll).
pub fn euler_angles(m: &Mat4) -> Vec3 {
    let r = rotation_part(m);
    Vec3::new(
        r[(2, 1)].atan2(r[(2, 2)]),
        (-r[(2, 0)]).atan2((r[(2, 1)] * r[(2, 1)] + r[(2, 2)] * r[(2, 2)]).sqrt()),
        r[(1, 0)].atan2(r[(0, 0)]),
    )
}

/// Total angle of the rotation taking `a` into `b`.
pub fn angle_between(a: &Mat4, b: &Mat4) -> Real {
    let rel = rotation_part(a).transpose() * rotation_part(b);
    let t = rel[(0, 0)] + rel[(1, 1)] + rel[(2, 2)];
    ((t - 1.0) / 2.0).clamp(-1.0, 1.0).acos()
}

/// Per-axis angular offset `(pitch, yaw, roll)` taking pose `a` into pose `b`.
///
/// Computed from the relative rotation `Raᵀ·Rb`, so each component is first
/// order in the corresponding angle. `angular_offset(a, b).y > 0` means `b`
/// is yawed further than `a`.
pub fn angular_offset(a: &Mat4, b: &Mat4) -> Vec3 {
    let rel = rotation_part(a).transpose() * rotation_part(b);
    euler_angles(&from_rotation(&rel))
}

/// Spherical linear interpolation between the rotation parts of two poses.
///
/// `t = 0` yields `a`, `t = 1` yields `b`. Translation is ignored; the
/// recorder works with pure rotations.
pub fn slerp(a: &Mat4, b: &Mat4, t: Real) -> Mat4 {
    let qa = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&rotation_part(a)));
    let qb = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&rotation_part(b)));
    let q = qa.slerp(&qb, t);
    from_rotation(q.to_rotation_matrix().matrix())
}

/// Check that a pose is a valid rigid transform: orthonormal rotation
/// block, determinant +1, homogeneous row `[0, 0, 0, 1]`.
pub fn is_valid_pose(m: &Mat4) -> bool {
    const EPS: Real = 1e-6;
    let r = rotation_part(m);
    let rtr = r.transpose() * r;
    if (rtr - Mat3::identity()).norm() > EPS {
        return false;
    }
    if (r.determinant() - 1.0).abs() > EPS {
        return false;
    }
    let h = m.row(3);
    (h[0]).abs() < EPS && (h[1]).abs() < EPS && (h[2]).abs() < EPS && (h[3] - 1.0).abs() < EPS
}
