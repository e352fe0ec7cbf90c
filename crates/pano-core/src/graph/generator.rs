//! Lattice generation.
//!
//! Rings are pitched so vertical neighbours overlap by the configured
//! fraction; targets within a ring are spaced so horizontal neighbours
//! overlap likewise. Ring target counts are kept at multiples of
//! [`RING_DIVIDER`] so rings decompose into even octants, flooring rather
//! than rounding so a density budget is never exceeded.

use std::collections::HashMap;

use thiserror::Error;

use crate::camera::{horizontal_fov, vertical_fov};
use crate::config::{Density, GraphMode, RecorderConfig};
use crate::math::{rotation_x, rotation_y, Mat3, Real};

use super::{RecorderGraph, SelectionEdge, SelectionPoint, TargetId};

/// Ring target counts are multiples of this.
pub const RING_DIVIDER: u32 = 8;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("overlap {0} outside [0, 1)")]
    InvalidOverlap(Real),
    #[error("intrinsics with non-positive focal length")]
    InvalidIntrinsics,
}

/// Generation parameters, typically derived from [`RecorderConfig`].
#[derive(Clone, Copy, Debug)]
pub struct GraphParams {
    pub mode: GraphMode,
    pub density: Density,
    pub h_overlap: Real,
    pub v_overlap: Real,
}

impl From<&RecorderConfig> for GraphParams {
    fn from(config: &RecorderConfig) -> Self {
        Self {
            mode: config.graph_mode,
            density: config.density,
            h_overlap: config.h_overlap,
            v_overlap: config.v_overlap,
        }
    }
}

/// Generate the target lattice for the given intrinsics.
pub fn generate(intrinsics: &Mat3, params: &GraphParams) -> Result<RecorderGraph, GraphError> {
    for overlap in [params.h_overlap, params.v_overlap] {
        if !(0.0..1.0).contains(&overlap) {
            return Err(GraphError::InvalidOverlap(overlap));
        }
    }
    if intrinsics[(0, 0)] <= 0.0 || intrinsics[(1, 1)] <= 0.0 {
        return Err(GraphError::InvalidIntrinsics);
    }

    let h_fov = horizontal_fov(intrinsics);
    let v_fov = vertical_fov(intrinsics);

    // Ring pitches in traversal order: centre first, then alternating
    // upper and lower rings until the poles are covered.
    let v_step = v_fov * (1.0 - params.v_overlap);
    let levels = (((std::f64::consts::FRAC_PI_2 - v_fov / 2.0) / v_step).ceil() as i32).max(0);
    let mut pitches = vec![0.0];
    for k in 1..=levels {
        pitches.push(k as Real * v_step);
        pitches.push(-(k as Real) * v_step);
    }
    let ring_count = match params.mode {
        GraphMode::Center => 1,
        GraphMode::Truncated => pitches.len().min(3),
        GraphMode::All => pitches.len(),
    };
    pitches.truncate(ring_count);

    let raw = std::f64::consts::TAU / (h_fov * (1.0 - params.h_overlap));

    let mut rings = Vec::with_capacity(ring_count);
    let mut global_id: TargetId = 0;
    for (ring_id, &pitch) in pitches.iter().enumerate() {
        let scaled = raw * params.density.scale() * pitch.cos().abs();
        let count = (((scaled / RING_DIVIDER as Real).floor() as u32) * RING_DIVIDER)
            .max(RING_DIVIDER);
        let mut ring = Vec::with_capacity(count as usize);
        for local_id in 0..count {
            let azimuth = std::f64::consts::TAU * local_id as Real / count as Real;
            ring.push(SelectionPoint {
                global_id,
                ring_id: ring_id as u32,
                local_id,
                extrinsics: rotation_y(azimuth) * rotation_x(pitch),
                h_fov,
                v_fov,
                enabled: true,
            });
            global_id += 1;
        }
        rings.push(ring);
    }

    let edges = build_edges(&rings);
    Ok(RecorderGraph::from_parts(
        *intrinsics,
        rings,
        pitches,
        v_step / 2.0,
        edges,
    ))
}

/// Horizontal edges between ring neighbours (both directions) and a
/// vertical edge from each target to its closest point in every
/// pitch-adjacent ring.
pub(super) fn build_edges(
    rings: &[Vec<SelectionPoint>],
) -> HashMap<(TargetId, TargetId), SelectionEdge> {
    let mut edges = HashMap::new();
    for ring in rings {
        let n = ring.len();
        if n < 2 {
            continue;
        }
        for (i, point) in ring.iter().enumerate() {
            let next = &ring[(i + 1) % n];
            for (from, to) in [
                (point.global_id, next.global_id),
                (next.global_id, point.global_id),
            ] {
                edges.insert(
                    (from, to),
                    SelectionEdge {
                        from,
                        to,
                        vertical: false,
                    },
                );
            }
        }
    }

    // Vertical edges only link rings adjacent in pitch.
    let pitch_of: Vec<Real> = rings
        .iter()
        .map(|r| {
            r.first()
                .map(|p| super::view_pitch(&p.extrinsics))
                .unwrap_or(0.0)
        })
        .collect();
    let mut pitch_step = Real::INFINITY;
    for a in 0..rings.len() {
        for b in 0..rings.len() {
            let d = (pitch_of[a] - pitch_of[b]).abs();
            if d > 1e-9 {
                pitch_step = pitch_step.min(d);
            }
        }
    }

    for a in 0..rings.len() {
        for b in 0..rings.len() {
            if a == b || rings[b].is_empty() {
                continue;
            }
            let d = (pitch_of[a] - pitch_of[b]).abs();
            if d < 1e-9 || d > pitch_step * 1.5 {
                continue;
            }
            for point in &rings[a] {
                let closest = rings[b]
                    .iter()
                    .min_by(|p, q| {
                        crate::math::angle_between(&point.extrinsics, &p.extrinsics)
                            .total_cmp(&crate::math::angle_between(&point.extrinsics, &q.extrinsics))
                    })
                    .expect("ring is non-empty");
                edges.insert(
                    (point.global_id, closest.global_id),
                    SelectionEdge {
                        from: point.global_id,
                        to: closest.global_id,
                        vertical: true,
                    },
                );
            }
        }
    }
    edges
}
