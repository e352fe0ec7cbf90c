//! The recording-target graph: a lattice of capture targets on the sphere.
//!
//! The graph is immutable after generation. Rings are stored in traversal
//! order: the centre ring first, then alternating upper and lower rings.
//! Within a ring, targets form a cyclic sequence ordered by azimuth.

mod generator;

pub use generator::{generate, GraphError, GraphParams};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::frame::Frame;
use crate::math::{angle_between, Mat3, Mat4, Real, Vec3};

/// Identifier of a target, unique across all rings of one graph.
pub type TargetId = u32;

/// A target position on the sphere the user must visit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectionPoint {
    pub global_id: TargetId,
    pub ring_id: u32,
    pub local_id: u32,
    pub extrinsics: Mat4,
    pub h_fov: Real,
    pub v_fov: Real,
    pub enabled: bool,
}

/// Directed adjacency between two targets.
///
/// Existence implies the pair is a stitch candidate: either neighbours in
/// the same ring or the closest cross-ring pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionEdge {
    pub from: TargetId,
    pub to: TargetId,
    /// `true` for cross-ring edges.
    pub vertical: bool,
}

/// Pitch of the viewing direction of a pose, in `[-π/2, π/2]`.
pub fn view_pitch(pose: &Mat4) -> Real {
    let dir = pose * nalgebra::Vector4::new(0.0, 0.0, 1.0, 0.0);
    (-dir[1]).clamp(-1.0, 1.0).asin()
}

/// Azimuth of the viewing direction of a pose, in `(-π, π]`.
pub fn view_azimuth(pose: &Mat4) -> Real {
    let dir = pose * nalgebra::Vector4::new(0.0, 0.0, 1.0, 0.0);
    dir[0].atan2(dir[2])
}

/// The immutable target lattice.
#[derive(Clone, Debug)]
pub struct RecorderGraph {
    intrinsics: Mat3,
    rings: Vec<Vec<SelectionPoint>>,
    ring_pitches: Vec<Real>,
    half_height: Real,
    edges: HashMap<(TargetId, TargetId), SelectionEdge>,
    locations: Vec<(u32, u32)>,
}

impl RecorderGraph {
    pub(crate) fn from_parts(
        intrinsics: Mat3,
        rings: Vec<Vec<SelectionPoint>>,
        ring_pitches: Vec<Real>,
        half_height: Real,
        edges: HashMap<(TargetId, TargetId), SelectionEdge>,
    ) -> Self {
        let mut locations = vec![(0u32, 0u32); rings.iter().map(Vec::len).sum()];
        for (r, ring) in rings.iter().enumerate() {
            for (l, point) in ring.iter().enumerate() {
                locations[point.global_id as usize] = (r as u32, l as u32);
            }
        }
        Self {
            intrinsics,
            rings,
            ring_pitches,
            half_height,
            edges,
            locations,
        }
    }

    /// Intrinsics the lattice was generated for.
    pub fn intrinsics(&self) -> &Mat3 {
        &self.intrinsics
    }

    /// Rings in traversal order.
    pub fn rings(&self) -> &[Vec<SelectionPoint>] {
        &self.rings
    }

    /// Total number of targets.
    pub fn size(&self) -> usize {
        self.rings.iter().map(Vec::len).sum()
    }

    /// All targets flattened in traversal order.
    pub fn target_sequence(&self) -> impl Iterator<Item = &SelectionPoint> {
        self.rings.iter().flatten()
    }

    pub fn point_by_id(&self, id: TargetId) -> Option<&SelectionPoint> {
        let &(r, l) = self.locations.get(id as usize)?;
        self.rings.get(r as usize)?.get(l as usize)
    }

    /// The ring whose centre latitude is closest to the pose's pitch.
    ///
    /// `None` when the distance exceeds the ring half-height, i.e. the pose
    /// lies between rings or beyond the lattice.
    pub fn find_associated_ring(&self, pose: &Mat4) -> Option<u32> {
        let pitch = view_pitch(pose);
        let (best, dist) = self
            .ring_pitches
            .iter()
            .enumerate()
            .map(|(i, &p)| (i as u32, (p - pitch).abs()))
            .min_by(|a, b| a.1.total_cmp(&b.1))?;
        (dist <= self.half_height).then_some(best)
    }

    /// The reference ring other rings are aligned against.
    pub fn parent_ring(&self, _ring: u32) -> u32 {
        0
    }

    /// Edge between two targets, if they are stitch-pair candidates.
    pub fn get_edge(&self, a: &SelectionPoint, b: &SelectionPoint) -> Option<SelectionEdge> {
        self.edges.get(&(a.global_id, b.global_id)).copied()
    }

    /// Greedily assign each target the frame minimising angular distance.
    ///
    /// Frames are consumed at most once. A target stays unassigned when no
    /// unused frame lies within one azimuth step of it. Returns the chosen
    /// frames in traversal order and the frame-id to target-id assignment.
    pub fn select_best_matches(&self, frames: &[Frame]) -> (Vec<Frame>, HashMap<u64, TargetId>) {
        let mut used = vec![false; frames.len()];
        let mut selected = Vec::new();
        let mut assignment = HashMap::new();

        for ring in &self.rings {
            let threshold = std::f64::consts::TAU / ring.len() as Real;
            for point in ring {
                let best = frames
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !used[*i])
                    .map(|(i, f)| (i, angle_between(&point.extrinsics, &f.adjusted)))
                    .min_by(|a, b| a.1.total_cmp(&b.1));
                if let Some((idx, dist)) = best {
                    if dist <= threshold {
                        used[idx] = true;
                        assignment.insert(frames[idx].id, point.global_id);
                        selected.push(frames[idx].clone());
                    }
                }
            }
        }

        (selected, assignment)
    }

    /// Partition frames by their associated ring; unassociated frames are
    /// dropped.
    pub fn split_into_rings(&self, frames: Vec<Frame>) -> Vec<Vec<Frame>> {
        let mut rings: Vec<Vec<Frame>> = vec![Vec::new(); self.rings.len()];
        for frame in frames {
            if let Some(ring) = self.find_associated_ring(&frame.original) {
                rings[ring as usize].push(frame);
            }
        }
        rings
    }

    /// A sparse copy keeping every `skip`-th target of each ring.
    ///
    /// Global and local identifiers are reassigned; edges are rebuilt over
    /// the surviving targets.
    pub fn sparse(&self, skip: u32) -> RecorderGraph {
        assert!(skip >= 1);
        let mut rings = Vec::with_capacity(self.rings.len());
        let mut global_id = 0u32;
        for (ring_id, ring) in self.rings.iter().enumerate() {
            let mut thinned = Vec::new();
            for point in ring.iter().step_by(skip as usize) {
                thinned.push(SelectionPoint {
                    global_id,
                    ring_id: ring_id as u32,
                    local_id: thinned.len() as u32,
                    ..point.clone()
                });
                global_id += 1;
            }
            rings.push(thinned);
        }
        let edges = generator::build_edges(&rings);
        RecorderGraph::from_parts(
            self.intrinsics,
            rings,
            self.ring_pitches.clone(),
            self.half_height,
            edges,
        )
    }
}

/// Angular error of a frame pose against a target, per axis
/// `(pitch, yaw, roll)`.
pub fn target_error(pose: &Mat4, target: &SelectionPoint) -> Vec3 {
    crate::math::angular_offset(&target.extrinsics, pose)
}
