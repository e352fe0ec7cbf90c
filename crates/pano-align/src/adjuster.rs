//! Batch pose refinement over the recording graph.
//!
//! After capture, every pair of kept frames whose targets share a graph
//! edge is correlated once more. The measured corrective yaws form an
//! overdetermined linear system in per-frame yaw updates; a damped
//! Gauss-Seidel relaxation drives the total angular residual down while
//! the first frame of the reference ring stays pinned. Exposure gains are
//! estimated from the same pairs as a side effect.

use std::collections::HashMap;

use pano_core::{rotation_y, Frame, Real, RecorderGraph, TargetId};
use tracing::{debug, info};

use crate::closer::close_ring;
use crate::exposure::{mean_intensity, ExposureCompensator};
use crate::pairwise::{CorrelatorSettings, PairwiseCorrelator};

/// Outcome of one adjustment run.
#[derive(Clone, Debug, Default)]
pub struct AdjusterReport {
    /// Per-frame exposure gains, keyed by frame id.
    pub gains: HashMap<u64, Real>,
    /// Graph-edge pairs successfully correlated.
    pub edges_matched: usize,
    /// Pairs rejected by the correlator.
    pub edges_rejected: usize,
    /// Relaxation iterations performed.
    pub iterations: usize,
    /// Largest remaining corrective yaw after relaxation.
    pub final_residual: Real,
    /// Rings that were successfully closed before adjustment.
    pub rings_closed: usize,
}

/// Global pairwise-correspondence pose refinement.
#[derive(Clone, Debug)]
pub struct CorrespondenceAdjuster {
    settings: CorrelatorSettings,
    max_iterations: usize,
    damping: Real,
}

impl Default for CorrespondenceAdjuster {
    fn default() -> Self {
        Self {
            settings: CorrelatorSettings::default(),
            max_iterations: 100,
            damping: 0.8,
        }
    }
}

impl CorrespondenceAdjuster {
    pub fn new(settings: CorrelatorSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Refine the poses of `frames` in place.
    ///
    /// `assignment` maps frame ids to the targets they were recorded for;
    /// frames without an assignment are left untouched. Frames must carry
    /// loaded pixel buffers.
    pub fn adjust(
        &self,
        graph: &RecorderGraph,
        frames: &mut [Frame],
        assignment: &HashMap<u64, TargetId>,
    ) -> AdjusterReport {
        let mut report = AdjusterReport::default();

        // Close each completed ring first so the per-ring gap does not leak
        // into the cross-ring relaxation.
        let mut by_ring: Vec<Vec<usize>> = vec![Vec::new(); graph.rings().len()];
        for (i, frame) in frames.iter().enumerate() {
            let Some(&target) = assignment.get(&frame.id) else {
                continue;
            };
            if let Some(point) = graph.point_by_id(target) {
                by_ring[point.ring_id as usize].push(i);
            }
        }
        for indices in &by_ring {
            if indices.len() < 2 {
                continue;
            }
            let mut ring: Vec<Frame> = indices.iter().map(|&i| frames[i].clone()).collect();
            if close_ring(&mut ring) {
                report.rings_closed += 1;
                for (&i, closed) in indices.iter().zip(ring) {
                    frames[i].adjusted = closed.adjusted;
                }
            }
        }

        // Correlate every graph-edge pair once.
        let correlator = PairwiseCorrelator::new(self.settings);
        let mut compensator = ExposureCompensator::default();
        let mut edges: Vec<(usize, usize, Real)> = Vec::new();
        for i in 0..frames.len() {
            for j in (i + 1)..frames.len() {
                let (Some(&ti), Some(&tj)) =
                    (assignment.get(&frames[i].id), assignment.get(&frames[j].id))
                else {
                    continue;
                };
                let (Some(pi), Some(pj)) = (graph.point_by_id(ti), graph.point_by_id(tj)) else {
                    continue;
                };
                if graph.get_edge(pi, pj).is_none() {
                    continue;
                }
                let result = correlator.match_frames(&frames[i], &frames[j]);
                if !result.valid {
                    report.edges_rejected += 1;
                    continue;
                }
                report.edges_matched += 1;
                edges.push((i, j, result.angular_offset.y));
                if let (Some(ba), Some(bb)) = (frames[i].pixels(), frames[j].pixels()) {
                    compensator.add_pair(
                        frames[i].id,
                        frames[j].id,
                        mean_intensity(ba),
                        mean_intensity(bb),
                    );
                }
            }
        }
        report.gains = compensator.estimate();

        if edges.is_empty() {
            debug!("no usable correspondence edges, poses unchanged");
            return report;
        }

        // The measured correction for frame i against j shifts linearly
        // with later yaw updates, so the image work above is done exactly
        // once and the relaxation below is pure algebra.
        let pinned = by_ring[graph.parent_ring(0) as usize]
            .first()
            .copied()
            .unwrap_or(0);
        let mut updates = vec![0.0; frames.len()];
        let mut incident: Vec<Vec<(usize, Real)>> = vec![Vec::new(); frames.len()];
        for &(i, j, c) in &edges {
            incident[i].push((j, c));
            incident[j].push((i, -c));
        }

        for iteration in 0..self.max_iterations {
            let mut largest = 0.0f64;
            for i in 0..frames.len() {
                if i == pinned || incident[i].is_empty() {
                    continue;
                }
                let mean = incident[i]
                    .iter()
                    .map(|&(j, c)| c + updates[j] - updates[i])
                    .sum::<Real>()
                    / incident[i].len() as Real;
                let step = self.damping * mean;
                updates[i] += step;
                largest = largest.max(step.abs());
            }
            report.iterations = iteration + 1;
            if largest < 1e-9 {
                break;
            }
        }

        report.final_residual = edges
            .iter()
            .map(|&(i, j, c)| (c + updates[j] - updates[i]).abs())
            .fold(0.0, Real::max);

        for (frame, &update) in frames.iter_mut().zip(&updates) {
            if update != 0.0 {
                frame.adjusted = rotation_y(update) * frame.adjusted;
            }
        }

        info!(
            matched = report.edges_matched,
            rejected = report.edges_rejected,
            iterations = report.iterations,
            residual = report.final_residual,
            "correspondence adjustment done"
        );
        report
    }
}
