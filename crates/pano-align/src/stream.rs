//! Online ring-wise drift correction.
//!
//! Runs while frames arrive. Each frame is associated with a ring and
//! correlated against the closest already-aligned frame of the parent ring;
//! the yaw component of the measurement feeds a short median filter that
//! drives the drift correction. Correction is yaw only: sensor pitch drift
//! is small in practice and roll correction tilts the horizon.

use std::collections::VecDeque;
use std::sync::Arc;

use pano_core::{angle_between, rotation_y, Frame, Mat4, Real, RecorderGraph};
use tracing::{debug, trace};

use crate::pairwise::PairwiseCorrelator;
use crate::stat::median;

/// Length of the drift median filter.
pub const DRIFT_MEDIAN_LEN: usize = 3;

/// Streaming aligner that tracks sensor drift against a reference ring.
pub struct RingwiseStreamAligner {
    graph: Arc<RecorderGraph>,
    correlator: PairwiseCorrelator,
    rings: Vec<Vec<Frame>>,
    drift: Mat4,
    angles: VecDeque<Real>,
    last_angle: Real,
}

impl RingwiseStreamAligner {
    pub fn new(graph: Arc<RecorderGraph>) -> Self {
        let ring_count = graph.rings().len();
        Self {
            graph,
            correlator: PairwiseCorrelator::default(),
            rings: vec![Vec::new(); ring_count],
            drift: Mat4::identity(),
            angles: VecDeque::with_capacity(DRIFT_MEDIAN_LEN + 1),
            last_angle: 0.0,
        }
    }

    /// Current drift correction, `Ry(median)` of the recent measurements.
    pub fn drift(&self) -> &Mat4 {
        &self.drift
    }

    /// Frames seen so far, partitioned by ring in graph order.
    pub fn rings(&self) -> &[Vec<Frame>] {
        &self.rings
    }

    /// Align one frame: updates `frame.adjusted` to `drift · original` and
    /// records the frame in its ring.
    ///
    /// Returns `false` when the frame cannot be associated with any ring;
    /// the caller discards such frames.
    pub fn push(&mut self, frame: &mut Frame) -> bool {
        let Some(ring) = self.graph.find_associated_ring(&frame.original) else {
            debug!(id = frame.id, "frame matches no ring");
            return false;
        };

        let parent = self.graph.parent_ring(ring);
        if parent != ring {
            let closest = self.rings[parent as usize]
                .iter()
                .min_by(|p, q| {
                    angle_between(&frame.original, &p.adjusted)
                        .total_cmp(&angle_between(&frame.original, &q.adjusted))
                });
            if let Some(closest) = closest {
                let result = self.correlator.match_frames(frame, closest);
                if result.valid {
                    let width = frame
                        .pixels()
                        .map(|p| p.width() as Real)
                        .unwrap_or(frame.intrinsics[(0, 2)] * 2.0);
                    // Yaw from the horizontal pixel offset, using the
                    // sensor-ratio form of the intrinsics.
                    let hx = frame.intrinsics[(0, 0)] / (frame.intrinsics[(0, 2)] * 2.0);
                    let arg = (result.offset.0 as Real / width) / hx;
                    if arg.abs() <= 1.0 {
                        self.last_angle = arg.asin();
                        trace!(
                            id = frame.id,
                            angle = self.last_angle,
                            "drift measurement"
                        );
                    }
                } else {
                    trace!(id = frame.id, reason = ?result.rejection, "drift update skipped");
                }
            }
        }

        self.angles.push_back(self.last_angle);
        if self.angles.len() > DRIFT_MEDIAN_LEN {
            self.angles.pop_front();
        }
        if self.angles.len() == DRIFT_MEDIAN_LEN {
            let smoothed = median(self.angles.make_contiguous());
            self.drift = rotation_y(smoothed);
        }

        frame.adjusted = self.drift * frame.original;
        self.rings[ring as usize].push(frame.clone());
        true
    }

    /// `drift · original` for an arbitrary pose, e.g. for UI readback.
    pub fn current_rotation(&self, original: &Mat4) -> Mat4 {
        self.drift * original
    }
}
