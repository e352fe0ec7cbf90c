//! Ring closure: distribute the residual angular gap between the first and
//! last frame of a completed ring across all of its members.

use pano_core::{rotation_y, Frame, Real};
use tracing::{debug, info};

use crate::pairwise::PairwiseCorrelator;

/// Largest acceptable corrective yaw. Bigger closures would rotate frames
/// into unrecorded territory and leave black vertical stripes.
pub const MAX_CLOSURE_YAW: Real = 0.2;

/// Close a ring by matching its first frame against its last.
///
/// On success the i-th of n frames receives `Ry(Δy · (1 - i/n))` on top of
/// its adjusted pose, so the first frame absorbs the full correction and
/// the last almost none. Returns `false` when the match is rejected or the
/// required correction exceeds [`MAX_CLOSURE_YAW`].
pub fn close_ring(ring: &mut [Frame]) -> bool {
    let n = ring.len();
    if n < 2 {
        return false;
    }

    let correlator = PairwiseCorrelator::default();
    let result = correlator.match_whole(&ring[0], &ring[n - 1]);

    if !result.valid {
        debug!(reason = ?result.rejection, "ring closure rejected");
        return false;
    }
    if result.angular_offset.y > MAX_CLOSURE_YAW {
        debug!(
            yaw = result.angular_offset.y,
            "ring closure rejected, correction would leave black stripes"
        );
        return false;
    }

    let dy = result.angular_offset.y;
    info!(yaw = dy, frames = n, "closing ring");

    for (i, frame) in ring.iter_mut().enumerate() {
        let correction = dy * (1.0 - i as Real / n as Real);
        frame.adjusted = rotation_y(correction) * frame.adjusted;
    }
    true
}
