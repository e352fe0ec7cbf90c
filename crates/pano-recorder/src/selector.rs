//! Feedback frame selection.
//!
//! The selector walks the cyclic target sequence with a cursor. Frames
//! inside the tolerance ellipsoid of the current target become candidates;
//! when the camera departs toward the next target the best candidate seen
//! is emitted downstream and the cursor advances. Emissions are therefore
//! strictly in target order. The "ball" the UI renders is the pose of the
//! current target together with the per-axis angular error to it.

use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pano_core::{
    angle_between, angular_offset, Frame, Mat4, Real, RecorderGraph, SelectionPoint, SkipPolicy,
    Vec3,
};
use tracing::{debug, warn};

use crate::sink::Sink;

/// A frame bound to the target it snapped to.
#[derive(Clone, Debug)]
pub struct SelectionInfo {
    pub frame: Frame,
    pub target: SelectionPoint,
    /// Angular distance between frame pose and target at selection time.
    pub dist: Real,
    pub is_valid: bool,
}

/// Selector lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorState {
    Uninitialised,
    Idle,
    Seeking,
    InTolerance,
    Finished,
}

struct SharedState {
    state: SelectorState,
    ball: Mat4,
    error: Real,
    error_vector: Vec3,
    recorded: u32,
    rejected_pushes: u64,
}

/// Read-only view of the selector for the UI thread.
#[derive(Clone)]
pub struct SelectorHandle {
    shared: Arc<Mutex<SharedState>>,
    idle: Arc<AtomicBool>,
    to_record: u32,
}

impl SelectorHandle {
    pub fn state(&self) -> SelectorState {
        self.shared.lock().unwrap().state
    }

    /// Pose of the target the user should steer toward.
    pub fn ball_position(&self) -> Mat4 {
        self.shared.lock().unwrap().ball
    }

    /// Total angular distance to the ball.
    pub fn error(&self) -> Real {
        self.shared.lock().unwrap().error
    }

    /// Per-axis `(pitch, yaw, roll)` distance to the ball.
    pub fn error_vector(&self) -> Vec3 {
        self.shared.lock().unwrap().error_vector
    }

    pub fn images_to_record(&self) -> u32 {
        self.to_record
    }

    pub fn recorded_images(&self) -> u32 {
        self.shared.lock().unwrap().recorded
    }

    pub fn has_started(&self) -> bool {
        !matches!(
            self.state(),
            SelectorState::Uninitialised | SelectorState::Idle
        ) || self.recorded_images() > 0
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SelectorState::Finished
    }

    /// Pushes rejected after the selector finished.
    pub fn rejected_pushes(&self) -> u64 {
        self.shared.lock().unwrap().rejected_pushes
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    /// Idle selectors discard frames but keep updating the ball.
    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Relaxed);
    }
}

/// Picks the best frame per target and drives the guidance ball.
pub struct FeedbackSelector<S: Sink<SelectionInfo>> {
    targets: Vec<SelectionPoint>,
    cursor: usize,
    /// Ellipsoid semi-axes in (yaw, pitch, roll).
    tolerance: Vec3,
    skip_policy: SkipPolicy,
    best: Option<(Frame, Real)>,
    downstream: S,
    shared: Arc<Mutex<SharedState>>,
    idle: Arc<AtomicBool>,
}

impl<S: Sink<SelectionInfo>> FeedbackSelector<S> {
    pub fn new(
        graph: &RecorderGraph,
        downstream: S,
        tolerance_multiplier: Real,
        skip_policy: SkipPolicy,
    ) -> Self {
        let targets: Vec<SelectionPoint> = graph
            .target_sequence()
            .filter(|p| p.enabled)
            .cloned()
            .collect();
        let ball = targets
            .first()
            .map(|p| p.extrinsics)
            .unwrap_or_else(Mat4::identity);
        let shared = Arc::new(Mutex::new(SharedState {
            state: SelectorState::Uninitialised,
            ball,
            error: 0.0,
            error_vector: Vec3::zeros(),
            recorded: 0,
            rejected_pushes: 0,
        }));
        Self {
            targets,
            cursor: 0,
            tolerance: Vec3::new(
                PI / 64.0 * tolerance_multiplier,
                PI / 128.0 * tolerance_multiplier,
                PI / 16.0 * tolerance_multiplier,
            ),
            skip_policy,
            best: None,
            downstream,
            shared,
            idle: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> SelectorHandle {
        SelectorHandle {
            shared: self.shared.clone(),
            idle: self.idle.clone(),
            to_record: self.targets.len() as u32,
        }
    }

    fn in_tolerance(&self, error: &Vec3) -> bool {
        let yaw = error.y / self.tolerance.x;
        let pitch = error.x / self.tolerance.y;
        let roll = error.z / self.tolerance.z;
        yaw * yaw + pitch * pitch + roll * roll <= 1.0
    }

    /// Emit the pending best candidate and advance the cursor.
    fn emit_best(&mut self) {
        let Some((frame, dist)) = self.best.take() else {
            return;
        };
        let target = self.targets[self.cursor].clone();
        debug!(target = target.global_id, frame = frame.id, "target recorded");
        self.downstream.push(SelectionInfo {
            frame,
            target,
            dist,
            is_valid: true,
        });
        let mut shared = self.shared.lock().unwrap();
        shared.recorded += 1;
        drop(shared);
        self.advance();
    }

    fn advance(&mut self) {
        self.cursor += 1;
        if self.cursor >= self.targets.len() {
            self.shared.lock().unwrap().state = SelectorState::Finished;
        }
    }

    fn state(&self) -> SelectorState {
        self.shared.lock().unwrap().state
    }
}

impl<S: Sink<SelectionInfo>> Sink<Frame> for FeedbackSelector<S> {
    fn push(&mut self, frame: Frame) {
        if self.state() == SelectorState::Finished {
            let mut shared = self.shared.lock().unwrap();
            shared.rejected_pushes += 1;
            drop(shared);
            warn!(id = frame.id, "push after finish rejected");
            return;
        }
        if self.targets.is_empty() {
            return;
        }

        let target = &self.targets[self.cursor];
        let error = angular_offset(&target.extrinsics, &frame.adjusted);
        let dist = angle_between(&target.extrinsics, &frame.adjusted);
        let idle = self.idle.load(Ordering::Relaxed);
        let in_tolerance = self.in_tolerance(&error);

        {
            let mut shared = self.shared.lock().unwrap();
            shared.ball = target.extrinsics;
            shared.error = dist;
            shared.error_vector = error;
            if idle {
                shared.state = SelectorState::Idle;
            } else if shared.state == SelectorState::Uninitialised
                || shared.state == SelectorState::Idle
            {
                shared.state = SelectorState::Seeking;
            }
        }
        if idle {
            return;
        }

        if in_tolerance {
            self.shared.lock().unwrap().state = SelectorState::InTolerance;
            match &self.best {
                Some((_, best_dist)) if *best_dist <= dist => {}
                _ => self.best = Some((frame, dist)),
            }
            return;
        }

        if self.best.is_some() {
            // Departure from the current target.
            self.emit_best();
        } else if self.skip_policy == SkipPolicy::MarkEmpty && self.cursor + 1 < self.targets.len()
        {
            // The user swept past: if the pose is closer to the next target
            // the current one is marked recorded-empty.
            let next = &self.targets[self.cursor + 1];
            if angle_between(&next.extrinsics, &frame.adjusted) < dist {
                debug!(
                    target = self.targets[self.cursor].global_id,
                    "target skipped, marked empty"
                );
                self.shared.lock().unwrap().recorded += 1;
                self.advance();
            }
        }

        // Refresh the ball against the possibly advanced cursor.
        let mut shared = self.shared.lock().unwrap();
        if shared.state != SelectorState::Finished {
            shared.state = SelectorState::Seeking;
            let target = &self.targets[self.cursor];
            shared.ball = target.extrinsics;
            shared.error = angle_between(&target.extrinsics, &frame.adjusted);
            shared.error_vector = angular_offset(&target.extrinsics, &frame.adjusted);
        }
    }

    fn finish(&mut self) {
        if self.state() != SelectorState::Finished {
            if self.best.is_some() {
                self.emit_best();
            }
            self.shared.lock().unwrap().state = SelectorState::Finished;
        }
        self.downstream.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectSink;
    use pano_core::{generate, intrinsics, rotation_y, Density, FrameSource, GraphMode, GraphParams};

    fn center_graph() -> RecorderGraph {
        generate(
            &intrinsics(400.0, 400.0, 320.0, 320.0),
            &GraphParams {
                mode: GraphMode::Center,
                density: Density::Normal,
                h_overlap: 0.9,
                v_overlap: 0.25,
            },
        )
        .unwrap()
    }

    fn sweep(n: usize) -> Vec<Frame> {
        let k = intrinsics(400.0, 400.0, 320.0, 320.0);
        (0..n)
            .map(|i| {
                Frame::new(
                    i as u64,
                    k,
                    rotation_y(std::f64::consts::TAU * i as Real / n as Real),
                    FrameSource::None,
                )
            })
            .collect()
    }

    #[test]
    fn sweep_records_every_target_in_order() {
        let graph = center_graph();
        let mut selector =
            FeedbackSelector::new(&graph, CollectSink::default(), 3.0, SkipPolicy::Wait);
        let handle = selector.handle();
        assert_eq!(handle.images_to_record(), 16);
        assert!(!handle.has_started());

        for frame in sweep(30) {
            selector.push(frame);
        }

        assert!(handle.is_finished());
        assert_eq!(handle.recorded_images(), 16);
        let emitted = &selector.downstream.items;
        assert_eq!(emitted.len(), 16);
        for (i, info) in emitted.iter().enumerate() {
            assert!(info.is_valid);
            assert_eq!(info.target.global_id, i as u32);
            assert_eq!(info.target.ring_id, 0);
            assert_eq!(info.target.local_id, i as u32);
        }
    }

    #[test]
    fn push_after_finish_is_rejected() {
        let graph = center_graph();
        let mut selector =
            FeedbackSelector::new(&graph, CollectSink::default(), 3.0, SkipPolicy::Wait);
        let handle = selector.handle();

        for frame in sweep(30) {
            selector.push(frame);
        }
        assert!(handle.is_finished());
        let emitted = selector.downstream.items.len();

        selector.push(sweep(30).pop().unwrap());
        assert_eq!(handle.rejected_pushes(), 1);
        assert_eq!(selector.downstream.items.len(), emitted);
    }

    #[test]
    fn idle_frames_update_ball_but_record_nothing() {
        let graph = center_graph();
        let mut selector =
            FeedbackSelector::new(&graph, CollectSink::default(), 3.0, SkipPolicy::Wait);
        let handle = selector.handle();
        handle.set_idle(true);

        for frame in sweep(30) {
            selector.push(frame);
        }
        assert_eq!(handle.recorded_images(), 0);
        assert!(selector.downstream.items.is_empty());
        assert_eq!(handle.state(), SelectorState::Idle);

        // Waking up resumes recording from the first target.
        handle.set_idle(false);
        for frame in sweep(30) {
            selector.push(frame);
        }
        assert_eq!(handle.recorded_images(), 16);
    }

    #[test]
    fn ball_tracks_current_target() {
        let graph = center_graph();
        let mut selector =
            FeedbackSelector::new(&graph, CollectSink::default(), 3.0, SkipPolicy::Wait);
        let handle = selector.handle();

        // First frame sits on target 0; after departing, the ball is
        // target 1 and the error vector points at it.
        let frames = sweep(30);
        selector.push(frames[0].clone());
        selector.push(frames[1].clone());
        let ball = handle.ball_position();
        let expected = graph.rings()[0][1].extrinsics;
        assert!(angle_between(&ball, &expected) < 1e-9);
        assert!(handle.error() > 0.0);
    }

    #[test]
    fn finish_flushes_pending_candidate() {
        let graph = center_graph();
        let mut selector =
            FeedbackSelector::new(&graph, CollectSink::default(), 3.0, SkipPolicy::Wait);

        // One frame dead on the first target, then finish.
        selector.push(sweep(16)[0].clone());
        selector.finish();
        assert_eq!(selector.downstream.items.len(), 1);
        assert!(selector.downstream.finished);
    }

    #[test]
    fn mark_empty_policy_skips_unvisited_targets() {
        let graph = center_graph();
        let mut selector =
            FeedbackSelector::new(&graph, CollectSink::default(), 3.0, SkipPolicy::MarkEmpty);
        let handle = selector.handle();

        // Sweep only the second half of the circle, far from early targets.
        let k = intrinsics(400.0, 400.0, 320.0, 320.0);
        for i in 0..40u64 {
            let yaw = std::f64::consts::PI + std::f64::consts::PI * i as Real / 40.0;
            selector.push(Frame::new(i, k, rotation_y(yaw), FrameSource::None));
        }

        // Early targets were marked empty, later ones actually recorded.
        assert!(handle.recorded_images() > 8);
        let emitted = selector.downstream.items.len();
        assert!(emitted < handle.recorded_images() as usize);
    }
}
