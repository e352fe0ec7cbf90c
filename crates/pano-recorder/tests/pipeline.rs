//! End-to-end pipeline scenarios: a synthetic sweep through the full
//! recorder, cancellation, and protocol misuse.

use pano_core::{intrinsics, synthetic, Frame, FrameSource, Mat4, RecorderConfig, Real};
use pano_recorder::{MemorySink, Recorder};

const SIZE: u32 = 96;

fn test_intrinsics() -> pano_core::Mat3 {
    intrinsics(400.0, 400.0, 320.0, 320.0)
}

/// A sweep frame as the capture layer would hand it over: the image shows
/// the scene from `pose`, while the reported extrinsics use the device
/// convention the coordinate converter expects.
fn capture_frame(id: u64, pose: &Mat4) -> Frame {
    let k = test_intrinsics();
    let device_pose = pose.try_inverse().expect("pose invertible");
    let mut frame = Frame::new(id, k, device_pose, FrameSource::None);
    frame.attach_pixels(synthetic::render_view(&k, pose, SIZE, SIZE));
    frame
}

fn recorder(
    tolerance: Real,
) -> (Recorder<MemorySink, MemorySink>, MemorySink, MemorySink) {
    let left = MemorySink::new();
    let right = MemorySink::new();
    let config = RecorderConfig {
        tolerance,
        ..RecorderConfig::default()
    };
    let recorder = Recorder::new(
        Mat4::identity(),
        Mat4::identity(),
        test_intrinsics(),
        left.clone(),
        right.clone(),
        config,
    )
    .expect("recorder builds");
    (recorder, left, right)
}

/// A thirty-frame single-ring sweep against the default centre graph:
/// sixteen targets, sixteen selections, sixteen stereo pairs per eye.
#[test]
fn single_ring_sweep_records_every_target() {
    let (mut recorder, left, right) = recorder(3.0);
    assert_eq!(recorder.images_to_record(), 16);
    assert!(!recorder.has_started());

    for (i, pose) in synthetic::sweep_poses(30, 0.0).iter().enumerate() {
        recorder.push(capture_frame(i as u64, pose));
    }

    assert!(recorder.is_finished());
    assert_eq!(recorder.recorded_images(), 16);
    recorder.finish().expect("finish succeeds");

    // Draining: every selector emission reaches both sinks.
    assert_eq!(left.len(), 16);
    assert_eq!(right.len(), 16);

    let summary = left.summary().expect("summary written");
    assert_eq!(summary.rings.len(), 1);
    assert_eq!(summary.rings[0].len(), 16);
    assert_eq!(summary.frames.len(), 16);
    for record in &summary.frames {
        assert!(record.gain > 0.5 && record.gain < 1.5);
    }
}

/// Pushing after the selector finished increments the rejection counter
/// and writes nothing further to the sinks.
#[test]
fn push_after_finish_is_counted_not_stored() {
    let (mut recorder, left, _right) = recorder(3.0);

    for (i, pose) in synthetic::sweep_poses(30, 0.0).iter().enumerate() {
        recorder.push(capture_frame(i as u64, pose));
    }
    assert!(recorder.is_finished());
    assert_eq!(recorder.rejected_pushes(), 0);

    recorder.push(capture_frame(999, &synthetic::sweep_poses(30, 0.0)[0]));
    assert_eq!(recorder.rejected_pushes(), 1);

    recorder.finish().expect("finish succeeds");
    assert_eq!(left.len(), 16);
}

/// Cancelling after ten frames leaves at most ten entries per sink and no
/// dangling workers.
#[test]
fn cancellation_keeps_partial_results_bounded() {
    let (mut recorder, left, right) = recorder(3.0);

    for (i, pose) in synthetic::sweep_poses(30, 0.0).iter().take(10).enumerate() {
        recorder.push(capture_frame(i as u64, pose));
    }
    assert!(!recorder.is_finished());

    // Hard cancel: queued items are dropped, workers join.
    recorder.cancel(true);

    assert!(left.len() <= 10);
    assert!(right.len() <= 10);
}

/// The ball tracks the next unrecorded target and reports its distance.
#[test]
fn ball_guides_toward_next_target() {
    let (mut recorder, _left, _right) = recorder(3.0);
    let poses = synthetic::sweep_poses(30, 0.0);

    recorder.push(capture_frame(0, &poses[0]));
    recorder.push(capture_frame(1, &poses[1]));

    // After departing target 0 the ball sits on target 1 at 22.5°.
    let ball = recorder.ball_position();
    let expected_device = poses_target_device(&recorder);
    assert!(pano_core::angle_between(&ball, &expected_device) < 1e-6);
    assert!(recorder.distance_to_ball() > 0.0);
    assert!(recorder.angular_distance_to_ball().norm() > 0.0);
}

fn poses_target_device(recorder: &Recorder<MemorySink, MemorySink>) -> Mat4 {
    // Second target of the centre ring, mapped into device coordinates the
    // same way the recorder reports the ball.
    let points = recorder.selection_points();
    points[1].extrinsics
}

/// Frames that match no ring are counted as input rejections.
#[test]
fn off_graph_frames_are_rejected() {
    let (mut recorder, _left, _right) = recorder(3.0);
    let tilted = pano_core::rotation_x(0.9);
    recorder.push(capture_frame(0, &tilted));
    assert_eq!(recorder.input_rejections(), 1);
    assert_eq!(recorder.recorded_images(), 0);
    recorder.cancel(false);
}
