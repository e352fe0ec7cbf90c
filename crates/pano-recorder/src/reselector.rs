//! Re-selection of adjusted frames.
//!
//! After batch adjustment the poses have moved, so the recording is
//! matched against the stitch graph once more. The reselector buffers all
//! frames, greedily assigns them to targets on finish and forwards the
//! chosen selections in traversal order.

use std::sync::{Arc, Mutex};

use pano_core::{Frame, Mat4, RecorderGraph, TargetId};
use tracing::debug;

use crate::selector::SelectionInfo;
use crate::sink::Sink;

/// Final frame-to-target assignments, `(frame id, target, adjusted pose)`.
pub type SelectionRecords = Arc<Mutex<Vec<(u64, TargetId, Mat4)>>>;

pub struct Reselector<S: Sink<SelectionInfo>> {
    graph: Arc<RecorderGraph>,
    buffer: Vec<Frame>,
    records: SelectionRecords,
    downstream: S,
}

impl<S: Sink<SelectionInfo>> Reselector<S> {
    pub fn new(graph: Arc<RecorderGraph>, downstream: S) -> Self {
        Self {
            graph,
            buffer: Vec::new(),
            records: Arc::new(Mutex::new(Vec::new())),
            downstream,
        }
    }

    /// Shared view of the assignments made at finish.
    pub fn records(&self) -> SelectionRecords {
        self.records.clone()
    }
}

impl<S: Sink<SelectionInfo>> Sink<Frame> for Reselector<S> {
    fn push(&mut self, frame: Frame) {
        self.buffer.push(frame);
    }

    fn finish(&mut self) {
        let (selected, assignment) = self.graph.select_best_matches(&self.buffer);
        debug!(
            selected = selected.len(),
            of = self.buffer.len(),
            targets = self.graph.size(),
            "re-selection done"
        );
        self.buffer.clear();

        let mut records = self.records.lock().unwrap();
        for frame in selected {
            let Some(&target_id) = assignment.get(&frame.id) else {
                continue;
            };
            let Some(point) = self.graph.point_by_id(target_id) else {
                continue;
            };
            records.push((frame.id, target_id, frame.adjusted));
            let dist = pano_core::angle_between(&point.extrinsics, &frame.adjusted);
            self.downstream.push(SelectionInfo {
                frame,
                target: point.clone(),
                dist,
                is_valid: true,
            });
        }
        drop(records);
        self.downstream.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectSink;
    use pano_core::{
        generate, intrinsics, rotation_y, Density, FrameSource, GraphMode, GraphParams, Real,
    };

    #[test]
    fn reassigns_frames_in_target_order() {
        let graph = Arc::new(
            generate(
                &intrinsics(400.0, 400.0, 320.0, 320.0),
                &GraphParams {
                    mode: GraphMode::Center,
                    density: Density::Normal,
                    h_overlap: 0.9,
                    v_overlap: 0.25,
                },
            )
            .unwrap(),
        );
        let mut reselector = Reselector::new(graph.clone(), CollectSink::default());
        let records = reselector.records();

        let k = intrinsics(400.0, 400.0, 320.0, 320.0);
        // Frames in scrambled order, two per target region.
        for i in (0..32u64).rev() {
            reselector.push(Frame::new(
                i,
                k,
                rotation_y(std::f64::consts::TAU * i as Real / 32.0),
                FrameSource::None,
            ));
        }
        reselector.finish();

        let emitted = &reselector.downstream.items;
        assert_eq!(emitted.len(), 16);
        for (i, info) in emitted.iter().enumerate() {
            assert_eq!(info.target.local_id, i as u32);
            assert_eq!(info.frame.id % 2, 0);
        }
        assert_eq!(records.lock().unwrap().len(), 16);
        assert!(reselector.downstream.finished);
    }
}
