//! The recorder facade.
//!
//! Wires the pipeline leaves-first and exposes the capture API the host
//! application drives: push frames, read the guidance ball, finish or
//! cancel. The stage order on the capture thread is converter → loader →
//! debug tap → stream aligner → selector; the async decoupler hands the
//! selections to the adjuster worker, which feeds re-selection and stereo
//! generation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{ensure, Context, Result};
use pano_align::{CorrespondenceAdjuster, RingwiseStreamAligner};
use pano_core::{
    generate, Frame, GraphParams, Mat3, Mat4, Real, RecorderConfig, RecorderGraph, SelectionPoint,
    TargetId, Vec3,
};
use tracing::{info, warn};

use crate::async_sink::{AsyncSink, CancelHandle};
use crate::converter::CoordinateConverter;
use crate::debug::DebugSink;
use crate::loader::ImageLoader;
use crate::reselector::{Reselector, SelectionRecords};
use crate::selector::{FeedbackSelector, SelectionInfo, SelectorHandle};
use crate::sink::Sink;
use crate::stereo::{MonoStitcher, StereoGenerator};
use crate::storage::{FrameRecord, StorageSink};

/// Working resolution assumed by the startup memory probe.
const PROBE_WIDTH: usize = 1280;
const PROBE_HEIGHT: usize = 720;

/// Try to hold `count` RGB buffers of the working resolution at once.
///
/// Returns how many allocations succeeded before the first failure.
fn probe_buffer_allocation(width: usize, height: usize, count: usize) -> usize {
    let bytes = width * height * 3;
    let mut held = Vec::with_capacity(count);
    for _ in 0..count {
        let mut buf: Vec<u8> = Vec::new();
        if buf.try_reserve_exact(bytes).is_err() {
            break;
        }
        buf.resize(bytes, 0);
        held.push(buf);
    }
    held.len()
}

/// Buffers selections, runs the batch adjustment on finish and forwards
/// the refined frames.
struct AdjusterSink<S: Sink<Frame>> {
    graph: Arc<RecorderGraph>,
    adjuster: CorrespondenceAdjuster,
    buffer: Vec<SelectionInfo>,
    gains: Arc<Mutex<HashMap<u64, Real>>>,
    downstream: S,
}

impl<S: Sink<Frame>> AdjusterSink<S> {
    fn new(graph: Arc<RecorderGraph>, downstream: S) -> Self {
        Self {
            graph,
            adjuster: CorrespondenceAdjuster::default(),
            buffer: Vec::new(),
            gains: Arc::new(Mutex::new(HashMap::new())),
            downstream,
        }
    }
}

impl<S: Sink<Frame>> Sink<SelectionInfo> for AdjusterSink<S> {
    fn push(&mut self, info: SelectionInfo) {
        self.buffer.push(info);
    }

    fn finish(&mut self) {
        let assignment: HashMap<u64, TargetId> = self
            .buffer
            .iter()
            .map(|info| (info.frame.id, info.target.global_id))
            .collect();
        let mut frames: Vec<Frame> = self.buffer.drain(..).map(|info| info.frame).collect();

        let report = self.adjuster.adjust(&self.graph, &mut frames, &assignment);
        *self.gains.lock().unwrap() = report.gains;

        for frame in frames {
            self.downstream.push(frame);
        }
        self.downstream.finish();
    }
}

/// Applies the online drift correction on the capture thread.
struct StreamAlignSink<S: Sink<Frame>> {
    aligner: RingwiseStreamAligner,
    rejections: Arc<AtomicU64>,
    downstream: S,
}

impl<S: Sink<Frame>> Sink<Frame> for StreamAlignSink<S> {
    fn push(&mut self, mut frame: Frame) {
        if self.aligner.push(&mut frame) {
            self.downstream.push(frame);
        } else {
            self.rejections.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn finish(&mut self) {
        self.downstream.finish();
    }
}

/// On-device 360° stereo recorder core.
pub struct Recorder<L: StorageSink + Clone + 'static, R: StorageSink + Clone + 'static> {
    front: Box<dyn Sink<Frame> + Send>,
    graph: Arc<RecorderGraph>,
    stereo_graph: Arc<RecorderGraph>,
    selector: SelectorHandle,
    selections: SelectionRecords,
    gains: Arc<Mutex<HashMap<u64, Real>>>,
    input_rejections: Arc<AtomicU64>,
    cancel_handles: Vec<CancelHandle>,
    base: Mat4,
    zero: Mat4,
    left: L,
    right: R,
    finished: bool,
}

impl<L: StorageSink + Clone + 'static, R: StorageSink + Clone + 'static> Recorder<L, R> {
    /// Build the pipeline.
    ///
    /// `base` and `zero` define the device-to-stitcher frame mapping;
    /// `intrinsics` is the capture camera matrix; `left` and `right`
    /// receive the rectified stereo views.
    pub fn new(
        base: Mat4,
        zero: Mat4,
        intrinsics: Mat3,
        left: L,
        right: R,
        config: RecorderConfig,
    ) -> Result<Self> {
        config.validate().context("recorder configuration")?;

        let graph = Arc::new(
            generate(&intrinsics, &GraphParams::from(&config)).context("graph generation")?,
        );
        let stereo_graph = if config.half_graph {
            Arc::new(graph.sparse(2))
        } else {
            graph.clone()
        };
        let images_to_record = graph.size();
        info!(
            targets = images_to_record,
            rings = graph.rings().len(),
            "recorder graph generated"
        );

        let probed = probe_buffer_allocation(PROBE_WIDTH, PROBE_HEIGHT, images_to_record);
        ensure!(
            probed == images_to_record,
            "cannot pre-allocate {images_to_record} working buffers, got {probed}"
        );

        if config.debug_path.is_some() {
            warn!("debug mode active, intermediate images will be written");
        }

        let mut cancel_handles = Vec::new();

        // Wired leaves-first, mirroring the data flow bottom to top.
        let stereo = StereoGenerator::new(
            stereo_graph.clone(),
            MonoStitcher::new(config.stereo_h_buffer, config.stereo_v_buffer),
            left.clone(),
            right.clone(),
        );
        let stereo_stage = AsyncSink::new(stereo);
        cancel_handles.push(stereo_stage.cancel_handle());

        let reselector = Reselector::new(stereo_graph.clone(), stereo_stage);
        let selections = reselector.records();

        let adjuster = AdjusterSink::new(graph.clone(), reselector);
        let gains = adjuster.gains.clone();

        let decoupler = AsyncSink::new(adjuster);
        cancel_handles.push(decoupler.cancel_handle());

        let selector =
            FeedbackSelector::new(&graph, decoupler, config.tolerance, config.skip_policy);
        let selector_handle = selector.handle();

        let input_rejections = Arc::new(AtomicU64::new(0));
        let aligned = StreamAlignSink {
            aligner: RingwiseStreamAligner::new(graph.clone()),
            rejections: input_rejections.clone(),
            downstream: selector,
        };
        let debug_tap = DebugSink::new(config.debug_path.clone(), aligned);
        let loader = ImageLoader::new(debug_tap);
        let converter = CoordinateConverter::new(base, zero, loader);

        Ok(Self {
            front: Box::new(converter),
            graph,
            stereo_graph,
            selector: selector_handle,
            selections,
            gains,
            input_rejections,
            cancel_handles,
            base,
            zero,
            left,
            right,
            finished: false,
        })
    }

    /// Feed one captured frame.
    pub fn push(&mut self, frame: Frame) {
        if self.selector.is_finished() {
            warn!(id = frame.id, "push after recording finished");
        }
        self.front.push(frame);
    }

    /// Drain the pipeline, join the workers and write the input summaries.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.front.finish();
        self.finished = true;

        let gains = self.gains.lock().unwrap();
        let records: Vec<FrameRecord> = self
            .selections
            .lock()
            .unwrap()
            .iter()
            .map(|&(frame_id, target_id, adjusted)| FrameRecord {
                frame_id,
                target_id,
                gain: gains.get(&frame_id).copied().unwrap_or(1.0),
                adjusted,
            })
            .collect();
        drop(gains);

        self.left
            .save_input_summary(&self.stereo_graph, &records)
            .context("left input summary")?;
        self.right
            .save_input_summary(&self.stereo_graph, &records)
            .context("right input summary")?;
        Ok(())
    }

    /// Stop recording. A soft cancel drains queued frames so partial
    /// results persist; a hard cancel drops them after the current one.
    pub fn cancel(&mut self, hard: bool) {
        info!(hard, "recording cancelled");
        if hard {
            for handle in &self.cancel_handles {
                handle.cancel();
            }
        }
        self.front.finish();
        self.finished = true;
    }

    /// Pose of the guidance ball in device coordinates.
    pub fn ball_position(&self) -> Mat4 {
        self.convert_from_stitcher(&self.selector.ball_position())
    }

    /// Total angular distance to the ball.
    pub fn distance_to_ball(&self) -> Real {
        self.selector.error()
    }

    /// Per-axis `(pitch, yaw, roll)` distance to the ball.
    pub fn angular_distance_to_ball(&self) -> Vec3 {
        self.selector.error_vector()
    }

    pub fn is_idle(&self) -> bool {
        self.selector.is_idle()
    }

    pub fn set_idle(&self, idle: bool) {
        self.selector.set_idle(idle);
    }

    pub fn has_started(&self) -> bool {
        self.selector.has_started()
    }

    pub fn is_finished(&self) -> bool {
        self.selector.is_finished()
    }

    pub fn images_to_record(&self) -> u32 {
        self.selector.images_to_record()
    }

    pub fn recorded_images(&self) -> u32 {
        self.selector.recorded_images()
    }

    /// Frames rejected because no ring matched their pose.
    pub fn input_rejections(&self) -> u64 {
        self.input_rejections.load(Ordering::Relaxed)
    }

    /// Pushes rejected after the recording finished.
    pub fn rejected_pushes(&self) -> u64 {
        self.selector.rejected_pushes()
    }

    pub fn recorder_graph(&self) -> &RecorderGraph {
        &self.graph
    }

    /// Whether two targets form a stitch pair in the stereo graph.
    pub fn are_adjacent(&self, a: &SelectionPoint, b: &SelectionPoint) -> bool {
        self.stereo_graph.get_edge(a, b).is_some()
    }

    /// All targets with extrinsics converted back to device coordinates.
    pub fn selection_points(&self) -> Vec<SelectionPoint> {
        self.graph
            .target_sequence()
            .map(|point| SelectionPoint {
                extrinsics: self.convert_from_stitcher(&point.extrinsics),
                ..point.clone()
            })
            .collect()
    }

    fn convert_from_stitcher(&self, m: &Mat4) -> Mat4 {
        crate::converter::from_stitcher(&self.base, &self.zero, m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_succeeds_for_reasonable_counts() {
        assert_eq!(probe_buffer_allocation(1280, 720, 16), 16);
    }

    #[test]
    fn probe_handles_zero() {
        assert_eq!(probe_buffer_allocation(1280, 720, 0), 0);
    }
}
