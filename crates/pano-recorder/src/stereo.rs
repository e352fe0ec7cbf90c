//! Stereo rectification and view generation.
//!
//! Adjacent selections of a ring are paired into left/right stereo views.
//! The mono stitcher rotates each frame of a pair onto the central
//! baseline between the two poses, so both eyes look through the same
//! rotation and the residual angular disparity carries the depth.

use std::sync::Arc;

use pano_core::{slerp, Frame, Mat3, Mat4, PixelBuffer, Real, RecorderGraph, Vec3};
use tracing::{debug, warn};

use crate::ring_processor::RingProcessor;
use crate::selector::SelectionInfo;
use crate::sink::Sink;
use crate::storage::StorageSink;

/// Two rectified views synthesised from two adjacent frames.
#[derive(Clone, Debug)]
pub struct StereoPair {
    pub left: Frame,
    pub right: Frame,
    pub valid: bool,
}

/// Rotates frames onto a shared baseline and crops the result.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonoStitcher {
    h_buffer: u32,
    v_buffer: u32,
}

impl MonoStitcher {
    pub fn new(h_buffer: u32, v_buffer: u32) -> Self {
        Self { h_buffer, v_buffer }
    }

    /// Build the stereo pair for two adjacent selections.
    ///
    /// Both frames must carry loaded pixel buffers; otherwise the pair is
    /// returned invalid.
    pub fn create_stereo(&self, a: &SelectionInfo, b: &SelectionInfo) -> StereoPair {
        let center = slerp(&a.frame.adjusted, &b.frame.adjusted, 0.5);

        let (Some(left_px), Some(right_px)) = (
            self.reproject(&a.frame, &center),
            self.reproject(&b.frame, &center),
        ) else {
            return StereoPair {
                left: a.frame.clone(),
                right: b.frame.clone(),
                valid: false,
            };
        };

        let mut left = a.frame.clone();
        left.adjusted = center;
        left.attach_pixels(left_px);
        let mut right = b.frame.clone();
        right.adjusted = center;
        right.attach_pixels(right_px);

        StereoPair {
            left,
            right,
            valid: true,
        }
    }

    /// Resample a frame as seen from `target_pose`, cropped by the stereo
    /// buffers. Pixels leaving the source image come out black.
    fn reproject(&self, frame: &Frame, target_pose: &Mat4) -> Option<PixelBuffer> {
        let src = frame.pixels()?;
        let (w, h) = (src.width(), src.height());
        if w <= 2 * self.h_buffer || h <= 2 * self.v_buffer {
            return None;
        }
        let k = frame.scaled_intrinsics();
        let (fx, fy) = (k[(0, 0)], k[(1, 1)]);
        let (cx, cy) = (k[(0, 2)], k[(1, 2)]);

        // Direction of each output pixel in the target view, expressed in
        // the source camera frame.
        let r_src: Mat3 = pano_core::rotation_part(&frame.adjusted);
        let r_dst: Mat3 = pano_core::rotation_part(target_pose);
        let rel = r_src.transpose() * r_dst;

        let out_w = w - 2 * self.h_buffer;
        let out_h = h - 2 * self.v_buffer;
        let mut data = vec![0u8; (out_w * out_h * 3) as usize];

        for y in 0..out_h {
            for x in 0..out_w {
                let px = (x + self.h_buffer) as Real;
                let py = (y + self.v_buffer) as Real;
                let dir = rel * Vec3::new((px - cx) / fx, (py - cy) / fy, 1.0);
                if dir.z <= 0.0 {
                    continue;
                }
                let sx = fx * dir.x / dir.z + cx;
                let sy = fy * dir.y / dir.z + cy;
                if let Some(rgb) = sample_bilinear(src, sx, sy) {
                    let i = ((y * out_w + x) * 3) as usize;
                    data[i..i + 3].copy_from_slice(&rgb);
                }
            }
        }
        Some(PixelBuffer::new(out_w, out_h, data).expect("buffer size matches"))
    }
}

fn sample_bilinear(src: &PixelBuffer, x: Real, y: Real) -> Option<[u8; 3]> {
    if x < 0.0 || y < 0.0 {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    if x0 + 1 >= src.width() || y0 + 1 >= src.height() {
        return None;
    }
    let tx = x - x0 as Real;
    let ty = y - y0 as Real;
    let p00 = src.get(x0, y0);
    let p10 = src.get(x0 + 1, y0);
    let p01 = src.get(x0, y0 + 1);
    let p11 = src.get(x0 + 1, y0 + 1);
    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as Real * (1.0 - tx) + p10[c] as Real * tx;
        let bottom = p01[c] as Real * (1.0 - tx) + p11[c] as Real * tx;
        out[c] = (top * (1.0 - ty) + bottom * ty).round().clamp(0.0, 255.0) as u8;
    }
    Some(out)
}

/// Pairs adjacent selections ring by ring and feeds the storage sinks.
pub struct StereoGenerator<L: StorageSink, R: StorageSink> {
    graph: Arc<RecorderGraph>,
    stitcher: MonoStitcher,
    left: L,
    right: R,
    ring: Vec<SelectionInfo>,
    current_ring: Option<u32>,
    pairs_written: usize,
}

impl<L: StorageSink, R: StorageSink> StereoGenerator<L, R> {
    pub fn new(graph: Arc<RecorderGraph>, stitcher: MonoStitcher, left: L, right: R) -> Self {
        Self {
            graph,
            stitcher,
            left,
            right,
            ring: Vec::new(),
            current_ring: None,
            pairs_written: 0,
        }
    }

    pub fn pairs_written(&self) -> usize {
        self.pairs_written
    }

    fn flush_ring(&mut self) {
        if self.ring.is_empty() {
            return;
        }
        let ring = std::mem::take(&mut self.ring);

        let graph = &self.graph;
        let stitcher = &self.stitcher;
        let left = &mut self.left;
        let right = &mut self.right;
        let pairs_written = &mut self.pairs_written;

        let mut processor = RingProcessor::new(
            |info: &mut SelectionInfo| {
                if !info.frame.is_loaded() {
                    if let Err(err) = info.frame.load() {
                        warn!(id = info.frame.id, error = %err, "stereo input unavailable");
                    }
                }
            },
            |a: &mut SelectionInfo, b: &mut SelectionInfo| {
                if graph.get_edge(&a.target, &b.target).is_none() {
                    debug!(
                        a = a.target.global_id,
                        b = b.target.global_id,
                        "selection pair without edge skipped"
                    );
                    return;
                }
                let stereo = stitcher.create_stereo(a, b);
                if !stereo.valid {
                    debug!(a = a.frame.id, b = b.frame.id, "stereo pair invalid");
                    return;
                }
                if let Err(err) = left.save_rectified_image(&stereo.left, a.target.global_id) {
                    warn!(error = %err, "left sink write failed");
                    return;
                }
                if let Err(err) = right.save_rectified_image(&stereo.right, a.target.global_id) {
                    warn!(error = %err, "right sink write failed");
                    return;
                }
                *pairs_written += 1;
            },
            |mut info: SelectionInfo| {
                info.frame.unload();
            },
        );
        for info in ring {
            processor.push(info);
        }
        processor.flush();
    }
}

impl<L: StorageSink, R: StorageSink> Sink<SelectionInfo> for StereoGenerator<L, R> {
    fn push(&mut self, info: SelectionInfo) {
        if self.current_ring != Some(info.target.ring_id) {
            self.flush_ring();
            self.current_ring = Some(info.target.ring_id);
        }
        self.ring.push(info);
    }

    fn finish(&mut self) {
        self.flush_ring();
    }
}
