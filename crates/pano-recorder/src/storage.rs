//! Storage sinks and the input-summary format.
//!
//! Rectified views are stored indexed by target id. The input summary is a
//! little-endian binary manifest of the graph and the per-frame results:
//! rings, points, gain and adjusted pose per frame. The header carries a
//! fixed magic and a version byte; readers refuse other versions.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use pano_core::{Frame, Mat4, Real, RecorderGraph, TargetId};
use thiserror::Error;

/// Magic bytes opening an input summary.
pub const SUMMARY_MAGIC: [u8; 4] = *b"PANO";
/// Format version; bump on any incompatible change.
pub const SUMMARY_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error")]
    Io(#[from] io::Error),
    #[error("image encoding failed")]
    Image(#[from] image::ImageError),
    #[error("frame {0} has no pixel data to store")]
    NoPixels(u64),
    #[error("bad summary magic")]
    BadMagic,
    #[error("unsupported summary version {0}")]
    UnsupportedVersion(u8),
}

/// Per-frame record of the input summary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameRecord {
    pub frame_id: u64,
    pub target_id: TargetId,
    pub gain: Real,
    pub adjusted: Mat4,
}

/// One target of the serialised graph.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SummaryPoint {
    pub global_id: TargetId,
    pub ring_id: u32,
    pub local_id: u32,
    pub extrinsics: Mat4,
}

/// Parsed input summary.
#[derive(Clone, Debug, Default)]
pub struct InputSummary {
    /// Points grouped by ring, in traversal order.
    pub rings: Vec<Vec<SummaryPoint>>,
    pub frames: Vec<FrameRecord>,
}

fn write_mat4<W: Write>(w: &mut W, m: &Mat4) -> io::Result<()> {
    for r in 0..4 {
        for c in 0..4 {
            w.write_all(&m[(r, c)].to_le_bytes())?;
        }
    }
    Ok(())
}

fn read_mat4<R: Read>(r: &mut R) -> io::Result<Mat4> {
    let mut m = Mat4::zeros();
    let mut buf = [0u8; 8];
    for row in 0..4 {
        for col in 0..4 {
            r.read_exact(&mut buf)?;
            m[(row, col)] = Real::from_le_bytes(buf);
        }
    }
    Ok(m)
}

/// Serialise graph and frame records.
pub fn write_summary<W: Write>(
    w: &mut W,
    graph: &RecorderGraph,
    frames: &[FrameRecord],
) -> Result<(), StorageError> {
    w.write_all(&SUMMARY_MAGIC)?;
    w.write_all(&[SUMMARY_VERSION])?;

    w.write_all(&(graph.rings().len() as u32).to_le_bytes())?;
    for ring in graph.rings() {
        w.write_all(&(ring.len() as u32).to_le_bytes())?;
        for point in ring {
            w.write_all(&point.global_id.to_le_bytes())?;
            w.write_all(&point.ring_id.to_le_bytes())?;
            w.write_all(&point.local_id.to_le_bytes())?;
            write_mat4(w, &point.extrinsics)?;
        }
    }

    w.write_all(&(frames.len() as u32).to_le_bytes())?;
    for record in frames {
        w.write_all(&record.frame_id.to_le_bytes())?;
        w.write_all(&record.target_id.to_le_bytes())?;
        w.write_all(&record.gain.to_le_bytes())?;
        write_mat4(w, &record.adjusted)?;
    }
    Ok(())
}

/// Parse a summary written by [`write_summary`].
pub fn read_summary<R: Read>(r: &mut R) -> Result<InputSummary, StorageError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != SUMMARY_MAGIC {
        return Err(StorageError::BadMagic);
    }
    let mut version = [0u8; 1];
    r.read_exact(&mut version)?;
    if version[0] != SUMMARY_VERSION {
        return Err(StorageError::UnsupportedVersion(version[0]));
    }

    let mut u32_buf = [0u8; 4];
    let mut u64_buf = [0u8; 8];

    r.read_exact(&mut u32_buf)?;
    let ring_count = u32::from_le_bytes(u32_buf);
    let mut rings = Vec::with_capacity(ring_count as usize);
    for _ in 0..ring_count {
        r.read_exact(&mut u32_buf)?;
        let point_count = u32::from_le_bytes(u32_buf);
        let mut ring = Vec::with_capacity(point_count as usize);
        for _ in 0..point_count {
            r.read_exact(&mut u32_buf)?;
            let global_id = u32::from_le_bytes(u32_buf);
            r.read_exact(&mut u32_buf)?;
            let ring_id = u32::from_le_bytes(u32_buf);
            r.read_exact(&mut u32_buf)?;
            let local_id = u32::from_le_bytes(u32_buf);
            let extrinsics = read_mat4(r)?;
            ring.push(SummaryPoint {
                global_id,
                ring_id,
                local_id,
                extrinsics,
            });
        }
        rings.push(ring);
    }

    r.read_exact(&mut u32_buf)?;
    let frame_count = u32::from_le_bytes(u32_buf);
    let mut frames = Vec::with_capacity(frame_count as usize);
    for _ in 0..frame_count {
        r.read_exact(&mut u64_buf)?;
        let frame_id = u64::from_le_bytes(u64_buf);
        r.read_exact(&mut u32_buf)?;
        let target_id = u32::from_le_bytes(u32_buf);
        r.read_exact(&mut u64_buf)?;
        let gain = Real::from_le_bytes(u64_buf);
        let adjusted = read_mat4(r)?;
        frames.push(FrameRecord {
            frame_id,
            target_id,
            gain,
            adjusted,
        });
    }

    Ok(InputSummary { rings, frames })
}

/// Final destination of rectified views.
pub trait StorageSink: Send {
    fn save_rectified_image(&mut self, frame: &Frame, target: TargetId)
        -> Result<(), StorageError>;

    /// Serialise the graph and per-frame results; called once at finish.
    fn save_input_summary(
        &mut self,
        graph: &RecorderGraph,
        frames: &[FrameRecord],
    ) -> Result<(), StorageError>;
}

/// Keeps results in memory; shared between clones.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<BTreeMap<TargetId, Frame>>>,
    summary: Arc<Mutex<Option<InputSummary>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn target_ids(&self) -> Vec<TargetId> {
        self.entries.lock().unwrap().keys().copied().collect()
    }

    pub fn summary(&self) -> Option<InputSummary> {
        self.summary.lock().unwrap().clone()
    }
}

impl StorageSink for MemorySink {
    fn save_rectified_image(
        &mut self,
        frame: &Frame,
        target: TargetId,
    ) -> Result<(), StorageError> {
        if !frame.is_loaded() {
            return Err(StorageError::NoPixels(frame.id));
        }
        self.entries.lock().unwrap().insert(target, frame.clone());
        Ok(())
    }

    fn save_input_summary(
        &mut self,
        graph: &RecorderGraph,
        frames: &[FrameRecord],
    ) -> Result<(), StorageError> {
        // Round-trip through the wire format so memory and directory sinks
        // agree on what is representable.
        let mut bytes = Vec::new();
        write_summary(&mut bytes, graph, frames)?;
        let summary = read_summary(&mut bytes.as_slice())?;
        *self.summary.lock().unwrap() = Some(summary);
        Ok(())
    }
}

/// Writes results below a directory: one PNG per target plus the summary.
#[derive(Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join("input_summary.bin")
    }
}

impl StorageSink for DirectorySink {
    fn save_rectified_image(
        &mut self,
        frame: &Frame,
        target: TargetId,
    ) -> Result<(), StorageError> {
        let Some(pixels) = frame.pixels() else {
            return Err(StorageError::NoPixels(frame.id));
        };
        let path = self.dir.join(format!("target_{target:05}.png"));
        let img =
            image::RgbImage::from_raw(pixels.width(), pixels.height(), pixels.as_bytes().to_vec())
                .ok_or(StorageError::NoPixels(frame.id))?;
        img.save(&path)?;
        Ok(())
    }

    fn save_input_summary(
        &mut self,
        graph: &RecorderGraph,
        frames: &[FrameRecord],
    ) -> Result<(), StorageError> {
        let mut file = std::fs::File::create(self.summary_path())?;
        write_summary(&mut file, graph, frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pano_core::{
        generate, intrinsics, rotation_y, Density, FrameSource, GraphMode, GraphParams,
        PixelBuffer,
    };

    fn graph() -> RecorderGraph {
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

    fn records() -> Vec<FrameRecord> {
        vec![
            FrameRecord {
                frame_id: 3,
                target_id: 0,
                gain: 1.05,
                adjusted: rotation_y(0.1),
            },
            FrameRecord {
                frame_id: 9,
                target_id: 1,
                gain: 0.97,
                adjusted: rotation_y(0.5),
            },
        ]
    }

    #[test]
    fn summary_roundtrip() {
        let graph = graph();
        let mut bytes = Vec::new();
        write_summary(&mut bytes, &graph, &records()).unwrap();

        let summary = read_summary(&mut bytes.as_slice()).unwrap();
        assert_eq!(summary.rings.len(), 1);
        assert_eq!(summary.rings[0].len(), 16);
        assert_eq!(summary.frames, records());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let graph = graph();
        let mut bytes = Vec::new();
        write_summary(&mut bytes, &graph, &[]).unwrap();
        bytes[4] = SUMMARY_VERSION + 1;
        assert!(matches!(
            read_summary(&mut bytes.as_slice()),
            Err(StorageError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = b"JUNKdata".to_vec();
        assert!(matches!(
            read_summary(&mut bytes.as_slice()),
            Err(StorageError::BadMagic)
        ));
    }

    #[test]
    fn memory_sink_shares_entries_between_clones() {
        let mut sink = MemorySink::new();
        let reader = sink.clone();
        let mut frame = Frame::new(
            1,
            intrinsics(400.0, 400.0, 320.0, 320.0),
            rotation_y(0.0),
            FrameSource::None,
        );
        frame.attach_pixels(PixelBuffer::new(2, 2, vec![9; 12]).unwrap());
        sink.save_rectified_image(&frame, 4).unwrap();
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.target_ids(), vec![4]);
    }

    #[test]
    fn directory_sink_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::new(dir.path().to_path_buf()).unwrap();
        let mut frame = Frame::new(
            1,
            intrinsics(400.0, 400.0, 320.0, 320.0),
            rotation_y(0.0),
            FrameSource::None,
        );
        frame.attach_pixels(PixelBuffer::new(2, 2, vec![9; 12]).unwrap());
        sink.save_rectified_image(&frame, 2).unwrap();
        sink.save_input_summary(&graph(), &records()).unwrap();
        assert!(dir.path().join("target_00002.png").exists());
        assert!(sink.summary_path().exists());
    }
}
