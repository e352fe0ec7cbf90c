//! Image alignment for `panorec`.
//!
//! The crate builds up in layers: planar correlators measure pixel
//! displacement between two buffers ([`planar`]), the pairwise correlator
//! turns that into angular offsets between two frames ([`pairwise`]), and
//! the stream aligner, ring closer and correspondence adjuster apply those
//! measurements to frame poses ([`stream`], [`closer`], [`adjuster`]).

/// Batch pose refinement over graph edges.
pub mod adjuster;
/// Ring closure: distributing the first/last gap.
pub mod closer;
/// Per-frame exposure gain estimation.
pub mod exposure;
/// Frame-to-frame angular offset measurement.
pub mod pairwise;
/// Planar correlators and the pyramid aligner.
pub mod planar;
/// Streaming statistics helpers.
pub mod stat;
/// Online ring-wise drift correction.
pub mod stream;

pub use adjuster::{AdjusterReport, CorrespondenceAdjuster};
pub use closer::close_ring;
pub use exposure::ExposureCompensator;
pub use pairwise::{CorrelationResult, CorrelatorSettings, PairwiseCorrelator, RejectionReason};
pub use planar::{Correlator, ErrorMetric, PyramidAligner};
pub use stream::RingwiseStreamAligner;
