//! Umbrella crate re-exporting the `panorec` API surface.
//!
//! - `core`: math, camera model, frames, the recording graph and
//!   configuration,
//! - [`align`]: correlators, the pyramid aligner, stream alignment, ring
//!   closure and correspondence adjustment,
//! - [`recorder`]: the sink pipeline and the recorder facade.
//!
//! Most applications only need [`Recorder`] plus a pair of storage sinks.

pub use pano_align as align;
pub use pano_core as core;
pub use pano_recorder as recorder;

pub use pano_core::{Frame, FrameSource, PixelBuffer, RecorderConfig, RecorderGraph};
pub use pano_recorder::{DirectorySink, MemorySink, Recorder, StorageSink};
