//! Optional intermediate image dumps.
//!
//! When a debug path is configured every frame passing this sink is
//! written below it as a PNG named by frame id; without a path the sink
//! is a pass-through.

use std::path::PathBuf;

use pano_core::Frame;
use tracing::warn;

use crate::sink::Sink;

pub struct DebugSink<S: Sink<Frame>> {
    path: Option<PathBuf>,
    downstream: S,
}

impl<S: Sink<Frame>> DebugSink<S> {
    pub fn new(path: Option<PathBuf>, downstream: S) -> Self {
        if let Some(path) = &path {
            if let Err(err) = std::fs::create_dir_all(path) {
                warn!(path = %path.display(), error = %err, "debug path unusable");
            }
        }
        Self { path, downstream }
    }
}

impl<S: Sink<Frame>> Sink<Frame> for DebugSink<S> {
    fn push(&mut self, frame: Frame) {
        if let (Some(path), Some(pixels)) = (&self.path, frame.pixels()) {
            let file = path.join(format!("frame_{:06}.png", frame.id));
            let img = image::RgbImage::from_raw(
                pixels.width(),
                pixels.height(),
                pixels.as_bytes().to_vec(),
            );
            match img {
                Some(img) => {
                    if let Err(err) = img.save(&file) {
                        warn!(file = %file.display(), error = %err, "debug write failed");
                    }
                }
                None => warn!(id = frame.id, "debug write skipped, buffer size mismatch"),
            }
        }
        self.downstream.push(frame);
    }

    fn finish(&mut self) {
        self.downstream.finish();
    }
}
