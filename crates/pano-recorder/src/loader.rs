//! Lazy pixel loading.
//!
//! Downstream stages correlate on pixel data, so frames arriving with an
//! unloaded buffer are materialised from their source descriptor here.
//! Frames that cannot be loaded are dropped; the pipeline treats them like
//! any other input rejection.

use pano_core::Frame;
use tracing::warn;

use crate::sink::Sink;

pub struct ImageLoader<S: Sink<Frame>> {
    downstream: S,
    failed: u64,
}

impl<S: Sink<Frame>> ImageLoader<S> {
    pub fn new(downstream: S) -> Self {
        Self {
            downstream,
            failed: 0,
        }
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }
}

impl<S: Sink<Frame>> Sink<Frame> for ImageLoader<S> {
    fn push(&mut self, mut frame: Frame) {
        if !frame.is_loaded() {
            if let Err(err) = frame.load() {
                self.failed += 1;
                warn!(id = frame.id, error = %err, "frame dropped, pixels unavailable");
                return;
            }
        }
        self.downstream.push(frame);
    }

    fn finish(&mut self) {
        self.downstream.finish();
    }
}
