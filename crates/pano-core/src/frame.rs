//! Captured frames and their lazily loaded pixel buffers.
//!
//! A [`Frame`] carries the sensor metadata of one captured image and an
//! optional RGB pixel buffer. Buffers are loaded on demand from the frame's
//! [`FrameSource`] and can be dropped again with [`Frame::unload`] to bound
//! memory while the frame sits in a queue. Pixel data is reference counted,
//! so cloning a frame never copies pixels.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::camera;
use crate::math::{Mat3, Mat4};

/// Errors raised when materialising a frame's pixel buffer.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame {0} has no pixel source to load from")]
    NoSource(u64),
    #[error("failed to load frame image from {path:?}")]
    Load {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("raw buffer of {got} bytes does not match {width}x{height} RGBA")]
    RawSize { width: u32, height: u32, got: usize },
    #[error("pixel buffer of {got} bytes does not match {width}x{height} RGB")]
    BufferSize { width: u32, height: u32, got: usize },
}

/// Immutable RGB8 pixel buffer, row major, shared by reference counting.
#[derive(Clone)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Arc<Vec<u8>>,
}

impl PixelBuffer {
    /// Wrap raw RGB8 data. Fails if the byte count does not match.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        if data.len() != (width as usize) * (height as usize) * 3 {
            return Err(FrameError::BufferSize {
                width,
                height,
                got: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data: Arc::new(data),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// RGB triplet at `(x, y)`. Panics outside the buffer.
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> [u8; 3] {
        let i = ((y as usize) * (self.width as usize) + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Raw bytes, `width * height * 3` of them.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Copy out a sub-rectangle. Panics if the rectangle leaves the buffer.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> PixelBuffer {
        assert!(x + width <= self.width && y + height <= self.height);
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for row in y..y + height {
            let start = ((row as usize) * (self.width as usize) + x as usize) * 3;
            data.extend_from_slice(&self.data[start..start + (width as usize) * 3]);
        }
        PixelBuffer {
            width,
            height,
            data: Arc::new(data),
        }
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Raw RGBA capture data handed over by the sensor layer.
#[derive(Clone, Debug)]
pub struct RawRgba {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Where a frame's pixels can be (re)loaded from.
#[derive(Clone, Debug, Default)]
pub enum FrameSource {
    /// No backing source; the buffer cannot be reloaded once unloaded.
    #[default]
    None,
    /// An image file on disk.
    Path(PathBuf),
    /// A raw RGBA buffer kept alive by the capture layer.
    Raw(Arc<RawRgba>),
}

/// One captured image plus sensor metadata.
///
/// `adjusted` equals `original` until an aligner refines it; intrinsics
/// never change after capture; `id` is stable and used as a key downstream.
#[derive(Clone, Debug)]
pub struct Frame {
    pub id: u64,
    pub intrinsics: Mat3,
    pub original: Mat4,
    pub adjusted: Mat4,
    pub source: FrameSource,
    image: Option<PixelBuffer>,
}

impl Frame {
    /// A frame with an unloaded pixel buffer.
    pub fn new(id: u64, intrinsics: Mat3, original: Mat4, source: FrameSource) -> Self {
        Self {
            id,
            intrinsics,
            original,
            adjusted: original,
            source,
            image: None,
        }
    }

    /// A frame with pixels already materialised.
    pub fn with_pixels(id: u64, intrinsics: Mat3, original: Mat4, pixels: PixelBuffer) -> Self {
        Self {
            id,
            intrinsics,
            original,
            adjusted: original,
            source: FrameSource::None,
            image: Some(pixels),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.image.is_some()
    }

    /// The pixel buffer, if loaded. Consumers must handle `None`.
    pub fn pixels(&self) -> Option<&PixelBuffer> {
        self.image.as_ref()
    }

    /// Attach an externally produced buffer (e.g. a rectified view).
    pub fn attach_pixels(&mut self, pixels: PixelBuffer) {
        self.image = Some(pixels);
    }

    /// Materialise the pixel buffer from the frame source.
    ///
    /// A no-op when already loaded.
    pub fn load(&mut self) -> Result<(), FrameError> {
        if self.image.is_some() {
            return Ok(());
        }
        let buffer = match &self.source {
            FrameSource::None => return Err(FrameError::NoSource(self.id)),
            FrameSource::Path(path) => {
                let img = image::open(path)
                    .map_err(|source| FrameError::Load {
                        path: path.clone(),
                        source,
                    })?
                    .into_rgb8();
                let (w, h) = img.dimensions();
                PixelBuffer::new(w, h, img.into_raw())?
            }
            FrameSource::Raw(raw) => {
                let expected = (raw.width as usize) * (raw.height as usize) * 4;
                if raw.data.len() != expected {
                    return Err(FrameError::RawSize {
                        width: raw.width,
                        height: raw.height,
                        got: raw.data.len(),
                    });
                }
                let mut rgb = Vec::with_capacity(expected / 4 * 3);
                for px in raw.data.chunks_exact(4) {
                    rgb.extend_from_slice(&px[..3]);
                }
                PixelBuffer::new(raw.width, raw.height, rgb)?
            }
        };
        self.image = Some(buffer);
        Ok(())
    }

    /// Drop the pixel buffer. The frame can be reloaded from its source.
    pub fn unload(&mut self) {
        self.image = None;
    }

    /// Intrinsics rescaled to the dimensions of the loaded pixel buffer.
    ///
    /// Falls back to the stored intrinsics while unloaded.
    pub fn scaled_intrinsics(&self) -> Mat3 {
        match &self.image {
            Some(buf) => camera::scale_to_image(&self.intrinsics, buf.width(), buf.height()),
            None => self.intrinsics,
        }
    }
}
