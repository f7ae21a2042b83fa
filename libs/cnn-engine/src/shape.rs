//! Image and batch shapes, and the host tensor view every data-bearing call takes.
//!
//! Host buffers are row-major and channel-interleaved per sample, so a shape
//! descriptor is `[batch, height, width, channels]`. The engine never infers
//! a shape from a buffer length; the descriptor is always explicit.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Rank of every shape descriptor accepted by the engine.
pub const IMAGE_RANK: usize = 4;

/// Product of `dims`, or `None` when it does not fit in `usize`.
pub fn checked_product(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Shape of a single image (one sample), batch size excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageShape {
    pub const fn new(height: usize, width: usize, channels: usize) -> Self {
        ImageShape {
            height,
            width,
            channels,
        }
    }

    /// Elements per sample.
    pub const fn len(&self) -> usize {
        self.height * self.width * self.channels
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn checked_len(&self) -> Option<usize> {
        checked_product(&[self.height, self.width, self.channels])
    }

    /// Spatial positions per sample (`height * width`).
    pub const fn positions(&self) -> usize {
        self.height * self.width
    }

    pub const fn with_channels(&self, channels: usize) -> Self {
        ImageShape::new(self.height, self.width, channels)
    }

    /// Shape of the per-position label / weight / loss images for this output.
    pub const fn position_map(&self) -> Self {
        self.with_channels(1)
    }
}

impl fmt::Display for ImageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.height, self.width, self.channels)
    }
}

/// A batch of images: the validated form of a rank-4 shape descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchShape {
    pub batch: usize,
    pub image: ImageShape,
}

impl BatchShape {
    pub const fn new(batch: usize, image: ImageShape) -> Self {
        BatchShape { batch, image }
    }

    /// Parse a `[n, h, w, c]` descriptor.
    pub fn from_dims(what: &'static str, dims: &[usize]) -> Result<Self> {
        if dims.len() != IMAGE_RANK {
            return Err(Error::shape(
                what,
                format!("rank {IMAGE_RANK} [n, h, w, c]"),
                format!("rank {} {:?}", dims.len(), dims),
            ));
        }
        if checked_product(dims).is_none() {
            return Err(Error::shape(
                what,
                "an element count that fits in usize",
                format!("{:?}", dims),
            ));
        }
        Ok(BatchShape::new(
            dims[0],
            ImageShape::new(dims[1], dims[2], dims[3]),
        ))
    }

    pub const fn len(&self) -> usize {
        self.batch * self.image.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn dims(&self) -> [usize; IMAGE_RANK] {
        [
            self.batch,
            self.image.height,
            self.image.width,
            self.image.channels,
        ]
    }
}

impl fmt::Display for BatchShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.batch, self.image.height, self.image.width, self.image.channels
        )
    }
}

/// Borrowed host buffer plus its explicit shape descriptor.
#[derive(Debug, Clone, Copy)]
pub struct HostTensor<'a> {
    pub data: &'a [f32],
    pub shape: &'a [usize],
}

impl<'a> HostTensor<'a> {
    pub fn new(data: &'a [f32], shape: &'a [usize]) -> Self {
        HostTensor { data, shape }
    }

    /// Parse the descriptor and check the buffer length against it.
    pub fn batch_shape(&self, what: &'static str) -> Result<BatchShape> {
        let shape = BatchShape::from_dims(what, self.shape)?;
        if shape.len() != self.data.len() {
            return Err(Error::shape(
                what,
                format!("{} elements for shape {}", shape.len(), shape),
                format!("{} elements", self.data.len()),
            ));
        }
        Ok(shape)
    }

    /// Validate against a configured per-sample shape and batch capacity.
    pub fn expect(
        &self,
        what: &'static str,
        image: ImageShape,
        capacity: usize,
    ) -> Result<BatchShape> {
        let shape = self.batch_shape(what)?;
        if shape.image != image {
            return Err(Error::shape(
                what,
                format!("[n, {}, {}, {}]", image.height, image.width, image.channels),
                shape,
            ));
        }
        if shape.batch == 0 {
            return Err(Error::EmptyBatch);
        }
        if shape.batch > capacity {
            return Err(Error::BatchTooLarge {
                requested: shape.batch,
                capacity,
            });
        }
        Ok(shape)
    }
}
