//! Data marshaller: host batches (NHWC, channel-interleaved) to and from
//! device tensors (NCHW, planar).
//!
//! Conversion is a pure reordering copy; element values are never touched.

use crate::device::{BufferId, CommandStream, ComputeDevice};
use crate::error::{Error, Result};
use crate::shape::{BatchShape, HostTensor, ImageShape};

/// A capacity-sized device buffer holding a batch of images of one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTensor {
    pub buffer: BufferId,
    pub image: ImageShape,
    pub capacity: usize,
}

impl DeviceTensor {
    pub fn allocate(
        device: &mut dyn ComputeDevice,
        image: ImageShape,
        capacity: usize,
        label: &str,
    ) -> Result<Self> {
        let buffer = device.alloc(capacity * image.len(), label)?;
        Ok(DeviceTensor {
            buffer,
            image,
            capacity,
        })
    }
}

/// The first `shape.batch` samples of a device tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBatch {
    pub tensor: DeviceTensor,
    pub shape: BatchShape,
}

impl DeviceBatch {
    pub fn new(tensor: DeviceTensor, batch: usize) -> Self {
        DeviceBatch {
            tensor,
            shape: BatchShape::new(batch, tensor.image),
        }
    }

    pub fn buffer(&self) -> BufferId {
        self.tensor.buffer
    }

    pub fn len(&self) -> usize {
        self.shape.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }
}

pub fn nhwc_to_nchw(src: &[f32], shape: BatchShape) -> Vec<f32> {
    let ImageShape {
        height: h,
        width: w,
        channels: c,
    } = shape.image;
    let mut dst = vec![0.0; shape.len()];
    for n in 0..shape.batch {
        let sample = n * h * w * c;
        for y in 0..h {
            for x in 0..w {
                for ch in 0..c {
                    dst[sample + (ch * h + y) * w + x] = src[sample + (y * w + x) * c + ch];
                }
            }
        }
    }
    dst
}

pub fn nchw_to_nhwc(src: &[f32], shape: BatchShape) -> Vec<f32> {
    let ImageShape {
        height: h,
        width: w,
        channels: c,
    } = shape.image;
    let mut dst = vec![0.0; shape.len()];
    for n in 0..shape.batch {
        let sample = n * h * w * c;
        for ch in 0..c {
            for y in 0..h {
                for x in 0..w {
                    dst[sample + (y * w + x) * c + ch] = src[sample + (ch * h + y) * w + x];
                }
            }
        }
    }
    dst
}

/// A validated host batch already converted to device layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Staged {
    pub shape: BatchShape,
    data: Vec<f32>,
}

impl Staged {
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Record the upload into the first samples of `dst`.
    pub fn record(self, stream: &mut CommandStream, dst: DeviceTensor) -> DeviceBatch {
        stream.upload(dst.buffer, self.data);
        DeviceBatch {
            tensor: dst,
            shape: self.shape,
        }
    }
}

/// Validate `host` against a per-sample shape and capacity, then convert it.
pub fn stage(
    host: HostTensor<'_>,
    image: ImageShape,
    capacity: usize,
    what: &'static str,
) -> Result<Staged> {
    let shape = host.expect(what, image, capacity)?;
    Ok(Staged {
        shape,
        data: nhwc_to_nchw(host.data, shape),
    })
}

/// Validate `host` against `dst` and record its upload into `stream`.
pub fn to_device(
    stream: &mut CommandStream,
    dst: DeviceTensor,
    host: HostTensor<'_>,
    what: &'static str,
) -> Result<DeviceBatch> {
    Ok(stage(host, dst.image, dst.capacity, what)?.record(stream, dst))
}

/// Copy a completed device batch back to a host NHWC buffer.
///
/// The stream that last wrote `batch` must have requested its readback and
/// been waited on.
pub fn from_device(device: &mut dyn ComputeDevice, batch: &DeviceBatch) -> Result<Vec<f32>> {
    if batch.shape.batch > batch.tensor.capacity {
        return Err(Error::BatchTooLarge {
            requested: batch.shape.batch,
            capacity: batch.tensor.capacity,
        });
    }
    let mut planar = vec![0.0; batch.len()];
    device.read(batch.buffer(), &mut planar)?;
    Ok(nchw_to_nhwc(&planar, batch.shape))
}
