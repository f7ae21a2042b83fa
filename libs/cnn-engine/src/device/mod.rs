//! Device compute queue abstraction.
//!
//! A [`ComputeDevice`] owns an arena of f32 buffers addressed by [`BufferId`]
//! and executes [`CommandStream`]s in submission order. Submitting never
//! blocks on device work; [`ComputeDevice::wait`] blocks until a specific
//! submission has completed.

mod host;
pub mod kernels;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use host::HostDevice;
pub use kernels::{ConvDims, Kernel, LossDims, StepParams, StepRule};

/// Handle into a device's buffer arena. Valid for the device's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u32);

impl BufferId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Completion token for one submitted stream. Tokens increase monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Submission(pub(crate) u64);

impl Submission {
    pub fn index(self) -> u64 {
        self.0
    }
}

/// Host data copied into a device buffer before the stream's kernels run.
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub dst: BufferId,
    pub offset: usize,
    pub data: Vec<f32>,
}

/// Ordered recording of uploads, kernels and readback requests.
#[derive(Debug, Default, Clone)]
pub struct CommandStream {
    label: String,
    uploads: Vec<Upload>,
    kernels: Vec<Kernel>,
    readbacks: Vec<BufferId>,
}

impl CommandStream {
    pub fn new(label: impl Into<String>) -> Self {
        CommandStream {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn upload(&mut self, dst: BufferId, data: Vec<f32>) {
        self.upload_at(dst, 0, data);
    }

    pub fn upload_at(&mut self, dst: BufferId, offset: usize, data: Vec<f32>) {
        self.uploads.push(Upload { dst, offset, data });
    }

    pub fn push(&mut self, kernel: Kernel) {
        self.kernels.push(kernel);
    }

    /// Make `buffer` host-readable once this stream completes.
    pub fn read_back(&mut self, buffer: BufferId) {
        if !self.readbacks.contains(&buffer) {
            self.readbacks.push(buffer);
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn uploads(&self) -> &[Upload] {
        &self.uploads
    }

    pub fn kernels(&self) -> &[Kernel] {
        &self.kernels
    }

    pub fn readbacks(&self) -> &[BufferId] {
        &self.readbacks
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.kernels.is_empty() && self.readbacks.is_empty()
    }

    /// Check every buffer reference against the device's arena.
    pub fn validate(&self, buffer_len: impl Fn(BufferId) -> Option<usize>) -> Result<()> {
        let check = |id: BufferId, needed: usize, what: &str| -> Result<()> {
            match buffer_len(id) {
                None => Err(Error::device(format!(
                    "stream '{}': {} references unknown buffer {}",
                    self.label, what, id
                ))),
                Some(len) if len < needed => Err(Error::device(format!(
                    "stream '{}': {} needs {} elements in buffer {} of {}",
                    self.label, what, needed, id, len
                ))),
                Some(_) => Ok(()),
            }
        };

        for upload in &self.uploads {
            check(upload.dst, upload.offset + upload.data.len(), "upload")?;
        }
        for kernel in &self.kernels {
            for (id, needed) in kernel.buffers() {
                check(id, needed, kernel.name())?;
            }
        }
        for &id in &self.readbacks {
            check(id, 0, "readback")?;
        }
        Ok(())
    }
}

/// An ordered device compute queue plus the buffers it operates on.
pub trait ComputeDevice: Send {
    fn name(&self) -> &str;

    /// Allocate a zero-initialised buffer of `len` f32 elements.
    fn alloc(&mut self, len: usize, label: &str) -> Result<BufferId>;

    fn buffer_len(&self, buffer: BufferId) -> Option<usize>;

    /// Enqueue a stream. Returns once the work is queued, not when it ran.
    fn submit(&mut self, stream: CommandStream) -> Result<Submission>;

    /// Block until `submission` and everything queued before it completed.
    fn wait(&mut self, submission: Submission) -> Result<()>;

    fn wait_idle(&mut self) -> Result<()>;

    /// Copy the first `out.len()` elements of `buffer` to the host.
    ///
    /// The caller must have waited on a submission that requested a readback
    /// of `buffer` after its last write.
    fn read(&mut self, buffer: BufferId, out: &mut [f32]) -> Result<()>;

    fn allocated_bytes(&self) -> usize;
}

/// Which device backend a module should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// GPU when compiled in and an adapter exists, otherwise host.
    #[default]
    Auto,
    Host,
    Gpu,
}

pub fn open_device(preference: DevicePreference) -> Result<Box<dyn ComputeDevice>> {
    match preference {
        DevicePreference::Host => Ok(Box::new(HostDevice::new()?)),
        DevicePreference::Gpu => open_gpu(),
        DevicePreference::Auto => match open_gpu() {
            Ok(device) => Ok(device),
            Err(e) => {
                log::warn!("GPU device unavailable ({}), falling back to host device", e);
                Ok(Box::new(HostDevice::new()?))
            }
        },
    }
}

#[cfg(feature = "gpu")]
fn open_gpu() -> Result<Box<dyn ComputeDevice>> {
    let device = crate::gpu::GpuDevice::new()?;
    log::info!("Opened GPU device: {}", device.name());
    Ok(Box::new(device))
}

#[cfg(not(feature = "gpu"))]
fn open_gpu() -> Result<Box<dyn ComputeDevice>> {
    Err(Error::device("built without the `gpu` feature"))
}
