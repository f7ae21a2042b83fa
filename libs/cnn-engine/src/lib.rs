//! Asynchronous batch execution engine for convolutional networks.
//!
//! A [`TrainingModule`] marshals host image batches onto a compute device,
//! runs forward / backward / fused training passes, and pairs each
//! asynchronous submission with the caller's batch id until it is waited on.
//!
//! ```no_run
//! use cnn_engine::{HostTensor, ImageShape, ModuleConfig, NetworkKind, TrainingModule};
//!
//! let config = ModuleConfig::new(
//!     NetworkKind::ConvNet,
//!     4,
//!     ImageShape::new(32, 32, 3),
//!     ImageShape::new(1, 1, 10),
//! );
//! let mut module = TrainingModule::init(config)?;
//!
//! let images = vec![0.0f32; 4 * 32 * 32 * 3];
//! module.begin_forward_batch(1, HostTensor::new(&images, &[4, 32, 32, 3]), None, false, false)?;
//! // ... prepare the next batch on the host ...
//! let result = module.wait_for_batch(1)?;
//! assert_eq!(result.output.len(), 4 * 10);
//! # Ok::<(), cnn_engine::Error>(())
//! ```

pub mod batch_buffers;
pub mod config;
pub mod device;
pub mod error;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod marshal;
pub mod module;
pub mod network;
pub mod params;
pub mod scheduler;
pub mod shape;
pub mod updater;

pub use config::{ModuleConfig, OptionsMap};
pub use device::{open_device, ComputeDevice, DevicePreference, HostDevice};
pub use error::{Error, Result};
pub use module::TrainingModule;
pub use network::NetworkKind;
pub use params::{ParamArray, ParamMap, ParamTag};
pub use scheduler::{BatchId, BatchOutput, LossTargets};
pub use shape::{BatchShape, HostTensor, ImageShape};
pub use updater::UpdaterKind;

#[cfg(feature = "gpu")]
pub use gpu::GpuDevice;
