//! Network contract and the built-in topologies.
//!
//! A network records its layer kernels into a [`CommandStream`] over device
//! buffers described by a [`PassIo`]. It owns its parameters, their gradients,
//! intermediate activations, and the copy of the last training input.

mod layers;

use serde::{Deserialize, Serialize};

use crate::config::ModuleConfig;
use crate::device::{BufferId, CommandStream, ComputeDevice};
use crate::error::{Error, Result};
use crate::params::ParamSpec;
use crate::shape::ImageShape;

pub use layers::LayerStack;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    /// Shape-preserving ReLU, no parameters
    SingleRelu,
    /// One same-padded k x k convolution
    SingleConv,
    /// Same-padded conv, ReLU, then a valid conv down to the output size
    ConvNet,
}

impl NetworkKind {
    pub fn from_id(id: i32) -> Result<Self> {
        match id {
            0 => Ok(NetworkKind::SingleRelu),
            1 => Ok(NetworkKind::SingleConv),
            2 => Ok(NetworkKind::ConvNet),
            _ => Err(Error::UnknownNetwork(id)),
        }
    }

    pub fn id(self) -> i32 {
        match self {
            NetworkKind::SingleRelu => 0,
            NetworkKind::SingleConv => 1,
            NetworkKind::ConvNet => 2,
        }
    }
}

/// Device buffers one pass reads and writes. All are NCHW and hold at
/// least `batch` samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassIo {
    pub batch: usize,
    pub input: BufferId,
    pub output: BufferId,
    pub top_grad: BufferId,
    pub input_grad: BufferId,
}

pub trait Network: Send {
    fn kind(&self) -> NetworkKind;

    fn input_shape(&self) -> ImageShape;

    fn output_shape(&self) -> ImageShape;

    fn parameters(&self) -> &[ParamSpec];

    /// Record the forward pass from `io.input` to `io.output`. Training mode
    /// also keeps a copy of the input for a later backward pass.
    fn encode_forward(&self, stream: &mut CommandStream, io: &PassIo, is_train: bool);

    /// Recompute intermediate activations from the saved training input.
    fn encode_replay(&self, stream: &mut CommandStream, io: &PassIo);

    /// Record the backward pass from `io.top_grad`, writing parameter
    /// gradients and `io.input_grad`. Reads the activations of the most
    /// recent training forward over `io.batch` samples.
    fn encode_backward(&self, stream: &mut CommandStream, io: &PassIo);
}

/// Build the configured network. Returns the network and each parameter's
/// initial values, for the parameter table to upload.
pub fn build(
    config: &ModuleConfig,
    device: &mut dyn ComputeDevice,
) -> Result<(Box<dyn Network>, Vec<(ParamSpec, Vec<f32>)>)> {
    let (stack, initial) = LayerStack::build(config, device)?;
    log::debug!(
        "Built {:?}: {} layers, {} parameter tensors",
        config.network,
        stack.depth(),
        initial.len()
    );
    Ok((Box::new(stack), initial))
}
