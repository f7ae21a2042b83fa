//! Layer stack behind every built-in network.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Network, NetworkKind, PassIo};
use crate::config::ModuleConfig;
use crate::device::{BufferId, CommandStream, ComputeDevice, ConvDims, Kernel};
use crate::error::Result;
use crate::params::{ParamSpec, ParamTag};
use crate::shape::ImageShape;

#[derive(Debug, Clone)]
enum Layer {
    Conv {
        dims: ConvDims,
        weights: BufferId,
        bias: BufferId,
        grad_weights: BufferId,
        grad_bias: BufferId,
    },
    Relu {
        per_sample: usize,
    },
}

pub struct LayerStack {
    kind: NetworkKind,
    layers: Vec<Layer>,
    /// shapes[i] is the input of layer i; the last entry is the output.
    shapes: Vec<ImageShape>,
    /// Output of every layer except the last.
    activations: Vec<BufferId>,
    /// Gradient w.r.t. each entry of `activations`.
    activation_grads: Vec<BufferId>,
    saved_input: BufferId,
    params: Vec<ParamSpec>,
}

/// Kaiming/He uniform initialisation for a conv kernel.
fn kaiming_weights(rng: &mut StdRng, dims: &ConvDims) -> Vec<f32> {
    let fan_in = dims.in_channels * dims.kernel_height * dims.kernel_width;
    let scale = (2.0 / fan_in as f32).sqrt();
    (0..dims.weights_len())
        .map(|_| rng.random_range(-scale..scale))
        .collect()
}

impl LayerStack {
    pub fn build(
        config: &ModuleConfig,
        device: &mut dyn ComputeDevice,
    ) -> Result<(Self, Vec<(ParamSpec, Vec<f32>)>)> {
        config.validate()?;
        let (input, output) = (config.input_shape, config.output_shape);
        let capacity = config.batch_capacity;
        let kernel = config.kernel_size();

        let plan: Vec<(ImageShape, Option<ConvDims>)> = match config.network {
            NetworkKind::SingleRelu => vec![(input, None)],
            NetworkKind::SingleConv => vec![(input, Some(ConvDims::same(input, output.channels, kernel)))],
            NetworkKind::ConvNet => {
                let hidden = input.with_channels(config.hidden_channels());
                vec![
                    (input, Some(ConvDims::same(input, hidden.channels, kernel))),
                    (hidden, None),
                    (hidden, Some(ConvDims::valid(hidden, output))),
                ]
            }
        };

        let seed = config.seed().unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);

        let mut layers = Vec::with_capacity(plan.len());
        let mut shapes = Vec::with_capacity(plan.len() + 1);
        let mut params = Vec::new();
        let mut initial = Vec::new();
        let mut conv_index = 0;

        for (shape, conv) in plan {
            shapes.push(shape);
            match conv {
                Some(dims) => {
                    let weights_name = format!("conv{}_weights", conv_index);
                    let bias_name = format!("conv{}_biases", conv_index);
                    let weights = device.alloc(dims.weights_len(), &weights_name)?;
                    let grad_weights = device.alloc(dims.weights_len(), &format!("{}_grad", weights_name))?;
                    let bias = device.alloc(dims.out_channels, &bias_name)?;
                    let grad_bias = device.alloc(dims.out_channels, &format!("{}_grad", bias_name))?;

                    let weight_spec = ParamSpec {
                        name: weights_name,
                        tag: ParamTag::Weights,
                        shape: dims.weights_shape(),
                        value: weights,
                        grad: grad_weights,
                    };
                    let bias_spec = ParamSpec {
                        name: bias_name,
                        tag: ParamTag::Biases,
                        shape: vec![dims.out_channels],
                        value: bias,
                        grad: grad_bias,
                    };
                    initial.push((weight_spec.clone(), kaiming_weights(&mut rng, &dims)));
                    initial.push((bias_spec.clone(), vec![0.0; dims.out_channels]));
                    params.push(weight_spec);
                    params.push(bias_spec);

                    layers.push(Layer::Conv {
                        dims,
                        weights,
                        bias,
                        grad_weights,
                        grad_bias,
                    });
                    conv_index += 1;
                }
                None => layers.push(Layer::Relu {
                    per_sample: shape.len(),
                }),
            }
        }
        shapes.push(output);

        let mut activations = Vec::new();
        let mut activation_grads = Vec::new();
        for (i, shape) in shapes[1..shapes.len() - 1].iter().enumerate() {
            activations.push(device.alloc(capacity * shape.len(), &format!("layer{}_out", i))?);
            activation_grads.push(device.alloc(capacity * shape.len(), &format!("layer{}_grad", i))?);
        }
        let saved_input = device.alloc(capacity * input.len(), "saved_input")?;

        let stack = LayerStack {
            kind: config.network,
            layers,
            shapes,
            activations,
            activation_grads,
            saved_input,
            params,
        };
        Ok((stack, initial))
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    fn last(&self) -> usize {
        self.layers.len() - 1
    }

    fn encode_layers(&self, stream: &mut CommandStream, src: BufferId, dst: BufferId, batch: usize) {
        for (i, layer) in self.layers.iter().enumerate() {
            let input = if i == 0 { src } else { self.activations[i - 1] };
            let output = if i == self.last() { dst } else { self.activations[i] };
            match *layer {
                Layer::Conv {
                    dims, weights, bias, ..
                } => stream.push(Kernel::Conv2d {
                    input,
                    weights,
                    bias,
                    output,
                    dims: dims.with_batch(batch),
                }),
                Layer::Relu { per_sample } => stream.push(Kernel::Relu {
                    input,
                    output,
                    len: batch * per_sample,
                }),
            }
        }
    }
}

impl Network for LayerStack {
    fn kind(&self) -> NetworkKind {
        self.kind
    }

    fn input_shape(&self) -> ImageShape {
        self.shapes[0]
    }

    fn output_shape(&self) -> ImageShape {
        self.shapes[self.shapes.len() - 1]
    }

    fn parameters(&self) -> &[ParamSpec] {
        &self.params
    }

    fn encode_forward(&self, stream: &mut CommandStream, io: &PassIo, is_train: bool) {
        if is_train {
            stream.push(Kernel::Copy {
                src: io.input,
                dst: self.saved_input,
                len: io.batch * self.input_shape().len(),
            });
        }
        self.encode_layers(stream, io.input, io.output, io.batch);
    }

    fn encode_replay(&self, stream: &mut CommandStream, io: &PassIo) {
        // Single-layer stacks read only the saved input during backward.
        if self.layers.len() > 1 {
            self.encode_layers(stream, self.saved_input, io.output, io.batch);
        }
    }

    fn encode_backward(&self, stream: &mut CommandStream, io: &PassIo) {
        let batch = io.batch;
        for (i, layer) in self.layers.iter().enumerate().rev() {
            let input = if i == 0 { self.saved_input } else { self.activations[i - 1] };
            let grad_output = if i == self.last() {
                io.top_grad
            } else {
                self.activation_grads[i]
            };
            let grad_input = if i == 0 {
                io.input_grad
            } else {
                self.activation_grads[i - 1]
            };

            match *layer {
                Layer::Conv {
                    dims,
                    weights,
                    grad_weights,
                    grad_bias,
                    ..
                } => {
                    let dims = dims.with_batch(batch);
                    stream.push(Kernel::Conv2dBackwardFilter {
                        input,
                        grad_output,
                        grad_weights,
                        grad_bias,
                        dims,
                    });
                    stream.push(Kernel::Conv2dBackwardData {
                        grad_output,
                        weights,
                        grad_input,
                        dims,
                    });
                }
                Layer::Relu { per_sample } => stream.push(Kernel::ReluBackward {
                    input,
                    grad_output,
                    grad_input,
                    len: batch * per_sample,
                }),
            }
        }
    }
}
