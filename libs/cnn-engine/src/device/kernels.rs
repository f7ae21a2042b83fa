//! Kernel descriptions recorded into command streams, plus the reference
//! math the host device executes.
//!
//! Device tensors are planar (NCHW): sample, then channel plane, then rows.
//! Convolution weights are `[out_channels, in_channels, kernel_h, kernel_w]`.
//! Every kernel covers a prefix of its buffers sized by its dims, so one
//! capacity-sized buffer serves any per-call batch size.

use crate::shape::ImageShape;

use super::BufferId;

/// Smallest probability fed to the log in the cross-entropy loss.
pub const MIN_PROBABILITY: f32 = 1e-7;

/// Geometry of a stride-1 2D convolution over a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvDims {
    pub batch: usize,
    pub in_channels: usize,
    pub in_height: usize,
    pub in_width: usize,
    pub out_channels: usize,
    pub out_height: usize,
    pub out_width: usize,
    pub kernel_height: usize,
    pub kernel_width: usize,
    pub pad_height: usize,
    pub pad_width: usize,
}

impl ConvDims {
    /// Square odd kernel with zero padding that preserves height and width.
    pub fn same(input: ImageShape, out_channels: usize, kernel: usize) -> Self {
        ConvDims {
            batch: 0,
            in_channels: input.channels,
            in_height: input.height,
            in_width: input.width,
            out_channels,
            out_height: input.height,
            out_width: input.width,
            kernel_height: kernel,
            kernel_width: kernel,
            pad_height: kernel / 2,
            pad_width: kernel / 2,
        }
    }

    /// Unpadded kernel sized so the output has exactly `output`'s extent.
    pub fn valid(input: ImageShape, output: ImageShape) -> Self {
        ConvDims {
            batch: 0,
            in_channels: input.channels,
            in_height: input.height,
            in_width: input.width,
            out_channels: output.channels,
            out_height: output.height,
            out_width: output.width,
            kernel_height: input.height + 1 - output.height,
            kernel_width: input.width + 1 - output.width,
            pad_height: 0,
            pad_width: 0,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    pub fn input_len(&self) -> usize {
        self.batch * self.in_channels * self.in_height * self.in_width
    }

    pub fn output_len(&self) -> usize {
        self.batch * self.out_channels * self.out_height * self.out_width
    }

    pub fn weights_len(&self) -> usize {
        self.out_channels * self.in_channels * self.kernel_height * self.kernel_width
    }

    pub fn weights_shape(&self) -> Vec<usize> {
        vec![
            self.out_channels,
            self.in_channels,
            self.kernel_height,
            self.kernel_width,
        ]
    }

    #[inline]
    fn input_index(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        ((n * self.in_channels + c) * self.in_height + y) * self.in_width + x
    }

    #[inline]
    fn output_index(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        ((n * self.out_channels + c) * self.out_height + y) * self.out_width + x
    }

    #[inline]
    fn weight_index(&self, oc: usize, ic: usize, ky: usize, kx: usize) -> usize {
        ((oc * self.in_channels + ic) * self.kernel_height + ky) * self.kernel_width + kx
    }

    /// Input coordinate read by output `(y, x)` at kernel tap `(ky, kx)`.
    #[inline]
    fn source(&self, y: usize, x: usize, ky: usize, kx: usize) -> Option<(usize, usize)> {
        let iy = (y + ky).checked_sub(self.pad_height)?;
        let ix = (x + kx).checked_sub(self.pad_width)?;
        (iy < self.in_height && ix < self.in_width).then_some((iy, ix))
    }
}

/// Geometry of the per-position softmax cross-entropy loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossDims {
    pub batch: usize,
    pub classes: usize,
    /// Spatial positions per sample.
    pub positions: usize,
}

impl LossDims {
    pub fn logits_len(&self) -> usize {
        self.batch * self.classes * self.positions
    }

    pub fn positions_len(&self) -> usize {
        self.batch * self.positions
    }
}

/// Parameter update rule applied by [`Kernel::UpdateParams`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepRule {
    Sgd,
    Momentum { momentum: f32 },
    Adam { beta1: f32, beta2: f32, epsilon: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepParams {
    pub rule: StepRule,
    pub learning_rate: f32,
    pub weight_decay: f32,
    /// Element-wise gradient clipping bound; `0.0` disables clipping.
    pub clip: f32,
    /// 1-based step count, used by Adam's bias correction.
    pub step: u32,
}

/// One unit of device work.
#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    Zero {
        dst: BufferId,
        len: usize,
    },
    Copy {
        src: BufferId,
        dst: BufferId,
        len: usize,
    },
    Conv2d {
        input: BufferId,
        weights: BufferId,
        bias: BufferId,
        output: BufferId,
        dims: ConvDims,
    },
    Conv2dBackwardData {
        grad_output: BufferId,
        weights: BufferId,
        grad_input: BufferId,
        dims: ConvDims,
    },
    /// Writes both the weight and the bias gradient (overwrites, no accumulation).
    Conv2dBackwardFilter {
        input: BufferId,
        grad_output: BufferId,
        grad_weights: BufferId,
        grad_bias: BufferId,
        dims: ConvDims,
    },
    Relu {
        input: BufferId,
        output: BufferId,
        len: usize,
    },
    ReluBackward {
        input: BufferId,
        grad_output: BufferId,
        grad_input: BufferId,
        len: usize,
    },
    /// Softmax over the channel axis at every position, weighted
    /// cross-entropy into `loss`, gradient (scaled by `1 / batch`) into `grad`.
    SoftmaxCrossEntropy {
        logits: BufferId,
        labels: BufferId,
        weights: BufferId,
        grad: BufferId,
        loss: BufferId,
        dims: LossDims,
    },
    UpdateParams {
        param: BufferId,
        grad: BufferId,
        first_moment: BufferId,
        second_moment: BufferId,
        len: usize,
        params: StepParams,
    },
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Zero { .. } => "zero",
            Kernel::Copy { .. } => "copy",
            Kernel::Conv2d { .. } => "conv2d",
            Kernel::Conv2dBackwardData { .. } => "conv2d_backward_data",
            Kernel::Conv2dBackwardFilter { .. } => "conv2d_backward_filter",
            Kernel::Relu { .. } => "relu",
            Kernel::ReluBackward { .. } => "relu_backward",
            Kernel::SoftmaxCrossEntropy { .. } => "softmax_cross_entropy",
            Kernel::UpdateParams { .. } => "update_params",
        }
    }

    /// Every buffer the kernel touches, with the element count it needs.
    pub fn buffers(&self) -> Vec<(BufferId, usize)> {
        match *self {
            Kernel::Zero { dst, len } => vec![(dst, len)],
            Kernel::Copy { src, dst, len } => vec![(src, len), (dst, len)],
            Kernel::Conv2d {
                input,
                weights,
                bias,
                output,
                dims,
            } => vec![
                (input, dims.input_len()),
                (weights, dims.weights_len()),
                (bias, dims.out_channels),
                (output, dims.output_len()),
            ],
            Kernel::Conv2dBackwardData {
                grad_output,
                weights,
                grad_input,
                dims,
            } => vec![
                (grad_output, dims.output_len()),
                (weights, dims.weights_len()),
                (grad_input, dims.input_len()),
            ],
            Kernel::Conv2dBackwardFilter {
                input,
                grad_output,
                grad_weights,
                grad_bias,
                dims,
            } => vec![
                (input, dims.input_len()),
                (grad_output, dims.output_len()),
                (grad_weights, dims.weights_len()),
                (grad_bias, dims.out_channels),
            ],
            Kernel::Relu { input, output, len } => vec![(input, len), (output, len)],
            Kernel::ReluBackward {
                input,
                grad_output,
                grad_input,
                len,
            } => vec![(input, len), (grad_output, len), (grad_input, len)],
            Kernel::SoftmaxCrossEntropy {
                logits,
                labels,
                weights,
                grad,
                loss,
                dims,
            } => vec![
                (logits, dims.logits_len()),
                (labels, dims.positions_len()),
                (weights, dims.positions_len()),
                (grad, dims.logits_len()),
                (loss, dims.positions_len()),
            ],
            Kernel::UpdateParams {
                param,
                grad,
                first_moment,
                second_moment,
                len,
                ..
            } => vec![
                (param, len),
                (grad, len),
                (first_moment, len),
                (second_moment, len),
            ],
        }
    }
}

// Reference implementations. The host device runs these directly and the
// GPU tests compare the WGSL kernels against them.

pub fn conv2d_forward(input: &[f32], weights: &[f32], bias: &[f32], output: &mut [f32], d: &ConvDims) {
    for n in 0..d.batch {
        for oc in 0..d.out_channels {
            for y in 0..d.out_height {
                for x in 0..d.out_width {
                    let mut acc = bias[oc];
                    for ic in 0..d.in_channels {
                        for ky in 0..d.kernel_height {
                            for kx in 0..d.kernel_width {
                                if let Some((iy, ix)) = d.source(y, x, ky, kx) {
                                    acc += input[d.input_index(n, ic, iy, ix)]
                                        * weights[d.weight_index(oc, ic, ky, kx)];
                                }
                            }
                        }
                    }
                    output[d.output_index(n, oc, y, x)] = acc;
                }
            }
        }
    }
}

pub fn conv2d_backward_data(grad_output: &[f32], weights: &[f32], grad_input: &mut [f32], d: &ConvDims) {
    grad_input[..d.input_len()].fill(0.0);
    for n in 0..d.batch {
        for oc in 0..d.out_channels {
            for y in 0..d.out_height {
                for x in 0..d.out_width {
                    let g = grad_output[d.output_index(n, oc, y, x)];
                    for ic in 0..d.in_channels {
                        for ky in 0..d.kernel_height {
                            for kx in 0..d.kernel_width {
                                if let Some((iy, ix)) = d.source(y, x, ky, kx) {
                                    grad_input[d.input_index(n, ic, iy, ix)] +=
                                        g * weights[d.weight_index(oc, ic, ky, kx)];
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

pub fn conv2d_backward_filter(
    input: &[f32],
    grad_output: &[f32],
    grad_weights: &mut [f32],
    grad_bias: &mut [f32],
    d: &ConvDims,
) {
    grad_weights[..d.weights_len()].fill(0.0);
    grad_bias[..d.out_channels].fill(0.0);
    for n in 0..d.batch {
        for oc in 0..d.out_channels {
            for y in 0..d.out_height {
                for x in 0..d.out_width {
                    let g = grad_output[d.output_index(n, oc, y, x)];
                    grad_bias[oc] += g;
                    for ic in 0..d.in_channels {
                        for ky in 0..d.kernel_height {
                            for kx in 0..d.kernel_width {
                                if let Some((iy, ix)) = d.source(y, x, ky, kx) {
                                    grad_weights[d.weight_index(oc, ic, ky, kx)] +=
                                        g * input[d.input_index(n, ic, iy, ix)];
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

pub fn relu(input: &[f32], output: &mut [f32]) {
    for (o, &i) in output.iter_mut().zip(input) {
        *o = i.max(0.0);
    }
}

pub fn relu_backward(input: &[f32], grad_output: &[f32], grad_input: &mut [f32]) {
    for ((gi, &g), &x) in grad_input.iter_mut().zip(grad_output).zip(input) {
        *gi = if x > 0.0 { g } else { 0.0 };
    }
}

pub fn softmax_cross_entropy(
    logits: &[f32],
    labels: &[f32],
    weights: &[f32],
    grad: &mut [f32],
    loss: &mut [f32],
    d: &LossDims,
) {
    let scale = 1.0 / d.batch.max(1) as f32;
    let at = |n: usize, c: usize, s: usize| (n * d.classes + c) * d.positions + s;

    for n in 0..d.batch {
        for s in 0..d.positions {
            let p = n * d.positions + s;
            let label = (labels[p].max(0.0) as usize).min(d.classes - 1);
            let weight = weights[p];

            let mut max = f32::NEG_INFINITY;
            for c in 0..d.classes {
                max = max.max(logits[at(n, c, s)]);
            }
            let mut sum = 0.0;
            for c in 0..d.classes {
                sum += (logits[at(n, c, s)] - max).exp();
            }

            for c in 0..d.classes {
                let prob = (logits[at(n, c, s)] - max).exp() / sum;
                let target = if c == label { 1.0 } else { 0.0 };
                grad[at(n, c, s)] = weight * (prob - target) * scale;
                if c == label {
                    loss[p] = -weight * prob.max(MIN_PROBABILITY).ln();
                }
            }
        }
    }
}

pub fn update_params(param: &mut [f32], grad: &[f32], m: &mut [f32], v: &mut [f32], p: &StepParams) {
    let step = p.step.max(1) as i32;
    for i in 0..param.len() {
        let mut g = grad[i];
        if p.clip > 0.0 {
            g = g.clamp(-p.clip, p.clip);
        }
        if p.weight_decay > 0.0 {
            g += p.weight_decay * param[i];
        }

        match p.rule {
            StepRule::Sgd => {
                param[i] -= p.learning_rate * g;
            }
            StepRule::Momentum { momentum } => {
                m[i] = momentum * m[i] + g;
                param[i] -= p.learning_rate * m[i];
            }
            StepRule::Adam {
                beta1,
                beta2,
                epsilon,
            } => {
                m[i] = beta1 * m[i] + (1.0 - beta1) * g;
                v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
                let m_hat = m[i] / (1.0 - beta1.powi(step));
                let v_hat = v[i] / (1.0 - beta2.powi(step));
                param[i] -= p.learning_rate * m_hat / (v_hat.sqrt() + epsilon);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: &[f32], b: &[f32], eps: f32) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < eps)
    }

    #[test]
    fn test_conv_same_identity_kernel() {
        // 3x3 kernel with a single 1 in the centre copies the input.
        let dims = ConvDims::same(ImageShape::new(2, 3, 1), 1, 3).with_batch(1);
        let input = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut weights = vec![0.0; 9];
        weights[4] = 1.0;
        let mut output = vec![0.0; 6];

        conv2d_forward(&input, &weights, &[0.5], &mut output, &dims);
        assert!(approx_eq(&output, &[1.5, 2.5, 3.5, 4.5, 5.5, 6.5], 1e-6));
    }

    #[test]
    fn test_conv_valid_is_dense_layer() {
        // Kernel covering the whole 2x2 input collapses to a 1x1 output.
        let dims = ConvDims::valid(ImageShape::new(2, 2, 1), ImageShape::new(1, 1, 2)).with_batch(1);
        assert_eq!(dims.kernel_height, 2);
        assert_eq!(dims.weights_len(), 8);

        let input = [1.0, 2.0, 3.0, 4.0];
        let weights = [1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, -1.0];
        let mut output = vec![0.0; 2];
        conv2d_forward(&input, &weights, &[0.0, 1.0], &mut output, &dims);
        assert!(approx_eq(&output, &[10.0, -2.0], 1e-6));
    }

    #[test]
    fn test_conv_backward_matches_finite_difference() {
        let dims = ConvDims::same(ImageShape::new(3, 3, 2), 2, 3).with_batch(1);
        let input: Vec<f32> = (0..dims.input_len()).map(|i| (i as f32 * 0.37).sin()).collect();
        let weights: Vec<f32> = (0..dims.weights_len()).map(|i| (i as f32 * 0.11).cos() * 0.5).collect();
        let bias = vec![0.1, -0.2];
        // Loss = sum(output), so grad_output is all ones.
        let grad_output = vec![1.0; dims.output_len()];

        let mut grad_input = vec![0.0; dims.input_len()];
        conv2d_backward_data(&grad_output, &weights, &mut grad_input, &dims);
        let mut grad_weights = vec![0.0; dims.weights_len()];
        let mut grad_bias = vec![0.0; 2];
        conv2d_backward_filter(&input, &grad_output, &mut grad_weights, &mut grad_bias, &dims);

        let total = |input: &[f32], weights: &[f32]| {
            let mut out = vec![0.0; dims.output_len()];
            conv2d_forward(input, weights, &bias, &mut out, &dims);
            out.iter().sum::<f32>()
        };

        let h = 1e-2;
        for i in [0, 5, 11, 17] {
            let mut plus = input.clone();
            plus[i] += h;
            let mut minus = input.clone();
            minus[i] -= h;
            let numeric = (total(&plus, &weights) - total(&minus, &weights)) / (2.0 * h);
            assert!((numeric - grad_input[i]).abs() < 1e-2, "input {i}: {numeric} vs {}", grad_input[i]);
        }
        for i in [0, 9, 20, 35] {
            let mut plus = weights.clone();
            plus[i] += h;
            let mut minus = weights.clone();
            minus[i] -= h;
            let numeric = (total(&input, &plus) - total(&input, &minus)) / (2.0 * h);
            assert!((numeric - grad_weights[i]).abs() < 1e-2, "weight {i}: {numeric} vs {}", grad_weights[i]);
        }
        // Each bias feeds all 9 output positions.
        assert!(approx_eq(&grad_bias, &[9.0, 9.0], 1e-5));
    }

    #[test]
    fn test_relu_and_backward() {
        let input = [-1.0, 0.0, 2.0];
        let mut output = [9.0; 3];
        relu(&input, &mut output);
        assert_eq!(output, [0.0, 0.0, 2.0]);

        let mut grad_input = [9.0; 3];
        relu_backward(&input, &[5.0, 5.0, 5.0], &mut grad_input);
        assert_eq!(grad_input, [0.0, 0.0, 5.0]);
    }

    #[test]
    fn test_softmax_cross_entropy_uniform_logits() {
        let dims = LossDims { batch: 2, classes: 4, positions: 1 };
        let logits = vec![0.0; 8];
        let labels = [1.0, 3.0];
        let weights = [1.0, 0.5];
        let mut grad = vec![0.0; 8];
        let mut loss = vec![0.0; 2];

        softmax_cross_entropy(&logits, &labels, &weights, &mut grad, &mut loss, &dims);

        let ln4 = 4.0f32.ln();
        assert!(approx_eq(&loss, &[ln4, 0.5 * ln4], 1e-5));
        // Sample 0: (0.25 - onehot) / 2
        assert!(approx_eq(&grad[..4], &[0.125, -0.375, 0.125, 0.125], 1e-6));
        // Sample 1 carries weight 0.5.
        assert!(approx_eq(&grad[4..], &[0.0625, 0.0625, 0.0625, -0.1875], 1e-6));
    }

    #[test]
    fn test_softmax_cross_entropy_spatial_positions() {
        // One sample, 2 classes, 2 positions: logits planar [c][s].
        let dims = LossDims { batch: 1, classes: 2, positions: 2 };
        let logits = [10.0, -10.0, -10.0, 10.0];
        let labels = [0.0, 1.0];
        let mut grad = vec![0.0; 4];
        let mut loss = vec![0.0; 2];
        softmax_cross_entropy(&logits, &labels, &[1.0, 1.0], &mut grad, &mut loss, &dims);
        assert!(loss.iter().all(|&l| l < 1e-6));
    }

    #[test]
    fn test_update_rules() {
        let sgd = StepParams {
            rule: StepRule::Sgd,
            learning_rate: 0.1,
            weight_decay: 0.0,
            clip: 0.0,
            step: 1,
        };
        let mut param = vec![1.0, 2.0];
        let (mut m, mut v) = (vec![0.0; 2], vec![0.0; 2]);
        update_params(&mut param, &[1.0, -2.0], &mut m, &mut v, &sgd);
        assert!(approx_eq(&param, &[0.9, 2.2], 1e-6));

        let momentum = StepParams {
            rule: StepRule::Momentum { momentum: 0.5 },
            ..sgd
        };
        let mut param = vec![0.0];
        let mut m = vec![0.0];
        update_params(&mut param, &[1.0], &mut m, &mut [0.0], &momentum);
        update_params(&mut param, &[1.0], &mut m, &mut [0.0], &momentum);
        // m: 1.0 then 1.5; param: -0.1 then -0.25
        assert!(approx_eq(&param, &[-0.25], 1e-6));

        // First Adam step moves each weight by ~lr regardless of gradient scale.
        let adam = StepParams {
            rule: StepRule::Adam { beta1: 0.9, beta2: 0.999, epsilon: 1e-8 },
            learning_rate: 0.01,
            ..sgd
        };
        let mut param = vec![0.0, 0.0];
        let (mut m, mut v) = (vec![0.0; 2], vec![0.0; 2]);
        update_params(&mut param, &[100.0, -0.001], &mut m, &mut v, &adam);
        assert!(approx_eq(&param, &[-0.01, 0.01], 1e-4));
    }

    #[test]
    fn test_update_clipping_and_weight_decay() {
        let params = StepParams {
            rule: StepRule::Sgd,
            learning_rate: 1.0,
            weight_decay: 0.5,
            clip: 1.0,
            step: 1,
        };
        let mut param = vec![2.0];
        update_params(&mut param, &[10.0], &mut [0.0], &mut [0.0], &params);
        // clipped grad 1.0 + decay 0.5 * 2.0 = 2.0
        assert!(approx_eq(&param, &[0.0], 1e-6));
    }

    #[test]
    fn test_kernel_buffer_requirements() {
        let dims = ConvDims::same(ImageShape::new(4, 4, 3), 8, 3).with_batch(2);
        let kernel = Kernel::Conv2d {
            input: BufferId(0),
            weights: BufferId(1),
            bias: BufferId(2),
            output: BufferId(3),
            dims,
        };
        assert_eq!(kernel.name(), "conv2d");
        assert_eq!(
            kernel.buffers(),
            vec![
                (BufferId(0), 96),
                (BufferId(1), 216),
                (BufferId(2), 8),
                (BufferId(3), 256)
            ]
        );
    }
}
