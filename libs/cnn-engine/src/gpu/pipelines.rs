//! Compute pipelines and their uniform blocks.
//!
//! Every kernel binds its uniform block at binding 0 and its storage
//! buffers from binding 1 on, in the order the WGSL source declares them.

use bytemuck::{Pod, Zeroable};

use crate::device::{ConvDims, LossDims, StepParams, StepRule};

pub(super) const WORKGROUP_SIZE: u32 = 64;
/// Workgroups per dispatch row; larger jobs spill into the y dimension.
pub(super) const MAX_GROUPS_X: u32 = 65535;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(super) struct ConvUniform {
    batch: u32,
    in_c: u32,
    in_h: u32,
    in_w: u32,
    out_c: u32,
    out_h: u32,
    out_w: u32,
    k_h: u32,
    k_w: u32,
    pad_h: u32,
    pad_w: u32,
    total: u32,
}

impl ConvUniform {
    pub(super) fn new(d: &ConvDims, total: usize) -> Self {
        ConvUniform {
            batch: d.batch as u32,
            in_c: d.in_channels as u32,
            in_h: d.in_height as u32,
            in_w: d.in_width as u32,
            out_c: d.out_channels as u32,
            out_h: d.out_height as u32,
            out_w: d.out_width as u32,
            k_h: d.kernel_height as u32,
            k_w: d.kernel_width as u32,
            pad_h: d.pad_height as u32,
            pad_w: d.pad_width as u32,
            total: total as u32,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(super) struct ElementUniform {
    len: u32,
    _pad: [u32; 3],
}

impl ElementUniform {
    pub(super) fn new(len: usize) -> Self {
        ElementUniform {
            len: len as u32,
            _pad: [0; 3],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(super) struct LossUniform {
    batch: u32,
    classes: u32,
    positions: u32,
    _pad: u32,
}

impl LossUniform {
    pub(super) fn new(d: &LossDims) -> Self {
        LossUniform {
            batch: d.batch as u32,
            classes: d.classes as u32,
            positions: d.positions as u32,
            _pad: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(super) struct UpdateUniform {
    len: u32,
    rule: u32,
    step: u32,
    _pad0: u32,
    learning_rate: f32,
    momentum: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    clip: f32,
    _pad1: [f32; 2],
}

impl UpdateUniform {
    pub(super) fn new(len: usize, p: &StepParams) -> Self {
        let (rule, momentum, beta2, epsilon) = match p.rule {
            StepRule::Sgd => (0, 0.0, 0.0, 0.0),
            StepRule::Momentum { momentum } => (1, momentum, 0.0, 0.0),
            StepRule::Adam {
                beta1,
                beta2,
                epsilon,
            } => (2, beta1, beta2, epsilon),
        };
        UpdateUniform {
            len: len as u32,
            rule,
            step: p.step,
            _pad0: 0,
            learning_rate: p.learning_rate,
            momentum,
            beta2,
            epsilon,
            weight_decay: p.weight_decay,
            clip: p.clip,
            _pad1: [0.0; 2],
        }
    }
}

/// A compiled kernel and the layout its bind groups must follow.
pub(super) struct KernelPipeline {
    pub pipeline: wgpu::ComputePipeline,
    pub layout: wgpu::BindGroupLayout,
}

pub(super) struct Pipelines {
    pub conv_forward: KernelPipeline,
    pub conv_backward_data: KernelPipeline,
    pub conv_backward_filter: KernelPipeline,
    pub relu: KernelPipeline,
    pub relu_backward: KernelPipeline,
    pub softmax_loss: KernelPipeline,
    pub update_params: KernelPipeline,
}

impl Pipelines {
    pub(super) fn new(device: &wgpu::Device) -> Self {
        Pipelines {
            // input, weights, bias -> output
            conv_forward: create_pipeline(
                device,
                "conv_forward",
                include_str!("shaders/conv_forward.wgsl"),
                &[true, true, true, false],
            ),
            // grad_output, weights -> grad_input
            conv_backward_data: create_pipeline(
                device,
                "conv_backward_data",
                include_str!("shaders/conv_backward_data.wgsl"),
                &[true, true, false],
            ),
            // input, grad_output -> grad_weights, grad_bias
            conv_backward_filter: create_pipeline(
                device,
                "conv_backward_filter",
                include_str!("shaders/conv_backward_filter.wgsl"),
                &[true, true, false, false],
            ),
            relu: create_pipeline(device, "relu", include_str!("shaders/relu.wgsl"), &[true, false]),
            relu_backward: create_pipeline(
                device,
                "relu_backward",
                include_str!("shaders/relu_backward.wgsl"),
                &[true, true, false],
            ),
            // logits, labels, weights -> grad, loss
            softmax_loss: create_pipeline(
                device,
                "softmax_loss",
                include_str!("shaders/softmax_loss.wgsl"),
                &[true, true, true, false, false],
            ),
            // param (in place), grad, first moment, second moment
            update_params: create_pipeline(
                device,
                "update_params",
                include_str!("shaders/update_params.wgsl"),
                &[false, true, false, false],
            ),
        }
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// `storage` lists each storage binding's read-only flag, starting at binding 1.
fn create_pipeline(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    storage: &[bool],
) -> KernelPipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });

    let mut entries = vec![uniform_entry(0)];
    for (i, &read_only) in storage.iter().enumerate() {
        entries.push(storage_entry(i as u32 + 1, read_only));
    }
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &entries,
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });

    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    });

    KernelPipeline { pipeline, layout }
}

/// Workgroup counts covering `invocations` threads.
pub(super) fn dispatch_size(invocations: usize) -> (u32, u32) {
    let groups = (invocations as u32).div_ceil(WORKGROUP_SIZE).max(1);
    if groups <= MAX_GROUPS_X {
        (groups, 1)
    } else {
        (MAX_GROUPS_X, groups.div_ceil(MAX_GROUPS_X))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_sizes_are_16_byte_aligned() {
        assert_eq!(std::mem::size_of::<ConvUniform>() % 16, 0);
        assert_eq!(std::mem::size_of::<ElementUniform>(), 16);
        assert_eq!(std::mem::size_of::<LossUniform>(), 16);
        assert_eq!(std::mem::size_of::<UpdateUniform>(), 48);
    }

    #[test]
    fn test_dispatch_size_spills_into_y() {
        assert_eq!(dispatch_size(1), (1, 1));
        assert_eq!(dispatch_size(64), (1, 1));
        assert_eq!(dispatch_size(65), (2, 1));
        let big = (MAX_GROUPS_X as usize + 1) * WORKGROUP_SIZE as usize;
        assert_eq!(dispatch_size(big), (MAX_GROUPS_X, 2));
    }
}
