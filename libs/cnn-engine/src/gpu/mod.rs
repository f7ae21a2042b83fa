//! wgpu-backed compute device.
//!
//! Buffers live in GPU storage memory. A buffer that has ever been listed as
//! a readback gets a mappable staging mirror; the readback copy is encoded at
//! the end of the stream that requested it.

mod pipelines;

use std::collections::BTreeMap;
use std::sync::mpsc;

use wgpu::util::DeviceExt;

use crate::device::{BufferId, CommandStream, ComputeDevice, Kernel, Submission};
use crate::error::{Error, Result};
use pipelines::{
    dispatch_size, ConvUniform, ElementUniform, KernelPipeline, LossUniform, Pipelines,
    UpdateUniform,
};

const F32_BYTES: u64 = std::mem::size_of::<f32>() as u64;

struct GpuBuffer {
    storage: wgpu::Buffer,
    staging: Option<wgpu::Buffer>,
    /// Submission whose readback copy last filled `staging`.
    copied_in: Option<wgpu::SubmissionIndex>,
    len: usize,
}

pub struct GpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    name: String,
    pipelines: Pipelines,
    buffers: Vec<GpuBuffer>,
    /// Queue indices of submissions not yet waited on.
    in_flight: BTreeMap<u64, wgpu::SubmissionIndex>,
    submitted: u64,
}

impl GpuDevice {
    /// Open the default adapter and compile every kernel.
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| Error::device("no suitable GPU adapter found"))?;

        let info = adapter.get_info();
        log::info!("Using GPU adapter: {} ({:?})", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("cnn-engine"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| Error::device(format!("failed to create GPU device: {}", e)))?;

        let pipelines = Pipelines::new(&device);

        Ok(GpuDevice {
            device,
            queue,
            name: info.name,
            pipelines,
            buffers: Vec::new(),
            in_flight: BTreeMap::new(),
            submitted: 0,
        })
    }

    fn buffer(&self, id: BufferId) -> Result<&GpuBuffer> {
        self.buffers
            .get(id.index())
            .ok_or_else(|| Error::device(format!("unknown buffer {}", id)))
    }

    fn storage(&self, id: BufferId) -> &wgpu::Buffer {
        // Streams are validated before encoding, so every id is in range.
        &self.buffers[id.index()].storage
    }

    fn ensure_staging(&mut self, id: BufferId) {
        let device = &self.device;
        let buffer = &mut self.buffers[id.index()];
        if buffer.staging.is_none() {
            buffer.staging = Some(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("readback staging"),
                size: buffer.len as u64 * F32_BYTES,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
        }
    }

    fn encode_kernel(&self, encoder: &mut wgpu::CommandEncoder, kernel: &Kernel) {
        match *kernel {
            Kernel::Zero { dst, len } => {
                encoder.clear_buffer(self.storage(dst), 0, Some(len as u64 * F32_BYTES));
            }
            Kernel::Copy { src, dst, len } => {
                encoder.copy_buffer_to_buffer(
                    self.storage(src),
                    0,
                    self.storage(dst),
                    0,
                    len as u64 * F32_BYTES,
                );
            }
            Kernel::Conv2d {
                input,
                weights,
                bias,
                output,
                dims,
            } => {
                let total = dims.output_len();
                self.dispatch(
                    encoder,
                    &self.pipelines.conv_forward,
                    bytemuck::bytes_of(&ConvUniform::new(&dims, total)),
                    &[input, weights, bias, output],
                    total,
                );
            }
            Kernel::Conv2dBackwardData {
                grad_output,
                weights,
                grad_input,
                dims,
            } => {
                let total = dims.input_len();
                self.dispatch(
                    encoder,
                    &self.pipelines.conv_backward_data,
                    bytemuck::bytes_of(&ConvUniform::new(&dims, total)),
                    &[grad_output, weights, grad_input],
                    total,
                );
            }
            Kernel::Conv2dBackwardFilter {
                input,
                grad_output,
                grad_weights,
                grad_bias,
                dims,
            } => {
                let total = dims.weights_len() + dims.out_channels;
                self.dispatch(
                    encoder,
                    &self.pipelines.conv_backward_filter,
                    bytemuck::bytes_of(&ConvUniform::new(&dims, total)),
                    &[input, grad_output, grad_weights, grad_bias],
                    total,
                );
            }
            Kernel::Relu { input, output, len } => {
                self.dispatch(
                    encoder,
                    &self.pipelines.relu,
                    bytemuck::bytes_of(&ElementUniform::new(len)),
                    &[input, output],
                    len,
                );
            }
            Kernel::ReluBackward {
                input,
                grad_output,
                grad_input,
                len,
            } => {
                self.dispatch(
                    encoder,
                    &self.pipelines.relu_backward,
                    bytemuck::bytes_of(&ElementUniform::new(len)),
                    &[input, grad_output, grad_input],
                    len,
                );
            }
            Kernel::SoftmaxCrossEntropy {
                logits,
                labels,
                weights,
                grad,
                loss,
                dims,
            } => {
                self.dispatch(
                    encoder,
                    &self.pipelines.softmax_loss,
                    bytemuck::bytes_of(&LossUniform::new(&dims)),
                    &[logits, labels, weights, grad, loss],
                    dims.positions_len(),
                );
            }
            Kernel::UpdateParams {
                param,
                grad,
                first_moment,
                second_moment,
                len,
                params,
            } => {
                self.dispatch(
                    encoder,
                    &self.pipelines.update_params,
                    bytemuck::bytes_of(&UpdateUniform::new(len, &params)),
                    &[param, grad, first_moment, second_moment],
                    len,
                );
            }
        }
    }

    fn dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        kernel: &KernelPipeline,
        uniform: &[u8],
        storage: &[BufferId],
        invocations: usize,
    ) {
        if invocations == 0 {
            return;
        }

        let uniform = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("kernel uniform"),
                contents: uniform,
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniform.as_entire_binding(),
        }];
        for (i, &id) in storage.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: self.storage(id).as_entire_binding(),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &kernel.layout,
            entries: &entries,
        });

        let (x, y) = dispatch_size(invocations);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernel.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
    }
}

/// A storage buffer may not be bound twice in one dispatch.
fn check_distinct(kernel: &Kernel) -> Result<()> {
    let touched = kernel.buffers();
    for (i, (a, _)) in touched.iter().enumerate() {
        if touched[i + 1..].iter().any(|(b, _)| a == b) {
            return Err(Error::device(format!(
                "{} binds buffer {} twice; GPU kernels need distinct buffers",
                kernel.name(),
                a
            )));
        }
    }
    Ok(())
}

impl ComputeDevice for GpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn alloc(&mut self, len: usize, label: &str) -> Result<BufferId> {
        let index = u32::try_from(self.buffers.len())
            .map_err(|_| Error::device("GPU buffer arena is full"))?;
        let len = len.max(1);
        // wgpu zero-initialises new buffers.
        let storage = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: len as u64 * F32_BYTES,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.buffers.push(GpuBuffer {
            storage,
            staging: None,
            copied_in: None,
            len,
        });
        log::trace!("gpu alloc {} '{}' ({} floats)", index, label, len);
        Ok(BufferId(index))
    }

    fn buffer_len(&self, buffer: BufferId) -> Option<usize> {
        self.buffers.get(buffer.index()).map(|b| b.len)
    }

    fn submit(&mut self, stream: CommandStream) -> Result<Submission> {
        stream.validate(|id| self.buffer_len(id))?;
        for kernel in stream.kernels() {
            check_distinct(kernel)?;
        }
        for &id in stream.readbacks() {
            self.ensure_staging(id);
        }

        // Queue writes land before the next submitted command buffer.
        for upload in stream.uploads() {
            if upload.data.is_empty() {
                continue;
            }
            self.queue.write_buffer(
                self.storage(upload.dst),
                upload.offset as u64 * F32_BYTES,
                bytemuck::cast_slice(&upload.data),
            );
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(stream.label()),
            });
        for kernel in stream.kernels() {
            self.encode_kernel(&mut encoder, kernel);
        }
        for &id in stream.readbacks() {
            let buffer = &self.buffers[id.index()];
            if let Some(staging) = &buffer.staging {
                encoder.copy_buffer_to_buffer(
                    &buffer.storage,
                    0,
                    staging,
                    0,
                    buffer.len as u64 * F32_BYTES,
                );
            }
        }

        let index = self.queue.submit(Some(encoder.finish()));
        for &id in stream.readbacks() {
            self.buffers[id.index()].copied_in = Some(index.clone());
        }
        self.submitted += 1;
        self.in_flight.insert(self.submitted, index);
        log::trace!(
            "gpu submit {} '{}': {} kernels",
            self.submitted,
            stream.label(),
            stream.kernels().len()
        );
        Ok(Submission(self.submitted))
    }

    fn wait(&mut self, submission: Submission) -> Result<()> {
        if submission.0 > self.submitted {
            return Err(Error::device(format!(
                "submission {} was never issued",
                submission.0
            )));
        }
        let Some(index) = self.in_flight.get(&submission.0).cloned() else {
            // Already covered by an earlier wait.
            return Ok(());
        };
        self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        self.in_flight = self.in_flight.split_off(&(submission.0 + 1));
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device.poll(wgpu::Maintain::Wait);
        self.in_flight.clear();
        Ok(())
    }

    fn read(&mut self, buffer: BufferId, out: &mut [f32]) -> Result<()> {
        let entry = self.buffer(buffer)?;
        if out.len() > entry.len {
            return Err(Error::device(format!(
                "read of {} elements from buffer {} of {}",
                out.len(),
                buffer,
                entry.len
            )));
        }
        let (Some(staging), Some(copied_in)) = (&entry.staging, &entry.copied_in) else {
            return Err(Error::device(format!(
                "buffer {} was never requested for readback",
                buffer
            )));
        };
        // Only the submission that filled the staging buffer has to finish;
        // later streams keep running.
        let maintain = wgpu::Maintain::WaitForSubmissionIndex(copied_in.clone());

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(maintain);
        receiver
            .recv()
            .map_err(|_| Error::device("readback callback was dropped"))?
            .map_err(|e| Error::device(format!("failed to map readback buffer: {}", e)))?;

        {
            let data = slice.get_mapped_range();
            let values: &[f32] = bytemuck::cast_slice(&data);
            out.copy_from_slice(&values[..out.len()]);
        }
        staging.unmap();
        Ok(())
    }

    fn allocated_bytes(&self) -> usize {
        self.buffers.iter().map(|b| b.len * F32_BYTES as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ConvDims, HostDevice};
    use crate::shape::ImageShape;

    fn gpu() -> Option<GpuDevice> {
        match GpuDevice::new() {
            Ok(device) => Some(device),
            Err(e) => {
                eprintln!("skipping GPU test: {}", e);
                None
            }
        }
    }

    fn run(
        device: &mut dyn ComputeDevice,
        inputs: &[Vec<f32>],
        out_len: usize,
        kernel: impl Fn(&[BufferId], BufferId) -> Kernel,
    ) -> Vec<f32> {
        let mut stream = CommandStream::new("test");
        let ids: Vec<BufferId> = inputs
            .iter()
            .map(|data| {
                let id = device.alloc(data.len(), "in").unwrap();
                stream.upload(id, data.clone());
                id
            })
            .collect();
        let out = device.alloc(out_len, "out").unwrap();
        stream.push(kernel(&ids, out));
        stream.read_back(out);
        let sub = device.submit(stream).unwrap();
        device.wait(sub).unwrap();
        let mut result = vec![0.0; out_len];
        device.read(out, &mut result).unwrap();
        result
    }

    #[test]
    fn test_conv_matches_host() {
        let Some(mut gpu) = gpu() else { return };
        let mut host = HostDevice::new().unwrap();

        let dims = ConvDims::same(ImageShape::new(5, 4, 3), 2, 3).with_batch(2);
        let input: Vec<f32> = (0..dims.input_len())
            .map(|i| ((i * 7) % 11) as f32 * 0.1 - 0.5)
            .collect();
        let weights: Vec<f32> = (0..dims.weights_len())
            .map(|i| ((i * 5) % 13) as f32 * 0.05 - 0.3)
            .collect();
        let bias = vec![0.25, -0.5];
        let kernel = |ids: &[BufferId], out: BufferId| Kernel::Conv2d {
            input: ids[0],
            weights: ids[1],
            bias: ids[2],
            output: out,
            dims,
        };

        let inputs = [input, weights, bias];
        let expected = run(&mut host, &inputs, dims.output_len(), &kernel);
        let actual = run(&mut gpu, &inputs, dims.output_len(), &kernel);
        for (a, e) in actual.iter().zip(&expected) {
            assert!((a - e).abs() < 1e-4, "{} vs {}", a, e);
        }
    }

    #[test]
    fn test_relu_and_readback() {
        let Some(mut gpu) = gpu() else { return };
        let out = run(&mut gpu, &[vec![-1.0, 0.5, -0.0, 2.0]], 4, |ids, out| Kernel::Relu {
            input: ids[0],
            output: out,
            len: 4,
        });
        assert_eq!(out, vec![0.0, 0.5, 0.0, 2.0]);
    }

    #[test]
    fn test_aliased_bindings_are_rejected() {
        let Some(mut gpu) = gpu() else { return };
        let buffer = gpu.alloc(4, "x").unwrap();
        let mut stream = CommandStream::new("alias");
        stream.push(Kernel::Relu {
            input: buffer,
            output: buffer,
            len: 4,
        });
        assert!(matches!(gpu.submit(stream), Err(Error::Device(_))));
    }

    #[test]
    fn test_read_waits_only_for_its_own_submission() {
        let Some(mut gpu) = gpu() else { return };
        let len = 1 << 16;
        let first_in = gpu.alloc(4, "first in").unwrap();
        let first_out = gpu.alloc(4, "first out").unwrap();
        let second_in = gpu.alloc(len, "second in").unwrap();
        let second_out = gpu.alloc(len, "second out").unwrap();

        let mut first = CommandStream::new("first");
        first.upload(first_in, vec![-3.0, 1.0, -0.5, 4.0]);
        first.push(Kernel::Relu {
            input: first_in,
            output: first_out,
            len: 4,
        });
        first.read_back(first_out);
        gpu.submit(first).unwrap();

        let mut second = CommandStream::new("second");
        second.upload(second_in, vec![-1.0; len]);
        second.push(Kernel::Relu {
            input: second_in,
            output: second_out,
            len,
        });
        second.read_back(second_out);
        let pending = gpu.submit(second).unwrap();

        // No wait: the read itself blocks on the stream that copied the result.
        let mut early = [1.0; 4];
        gpu.read(first_out, &mut early).unwrap();
        assert_eq!(early, [0.0, 1.0, 0.0, 4.0]);
        assert!(gpu.in_flight.contains_key(&pending.0));

        gpu.wait(pending).unwrap();
        let mut late = vec![1.0; len];
        gpu.read(second_out, &mut late).unwrap();
        assert!(late.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_read_without_readback_fails() {
        let Some(mut gpu) = gpu() else { return };
        let buffer = gpu.alloc(4, "x").unwrap();
        let mut out = [0.0; 4];
        assert!(matches!(gpu.read(buffer, &mut out), Err(Error::Device(_))));
    }
}
