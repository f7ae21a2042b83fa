//! Reference device executing streams on a dedicated worker thread.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use super::kernels::{self, Kernel};
use super::{BufferId, CommandStream, ComputeDevice, Submission, Upload};
use crate::error::{Error, Result};

type HostBuffer = Arc<RwLock<Vec<f32>>>;

/// How often a blocked `wait` checks that the worker is still alive.
const LIVENESS_CHECK: Duration = Duration::from_millis(50);

struct Job {
    submission: u64,
    label: String,
    table: Arc<Vec<HostBuffer>>,
    uploads: Vec<Upload>,
    kernels: Vec<Kernel>,
}

#[derive(Default)]
struct Progress {
    completed: Mutex<u64>,
    signal: Condvar,
}

pub struct HostDevice {
    /// Snapshot handed to each job. Allocation copies the table only while a
    /// queued job still holds the previous snapshot.
    table: Arc<Vec<HostBuffer>>,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    progress: Arc<Progress>,
    submitted: u64,
}

impl HostDevice {
    pub fn new() -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let progress = Arc::new(Progress::default());
        let worker_progress = Arc::clone(&progress);

        let worker = thread::Builder::new()
            .name("host-device".into())
            .spawn(move || {
                for job in receiver {
                    let submission = job.submission;
                    run_job(&job);
                    // Release the table snapshot before reporting completion.
                    drop(job);
                    let mut completed = worker_progress.completed.lock();
                    *completed = submission;
                    worker_progress.signal.notify_all();
                }
            })
            .map_err(|e| Error::device(format!("failed to spawn host device worker: {}", e)))?;

        Ok(HostDevice {
            table: Arc::new(Vec::new()),
            jobs: Some(sender),
            worker: Some(worker),
            progress,
            submitted: 0,
        })
    }

    /// Index of the most recently completed submission.
    pub fn completed(&self) -> u64 {
        *self.progress.completed.lock()
    }

    fn buffer(&self, id: BufferId) -> Result<&HostBuffer> {
        self.table
            .get(id.index())
            .ok_or_else(|| Error::device(format!("unknown buffer {}", id)))
    }

    fn worker_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

impl ComputeDevice for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn alloc(&mut self, len: usize, label: &str) -> Result<BufferId> {
        let index = u32::try_from(self.table.len())
            .map_err(|_| Error::device("host buffer arena is full"))?;
        Arc::make_mut(&mut self.table).push(Arc::new(RwLock::new(vec![0.0; len.max(1)])));
        log::trace!("host alloc {} '{}' ({} floats)", index, label, len);
        Ok(BufferId(index))
    }

    fn buffer_len(&self, buffer: BufferId) -> Option<usize> {
        self.table.get(buffer.index()).map(|b| b.read().len())
    }

    fn submit(&mut self, stream: CommandStream) -> Result<Submission> {
        stream.validate(|id| self.buffer_len(id))?;

        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| Error::device("host device is shut down"))?;
        let submission = self.submitted + 1;
        let job = Job {
            submission,
            label: stream.label().to_string(),
            table: Arc::clone(&self.table),
            uploads: stream.uploads().to_vec(),
            kernels: stream.kernels().to_vec(),
        };
        jobs.send(job)
            .map_err(|_| Error::device("host device worker has stopped"))?;
        self.submitted = submission;
        Ok(Submission(submission))
    }

    fn wait(&mut self, submission: Submission) -> Result<()> {
        if submission.0 > self.submitted {
            return Err(Error::device(format!(
                "submission {} was never issued",
                submission.0
            )));
        }
        let mut completed = self.progress.completed.lock();
        while *completed < submission.0 {
            let timed_out = self
                .progress
                .signal
                .wait_for(&mut completed, LIVENESS_CHECK)
                .timed_out();
            if timed_out && *completed < submission.0 && !self.worker_alive() {
                return Err(Error::device("host device worker terminated"));
            }
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.wait(Submission(self.submitted))
    }

    fn read(&mut self, buffer: BufferId, out: &mut [f32]) -> Result<()> {
        let data = self.buffer(buffer)?.read();
        if out.len() > data.len() {
            return Err(Error::device(format!(
                "read of {} elements from buffer {} of {}",
                out.len(),
                buffer,
                data.len()
            )));
        }
        out.copy_from_slice(&data[..out.len()]);
        Ok(())
    }

    fn allocated_bytes(&self) -> usize {
        self.table
            .iter()
            .map(|b| b.read().len() * std::mem::size_of::<f32>())
            .sum()
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop after the queued jobs.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("host device worker panicked");
            }
        }
    }
}

fn run_job(job: &Job) {
    log::trace!("host device running '{}' (submission {})", job.label, job.submission);
    for upload in &job.uploads {
        let mut dst = job.table[upload.dst.index()].write();
        dst[upload.offset..upload.offset + upload.data.len()].copy_from_slice(&upload.data);
    }
    for kernel in &job.kernels {
        execute(kernel, &job.table);
    }
}

// Kernels read snapshots of their inputs and write results back afterwards,
// so a buffer may appear as both input and output.
fn load(table: &[HostBuffer], id: BufferId) -> Vec<f32> {
    table[id.index()].read().clone()
}

fn store(table: &[HostBuffer], id: BufferId, data: &[f32]) {
    let mut dst = table[id.index()].write();
    let n = data.len().min(dst.len());
    dst[..n].copy_from_slice(&data[..n]);
}

fn execute(kernel: &Kernel, table: &[HostBuffer]) {
    match *kernel {
        Kernel::Zero { dst, len } => {
            table[dst.index()].write()[..len].fill(0.0);
        }
        Kernel::Copy { src, dst, len } => {
            let data = load(table, src);
            store(table, dst, &data[..len]);
        }
        Kernel::Conv2d {
            input,
            weights,
            bias,
            output,
            dims,
        } => {
            let mut out = vec![0.0; dims.output_len()];
            kernels::conv2d_forward(
                &load(table, input),
                &load(table, weights),
                &load(table, bias),
                &mut out,
                &dims,
            );
            store(table, output, &out);
        }
        Kernel::Conv2dBackwardData {
            grad_output,
            weights,
            grad_input,
            dims,
        } => {
            let mut out = vec![0.0; dims.input_len()];
            kernels::conv2d_backward_data(
                &load(table, grad_output),
                &load(table, weights),
                &mut out,
                &dims,
            );
            store(table, grad_input, &out);
        }
        Kernel::Conv2dBackwardFilter {
            input,
            grad_output,
            grad_weights,
            grad_bias,
            dims,
        } => {
            let mut gw = vec![0.0; dims.weights_len()];
            let mut gb = vec![0.0; dims.out_channels];
            kernels::conv2d_backward_filter(
                &load(table, input),
                &load(table, grad_output),
                &mut gw,
                &mut gb,
                &dims,
            );
            store(table, grad_weights, &gw);
            store(table, grad_bias, &gb);
        }
        Kernel::Relu { input, output, len } => {
            let mut out = vec![0.0; len];
            kernels::relu(&load(table, input)[..len], &mut out);
            store(table, output, &out);
        }
        Kernel::ReluBackward {
            input,
            grad_output,
            grad_input,
            len,
        } => {
            let mut out = vec![0.0; len];
            kernels::relu_backward(
                &load(table, input)[..len],
                &load(table, grad_output)[..len],
                &mut out,
            );
            store(table, grad_input, &out);
        }
        Kernel::SoftmaxCrossEntropy {
            logits,
            labels,
            weights,
            grad,
            loss,
            dims,
        } => {
            let mut g = vec![0.0; dims.logits_len()];
            let mut l = vec![0.0; dims.positions_len()];
            kernels::softmax_cross_entropy(
                &load(table, logits),
                &load(table, labels),
                &load(table, weights),
                &mut g,
                &mut l,
                &dims,
            );
            store(table, grad, &g);
            store(table, loss, &l);
        }
        Kernel::UpdateParams {
            param,
            grad,
            first_moment,
            second_moment,
            len,
            params,
        } => {
            let mut p = load(table, param);
            let mut m = load(table, first_moment);
            let mut v = load(table, second_moment);
            kernels::update_params(
                &mut p[..len],
                &load(table, grad)[..len],
                &mut m[..len],
                &mut v[..len],
                &params,
            );
            store(table, param, &p[..len]);
            store(table, first_moment, &m[..len]);
            store(table, second_moment, &v[..len]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed() {
        let mut device = HostDevice::new().unwrap();
        let id = device.alloc(8, "zeros").unwrap();
        assert_eq!(device.buffer_len(id), Some(8));
        assert_eq!(device.allocated_bytes(), 32);

        let mut out = vec![1.0; 8];
        device.read(id, &mut out).unwrap();
        assert!(out.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_alloc_grows_table_in_place_when_idle() {
        let mut device = HostDevice::new().unwrap();
        let first = device.alloc(2, "first").unwrap();
        let table = Arc::as_ptr(&device.table);
        for i in 0..1000 {
            device.alloc(i % 7 + 1, "filler").unwrap();
        }
        assert!(std::ptr::eq(table, Arc::as_ptr(&device.table)));
        assert_eq!(device.table.len(), 1001);

        // A queued job keeps its own snapshot while the table grows.
        let mut stream = CommandStream::new("fill");
        stream.upload(first, vec![3.0, -3.0]);
        let sub = device.submit(stream).unwrap();
        let late = device.alloc(5, "late").unwrap();
        device.wait(sub).unwrap();

        assert_eq!(device.buffer_len(late), Some(5));
        let mut out = vec![0.0; 2];
        device.read(first, &mut out).unwrap();
        assert_eq!(out, vec![3.0, -3.0]);
        assert_eq!(Arc::strong_count(&device.table), 1);
    }

    #[test]
    fn test_uploads_apply_before_kernels() {
        let mut device = HostDevice::new().unwrap();
        let a = device.alloc(4, "a").unwrap();
        let b = device.alloc(4, "b").unwrap();

        let mut stream = CommandStream::new("relu");
        stream.push(Kernel::Relu {
            input: a,
            output: b,
            len: 4,
        });
        stream.upload(a, vec![-1.0, 2.0, -3.0, 4.0]);
        stream.read_back(b);
        let sub = device.submit(stream).unwrap();
        device.wait(sub).unwrap();

        let mut out = vec![0.0; 4];
        device.read(b, &mut out).unwrap();
        assert_eq!(out, vec![0.0, 2.0, 0.0, 4.0]);
    }

    #[test]
    fn test_streams_run_in_submission_order() {
        let mut device = HostDevice::new().unwrap();
        let buf = device.alloc(2, "buf").unwrap();

        let mut first = CommandStream::new("first");
        first.upload(buf, vec![1.0, 1.0]);
        let mut second = CommandStream::new("second");
        second.upload_at(buf, 1, vec![5.0]);

        let s1 = device.submit(first).unwrap();
        let s2 = device.submit(second).unwrap();
        assert!(s2 > s1);
        device.wait(s2).unwrap();
        assert!(device.completed() >= s1.index());

        let mut out = vec![0.0; 2];
        device.read(buf, &mut out).unwrap();
        assert_eq!(out, vec![1.0, 5.0]);
    }

    #[test]
    fn test_in_place_kernel() {
        let mut device = HostDevice::new().unwrap();
        let buf = device.alloc(3, "buf").unwrap();
        let mut stream = CommandStream::new("in-place");
        stream.upload(buf, vec![-2.0, 0.5, 3.0]);
        stream.push(Kernel::Relu {
            input: buf,
            output: buf,
            len: 3,
        });
        device.submit(stream).unwrap();
        device.wait_idle().unwrap();

        let mut out = vec![0.0; 3];
        device.read(buf, &mut out).unwrap();
        assert_eq!(out, vec![0.0, 0.5, 3.0]);
    }

    #[test]
    fn test_submit_rejects_unknown_buffer() {
        let mut device = HostDevice::new().unwrap();
        let mut stream = CommandStream::new("bad");
        stream.push(Kernel::Zero {
            dst: BufferId(42),
            len: 1,
        });
        assert!(matches!(device.submit(stream), Err(Error::Device(_))));
    }

    #[test]
    fn test_wait_on_unissued_submission_fails() {
        let mut device = HostDevice::new().unwrap();
        assert!(device.wait(Submission(3)).is_err());
        assert!(device.wait_idle().is_ok());
    }

    #[test]
    fn test_oversized_read_fails() {
        let mut device = HostDevice::new().unwrap();
        let id = device.alloc(2, "small").unwrap();
        let mut out = vec![0.0; 3];
        assert!(device.read(id, &mut out).is_err());
    }
}
