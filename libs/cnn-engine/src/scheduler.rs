//! Batch scheduler: pairs submitted device work with caller batch ids.
//!
//! Batch resources live in an arena of slots addressed by index. Slot 0 is
//! the canonical slot used by synchronous calls; asynchronous batches draw a
//! slot from the free list, or grow the arena when it is empty, and hand it
//! back when their results are retrieved. Slots are never freed, so device
//! buffers are allocated at most once per slot.

use std::collections::HashMap;

use crate::batch_buffers::BatchBuffers;
use crate::device::{CommandStream, ComputeDevice, Kernel, LossDims, Submission};
use crate::error::{Error, Result};
use crate::marshal::{self, DeviceBatch, Staged};
use crate::network::Network;
use crate::shape::{BatchShape, HostTensor, ImageShape};

/// Caller-chosen identifier of an asynchronous batch.
pub type BatchId = i64;

const SYNC_SLOT: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BatchKey {
    Caller(BatchId),
    Sync,
}

/// Class labels and optional per-position weights, both `[n, h_out, w_out, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct LossTargets<'a> {
    pub labels: HostTensor<'a>,
    pub weights: Option<HostTensor<'a>>,
}

impl<'a> LossTargets<'a> {
    pub fn new(labels: HostTensor<'a>) -> Self {
        LossTargets {
            labels,
            weights: None,
        }
    }

    pub fn with_weights(mut self, weights: HostTensor<'a>) -> Self {
        self.weights = Some(weights);
        self
    }
}

/// The work one batch performs.
#[derive(Debug, Clone, Copy)]
pub enum Pass<'a> {
    /// Forward only. With targets the loss is computed as well; loss images
    /// are returned when requested and targets are present.
    Forward {
        input: HostTensor<'a>,
        targets: Option<LossTargets<'a>>,
        loss_image_required: bool,
        is_train: bool,
    },
    /// Back-propagate a caller gradient through the last training forward.
    Backward { top_grad: HostTensor<'a> },
    /// Training forward, loss, and backward in one stream.
    ForwardBackward {
        input: HostTensor<'a>,
        targets: LossTargets<'a>,
        loss_image_required: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Forward,
    Backward,
    ForwardBackward,
}

impl PassKind {
    fn name(self) -> &'static str {
        match self {
            PassKind::Forward => "forward",
            PassKind::Backward => "backward",
            PassKind::ForwardBackward => "forward_backward",
        }
    }
}

/// Host data for one pass, validated and converted, not yet bound to a slot.
struct Prepared {
    kind: PassKind,
    primary: Staged,
    targets: Option<(Staged, Staged)>,
    loss_images: bool,
    is_train: bool,
}

impl Prepared {
    fn batch(&self) -> usize {
        self.primary.shape.batch
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveBatch {
    slot: usize,
    submission: Submission,
    kind: PassKind,
    batch: usize,
    loss_images: bool,
}

/// Results of one retrieved batch, in host (NHWC) layout.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutput {
    /// Network output, or the input gradient for a backward pass.
    pub output: Vec<f32>,
    pub shape: BatchShape,
    /// Per-position weighted loss, `[n, h_out, w_out, 1]`, when requested.
    pub loss_images: Option<Vec<f32>>,
}

impl BatchOutput {
    /// Copy into caller-owned buffers. `loss_out` is left untouched when no
    /// loss images were produced.
    pub fn write_into(&self, out: &mut [f32], loss_out: Option<&mut [f32]>) -> Result<()> {
        if out.len() != self.output.len() {
            return Err(Error::shape("output buffer", self.output.len(), out.len()));
        }
        if let (Some(images), Some(loss_out)) = (&self.loss_images, loss_out) {
            if loss_out.len() != images.len() {
                return Err(Error::shape("loss buffer", images.len(), loss_out.len()));
            }
            loss_out.copy_from_slice(images);
        }
        out.copy_from_slice(&self.output);
        Ok(())
    }
}

pub struct BatchScheduler {
    input: ImageShape,
    output: ImageShape,
    capacity: usize,
    slots: Vec<BatchBuffers>,
    free: Vec<usize>,
    active: HashMap<BatchKey, ActiveBatch>,
    /// Batch size of the most recently submitted training forward pass.
    trained_batch: Option<usize>,
}

impl BatchScheduler {
    /// Allocate the canonical slot. The free list starts empty.
    pub fn new(
        device: &mut dyn ComputeDevice,
        input: ImageShape,
        output: ImageShape,
        capacity: usize,
    ) -> Result<Self> {
        let canonical = BatchBuffers::allocate(device, SYNC_SLOT, input, output, capacity)?;
        Ok(BatchScheduler {
            input,
            output,
            capacity,
            slots: vec![canonical],
            free: Vec::new(),
            active: HashMap::new(),
            trained_batch: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Marshal `pass` to the device and submit it under `id` without waiting.
    pub fn start(
        &mut self,
        id: BatchId,
        pass: Pass<'_>,
        device: &mut dyn ComputeDevice,
        network: &dyn Network,
    ) -> Result<()> {
        self.submit(BatchKey::Caller(id), pass, device, network)
    }

    /// Block until batch `id` completes and return its results.
    pub fn wait(&mut self, id: BatchId, device: &mut dyn ComputeDevice) -> Result<BatchOutput> {
        self.retrieve(BatchKey::Caller(id), device)
    }

    /// Start and wait in one call, on the canonical slot.
    pub fn run_sync(
        &mut self,
        pass: Pass<'_>,
        device: &mut dyn ComputeDevice,
        network: &dyn Network,
    ) -> Result<BatchOutput> {
        self.submit(BatchKey::Sync, pass, device, network)?;
        self.retrieve(BatchKey::Sync, device)
    }

    pub fn is_active(&self, id: BatchId) -> bool {
        self.active.contains_key(&BatchKey::Caller(id))
    }

    /// Ids of all batches started and not yet waited on, ascending.
    pub fn active_batches(&self) -> Vec<BatchId> {
        let mut ids: Vec<BatchId> = self
            .active
            .keys()
            .filter_map(|key| match key {
                BatchKey::Caller(id) => Some(*id),
                BatchKey::Sync => None,
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Slots ready for reuse by the next asynchronous batch.
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Slots allocated so far, the canonical slot included.
    pub fn allocated_slots(&self) -> usize {
        self.slots.len()
    }

    /// Whether a training forward pass has been submitted, so a standalone
    /// backward pass has state to work from.
    pub fn has_training_state(&self) -> bool {
        self.trained_batch.is_some()
    }

    fn submit(
        &mut self,
        key: BatchKey,
        pass: Pass<'_>,
        device: &mut dyn ComputeDevice,
        network: &dyn Network,
    ) -> Result<()> {
        if self.active.contains_key(&key) {
            return Err(match key {
                BatchKey::Caller(id) => Error::DuplicateBatchId(id),
                BatchKey::Sync => Error::device("synchronous batch already in flight"),
            });
        }
        let prepared = self.prepare(pass)?;
        let slot = self.acquire(key, device)?;

        let submitted = self
            .encode(slot, key, &prepared, device, network)
            .and_then(|stream| device.submit(stream));
        let submission = match submitted {
            Ok(submission) => submission,
            Err(e) => {
                self.release(key, slot);
                return Err(e);
            }
        };

        if prepared.is_train {
            self.trained_batch = Some(prepared.batch());
        }
        log::debug!(
            "Started {:?} {} on slot {} ({} samples, submission {})",
            key,
            prepared.kind.name(),
            slot,
            prepared.batch(),
            submission.index()
        );
        self.active.insert(
            key,
            ActiveBatch {
                slot,
                submission,
                kind: prepared.kind,
                batch: prepared.batch(),
                loss_images: prepared.loss_images,
            },
        );
        Ok(())
    }

    fn retrieve(&mut self, key: BatchKey, device: &mut dyn ComputeDevice) -> Result<BatchOutput> {
        let active = self.active.remove(&key).ok_or(match key {
            BatchKey::Caller(id) => Error::UnknownBatchId(id),
            BatchKey::Sync => Error::device("no synchronous batch in flight"),
        })?;

        let result = self.collect(&active, device);
        self.release(key, active.slot);
        if result.is_ok() {
            log::debug!("Retrieved {:?} from slot {}", key, active.slot);
        }
        result
    }

    fn collect(&self, active: &ActiveBatch, device: &mut dyn ComputeDevice) -> Result<BatchOutput> {
        device.wait(active.submission)?;

        let buffers = &self.slots[active.slot];
        let tensor = match active.kind {
            PassKind::Backward => buffers.input_grad,
            PassKind::Forward | PassKind::ForwardBackward => buffers.output,
        };
        let batch = DeviceBatch::new(tensor, active.batch);
        let output = marshal::from_device(device, &batch)?;

        let loss_images = match (active.loss_images, buffers.loss()) {
            (true, Some(loss)) => {
                let images = DeviceBatch::new(loss.images, active.batch);
                Some(marshal::from_device(device, &images)?)
            }
            _ => None,
        };

        Ok(BatchOutput {
            output,
            shape: batch.shape,
            loss_images,
        })
    }

    fn prepare(&self, pass: Pass<'_>) -> Result<Prepared> {
        match pass {
            Pass::Forward {
                input,
                targets,
                loss_image_required,
                is_train,
            } => {
                let primary = marshal::stage(input, self.input, self.capacity, "input")?;
                let targets = match targets {
                    Some(t) => Some(self.stage_targets(t, primary.shape.batch)?),
                    None => None,
                };
                Ok(Prepared {
                    kind: PassKind::Forward,
                    loss_images: loss_image_required && targets.is_some(),
                    primary,
                    targets,
                    is_train,
                })
            }
            Pass::ForwardBackward {
                input,
                targets,
                loss_image_required,
            } => {
                let primary = marshal::stage(input, self.input, self.capacity, "input")?;
                let targets = self.stage_targets(targets, primary.shape.batch)?;
                Ok(Prepared {
                    kind: PassKind::ForwardBackward,
                    primary,
                    targets: Some(targets),
                    loss_images: loss_image_required,
                    is_train: true,
                })
            }
            Pass::Backward { top_grad } => {
                let primary = marshal::stage(top_grad, self.output, self.capacity, "top_grad")?;
                let trained = self.trained_batch.ok_or(Error::MissingForwardPass)?;
                if primary.shape.batch != trained {
                    return Err(Error::shape(
                        "top_grad",
                        format!("{} samples from the last training forward", trained),
                        format!("{} samples", primary.shape.batch),
                    ));
                }
                Ok(Prepared {
                    kind: PassKind::Backward,
                    primary,
                    targets: None,
                    loss_images: false,
                    is_train: false,
                })
            }
        }
    }

    fn stage_targets(&self, targets: LossTargets<'_>, batch: usize) -> Result<(Staged, Staged)> {
        let map = self.output.position_map();
        let labels = marshal::stage(targets.labels, map, self.capacity, "labels")?;
        if labels.shape.batch != batch {
            return Err(Error::shape("labels", format!("{} samples", batch), labels.shape));
        }
        let classes = self.output.channels;
        for (index, &value) in labels.data().iter().enumerate() {
            if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value >= classes as f32 {
                return Err(Error::InvalidLabel {
                    index,
                    value,
                    classes,
                });
            }
        }

        let weights = match targets.weights {
            Some(w) => {
                let weights = marshal::stage(w, map, self.capacity, "weights")?;
                if weights.shape != labels.shape {
                    return Err(Error::shape("weights", labels.shape, weights.shape));
                }
                weights
            }
            None => {
                let ones = vec![1.0; labels.shape.len()];
                let dims = labels.shape.dims();
                marshal::stage(HostTensor::new(&ones, &dims), map, self.capacity, "weights")?
            }
        };
        Ok((labels, weights))
    }

    fn acquire(&mut self, key: BatchKey, device: &mut dyn ComputeDevice) -> Result<usize> {
        if key == BatchKey::Sync {
            return Ok(SYNC_SLOT);
        }
        if let Some(slot) = self.free.pop() {
            log::debug!("Reusing slot {}", slot);
            return Ok(slot);
        }
        let slot = self.slots.len();
        let buffers = BatchBuffers::allocate(device, slot, self.input, self.output, self.capacity)?;
        self.slots.push(buffers);
        log::debug!("Allocated slot {} ({} bytes on device)", slot, device.allocated_bytes());
        Ok(slot)
    }

    fn release(&mut self, key: BatchKey, slot: usize) {
        if key != BatchKey::Sync {
            self.free.push(slot);
        }
    }

    fn encode(
        &mut self,
        slot: usize,
        key: BatchKey,
        prepared: &Prepared,
        device: &mut dyn ComputeDevice,
        network: &dyn Network,
    ) -> Result<CommandStream> {
        let batch = prepared.batch();
        let label = match key {
            BatchKey::Caller(id) => format!("batch {} {}", id, prepared.kind.name()),
            BatchKey::Sync => format!("sync {}", prepared.kind.name()),
        };
        let mut stream = CommandStream::new(label);

        let loss = match prepared.targets {
            Some(_) => Some(self.slots[slot].ensure_loss(device)?),
            None => None,
        };
        let buffers = &self.slots[slot];
        let io = buffers.io(batch);

        match prepared.kind {
            PassKind::Backward => {
                prepared.primary.clone().record(&mut stream, buffers.top_grad);
                network.encode_replay(&mut stream, &io);
                network.encode_backward(&mut stream, &io);
                stream.read_back(io.input_grad);
                return Ok(stream);
            }
            PassKind::Forward | PassKind::ForwardBackward => {
                prepared.primary.clone().record(&mut stream, buffers.input);
                network.encode_forward(&mut stream, &io, prepared.is_train);
            }
        }

        if let (Some((labels, weights)), Some(loss)) = (&prepared.targets, loss) {
            labels.clone().record(&mut stream, loss.labels);
            weights.clone().record(&mut stream, loss.weights);
            stream.push(Kernel::SoftmaxCrossEntropy {
                logits: io.output,
                labels: loss.labels.buffer,
                weights: loss.weights.buffer,
                grad: io.top_grad,
                loss: loss.images.buffer,
                dims: LossDims {
                    batch,
                    classes: self.output.channels,
                    positions: self.output.positions(),
                },
            });
            if prepared.loss_images {
                stream.read_back(loss.images.buffer);
            }
        }

        if prepared.kind == PassKind::ForwardBackward {
            network.encode_backward(&mut stream, &io);
        }
        stream.read_back(io.output);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleConfig;
    use crate::device::HostDevice;
    use crate::network::{self, NetworkKind};

    struct Fixture {
        device: HostDevice,
        network: Box<dyn Network>,
        scheduler: BatchScheduler,
    }

    fn relu_fixture(capacity: usize) -> Fixture {
        let mut device = HostDevice::new().unwrap();
        let shape = ImageShape::new(1, 2, 2);
        let config = ModuleConfig::new(NetworkKind::SingleRelu, capacity, shape, shape);
        let (network, _) = network::build(&config, &mut device).unwrap();
        let scheduler = BatchScheduler::new(&mut device, shape, shape, capacity).unwrap();
        Fixture {
            device,
            network,
            scheduler,
        }
    }

    fn forward(input: HostTensor<'_>) -> Pass<'_> {
        Pass::Forward {
            input,
            targets: None,
            loss_image_required: false,
            is_train: false,
        }
    }

    #[test]
    fn test_start_then_wait_matches_sync() {
        let mut f = relu_fixture(2);
        let data = [-1.0, 2.0, 3.0, -4.0];
        let dims = [1, 1, 2, 2];

        let sync = f
            .scheduler
            .run_sync(forward(HostTensor::new(&data, &dims)), &mut f.device, f.network.as_ref())
            .unwrap();
        f.scheduler
            .start(5, forward(HostTensor::new(&data, &dims)), &mut f.device, f.network.as_ref())
            .unwrap();
        let asynchronous = f.scheduler.wait(5, &mut f.device).unwrap();

        assert_eq!(sync, asynchronous);
        assert_eq!(sync.output, vec![0.0, 2.0, 3.0, 0.0]);
        assert_eq!(sync.shape.dims(), [1, 1, 2, 2]);
    }

    #[test]
    fn test_duplicate_id_leaves_active_batch_intact() {
        let mut f = relu_fixture(2);
        let first = [1.0, 1.0, 1.0, 1.0];
        let second = [2.0, 2.0, 2.0, 2.0];
        let dims = [1, 1, 2, 2];

        f.scheduler
            .start(1, forward(HostTensor::new(&first, &dims)), &mut f.device, f.network.as_ref())
            .unwrap();
        let err = f
            .scheduler
            .start(1, forward(HostTensor::new(&second, &dims)), &mut f.device, f.network.as_ref())
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateBatchId(1)));
        assert_eq!(f.scheduler.active_batches(), vec![1]);
        assert_eq!(f.scheduler.allocated_slots(), 2);

        let out = f.scheduler.wait(1, &mut f.device).unwrap();
        assert_eq!(out.output, first.to_vec());
    }

    #[test]
    fn test_wait_unknown_and_twice() {
        let mut f = relu_fixture(1);
        assert!(matches!(f.scheduler.wait(3, &mut f.device), Err(Error::UnknownBatchId(3))));

        let data = [0.0; 4];
        f.scheduler
            .start(3, forward(HostTensor::new(&data, &[1, 1, 2, 2])), &mut f.device, f.network.as_ref())
            .unwrap();
        assert!(f.scheduler.wait(3, &mut f.device).is_ok());
        assert!(matches!(f.scheduler.wait(3, &mut f.device), Err(Error::UnknownBatchId(3))));
    }

    #[test]
    fn test_slots_are_reused() {
        let mut f = relu_fixture(1);
        let data = [1.0; 4];
        let dims = [1, 1, 2, 2];
        assert_eq!(f.scheduler.allocated_slots(), 1);
        assert_eq!(f.scheduler.free_slots(), 0);

        for id in 0..3 {
            f.scheduler
                .start(id, forward(HostTensor::new(&data, &dims)), &mut f.device, f.network.as_ref())
                .unwrap();
            f.scheduler.wait(id, &mut f.device).unwrap();
        }
        assert_eq!(f.scheduler.allocated_slots(), 2);
        assert_eq!(f.scheduler.free_slots(), 1);

        // Two overlapping batches need a second pooled slot.
        f.scheduler
            .start(10, forward(HostTensor::new(&data, &dims)), &mut f.device, f.network.as_ref())
            .unwrap();
        f.scheduler
            .start(11, forward(HostTensor::new(&data, &dims)), &mut f.device, f.network.as_ref())
            .unwrap();
        assert_eq!(f.scheduler.allocated_slots(), 3);
        assert_eq!(f.scheduler.free_slots(), 0);
    }

    #[test]
    fn test_rejected_start_does_not_allocate() {
        let mut f = relu_fixture(2);
        let data = [0.0; 12];
        let err = f
            .scheduler
            .start(1, forward(HostTensor::new(&data, &[3, 1, 2, 2])), &mut f.device, f.network.as_ref())
            .unwrap_err();
        assert!(matches!(err, Error::BatchTooLarge { requested: 3, capacity: 2 }));
        assert!(f.scheduler.active_batches().is_empty());
        assert_eq!(f.scheduler.allocated_slots(), 1);
    }

    #[test]
    fn test_backward_requires_training_forward() {
        let mut f = relu_fixture(1);
        let grad = [1.0; 4];
        let dims = [1, 1, 2, 2];
        let err = f
            .scheduler
            .run_sync(Pass::Backward { top_grad: HostTensor::new(&grad, &dims) }, &mut f.device, f.network.as_ref())
            .unwrap_err();
        assert!(matches!(err, Error::MissingForwardPass));

        let input = [-1.0, 1.0, -1.0, 1.0];
        let train = Pass::Forward {
            input: HostTensor::new(&input, &dims),
            targets: None,
            loss_image_required: false,
            is_train: true,
        };
        f.scheduler.run_sync(train, &mut f.device, f.network.as_ref()).unwrap();
        assert!(f.scheduler.has_training_state());

        let out = f
            .scheduler
            .run_sync(Pass::Backward { top_grad: HostTensor::new(&grad, &dims) }, &mut f.device, f.network.as_ref())
            .unwrap();
        assert_eq!(out.output, vec![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_invalid_labels_rejected() {
        let mut device = HostDevice::new().unwrap();
        let shape = ImageShape::new(1, 1, 3);
        let scheduler = BatchScheduler::new(&mut device, shape, shape, 2).unwrap();

        let cases: [(f32, bool); 5] = [(0.0, true), (2.0, true), (3.0, false), (-1.0, false), (1.5, false)];
        for (value, ok) in cases {
            let labels = [value];
            let targets = LossTargets::new(HostTensor::new(&labels, &[1, 1, 1, 1]));
            let result = scheduler.stage_targets(targets, 1);
            assert_eq!(result.is_ok(), ok, "label {}", value);
            if !ok {
                assert!(matches!(result, Err(Error::InvalidLabel { classes: 3, .. })));
            }
        }

        // Label batch must match the input batch.
        let labels = [0.0, 1.0];
        let targets = LossTargets::new(HostTensor::new(&labels, &[2, 1, 1, 1]));
        assert!(matches!(scheduler.stage_targets(targets, 1), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_write_into_leaves_loss_buffer_untouched() {
        let output = BatchOutput {
            output: vec![1.0, 2.0],
            shape: BatchShape::new(1, ImageShape::new(1, 1, 2)),
            loss_images: None,
        };
        let mut out = [0.0; 2];
        let mut loss = [7.0];
        output.write_into(&mut out, Some(&mut loss)).unwrap();
        assert_eq!(out, [1.0, 2.0]);
        assert_eq!(loss, [7.0]);

        let mut short = [0.0; 1];
        assert!(output.write_into(&mut short, None).is_err());
    }
}
