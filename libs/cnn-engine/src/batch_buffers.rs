//! Device-resident working tensors for one batch slot.
//!
//! A slot's buffers are allocated once at capacity and reused by every batch
//! that draws the slot. Loss buffers are allocated the first time a batch in
//! the slot needs a loss.

use crate::device::ComputeDevice;
use crate::error::Result;
use crate::marshal::DeviceTensor;
use crate::network::PassIo;
use crate::shape::ImageShape;

/// Labels, sample weights and the per-position loss image
#[derive(Debug, Clone, Copy)]
pub struct LossBuffers {
    pub labels: DeviceTensor,
    pub weights: DeviceTensor,
    pub images: DeviceTensor,
}

#[derive(Debug, Clone)]
pub struct BatchBuffers {
    pub slot: usize,
    pub input: DeviceTensor,
    pub output: DeviceTensor,
    /// Gradient w.r.t. the output, from the caller or the loss
    pub top_grad: DeviceTensor,
    /// Gradient w.r.t. the input, produced by backward
    pub input_grad: DeviceTensor,
    loss: Option<LossBuffers>,
}

impl BatchBuffers {
    pub fn allocate(
        device: &mut dyn ComputeDevice,
        slot: usize,
        input: ImageShape,
        output: ImageShape,
        capacity: usize,
    ) -> Result<Self> {
        let label = |what: &str| format!("slot{}_{}", slot, what);
        Ok(BatchBuffers {
            slot,
            input: DeviceTensor::allocate(device, input, capacity, &label("input"))?,
            output: DeviceTensor::allocate(device, output, capacity, &label("output"))?,
            top_grad: DeviceTensor::allocate(device, output, capacity, &label("top_grad"))?,
            input_grad: DeviceTensor::allocate(device, input, capacity, &label("input_grad"))?,
            loss: None,
        })
    }

    pub fn loss(&self) -> Option<&LossBuffers> {
        self.loss.as_ref()
    }

    pub fn ensure_loss(&mut self, device: &mut dyn ComputeDevice) -> Result<LossBuffers> {
        if let Some(loss) = self.loss {
            return Ok(loss);
        }
        let map = self.output.image.position_map();
        let capacity = self.output.capacity;
        let label = |what: &str| format!("slot{}_{}", self.slot, what);
        let loss = LossBuffers {
            labels: DeviceTensor::allocate(device, map, capacity, &label("labels"))?,
            weights: DeviceTensor::allocate(device, map, capacity, &label("weights"))?,
            images: DeviceTensor::allocate(device, map, capacity, &label("loss_images"))?,
        };
        log::debug!("Allocated loss buffers for slot {}", self.slot);
        self.loss = Some(loss);
        Ok(loss)
    }

    pub fn io(&self, batch: usize) -> PassIo {
        PassIo {
            batch,
            input: self.input.buffer,
            output: self.output.buffer,
            top_grad: self.top_grad.buffer,
            input_grad: self.input_grad.buffer,
        }
    }

    pub fn capacity(&self) -> usize {
        self.input.capacity
    }
}
