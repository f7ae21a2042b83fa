//! Parameter update rules applied on the device.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ModuleConfig;
use crate::device::{BufferId, CommandStream, ComputeDevice, Kernel, StepParams, StepRule};
use crate::error::{Error, Result};
use crate::params::ParamSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdaterKind {
    Sgd,
    Momentum,
    Adam,
}

impl UpdaterKind {
    pub fn from_id(id: i32) -> Result<Self> {
        match id {
            0 => Ok(UpdaterKind::Sgd),
            1 => Ok(UpdaterKind::Momentum),
            2 => Ok(UpdaterKind::Adam),
            _ => Err(Error::UnknownUpdater(id)),
        }
    }

    pub fn id(self) -> i32 {
        match self {
            UpdaterKind::Sgd => 0,
            UpdaterKind::Momentum => 1,
            UpdaterKind::Adam => 2,
        }
    }
}

/// Optimizer state for one parameter
#[derive(Debug, Clone)]
struct SlotState {
    param: BufferId,
    grad: BufferId,
    first_moment: BufferId,
    second_moment: BufferId,
    len: usize,
}

pub struct Updater {
    kind: UpdaterKind,
    rule: StepRule,
    learning_rate: f32,
    weight_decay: f32,
    clip: f32,
    step: u32,
    overrides: HashMap<String, f32>,
    state: Vec<(String, SlotState)>,
}

impl Updater {
    /// Allocate optimizer state for `params` on `device`.
    pub fn new(
        kind: UpdaterKind,
        config: &ModuleConfig,
        params: &[ParamSpec],
        device: &mut dyn ComputeDevice,
    ) -> Result<Self> {
        let rule = match kind {
            UpdaterKind::Sgd => StepRule::Sgd,
            UpdaterKind::Momentum => StepRule::Momentum {
                momentum: config.option_or("momentum", 0.9),
            },
            UpdaterKind::Adam => StepRule::Adam {
                beta1: config.option_or("beta1", 0.9),
                beta2: config.option_or("beta2", 0.999),
                epsilon: config.option_or("epsilon", 1e-8),
            },
        };

        // Moments a rule never reads point at shared scratch buffers.
        let scratch_len = params.iter().map(ParamSpec::len).max().unwrap_or(1);
        let scratch_m = device.alloc(scratch_len, "updater_scratch_m")?;
        let scratch_v = device.alloc(scratch_len, "updater_scratch_v")?;

        let mut state = Vec::with_capacity(params.len());
        for spec in params {
            let first_moment = match kind {
                UpdaterKind::Sgd => scratch_m,
                _ => device.alloc(spec.len(), &format!("{}_m", spec.name))?,
            };
            let second_moment = match kind {
                UpdaterKind::Adam => device.alloc(spec.len(), &format!("{}_v", spec.name))?,
                _ => scratch_v,
            };
            state.push((
                spec.name.clone(),
                SlotState {
                    param: spec.value,
                    grad: spec.grad,
                    first_moment,
                    second_moment,
                    len: spec.len(),
                },
            ));
        }

        Ok(Updater {
            kind,
            rule,
            learning_rate: config.learning_rate(),
            weight_decay: config.option_or("weight_decay", 0.0),
            clip: config.option_or("gradient_clipping", 0.0),
            step: 0,
            overrides: HashMap::new(),
            state,
        })
    }

    pub fn kind(&self) -> UpdaterKind {
        self.kind
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, rate: f32) {
        log::debug!("Learning rate {} -> {}", self.learning_rate, rate);
        self.learning_rate = rate;
    }

    /// Override the learning rate of one parameter; it no longer follows
    /// `set_learning_rate`.
    pub fn set_param_learning_rate(&mut self, name: &str, rate: f32) -> Result<()> {
        if !self.state.iter().any(|(n, _)| n == name) {
            return Err(Error::UnknownParameter(name.to_string()));
        }
        self.overrides.insert(name.to_string(), rate);
        Ok(())
    }

    pub fn param_learning_rate(&self, name: &str) -> f32 {
        self.overrides.get(name).copied().unwrap_or(self.learning_rate)
    }

    pub fn steps(&self) -> u32 {
        self.step
    }

    /// Record one update of every parameter from its current gradient.
    pub fn encode_step(&mut self, stream: &mut CommandStream) {
        self.step += 1;
        for (name, slot) in &self.state {
            let learning_rate = self.overrides.get(name).copied().unwrap_or(self.learning_rate);
            stream.push(Kernel::UpdateParams {
                param: slot.param,
                grad: slot.grad,
                first_moment: slot.first_moment,
                second_moment: slot.second_moment,
                len: slot.len,
                params: StepParams {
                    rule: self.rule,
                    learning_rate,
                    weight_decay: self.weight_decay,
                    clip: self.clip,
                    step: self.step,
                },
            });
        }
        log::debug!("{:?} step {} over {} parameters", self.kind, self.step, self.state.len());
    }
}
