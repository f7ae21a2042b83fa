//! Module configuration

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::DevicePreference;
use crate::error::{Error, Result};
use crate::network::NetworkKind;
use crate::shape::{checked_product, ImageShape};
use crate::updater::UpdaterKind;

/// Flat option name -> value mapping interpreted by the network and updater.
pub type OptionsMap = BTreeMap<String, f32>;

/// Option names understood by the built-in networks and updaters.
pub const KNOWN_OPTIONS: &[&str] = &[
    "learning_rate",
    "momentum",
    "beta1",
    "beta2",
    "epsilon",
    "weight_decay",
    "gradient_clipping",
    "kernel_size",
    "hidden_channels",
    "seed",
];

pub const DEFAULT_LEARNING_RATE: f32 = 1e-3;
pub const DEFAULT_KERNEL_SIZE: usize = 3;
pub const DEFAULT_HIDDEN_CHANNELS: usize = 8;

/// Configuration for a training module. Immutable once the module is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Network topology
    pub network: NetworkKind,
    /// Largest batch any single call may carry
    pub batch_capacity: usize,
    /// Per-sample input shape
    pub input_shape: ImageShape,
    /// Per-sample output shape
    pub output_shape: ImageShape,
    /// Update rule; `None` builds an inference-only module
    #[serde(default)]
    pub updater: Option<UpdaterKind>,
    /// Numeric options for the network and updater
    #[serde(default)]
    pub options: OptionsMap,
    /// Device backend
    #[serde(default)]
    pub device: DevicePreference,
}

impl ModuleConfig {
    pub fn new(
        network: NetworkKind,
        batch_capacity: usize,
        input_shape: ImageShape,
        output_shape: ImageShape,
    ) -> Self {
        Self {
            network,
            batch_capacity,
            input_shape,
            output_shape,
            updater: None,
            options: OptionsMap::new(),
            device: DevicePreference::Auto,
        }
    }

    /// Build from the numeric init contract. Shapes are `[channels, height, width]`;
    /// a negative `updater_id` means no updater.
    pub fn from_ids(
        network_id: i32,
        batch_capacity: usize,
        input_chw: [usize; 3],
        output_chw: [usize; 3],
        updater_id: i32,
        options: OptionsMap,
    ) -> Result<Self> {
        let network = NetworkKind::from_id(network_id)?;
        let updater = if updater_id < 0 {
            None
        } else {
            Some(UpdaterKind::from_id(updater_id)?)
        };
        let chw = |[c, h, w]: [usize; 3]| ImageShape::new(h, w, c);

        Ok(Self {
            network,
            batch_capacity,
            input_shape: chw(input_chw),
            output_shape: chw(output_chw),
            updater,
            options,
            device: DevicePreference::Auto,
        })
    }

    pub fn with_updater(mut self, updater: UpdaterKind) -> Self {
        self.updater = Some(updater);
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, value: f32) -> Self {
        self.options.insert(name.into(), value);
        self
    }

    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }

    pub fn option_or(&self, name: &str, default: f32) -> f32 {
        self.options.get(name).copied().unwrap_or(default)
    }

    pub fn learning_rate(&self) -> f32 {
        self.option_or("learning_rate", DEFAULT_LEARNING_RATE)
    }

    pub fn kernel_size(&self) -> usize {
        self.option_or("kernel_size", DEFAULT_KERNEL_SIZE as f32) as usize
    }

    pub fn hidden_channels(&self) -> usize {
        self.option_or("hidden_channels", DEFAULT_HIDDEN_CHANNELS as f32) as usize
    }

    /// Weight-initialisation seed; random when absent.
    pub fn seed(&self) -> Option<u64> {
        self.options.get("seed").map(|&s| s.max(0.0) as u64)
    }

    /// Option names no built-in component reads.
    pub fn ignored_options(&self) -> Vec<&str> {
        self.options
            .keys()
            .map(String::as_str)
            .filter(|name| !KNOWN_OPTIONS.contains(name))
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if self.batch_capacity == 0 {
            return invalid("batch_capacity must be > 0".to_string());
        }
        for (what, shape) in [("input", self.input_shape), ("output", self.output_shape)] {
            match shape.checked_len() {
                None => return invalid(format!("{} shape {} overflows usize", what, shape)),
                Some(0) => return invalid(format!("{} shape {} has no elements", what, shape)),
                Some(_) => {}
            }
        }
        for (name, value) in &self.options {
            if !value.is_finite() {
                return invalid(format!("option '{}' must be finite, got {}", name, value));
            }
        }

        let lr = self.learning_rate();
        if lr < 0.0 {
            return invalid(format!("learning_rate must be >= 0, got {}", lr));
        }
        for name in ["momentum", "beta1", "beta2"] {
            if let Some(&v) = self.options.get(name) {
                if !(0.0..1.0).contains(&v) {
                    return invalid(format!("{} must be in [0, 1), got {}", name, v));
                }
            }
        }

        let (input, output) = (self.input_shape, self.output_shape);
        match self.network {
            NetworkKind::SingleRelu => {
                if input != output {
                    return invalid(format!(
                        "single_relu needs equal input and output shapes, got {} and {}",
                        input, output
                    ));
                }
            }
            NetworkKind::SingleConv | NetworkKind::ConvNet => {
                let k = self.kernel_size();
                if k == 0 || k % 2 == 0 {
                    return invalid(format!("kernel_size must be odd, got {}", k));
                }
            }
        }
        match self.network {
            NetworkKind::SingleRelu => {}
            NetworkKind::SingleConv => {
                if input.height != output.height || input.width != output.width {
                    return invalid(format!(
                        "single_conv preserves spatial size: input {} vs output {}",
                        input, output
                    ));
                }
            }
            NetworkKind::ConvNet => {
                if output.height > input.height || output.width > input.width {
                    return invalid(format!(
                        "conv_net cannot grow spatial size: input {} vs output {}",
                        input, output
                    ));
                }
                if self.hidden_channels() == 0 {
                    return invalid("hidden_channels must be > 0".to_string());
                }
            }
        }

        self.check_sizes()
    }

    /// Every device buffer the network and a full batch need must have an
    /// element count that fits in `usize`.
    fn check_sizes(&self) -> Result<()> {
        let (input, output) = (self.input_shape, self.output_shape);
        let cap = self.batch_capacity;
        let k = self.kernel_size();
        let hidden = self.hidden_channels();

        let mut sizes = vec![
            ("input batch", vec![cap, input.height, input.width, input.channels]),
            ("output batch", vec![cap, output.height, output.width, output.channels]),
        ];
        match self.network {
            NetworkKind::SingleRelu => {}
            NetworkKind::SingleConv => {
                sizes.push(("conv weights", vec![output.channels, input.channels, k, k]));
            }
            NetworkKind::ConvNet => {
                let (kh, kw) = (input.height + 1 - output.height, input.width + 1 - output.width);
                sizes.push(("hidden batch", vec![cap, input.height, input.width, hidden]));
                sizes.push(("conv0 weights", vec![hidden, input.channels, k, k]));
                sizes.push(("conv1 weights", vec![output.channels, hidden, kh, kw]));
            }
        }

        for (what, dims) in sizes {
            if checked_product(&dims).is_none() {
                return Err(Error::InvalidConfig(format!(
                    "{} of {:?} elements overflows usize",
                    what, dims
                )));
            }
        }
        Ok(())
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
