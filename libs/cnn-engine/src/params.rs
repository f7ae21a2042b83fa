//! Parameter table: name-keyed learnable tensors with a host mirror.
//!
//! The device buffers are authoritative. The host mirror is refreshed after
//! synchronous updates and before export.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::device::{BufferId, CommandStream, ComputeDevice};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamTag {
    Weights,
    Biases,
}

/// Shape and device location of one learnable tensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub tag: ParamTag,
    pub shape: Vec<usize>,
    pub value: BufferId,
    pub grad: BufferId,
}

impl ParamSpec {
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host-side parameter values exchanged through load / export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamArray {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl ParamArray {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        Self { data, shape }
    }
}

pub type ParamMap = BTreeMap<String, ParamArray>;

#[derive(Debug)]
struct ParamEntry {
    spec: ParamSpec,
    data: Vec<f32>,
}

#[derive(Debug, Default)]
pub struct ParameterTable {
    entries: BTreeMap<String, ParamEntry>,
}

impl ParameterTable {
    /// Register parameters with their initial values and record the uploads.
    pub fn new(initial: Vec<(ParamSpec, Vec<f32>)>, stream: &mut CommandStream) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (spec, data) in initial {
            if data.len() != spec.len() {
                return Err(Error::shape("initial parameter", spec.len(), data.len()));
            }
            if entries.contains_key(&spec.name) {
                return Err(Error::InvalidConfig(format!("duplicate parameter name '{}'", spec.name)));
            }
            stream.upload(spec.value, data.clone());
            entries.insert(spec.name.clone(), ParamEntry { spec, data });
        }
        Ok(ParameterTable { entries })
    }

    /// Overwrite the named parameters. Every entry is validated before any
    /// is applied, so a failed load changes nothing.
    pub fn load(&mut self, params: &ParamMap, stream: &mut CommandStream) -> Result<()> {
        for (name, array) in params {
            let entry = self
                .entries
                .get(name)
                .ok_or_else(|| Error::UnknownParameter(name.clone()))?;
            if array.shape != entry.spec.shape {
                return Err(Error::shape(
                    "parameter",
                    format!("{} {:?}", name, entry.spec.shape),
                    format!("{:?}", array.shape),
                ));
            }
            if array.data.len() != entry.spec.len() {
                return Err(Error::shape(
                    "parameter",
                    format!("{} elements for {}", entry.spec.len(), name),
                    format!("{} elements", array.data.len()),
                ));
            }
        }

        for (name, array) in params {
            if let Some(entry) = self.entries.get_mut(name) {
                entry.data.copy_from_slice(&array.data);
                stream.upload(entry.spec.value, array.data.clone());
            }
        }
        log::debug!("Loaded {} of {} parameters", params.len(), self.entries.len());
        Ok(())
    }

    /// Snapshot of the host mirror.
    pub fn export(&self) -> ParamMap {
        self.entries
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    ParamArray::new(entry.data.clone(), entry.spec.shape.clone()),
                )
            })
            .collect()
    }

    /// Read every parameter back from the device into the host mirror.
    /// Blocks until all previously submitted work has completed.
    pub fn refresh_from_device(&mut self, device: &mut dyn ComputeDevice) -> Result<()> {
        let mut stream = CommandStream::new("param_readback");
        for entry in self.entries.values() {
            stream.read_back(entry.spec.value);
        }
        let submission = device.submit(stream)?;
        device.wait(submission)?;
        for entry in self.entries.values_mut() {
            device.read(entry.spec.value, &mut entry.data)?;
        }
        Ok(())
    }

    pub fn specs(&self) -> impl Iterator<Item = &ParamSpec> {
        self.entries.values().map(|e| &e.spec)
    }

    pub fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.entries.get(name).map(|e| &e.spec)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of distinct learnable tensors.
    pub fn num_params(&self) -> usize {
        self.entries.len()
    }

    /// Total learnable scalars across all tensors.
    pub fn num_elements(&self) -> usize {
        self.entries.values().map(|e| e.spec.len()).sum()
    }
}
