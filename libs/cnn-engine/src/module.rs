//! Training module: the public entry point composing device, network,
//! parameters, updater and scheduler.

use crate::config::ModuleConfig;
use crate::device::{self, CommandStream, ComputeDevice};
use crate::error::{Error, Result};
use crate::network::{self, Network};
use crate::params::{ParamMap, ParameterTable};
use crate::scheduler::{BatchId, BatchOutput, BatchScheduler, LossTargets, Pass};
use crate::shape::HostTensor;
use crate::updater::Updater;

pub struct TrainingModule {
    config: ModuleConfig,
    device: Box<dyn ComputeDevice>,
    network: Box<dyn Network>,
    params: ParameterTable,
    updater: Option<Updater>,
    scheduler: BatchScheduler,
}

impl TrainingModule {
    /// Validate `config`, open its device and build the module.
    pub fn init(config: ModuleConfig) -> Result<Self> {
        config.validate()?;
        let device = device::open_device(config.device)?;
        Self::with_device(config, device)
    }

    /// Build the module on an already opened device.
    pub fn with_device(config: ModuleConfig, mut device: Box<dyn ComputeDevice>) -> Result<Self> {
        config.validate()?;
        for name in config.ignored_options() {
            log::debug!("Ignoring unrecognised option '{}'", name);
        }

        let (network, initial) = network::build(&config, device.as_mut())?;
        let mut stream = CommandStream::new("init_params");
        let params = ParameterTable::new(initial, &mut stream)?;
        device.submit(stream)?;

        let updater = match config.updater {
            Some(kind) => Some(Updater::new(kind, &config, network.parameters(), device.as_mut())?),
            None => None,
        };
        let scheduler = BatchScheduler::new(
            device.as_mut(),
            config.input_shape,
            config.output_shape,
            config.batch_capacity,
        )?;

        log::info!(
            "Initialised {:?} on {} device: {} parameter tensors ({} values), capacity {}, updater {:?}",
            config.network,
            device.name(),
            params.num_params(),
            params.num_elements(),
            config.batch_capacity,
            config.updater
        );

        Ok(TrainingModule {
            config,
            device,
            network,
            params,
            updater,
            scheduler,
        })
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Forward pass; blocks until the output is on the host.
    pub fn forward(&mut self, input: HostTensor<'_>, is_train: bool) -> Result<BatchOutput> {
        self.run(Pass::Forward {
            input,
            targets: None,
            loss_image_required: false,
            is_train,
        })
    }

    /// Forward pass that also evaluates the loss against `targets`.
    pub fn forward_with_loss(
        &mut self,
        input: HostTensor<'_>,
        targets: LossTargets<'_>,
        loss_image_required: bool,
        is_train: bool,
    ) -> Result<BatchOutput> {
        self.run(Pass::Forward {
            input,
            targets: Some(targets),
            loss_image_required,
            is_train,
        })
    }

    /// Inference-mode forward pass with loss.
    pub fn loss(
        &mut self,
        input: HostTensor<'_>,
        targets: LossTargets<'_>,
        loss_image_required: bool,
    ) -> Result<BatchOutput> {
        self.forward_with_loss(input, targets, loss_image_required, false)
    }

    /// Back-propagate `top_grad` through the last training forward pass.
    /// Returns the gradient with respect to the input.
    pub fn backward(&mut self, top_grad: HostTensor<'_>) -> Result<BatchOutput> {
        self.run(Pass::Backward { top_grad })
    }

    pub fn forward_backward(
        &mut self,
        input: HostTensor<'_>,
        targets: LossTargets<'_>,
        loss_image_required: bool,
    ) -> Result<BatchOutput> {
        self.run(Pass::ForwardBackward {
            input,
            targets,
            loss_image_required,
        })
    }

    /// Submit a forward batch under `id` and return without waiting.
    pub fn begin_forward_batch(
        &mut self,
        id: BatchId,
        input: HostTensor<'_>,
        targets: Option<LossTargets<'_>>,
        loss_image_required: bool,
        is_train: bool,
    ) -> Result<()> {
        let pass = Pass::Forward {
            input,
            targets,
            loss_image_required,
            is_train,
        };
        self.scheduler
            .start(id, pass, self.device.as_mut(), self.network.as_ref())
    }

    /// Submit a fused training batch under `id` and return without waiting.
    pub fn begin_forward_backward_batch(
        &mut self,
        id: BatchId,
        input: HostTensor<'_>,
        targets: LossTargets<'_>,
        loss_image_required: bool,
    ) -> Result<()> {
        let pass = Pass::ForwardBackward {
            input,
            targets,
            loss_image_required,
        };
        self.scheduler
            .start(id, pass, self.device.as_mut(), self.network.as_ref())
    }

    pub fn wait_for_batch(&mut self, id: BatchId) -> Result<BatchOutput> {
        self.scheduler.wait(id, self.device.as_mut())
    }

    /// Apply one update step and wait until the host copies are current.
    pub fn update(&mut self) -> Result<()> {
        self.encode_update()?;
        self.params.refresh_from_device(self.device.as_mut())
    }

    /// Apply one update step on the device without waiting.
    pub fn gpu_update(&mut self) -> Result<()> {
        self.encode_update()
    }

    /// Overwrite the named parameters.
    pub fn load(&mut self, params: &ParamMap) -> Result<()> {
        let mut stream = CommandStream::new("load_params");
        self.params.load(params, &mut stream)?;
        self.device.submit(stream)?;
        Ok(())
    }

    /// Snapshot every parameter. Waits for all submitted work first.
    pub fn export(&mut self) -> Result<ParamMap> {
        self.device.wait_idle()?;
        self.params.refresh_from_device(self.device.as_mut())?;
        log::debug!("Exported {} parameters", self.params.num_params());
        Ok(self.params.export())
    }

    /// No-op when the module has no updater.
    pub fn set_learning_rate(&mut self, rate: f32) {
        match self.updater.as_mut() {
            Some(updater) => updater.set_learning_rate(rate),
            None => log::debug!("set_learning_rate({}) ignored: no updater", rate),
        }
    }

    /// No-op when the module has no updater; unknown names still fail.
    pub fn set_param_learning_rate(&mut self, name: &str, rate: f32) -> Result<()> {
        if !self.params.contains(name) {
            return Err(Error::UnknownParameter(name.to_string()));
        }
        match self.updater.as_mut() {
            Some(updater) => updater.set_param_learning_rate(name, rate),
            None => Ok(()),
        }
    }

    pub fn learning_rate(&self) -> Option<f32> {
        self.updater.as_ref().map(Updater::learning_rate)
    }

    pub fn num_params(&self) -> usize {
        self.params.num_params()
    }

    pub fn param_names(&self) -> Vec<String> {
        self.params.specs().map(|s| s.name.clone()).collect()
    }

    fn run(&mut self, pass: Pass<'_>) -> Result<BatchOutput> {
        self.scheduler
            .run_sync(pass, self.device.as_mut(), self.network.as_ref())
    }

    fn encode_update(&mut self) -> Result<()> {
        let updater = self.updater.as_mut().ok_or(Error::NoUpdater)?;
        let mut stream = CommandStream::new("update");
        updater.encode_step(&mut stream);
        self.device.submit(stream)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DevicePreference, HostDevice};
    use crate::network::NetworkKind;
    use crate::shape::ImageShape;
    use crate::updater::UpdaterKind;

    fn module(updater: Option<UpdaterKind>) -> TrainingModule {
        let shape = ImageShape::new(2, 2, 1);
        let mut config = ModuleConfig::new(NetworkKind::SingleConv, 2, shape, shape)
            .with_option("seed", 1.0)
            .with_device(DevicePreference::Host);
        config.updater = updater;
        TrainingModule::init(config).unwrap()
    }

    #[test]
    fn test_init_on_host() {
        let module = module(None);
        assert_eq!(module.device_name(), "host");
        assert_eq!(module.num_params(), 2);
        assert_eq!(module.param_names(), vec!["conv0_biases", "conv0_weights"]);
        assert_eq!(module.learning_rate(), None);
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let shape = ImageShape::new(2, 2, 1);
        let config = ModuleConfig::new(NetworkKind::SingleConv, 0, shape, shape);
        let device = Box::new(HostDevice::new().unwrap());
        assert!(matches!(
            TrainingModule::with_device(config, device),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_update_without_updater() {
        let mut module = module(None);
        assert!(matches!(module.update(), Err(Error::NoUpdater)));
        assert!(matches!(module.gpu_update(), Err(Error::NoUpdater)));
        module.set_learning_rate(0.5);
        assert!(module.set_param_learning_rate("conv0_weights", 0.5).is_ok());
        assert!(matches!(
            module.set_param_learning_rate("nope", 0.5),
            Err(Error::UnknownParameter(_))
        ));
    }

    #[test]
    fn test_set_learning_rate_with_updater() {
        let mut module = module(Some(UpdaterKind::Sgd));
        assert_eq!(module.learning_rate(), Some(crate::config::DEFAULT_LEARNING_RATE));
        module.set_learning_rate(0.25);
        assert_eq!(module.learning_rate(), Some(0.25));
    }
}
