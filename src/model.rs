//! Capability traits for the model components the trainer drives.
//!
//! The networks themselves are opaque collaborators: the pipeline and the
//! predictor only rely on encode/decode/forward operations and a scaling
//! constant. Implementations wrap whatever backbone is being trained and are
//! free to use interior mutability for device placement.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::path::Path;
use std::sync::Arc;

use crate::config::ModelType;
use crate::progress::TrainProgress;
use crate::trainers::ddpm_scheduler::DdpmScheduler;

/// Diagonal Gaussian over latent space, as produced by a VAE encoder. Holds
/// enough to either take the mode or draw a reparameterized sample.
#[derive(Debug, Clone)]
pub struct LatentDistribution {
    pub mean: Tensor,
    pub logvar: Tensor,
}

impl LatentDistribution {
    pub fn new(mean: Tensor, logvar: Tensor) -> Self {
        Self { mean, logvar }
    }

    /// The distribution mode, i.e. the mean.
    pub fn mode(&self) -> Tensor {
        self.mean.clone()
    }

    /// Reparameterized draw: `mean + exp(logvar / 2) * eps`. The epsilon is
    /// generated on the host from the caller's RNG so draws stay reproducible
    /// independent of the tensor device.
    pub fn sample(&self, rng: &mut StdRng) -> Result<Tensor> {
        let count = self.mean.elem_count();
        let eps: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
        let eps = Tensor::from_vec(eps, self.mean.dims(), self.mean.device())?;
        let std = ((&self.logvar * 0.5)?).exp()?;
        Ok((&self.mean + (std * eps)?)?)
    }
}

/// Text conditioning capability: prompt in, embedding plus attention mask out.
pub trait TextEncoder: Send + Sync {
    fn encode(&self, text: &str, batch_size: usize, layer_skip: usize)
        -> Result<(Tensor, Tensor)>;

    fn move_to(&self, device: &Device) -> Result<()> {
        let _ = device;
        Ok(())
    }

    fn set_train(&self, train: bool) {
        let _ = train;
    }
}

/// Image autoencoder capability. `encode` yields a latent distribution,
/// `decode` maps a latent back to pixel space in [-1, 1].
pub trait Vae: Send + Sync {
    fn encode(&self, image: &Tensor) -> Result<LatentDistribution>;
    fn decode(&self, latent: &Tensor) -> Result<Tensor>;
    fn scaling_factor(&self) -> f64;

    fn move_to(&self, device: &Device) -> Result<()> {
        let _ = device;
        Ok(())
    }

    fn set_train(&self, train: bool) {
        let _ = train;
    }
}

/// Denoising backbone (U-Net or transformer). `depth` is only passed for
/// depth-conditioned model variants.
pub trait DenoisingModel: Send + Sync {
    fn forward(
        &self,
        latent: &Tensor,
        timestep: &Tensor,
        conditioning: &Tensor,
        depth: Option<&Tensor>,
    ) -> Result<Tensor>;

    fn move_to(&self, device: &Device) -> Result<()> {
        let _ = device;
        Ok(())
    }

    fn set_train(&self, train: bool) {
        let _ = train;
    }
}

/// Optimizer surface the trainer drives. Construction and math live outside
/// this crate.
pub trait TrainOptimizer {
    fn backward_step(&mut self, loss: &Tensor) -> Result<()>;
}

/// Checkpoint persistence, consumed as an opaque save operation.
pub trait ModelSaver {
    fn save(&self, model: &StableDiffusionModel, destination: &Path) -> Result<()>;
}

/// The trained model as the loop sees it: capability providers, the noise
/// scheduler, and the persistent progress counters.
pub struct StableDiffusionModel {
    pub model_type: ModelType,
    pub text_encoder: Arc<dyn TextEncoder>,
    pub vae: Arc<dyn Vae>,
    pub denoiser: Arc<dyn DenoisingModel>,
    pub noise_scheduler: DdpmScheduler,
    pub train_progress: TrainProgress,
}

impl StableDiffusionModel {
    pub fn new(
        model_type: ModelType,
        text_encoder: Arc<dyn TextEncoder>,
        vae: Arc<dyn Vae>,
        denoiser: Arc<dyn DenoisingModel>,
        noise_scheduler: DdpmScheduler,
        train_progress: TrainProgress,
    ) -> Self {
        Self {
            model_type,
            text_encoder,
            vae,
            denoiser,
            noise_scheduler,
            train_progress,
        }
    }
}

/// Device choreography around the step boundary. Weight movement never happens
/// implicitly inside the predictor; the trainer calls these at well-defined
/// points.
pub struct ModelSetup {
    pub train_device: Device,
    pub temp_device: Device,
    pub debug_mode: bool,
}

impl ModelSetup {
    pub fn new(train_device: Device, temp_device: Device, debug_mode: bool) -> Self {
        Self {
            train_device,
            temp_device,
            debug_mode,
        }
    }

    pub fn setup_train_device(&self, model: &StableDiffusionModel) -> Result<()> {
        model.text_encoder.move_to(&self.train_device)?;
        // The VAE is only needed for debug decodes during training; keep it on
        // the offload device otherwise.
        let vae_device = if self.debug_mode {
            &self.train_device
        } else {
            &self.temp_device
        };
        model.vae.move_to(vae_device)?;
        model.denoiser.move_to(&self.train_device)?;

        model.text_encoder.set_train(true);
        model.vae.set_train(false);
        model.denoiser.set_train(true);
        Ok(())
    }

    pub fn setup_eval_device(&self, model: &StableDiffusionModel) -> Result<()> {
        model.text_encoder.move_to(&self.train_device)?;
        model.vae.move_to(&self.train_device)?;
        model.denoiser.move_to(&self.train_device)?;

        model.text_encoder.set_train(false);
        model.vae.set_train(false);
        model.denoiser.set_train(false);
        Ok(())
    }
}
