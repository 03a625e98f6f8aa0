//! The per-step training prediction: noise the latent, assemble conditioning,
//! run the denoiser.
//!
//! All randomness comes from a local generator seeded with the global step, so
//! a given step index reproduces its noise and timesteps exactly, on any
//! device, including after a resume. Debug output is a pure side channel: it
//! draws nothing from the generator and never touches the returned tensors.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::PathBuf;

use crate::config::TrainConfig;
use crate::model::StableDiffusionModel;
use crate::pipeline::Batch;
use crate::progress::TrainProgress;
use crate::trainers::image_utils::save_batch_images;

/// What one training step produced, ready for loss computation.
pub struct StepPrediction {
    pub predicted_noise: Tensor,
    pub noise: Tensor,
}

/// Consumer for the debug decodes of intermediate tensors.
pub trait DebugSink {
    fn save(&self, label: &str, images: &Tensor, global_step: usize) -> Result<()>;
}

/// Writes each batch sample of each labeled tensor under the debug directory
/// as `<step>-<label>-<sample>.png`.
pub struct FileDebugSink {
    dir: PathBuf,
}

impl FileDebugSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DebugSink for FileDebugSink {
    fn save(&self, label: &str, images: &Tensor, global_step: usize) -> Result<()> {
        save_batch_images(images, &self.dir, &format!("{global_step:07}-{label}"))?;
        Ok(())
    }
}

/// Host-side Gaussian draw lifted into a tensor, so the bytes only depend on
/// the rng state, never on the device.
fn draw_normal(rng: &mut StdRng, dims: &[usize], like: &Tensor) -> Result<Tensor> {
    let count: usize = dims.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    let tensor = Tensor::from_vec(values, dims, like.device())?.to_dtype(like.dtype())?;
    Ok(tensor)
}

/// Run one training-step prediction over a batch.
pub fn predict(
    model: &StableDiffusionModel,
    batch: &Batch,
    config: &TrainConfig,
    progress: &TrainProgress,
    debug: Option<&dyn DebugSink>,
) -> Result<StepPrediction> {
    let scaling_factor = model.vae.scaling_factor();
    let latent_image = batch.tensor("latent_image").context("batch lacks latent_image")?;
    let scaled_latent = (latent_image * scaling_factor)?;
    let (batch_size, channels, _, _) = scaled_latent.dims4()?;

    let mut rng = StdRng::seed_from_u64(progress.global_step as u64);

    // Draw order is fixed: base noise first, then the optional offset
    // component, then timesteps.
    let mut noise = draw_normal(&mut rng, scaled_latent.dims(), &scaled_latent)?;
    if config.offset_noise_weight != 0.0 {
        let offset = draw_normal(&mut rng, &[batch_size, channels, 1, 1], &scaled_latent)?;
        noise = noise.broadcast_add(&offset.affine(config.offset_noise_weight, 0.0)?)?;
    }

    let scheduler = &model.noise_scheduler;
    let timestep_high = ((scheduler.num_train_timesteps() as f64 * config.max_noising_strength)
        as usize)
        .max(1);
    let timesteps: Vec<i64> = (0..batch_size)
        .map(|_| rng.gen_range(0..timestep_high) as i64)
        .collect();
    let timesteps = Tensor::from_vec(timesteps, batch_size, scaled_latent.device())?;

    let noisy_latent = scheduler.add_noise(&scaled_latent, &noise, &timesteps)?;

    let prompts: Vec<String> = if batch.contains("prompt") {
        batch.texts("prompt")?.to_vec()
    } else {
        vec![String::new(); batch_size]
    };
    let embeddings: Vec<Tensor> = prompts
        .iter()
        .map(|prompt| {
            model
                .text_encoder
                .encode(prompt, 1, config.text_encoder_layer_skip)
                .map(|(embedding, _mask)| embedding)
        })
        .collect::<Result<_>>()?;
    let conditioning = Tensor::cat(&embeddings, 0)?;

    let uses_mask_conditioning = model.model_type.has_mask_input()
        && model.model_type.has_conditioning_image_input();
    let scaled_conditioning_image = if uses_mask_conditioning {
        Some((batch.tensor("latent_conditioning_image")? * scaling_factor)?)
    } else {
        None
    };
    let denoiser_input = match &scaled_conditioning_image {
        Some(scaled_cond) => {
            let latent_mask = batch.tensor("latent_mask")?;
            Tensor::cat(&[&noisy_latent, latent_mask, scaled_cond], 1)?
        }
        None => noisy_latent.clone(),
    };

    let depth = if model.model_type.has_depth_input() {
        Some(batch.tensor("latent_depth").context("depth model requires latent_depth")?)
    } else {
        None
    };

    let predicted_noise = model
        .denoiser
        .forward(&denoiser_input, &timesteps, &conditioning, depth)?;

    if let Some(sink) = debug {
        write_debug_images(
            sink,
            model,
            &noise,
            &predicted_noise,
            &noisy_latent,
            &timesteps,
            scaled_conditioning_image.as_ref(),
            progress.global_step,
        )?;
    }

    Ok(StepPrediction {
        predicted_noise,
        noise,
    })
}

/// Decode and persist the step's intermediate tensors. Pure diagnostics; no
/// randomness, no influence on the returned prediction.
#[allow(clippy::too_many_arguments)]
fn write_debug_images(
    sink: &dyn DebugSink,
    model: &StableDiffusionModel,
    noise: &Tensor,
    predicted_noise: &Tensor,
    noisy_latent: &Tensor,
    timesteps: &Tensor,
    scaled_conditioning_image: Option<&Tensor>,
    global_step: usize,
) -> Result<()> {
    let scaling_factor = model.vae.scaling_factor();
    let decode = |latent: &Tensor| -> Result<Tensor> {
        let image = model.vae.decode(&(latent / scaling_factor)?)?;
        Ok(image.clamp(-1f32, 1f32)?)
    };

    sink.save("1-noise", &decode(noise)?, global_step)?;
    sink.save("2-predicted_noise", &decode(predicted_noise)?, global_step)?;
    sink.save("3-noisy_image", &decode(noisy_latent)?, global_step)?;

    // Closed-form DDPM inversion of the model's own prediction:
    // x0 = (x_t - sqrt(1 - a_t) * eps) / sqrt(a_t).
    let batch_size = timesteps.dims()[0];
    let alphas = model
        .noise_scheduler
        .alphas_cumprod(timesteps)?
        .to_dtype(DType::F32)?
        .reshape((batch_size, 1, 1, 1))?;
    let sqrt_alphas = alphas.sqrt()?;
    let sqrt_one_minus_alphas = alphas.affine(-1.0, 1.0)?.sqrt()?;
    let predicted_latent = noisy_latent
        .broadcast_sub(&sqrt_one_minus_alphas.broadcast_mul(predicted_noise)?)?
        .broadcast_div(&sqrt_alphas)?;
    sink.save("4-predicted_image", &decode(&predicted_latent)?, global_step)?;

    if let Some(scaled_cond) = scaled_conditioning_image {
        sink.save("5-conditioning_image", &decode(scaled_cond)?, global_step)?;
    }
    Ok(())
}
