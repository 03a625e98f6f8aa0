//! DDPM noise scheduler: beta schedules and the forward diffusion step.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    SquaredCosCapV2,
}

pub struct DdpmScheduler {
    num_train_timesteps: usize,
    alphas_cumprod: Tensor,
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
}

impl DdpmScheduler {
    pub fn new(
        num_train_timesteps: usize,
        beta_start: f32,
        beta_end: f32,
        beta_schedule: BetaSchedule,
        device: &Device,
    ) -> Result<Self> {
        if num_train_timesteps == 0 {
            bail!("num_train_timesteps must be at least 1");
        }

        let betas = match beta_schedule {
            BetaSchedule::Linear => linear_betas(num_train_timesteps, beta_start, beta_end),
            BetaSchedule::ScaledLinear => {
                scaled_linear_betas(num_train_timesteps, beta_start, beta_end)
            }
            BetaSchedule::SquaredCosCapV2 => cosine_betas(num_train_timesteps),
        };

        let mut alphas_cumprod = Vec::with_capacity(num_train_timesteps);
        let mut running = 1.0f32;
        for beta in &betas {
            running *= 1.0 - beta;
            alphas_cumprod.push(running);
        }

        let sqrt_alphas_cumprod: Vec<f32> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod: Vec<f32> =
            alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();

        Ok(Self {
            num_train_timesteps,
            alphas_cumprod: Tensor::from_vec(alphas_cumprod, num_train_timesteps, device)?,
            sqrt_alphas_cumprod: Tensor::from_vec(
                sqrt_alphas_cumprod,
                num_train_timesteps,
                device,
            )?,
            sqrt_one_minus_alphas_cumprod: Tensor::from_vec(
                sqrt_one_minus_alphas_cumprod,
                num_train_timesteps,
                device,
            )?,
        })
    }

    /// Scheduler with the standard Stable Diffusion configuration.
    pub fn stable_diffusion(device: &Device) -> Result<Self> {
        Self::new(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear, device)
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.num_train_timesteps
    }

    /// Forward diffusion:
    /// `noisy = sqrt(alpha_cumprod_t) * sample + sqrt(1 - alpha_cumprod_t) * noise`.
    /// `timesteps` is a `[batch]` i64 tensor.
    pub fn add_noise(
        &self,
        original_samples: &Tensor,
        noise: &Tensor,
        timesteps: &Tensor,
    ) -> Result<Tensor> {
        let batch_size = timesteps.dims()[0];
        let timesteps = timesteps.to_dtype(DType::I64)?;

        let sqrt_alpha_prod = self
            .sqrt_alphas_cumprod
            .index_select(&timesteps, 0)?
            .reshape((batch_size, 1, 1, 1))?
            .to_dtype(original_samples.dtype())?;
        let sqrt_one_minus_alpha_prod = self
            .sqrt_one_minus_alphas_cumprod
            .index_select(&timesteps, 0)?
            .reshape((batch_size, 1, 1, 1))?
            .to_dtype(original_samples.dtype())?;

        let scaled_original = sqrt_alpha_prod.broadcast_mul(original_samples)?;
        let scaled_noise = sqrt_one_minus_alpha_prod.broadcast_mul(noise)?;
        Ok((scaled_original + scaled_noise)?)
    }

    /// `alpha_cumprod` gathered at the given timesteps, shaped `[batch]`.
    pub fn alphas_cumprod(&self, timesteps: &Tensor) -> Result<Tensor> {
        let timesteps = timesteps.to_dtype(DType::I64)?;
        Ok(self.alphas_cumprod.index_select(&timesteps, 0)?)
    }
}

fn linear_betas(n: usize, start: f32, end: f32) -> Vec<f32> {
    (0..n)
        .map(|i| start + (end - start) * i as f32 / (n as f32 - 1.0).max(1.0))
        .collect()
}

fn scaled_linear_betas(n: usize, start: f32, end: f32) -> Vec<f32> {
    let (start, end) = (start.sqrt(), end.sqrt());
    (0..n)
        .map(|i| {
            let b = start + (end - start) * i as f32 / (n as f32 - 1.0).max(1.0);
            b * b
        })
        .collect()
}

fn cosine_betas(n: usize) -> Vec<f32> {
    let s = 0.008f32;
    let alpha_bar = |t: f32| ((t + s) / (1.0 + s) * std::f32::consts::PI / 2.0).cos().powi(2);
    let base = alpha_bar(0.0);
    (0..n)
        .map(|i| {
            let t0 = i as f32 / n as f32;
            let t1 = (i + 1) as f32 / n as f32;
            (1.0 - (alpha_bar(t1) / base) / (alpha_bar(t0) / base)).min(0.999)
        })
        .collect()
}
