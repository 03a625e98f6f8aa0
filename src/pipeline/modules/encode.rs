//! Latent-space modules: VAE encoding, mask downscaling, and distribution
//! sampling.

use std::sync::Arc;

use crate::config::LatentSampleMode;
use crate::model::Vae;
use crate::pipeline::{MapModule, ModuleContext, PipelineError, PipelineModule, SampleRecord, Value};

/// Runs the VAE encoder capability over the image field, producing a latent
/// distribution. This is the expensive module the disk cache short-circuits.
pub struct EncodeVae {
    in_name: String,
    out_name: String,
    vae: Arc<dyn Vae>,
}

impl EncodeVae {
    pub fn new(in_name: &str, out_name: &str, vae: Arc<dyn Vae>) -> Self {
        Self {
            in_name: in_name.to_string(),
            out_name: out_name.to_string(),
            vae,
        }
    }
}

impl PipelineModule for EncodeVae {
    fn name(&self) -> &'static str {
        "EncodeVae"
    }

    fn inputs(&self) -> Vec<String> {
        vec![self.in_name.clone()]
    }

    fn outputs(&self) -> Vec<String> {
        vec![self.out_name.clone()]
    }
}

impl MapModule for EncodeVae {
    fn process(
        &self,
        record: &mut SampleRecord,
        _ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        let image = record.tensor(&self.in_name)?;
        let batched = image.unsqueeze(0)?;
        let mut distribution = self.vae.encode(&batched)?;
        // Store without the batch axis; batching happens at collation.
        distribution.mean = distribution.mean.squeeze(0)?;
        distribution.logvar = distribution.logvar.squeeze(0)?;
        record.insert(self.out_name.clone(), Value::Distribution(distribution));
        Ok(())
    }
}

/// Area-reduces the mask to latent resolution (average pooling by the VAE
/// spatial factor).
pub struct DownscaleMask {
    in_name: String,
    out_name: String,
    factor: usize,
}

impl DownscaleMask {
    pub fn new(in_name: &str, out_name: &str, factor: usize) -> Self {
        Self {
            in_name: in_name.to_string(),
            out_name: out_name.to_string(),
            factor,
        }
    }
}

impl PipelineModule for DownscaleMask {
    fn name(&self) -> &'static str {
        "DownscaleMask"
    }

    fn inputs(&self) -> Vec<String> {
        vec![self.in_name.clone()]
    }

    fn outputs(&self) -> Vec<String> {
        vec![self.out_name.clone()]
    }
}

impl MapModule for DownscaleMask {
    fn process(
        &self,
        record: &mut SampleRecord,
        _ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        let mask = record.tensor(&self.in_name)?;
        let pooled = mask
            .unsqueeze(0)?
            .avg_pool2d(self.factor)?
            .squeeze(0)?;
        record.insert(self.out_name.clone(), Value::Tensor(pooled));
        Ok(())
    }
}

/// Collapses the latent distribution into one concrete latent tensor. This is
/// where cacheable-but-stochastic inputs are decoupled from the deterministic
/// cache: the draw happens downstream of it, every epoch.
pub struct SampleVaeDistribution {
    in_name: String,
    out_name: String,
    mode: LatentSampleMode,
}

impl SampleVaeDistribution {
    pub fn new(in_name: &str, out_name: &str, mode: LatentSampleMode) -> Self {
        Self {
            in_name: in_name.to_string(),
            out_name: out_name.to_string(),
            mode,
        }
    }
}

impl PipelineModule for SampleVaeDistribution {
    fn name(&self) -> &'static str {
        "SampleVaeDistribution"
    }

    fn inputs(&self) -> Vec<String> {
        vec![self.in_name.clone()]
    }

    fn outputs(&self) -> Vec<String> {
        vec![self.out_name.clone()]
    }
}

impl MapModule for SampleVaeDistribution {
    fn process(
        &self,
        record: &mut SampleRecord,
        ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        let distribution = record.distribution(&self.in_name)?;
        let latent = match self.mode {
            LatentSampleMode::Mean => distribution.mode(),
            LatentSampleMode::Sample => distribution.sample(&mut ctx.rng)?,
        };
        record.insert(self.out_name.clone(), Value::Tensor(latent));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LatentDistribution;
    use anyhow::Result;
    use candle_core::{DType, Device, Tensor};
    use rand::SeedableRng;

    fn ctx() -> ModuleContext {
        ModuleContext {
            epoch: 0,
            sample_index: 0,
            rng: rand::rngs::StdRng::seed_from_u64(0),
            device: Device::Cpu,
        }
    }

    /// Encoder stand-in: mean is an 8x area reduction of the input, variance
    /// is fixed at zero.
    struct PoolingVae;

    impl Vae for PoolingVae {
        fn encode(&self, image: &Tensor) -> Result<LatentDistribution> {
            let mean = image.avg_pool2d(8)?;
            let logvar = mean.zeros_like()?;
            Ok(LatentDistribution::new(mean, logvar))
        }

        fn decode(&self, latent: &Tensor) -> Result<Tensor> {
            Ok(latent.upsample_nearest2d(latent.dim(2)? * 8, latent.dim(3)? * 8)?)
        }

        fn scaling_factor(&self) -> f64 {
            0.18215
        }
    }

    #[test]
    fn encode_stores_an_unbatched_distribution() {
        let image = Tensor::zeros((3, 64, 64), DType::F32, &Device::Cpu).unwrap();
        let mut record = SampleRecord::new();
        record.insert("image", Value::Tensor(image));

        EncodeVae::new("image", "latent_image_distribution", Arc::new(PoolingVae))
            .process(&mut record, &mut ctx())
            .unwrap();

        let distribution = record.distribution("latent_image_distribution").unwrap();
        assert_eq!(distribution.mean.dims3().unwrap(), (3, 8, 8));
    }

    #[test]
    fn mask_downscale_averages_areas() {
        // Left half ones, right half zeros: pooled cells keep the split.
        let mut data = vec![0f32; 16 * 16];
        for y in 0..16 {
            for x in 0..8 {
                data[y * 16 + x] = 1.0;
            }
        }
        let mask = Tensor::from_vec(data, (1, 16, 16), &Device::Cpu).unwrap();
        let mut record = SampleRecord::new();
        record.insert("mask", Value::Tensor(mask));

        DownscaleMask::new("mask", "latent_mask", 8)
            .process(&mut record, &mut ctx())
            .unwrap();

        let latent_mask = record.tensor("latent_mask").unwrap();
        assert_eq!(latent_mask.dims3().unwrap(), (1, 2, 2));
        let values = latent_mask.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn mean_mode_reproduces_the_distribution_mean() {
        let mean = Tensor::full(0.7f32, (4, 2, 2), &Device::Cpu).unwrap();
        let logvar = mean.zeros_like().unwrap();
        let mut record = SampleRecord::new();
        record.insert(
            "latent_image_distribution",
            Value::Distribution(LatentDistribution::new(mean, logvar)),
        );

        SampleVaeDistribution::new("latent_image_distribution", "latent_image", LatentSampleMode::Mean)
            .process(&mut record, &mut ctx())
            .unwrap();

        let latent = record.tensor("latent_image").unwrap();
        let values = latent.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (*v - 0.7).abs() < 1e-6));
    }
}
