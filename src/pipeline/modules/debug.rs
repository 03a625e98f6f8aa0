//! Debug taps: modules placed after the output stage that decode and dump
//! intermediate tensors as images without feeding anything back into the
//! training path.

use std::path::PathBuf;
use std::sync::Arc;

use crate::model::Vae;
use crate::pipeline::image_ops::save_image_tensor;
use crate::pipeline::{MapModule, ModuleContext, PipelineError, PipelineModule, SampleRecord, Value};

/// Decodes a latent back to pixel space so it can be saved for inspection.
pub struct DecodeVae {
    in_name: String,
    out_name: String,
    vae: Arc<dyn Vae>,
}

impl DecodeVae {
    pub fn new(in_name: &str, out_name: &str, vae: Arc<dyn Vae>) -> Self {
        Self {
            in_name: in_name.to_string(),
            out_name: out_name.to_string(),
            vae,
        }
    }
}

impl PipelineModule for DecodeVae {
    fn name(&self) -> &'static str {
        "DecodeVae"
    }

    fn inputs(&self) -> Vec<String> {
        vec![self.in_name.clone()]
    }

    fn outputs(&self) -> Vec<String> {
        vec![self.out_name.clone()]
    }
}

impl MapModule for DecodeVae {
    fn process(
        &self,
        record: &mut SampleRecord,
        _ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        let latent = record.tensor(&self.in_name)?.unsqueeze(0)?;
        let decoded = self.vae.decode(&latent)?.squeeze(0)?;
        record.insert(self.out_name.clone(), Value::Tensor(decoded));
        Ok(())
    }
}

/// Writes a CHW tensor field to `<dir>/<stem>-<field>-<epoch>.png`.
pub struct SaveImage {
    in_name: String,
    dir: PathBuf,
    range_min: f32,
    range_max: f32,
}

impl SaveImage {
    pub fn new(in_name: &str, dir: impl Into<PathBuf>, range_min: f32, range_max: f32) -> Self {
        Self {
            in_name: in_name.to_string(),
            dir: dir.into(),
            range_min,
            range_max,
        }
    }
}

impl PipelineModule for SaveImage {
    fn name(&self) -> &'static str {
        "SaveImage"
    }

    fn inputs(&self) -> Vec<String> {
        vec![self.in_name.clone(), "image_path".to_string()]
    }

    fn outputs(&self) -> Vec<String> {
        Vec::new()
    }
}

impl MapModule for SaveImage {
    fn process(
        &self,
        record: &mut SampleRecord,
        ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        let stem = record
            .path("image_path")?
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("sample")
            .to_string();
        let file = self
            .dir
            .join(format!("{stem}-{}-{}.png", self.in_name, ctx.epoch));
        let tensor = record.tensor(&self.in_name)?;
        save_image_tensor(tensor, self.range_min, self.range_max, &file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn ctx() -> ModuleContext {
        ModuleContext {
            epoch: 2,
            sample_index: 0,
            rng: StdRng::seed_from_u64(0),
            device: Device::Cpu,
        }
    }

    #[test]
    fn save_image_writes_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let module = SaveImage::new("image", dir.path(), -1.0, 1.0);

        let mut record = SampleRecord::new();
        record.insert(
            "image_path",
            Value::Path(PathBuf::from("/data/cat.png")),
        );
        let image = Tensor::zeros((3, 8, 8), candle_core::DType::F32, &Device::Cpu).unwrap();
        record.insert("image", Value::Tensor(image));

        module.process(&mut record, &mut ctx()).unwrap();
        assert!(dir.path().join("cat-image-2.png").exists());
    }
}
