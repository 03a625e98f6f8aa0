//! Decoding files into record fields.

use candle_core::Tensor;
use std::fs;

use crate::pipeline::image_ops;
use crate::pipeline::{MapModule, ModuleContext, PipelineError, PipelineModule, SampleRecord, Value};

/// Decodes the image behind a path field into a normalized CHW f32 tensor.
///
/// For single-channel loads a `fallback_like` field may be named: when the
/// file is missing, or the path field itself was never produced (a gated
/// upstream module), an all-ones tensor with that field's spatial size is
/// produced instead. This is how concepts with masking disabled still satisfy
/// the mask field contract.
pub struct LoadImage {
    path_in_name: String,
    image_out_name: String,
    range_min: f32,
    range_max: f32,
    channels: usize,
    fallback_like: Option<String>,
}

impl LoadImage {
    pub fn new(path_in_name: &str, image_out_name: &str, range_min: f32, range_max: f32) -> Self {
        Self {
            path_in_name: path_in_name.to_string(),
            image_out_name: image_out_name.to_string(),
            range_min,
            range_max,
            channels: 3,
            fallback_like: None,
        }
    }

    pub fn single_channel(mut self) -> Self {
        self.channels = 1;
        self
    }

    pub fn with_fallback_like(mut self, field: &str) -> Self {
        self.fallback_like = Some(field.to_string());
        self
    }
}

impl PipelineModule for LoadImage {
    fn name(&self) -> &'static str {
        "LoadImage"
    }

    fn inputs(&self) -> Vec<String> {
        let mut inputs = vec![self.path_in_name.clone()];
        if let Some(like) = &self.fallback_like {
            inputs.push(like.clone());
        }
        inputs
    }

    fn outputs(&self) -> Vec<String> {
        vec![self.image_out_name.clone()]
    }
}

impl MapModule for LoadImage {
    fn process(
        &self,
        record: &mut SampleRecord,
        ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        let path = match record.path(&self.path_in_name) {
            Ok(path) => Some(path.clone()),
            Err(PipelineError::MissingField(_)) if self.fallback_like.is_some() => None,
            Err(err) => return Err(err),
        };

        let loadable = path.filter(|p| p.exists() || self.fallback_like.is_none());
        if let Some(path) = loadable {
            let tensor = image_ops::load_image_tensor(
                &path,
                self.range_min,
                self.range_max,
                self.channels,
                &ctx.device,
            )?;
            record.insert(self.image_out_name.clone(), Value::Tensor(tensor));
            return Ok(());
        }

        let like = self
            .fallback_like
            .as_ref()
            .ok_or_else(|| PipelineError::MissingField(self.path_in_name.clone()))?;
        let (_, h, w) = record.tensor(like)?.dims3()?;
        let ones = Tensor::full(self.range_max, (self.channels, h, w), &ctx.device)?;
        record.insert(self.image_out_name.clone(), Value::Tensor(ones));
        Ok(())
    }
}

/// Reads a text file into a record field, falling back to another text field
/// (typically the concept name) when the file does not exist.
pub struct LoadText {
    path_in_name: String,
    text_out_name: String,
    fallback_in_name: Option<String>,
}

impl LoadText {
    pub fn new(path_in_name: &str, text_out_name: &str, fallback_in_name: Option<&str>) -> Self {
        Self {
            path_in_name: path_in_name.to_string(),
            text_out_name: text_out_name.to_string(),
            fallback_in_name: fallback_in_name.map(|s| s.to_string()),
        }
    }
}

impl PipelineModule for LoadText {
    fn name(&self) -> &'static str {
        "LoadText"
    }

    fn inputs(&self) -> Vec<String> {
        let mut inputs = vec![self.path_in_name.clone()];
        if let Some(fallback) = &self.fallback_in_name {
            inputs.push(fallback.clone());
        }
        inputs
    }

    fn outputs(&self) -> Vec<String> {
        vec![self.text_out_name.clone()]
    }
}

impl MapModule for LoadText {
    fn process(
        &self,
        record: &mut SampleRecord,
        _ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        let path = record.path(&self.path_in_name)?.clone();
        let text = if path.exists() {
            fs::read_to_string(&path)
                .map_err(|source| PipelineError::Io { path, source })?
                .trim()
                .to_string()
        } else if let Some(fallback) = &self.fallback_in_name {
            record.text(fallback)?.to_string()
        } else {
            String::new()
        };
        record.insert(self.text_out_name.clone(), Value::Text(text));
        Ok(())
    }
}
