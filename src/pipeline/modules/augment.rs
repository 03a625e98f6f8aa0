//! Random augmentations. Every transform is applied identically to all
//! co-registered tensors of a record so the mask keeps pointing at the same
//! world location as the image.

use rand::Rng;

use crate::pipeline::image_ops;
use crate::pipeline::{MapModule, ModuleContext, PipelineError, PipelineModule, SampleRecord, Value};

/// Random rotation plus a crop around the mask-positive region, with a random
/// padding margin. Runs before bucketing so the deterministic scale/crop later
/// operates on already-augmented content.
pub struct RandomMaskRotateCrop {
    mask_name: String,
    additional_names: Vec<String>,
    min_size: usize,
    min_padding_percent: f32,
    max_padding_percent: f32,
    max_rotate_angle: f32,
}

impl RandomMaskRotateCrop {
    pub fn new(
        mask_name: &str,
        additional_names: &[&str],
        min_size: usize,
        min_padding_percent: f32,
        max_padding_percent: f32,
        max_rotate_angle: f32,
    ) -> Self {
        Self {
            mask_name: mask_name.to_string(),
            additional_names: additional_names.iter().map(|s| s.to_string()).collect(),
            min_size,
            min_padding_percent,
            max_padding_percent,
            max_rotate_angle,
        }
    }

    fn all_names(&self) -> Vec<String> {
        let mut names = vec![self.mask_name.clone()];
        names.extend(self.additional_names.iter().cloned());
        names
    }
}

/// Bounding box of mask values above 0.5, as (x0, y0, x1, y1) inclusive.
fn mask_bounding_box(
    mask: &candle_core::Tensor,
) -> Result<Option<(usize, usize, usize, usize)>, PipelineError> {
    let (_, h, w) = mask.dims3()?;
    let data = mask.flatten_all()?.to_vec1::<f32>()?;
    let mut bbox: Option<(usize, usize, usize, usize)> = None;
    for y in 0..h {
        for x in 0..w {
            if data[y * w + x] > 0.5 {
                bbox = Some(match bbox {
                    None => (x, y, x, y),
                    Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
                });
            }
        }
    }
    Ok(bbox)
}

impl PipelineModule for RandomMaskRotateCrop {
    fn name(&self) -> &'static str {
        "RandomMaskRotateCrop"
    }

    fn inputs(&self) -> Vec<String> {
        self.all_names()
    }

    fn outputs(&self) -> Vec<String> {
        self.all_names()
    }
}

impl MapModule for RandomMaskRotateCrop {
    fn process(
        &self,
        record: &mut SampleRecord,
        ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        // Fixed draw order keeps records reproducible for a given seed.
        let padding_percent = ctx
            .rng
            .gen_range(self.min_padding_percent..=self.max_padding_percent);
        let angle = if self.max_rotate_angle > 0.0 {
            ctx.rng.gen_range(-self.max_rotate_angle..=self.max_rotate_angle)
        } else {
            0.0
        };

        let names = self.all_names();
        for name in &names {
            let rotated = image_ops::rotate_chw(record.tensor(name)?, angle, 0.0)?;
            record.insert(name.clone(), Value::Tensor(rotated));
        }

        let mask = record.tensor(&self.mask_name)?;
        let (_, h, w) = mask.dims3()?;
        // No mask-positive pixel: fall back to the full frame.
        let (x0, y0, x1, y1) = mask_bounding_box(mask)?.unwrap_or((0, 0, w - 1, h - 1));

        let bbox_w = x1 - x0 + 1;
        let bbox_h = y1 - y0 + 1;
        let pad_x = (bbox_w as f32 * padding_percent / 100.0).round() as usize;
        let pad_y = (bbox_h as f32 * padding_percent / 100.0).round() as usize;

        let mut crop_w = (bbox_w + 2 * pad_x).max(self.min_size).min(w);
        let mut crop_h = (bbox_h + 2 * pad_y).max(self.min_size).min(h);
        // Center the crop on the bounding box, clamped into the frame.
        let center_x = (x0 + x1) / 2;
        let center_y = (y0 + y1) / 2;
        let crop_x = center_x.saturating_sub(crop_w / 2).min(w - crop_w);
        let crop_y = center_y.saturating_sub(crop_h / 2).min(h - crop_h);
        crop_w = crop_w.min(w - crop_x);
        crop_h = crop_h.min(h - crop_y);

        for name in &names {
            let cropped =
                image_ops::crop_chw(record.tensor(name)?, crop_x, crop_y, crop_w, crop_h)?;
            record.insert(name.clone(), Value::Tensor(cropped));
        }
        Ok(())
    }
}

/// Horizontal flip of all named tensors together, with a fixed per-sample
/// probability.
pub struct RandomFlip {
    names: Vec<String>,
    probability: f32,
}

impl RandomFlip {
    pub fn new(names: &[&str], probability: f32) -> Self {
        Self {
            names: names.iter().map(|s| s.to_string()).collect(),
            probability,
        }
    }
}

impl PipelineModule for RandomFlip {
    fn name(&self) -> &'static str {
        "RandomFlip"
    }

    fn inputs(&self) -> Vec<String> {
        self.names.clone()
    }

    fn outputs(&self) -> Vec<String> {
        self.names.clone()
    }
}

impl MapModule for RandomFlip {
    fn process(
        &self,
        record: &mut SampleRecord,
        ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        if ctx.rng.gen::<f32>() >= self.probability {
            return Ok(());
        }
        for name in &self.names {
            let flipped = image_ops::flip_horizontal_chw(record.tensor(name)?)?;
            record.insert(name.clone(), Value::Tensor(flipped));
        }
        Ok(())
    }
}

/// Blanks the masked region of the image, producing the conditioning image
/// that inpainting-style model variants see alongside the noisy latent.
pub struct GenerateMaskedConditioningImage {
    image_in_name: String,
    mask_in_name: String,
    image_out_name: String,
}

impl GenerateMaskedConditioningImage {
    pub fn new(image_in_name: &str, mask_in_name: &str, image_out_name: &str) -> Self {
        Self {
            image_in_name: image_in_name.to_string(),
            mask_in_name: mask_in_name.to_string(),
            image_out_name: image_out_name.to_string(),
        }
    }
}

impl PipelineModule for GenerateMaskedConditioningImage {
    fn name(&self) -> &'static str {
        "GenerateMaskedConditioningImage"
    }

    fn inputs(&self) -> Vec<String> {
        vec![self.image_in_name.clone(), self.mask_in_name.clone()]
    }

    fn outputs(&self) -> Vec<String> {
        vec![self.image_out_name.clone()]
    }
}

impl MapModule for GenerateMaskedConditioningImage {
    fn process(
        &self,
        record: &mut SampleRecord,
        _ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        let image = record.tensor(&self.image_in_name)?;
        let mask = record.tensor(&self.mask_in_name)?;
        // mask is (1, h, w) in [0, 1]; invert and broadcast over channels.
        let keep = mask.affine(-1.0, 1.0)?;
        let conditioning = image.broadcast_mul(&keep)?;
        record.insert(self.image_out_name.clone(), Value::Tensor(conditioning));
        Ok(())
    }
}
