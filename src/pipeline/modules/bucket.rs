//! Aspect-ratio bucketing: pure resolution math that maps each sample onto one
//! of a fixed set of admissible resolutions near the target pixel budget.

use crate::pipeline::image_ops;
use crate::pipeline::{MapModule, ModuleContext, PipelineError, PipelineModule, SampleRecord, Value};

const BUCKET_ASPECTS: &[f64] = &[1.0, 1.25, 1.5, 1.75, 2.0, 2.5, 3.0, 3.5, 4.0];
const BUCKET_QUANT: usize = 64;

/// All admissible (width, height) buckets for a target resolution: each listed
/// aspect ratio and its inverse, quantized to multiples of 64, holding the
/// total pixel count near `target_resolution^2`.
pub fn possible_buckets(target_resolution: usize) -> Vec<(usize, usize)> {
    let budget = (target_resolution * target_resolution) as f64;
    let quantize = |v: f64| -> usize {
        ((v / BUCKET_QUANT as f64).round() as usize).max(1) * BUCKET_QUANT
    };

    let mut buckets = Vec::new();
    for &aspect in BUCKET_ASPECTS {
        for aspect in [aspect, 1.0 / aspect] {
            let w = quantize((budget * aspect).sqrt());
            let h = quantize((budget / aspect).sqrt());
            if !buckets.contains(&(w, h)) {
                buckets.push((w, h));
            }
        }
    }
    buckets.sort();
    buckets
}

/// Bucket minimizing aspect-ratio distortion for a native resolution. Pure:
/// same input and bucket list always select the same bucket.
pub fn select_bucket(width: usize, height: usize, buckets: &[(usize, usize)]) -> (usize, usize) {
    let aspect = (width as f64 / height as f64).ln();
    *buckets
        .iter()
        .min_by(|a, b| {
            let da = ((a.0 as f64 / a.1 as f64).ln() - aspect).abs();
            let db = ((b.0 as f64 / b.1 as f64).ln() - aspect).abs();
            da.partial_cmp(&db).expect("aspect distances are finite")
        })
        .expect("bucket list is never empty")
}

/// Scale-to-cover resolution for a native size and a crop target: the smallest
/// resolution preserving aspect ratio that covers the crop box in both axes.
fn cover_resolution(
    width: usize,
    height: usize,
    crop_w: usize,
    crop_h: usize,
) -> (usize, usize) {
    let scale = (crop_w as f64 / width as f64).max(crop_h as f64 / height as f64);
    let scaled_w = ((width as f64 * scale).ceil() as usize).max(crop_w);
    let scaled_h = ((height as f64 * scale).ceil() as usize).max(crop_h);
    (scaled_w, scaled_h)
}

/// Records the native resolution of the image tensor.
pub struct CalcAspect {
    image_in_name: String,
    resolution_out_name: String,
}

impl CalcAspect {
    pub fn new(image_in_name: &str, resolution_out_name: &str) -> Self {
        Self {
            image_in_name: image_in_name.to_string(),
            resolution_out_name: resolution_out_name.to_string(),
        }
    }
}

impl PipelineModule for CalcAspect {
    fn name(&self) -> &'static str {
        "CalcAspect"
    }

    fn inputs(&self) -> Vec<String> {
        vec![self.image_in_name.clone()]
    }

    fn outputs(&self) -> Vec<String> {
        vec![self.resolution_out_name.clone()]
    }
}

impl MapModule for CalcAspect {
    fn process(
        &self,
        record: &mut SampleRecord,
        _ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        let (_, h, w) = record.tensor(&self.image_in_name)?.dims3()?;
        record.insert(self.resolution_out_name.clone(), Value::Size(w, h));
        Ok(())
    }
}

/// Assigns each sample its bucket and the deterministic scale/crop pair that
/// maps the native image into it exactly.
pub struct AspectBucketing {
    resolution_in_name: String,
    scale_resolution_out_name: String,
    crop_resolution_out_name: String,
    buckets: Vec<(usize, usize)>,
}

impl AspectBucketing {
    pub fn new(
        target_resolution: usize,
        resolution_in_name: &str,
        scale_resolution_out_name: &str,
        crop_resolution_out_name: &str,
    ) -> Self {
        Self {
            resolution_in_name: resolution_in_name.to_string(),
            scale_resolution_out_name: scale_resolution_out_name.to_string(),
            crop_resolution_out_name: crop_resolution_out_name.to_string(),
            buckets: possible_buckets(target_resolution),
        }
    }
}

impl PipelineModule for AspectBucketing {
    fn name(&self) -> &'static str {
        "AspectBucketing"
    }

    fn inputs(&self) -> Vec<String> {
        vec![self.resolution_in_name.clone()]
    }

    fn outputs(&self) -> Vec<String> {
        vec![
            self.scale_resolution_out_name.clone(),
            self.crop_resolution_out_name.clone(),
        ]
    }
}

impl MapModule for AspectBucketing {
    fn process(
        &self,
        record: &mut SampleRecord,
        _ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        let (w, h) = record.size(&self.resolution_in_name)?;
        let (bucket_w, bucket_h) = select_bucket(w, h, &self.buckets);
        let (scale_w, scale_h) = cover_resolution(w, h, bucket_w, bucket_h);
        record.insert(self.scale_resolution_out_name.clone(), Value::Size(scale_w, scale_h));
        record.insert(self.crop_resolution_out_name.clone(), Value::Size(bucket_w, bucket_h));
        Ok(())
    }
}

/// The non-bucketing counterpart: every sample targets the square training
/// resolution, so downstream modules see the same contract either way.
pub struct SingleResolutionCalc {
    image_in_name: String,
    scale_resolution_out_name: String,
    crop_resolution_out_name: String,
    resolution: usize,
}

impl SingleResolutionCalc {
    pub fn new(
        image_in_name: &str,
        scale_resolution_out_name: &str,
        crop_resolution_out_name: &str,
        resolution: usize,
    ) -> Self {
        Self {
            image_in_name: image_in_name.to_string(),
            scale_resolution_out_name: scale_resolution_out_name.to_string(),
            crop_resolution_out_name: crop_resolution_out_name.to_string(),
            resolution,
        }
    }
}

impl PipelineModule for SingleResolutionCalc {
    fn name(&self) -> &'static str {
        "SingleResolutionCalc"
    }

    fn inputs(&self) -> Vec<String> {
        vec![self.image_in_name.clone()]
    }

    fn outputs(&self) -> Vec<String> {
        vec![
            self.scale_resolution_out_name.clone(),
            self.crop_resolution_out_name.clone(),
        ]
    }
}

impl MapModule for SingleResolutionCalc {
    fn process(
        &self,
        record: &mut SampleRecord,
        _ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        let (_, h, w) = record.tensor(&self.image_in_name)?.dims3()?;
        let (scale_w, scale_h) = cover_resolution(w, h, self.resolution, self.resolution);
        record.insert(self.scale_resolution_out_name.clone(), Value::Size(scale_w, scale_h));
        record.insert(
            self.crop_resolution_out_name.clone(),
            Value::Size(self.resolution, self.resolution),
        );
        Ok(())
    }
}

/// Applies the computed geometry: scale to cover, then center crop to the
/// exact crop resolution.
pub struct ScaleCropImage {
    image_in_name: String,
    scale_resolution_in_name: String,
    crop_resolution_in_name: String,
    image_out_name: String,
}

impl ScaleCropImage {
    pub fn new(
        image_in_name: &str,
        scale_resolution_in_name: &str,
        crop_resolution_in_name: &str,
        image_out_name: &str,
    ) -> Self {
        Self {
            image_in_name: image_in_name.to_string(),
            scale_resolution_in_name: scale_resolution_in_name.to_string(),
            crop_resolution_in_name: crop_resolution_in_name.to_string(),
            image_out_name: image_out_name.to_string(),
        }
    }
}

impl PipelineModule for ScaleCropImage {
    fn name(&self) -> &'static str {
        "ScaleCropImage"
    }

    fn inputs(&self) -> Vec<String> {
        vec![
            self.image_in_name.clone(),
            self.scale_resolution_in_name.clone(),
            self.crop_resolution_in_name.clone(),
        ]
    }

    fn outputs(&self) -> Vec<String> {
        vec![self.image_out_name.clone()]
    }
}

impl MapModule for ScaleCropImage {
    fn process(
        &self,
        record: &mut SampleRecord,
        _ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        let (scale_w, scale_h) = record.size(&self.scale_resolution_in_name)?;
        let (crop_w, crop_h) = record.size(&self.crop_resolution_in_name)?;
        let scaled = image_ops::resize_chw(record.tensor(&self.image_in_name)?, scale_w, scale_h)?;
        let x = (scale_w - crop_w) / 2;
        let y = (scale_h - crop_h) / 2;
        let cropped = image_ops::crop_chw(&scaled, x, y, crop_w, crop_h)?;
        record.insert(self.image_out_name.clone(), Value::Tensor(cropped));
        Ok(())
    }
}
