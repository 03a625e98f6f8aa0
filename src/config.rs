//! Training configuration loaded from a YAML document, plus the concept file.
//!
//! The config is the single source of truth for pipeline assembly: flags like
//! `masked_training` or `aspect_ratio_bucketing` decide which modules end up
//! in the dataset pipeline.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Model families supported by the trainer. The variant decides which extra
/// inputs the denoiser consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelType {
    Sd15,
    Sd15Inpainting,
    Sd20,
    Sd20Inpainting,
    Sd20Depth,
    Sd21,
    Flux,
    Sana,
}

impl ModelType {
    pub fn has_mask_input(&self) -> bool {
        matches!(self, ModelType::Sd15Inpainting | ModelType::Sd20Inpainting)
    }

    pub fn has_conditioning_image_input(&self) -> bool {
        matches!(self, ModelType::Sd15Inpainting | ModelType::Sd20Inpainting)
    }

    pub fn has_depth_input(&self) -> bool {
        matches!(self, ModelType::Sd20Depth)
    }
}

/// How the latent distribution is collapsed into a concrete latent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatentSampleMode {
    Mean,
    Sample,
}

fn default_batch_size() -> usize {
    1
}

fn default_resolution() -> usize {
    512
}

fn default_epochs() -> usize {
    1
}

fn default_caching_epochs() -> usize {
    1
}

fn default_max_noising_strength() -> f64 {
    1.0
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_dtype() -> String {
    "fp32".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

fn default_sample_mode() -> LatentSampleMode {
    LatentSampleMode::Mean
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub model_type: ModelType,
    pub concept_file_name: PathBuf,
    pub workspace_dir: PathBuf,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_resolution")]
    pub resolution: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default)]
    pub masked_training: bool,
    #[serde(default)]
    pub random_rotate_and_crop: bool,
    #[serde(default)]
    pub aspect_ratio_bucketing: bool,
    #[serde(default)]
    pub load_prompts: bool,

    #[serde(default)]
    pub latent_caching: bool,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_caching_epochs")]
    pub latent_caching_epochs: usize,
    #[serde(default = "default_sample_mode")]
    pub latent_sample_mode: LatentSampleMode,

    #[serde(default)]
    pub offset_noise_weight: f64,
    #[serde(default = "default_max_noising_strength")]
    pub max_noising_strength: f64,
    #[serde(default)]
    pub text_encoder_layer_skip: usize,

    #[serde(default = "default_device")]
    pub train_device: String,
    #[serde(default = "default_device")]
    pub temp_device: String,
    #[serde(default = "default_dtype")]
    pub train_dtype: String,

    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub debug_dir: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub backup_before_save: bool,
    #[serde(default)]
    pub backup_after_epochs: Option<usize>,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl TrainConfig {
    pub fn device(&self) -> Result<Device> {
        parse_device(&self.train_device)
    }

    pub fn temp_device(&self) -> Result<Device> {
        parse_device(&self.temp_device)
    }

    pub fn dtype(&self) -> Result<DType> {
        match self.train_dtype.as_str() {
            "fp32" | "float32" => Ok(DType::F32),
            "fp16" | "float16" => Ok(DType::F16),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            other => bail!("unsupported train_dtype: {other}"),
        }
    }

    /// Validate the parts of the config that must fail before any epoch runs.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.resolution == 0 || self.resolution % 64 != 0 {
            bail!("resolution must be a positive multiple of 64, got {}", self.resolution);
        }
        if self.latent_caching && self.cache_dir.is_none() {
            bail!("latent_caching requires cache_dir to be set");
        }
        if self.latent_caching && self.latent_caching_epochs == 0 {
            bail!("latent_caching_epochs must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.max_noising_strength) {
            bail!("max_noising_strength must be within [0, 1]");
        }
        if self.model_type.has_conditioning_image_input() && !self.masked_training {
            bail!(
                "model type {:?} takes a masked conditioning image and requires masked_training",
                self.model_type
            );
        }
        Ok(())
    }
}

fn parse_device(spec: &str) -> Result<Device> {
    if spec == "cpu" {
        return Ok(Device::Cpu);
    }
    if let Some(idx) = spec.strip_prefix("cuda:") {
        let idx: usize = idx.parse().with_context(|| format!("bad device ordinal in {spec:?}"))?;
        return Ok(Device::new_cuda(idx)?);
    }
    if spec == "cuda" {
        return Ok(Device::new_cuda(0)?);
    }
    bail!("unsupported device: {spec:?}")
}

pub fn load_config(path: &Path) -> Result<TrainConfig> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: TrainConfig =
        serde_yaml::from_str(&config_str).with_context(|| "Failed to parse YAML config")?;
    config.validate()?;

    Ok(config)
}

/// One source of training images. Loaded from the concept file, immutable for
/// the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub name: String,
    pub path: PathBuf,
    /// Per-concept opt-out from masked training. Samples of a concept with
    /// masking disabled get an all-ones mask instead of a file-backed one.
    #[serde(default = "default_true", alias = "masked")]
    pub enable_masking: bool,
    #[serde(default)]
    pub include_subdirectories: bool,
}

pub fn load_concepts(path: &Path) -> Result<Vec<Concept>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read concept file: {}", path.display()))?;
    let concepts: Vec<Concept> =
        serde_json::from_str(&text).with_context(|| "Failed to parse concept file")?;

    if concepts.is_empty() {
        bail!("concept file {} contains no concepts", path.display());
    }

    Ok(concepts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
model_type: sd15
concept_file_name: concepts.json
workspace_dir: workspace
batch_size: 2
resolution: 512
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: TrainConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.resolution, 512);
        assert!(!config.masked_training);
        assert!(!config.aspect_ratio_bucketing);
        assert_eq!(config.latent_caching_epochs, 1);
        assert_eq!(config.max_noising_strength, 1.0);
        assert!(config.backup_before_save);
        config.validate().unwrap();
    }

    #[test]
    fn caching_without_cache_dir_is_rejected() {
        let mut config: TrainConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.latent_caching = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn model_type_capabilities() {
        assert!(ModelType::Sd15Inpainting.has_mask_input());
        assert!(ModelType::Sd15Inpainting.has_conditioning_image_input());
        assert!(!ModelType::Sd15Inpainting.has_depth_input());
        assert!(ModelType::Sd20Depth.has_depth_input());
        assert!(!ModelType::Sd15.has_mask_input());
        assert!(!ModelType::Flux.has_depth_input());
    }

    #[test]
    fn loads_concepts_and_rejects_empty_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concepts.json");

        fs::write(&path, r#"[{"name": "cat", "path": "/data/cat"}]"#).unwrap();
        let concepts = load_concepts(&path).unwrap();
        assert_eq!(concepts.len(), 1);
        assert_eq!(concepts[0].name, "cat");
        assert!(concepts[0].enable_masking);

        fs::write(
            &path,
            r#"[{"name": "cat", "path": "/data/cat", "masked": false}]"#,
        )
        .unwrap();
        assert!(!load_concepts(&path).unwrap()[0].enable_masking);

        fs::write(&path, "[]").unwrap();
        assert!(load_concepts(&path).is_err());
    }
}
