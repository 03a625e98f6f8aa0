//! On-disk latent cache. Split fields (large per-sample tensors) live in one
//! safetensors file each; aggregate fields (small metadata) live in a single
//! JSON index per cache root. All writes are temp-file-then-rename, and every
//! unreadable or stale artifact is treated as a miss, never an error.

use candle_core::{Device, Tensor};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::LatentDistribution;
use crate::pipeline::{PipelineError, PipelineModule, SampleRecord, Value};

const INDEX_FILE: &str = "aggregate.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    /// Epoch at which the entry was written; it stays valid for
    /// `cached_epochs` epochs after that.
    cached_epoch: usize,
    fields: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: HashMap<String, IndexEntry>,
}

pub struct DiskCache {
    cache_dir: PathBuf,
    split_names: Vec<String>,
    aggregate_names: Vec<String>,
    cached_epochs: usize,
    device: Device,

    epoch: usize,
    index: CacheIndex,
    index_loaded: bool,
    dirty: bool,
}

impl DiskCache {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        split_names: &[&str],
        aggregate_names: &[&str],
        cached_epochs: usize,
        device: Device,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            split_names: split_names.iter().map(|s| s.to_string()).collect(),
            aggregate_names: aggregate_names.iter().map(|s| s.to_string()).collect(),
            cached_epochs,
            device,
            epoch: 0,
            index: CacheIndex::default(),
            index_loaded: false,
            dirty: false,
        }
    }

    /// Stable identity for one sample: ordinal position in the deterministic
    /// enumeration order plus the image file stem.
    fn sample_id(&self, sample_index: usize, record: &SampleRecord) -> Result<String, PipelineError> {
        let stem = record
            .path("image_path")?
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("sample")
            .to_string();
        Ok(format!("{sample_index:08}-{stem}"))
    }

    fn artifact_path(&self, id: &str, field: &str) -> PathBuf {
        self.cache_dir.join(format!("{id}-{field}.safetensors"))
    }

    fn index_path(&self) -> PathBuf {
        self.cache_dir.join(INDEX_FILE)
    }

    pub fn begin_epoch(&mut self, epoch: usize) -> Result<(), PipelineError> {
        self.epoch = epoch;
        if self.index_loaded {
            return Ok(());
        }
        fs::create_dir_all(&self.cache_dir).map_err(|source| PipelineError::Io {
            path: self.cache_dir.clone(),
            source,
        })?;
        let path = self.index_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(text) => match serde_json::from_str::<CacheIndex>(&text) {
                    Ok(index) => self.index = index,
                    Err(err) => {
                        warn!("cache index {} is unreadable, rebuilding: {err}", path.display());
                    }
                },
                Err(err) => {
                    warn!("cache index {} cannot be read, rebuilding: {err}", path.display());
                }
            }
        }
        self.index_loaded = true;
        Ok(())
    }

    /// Load a valid cache entry into the record. `Ok(false)` means miss:
    /// missing, stale beyond the cached-epochs horizon, or unreadable.
    pub fn try_load(
        &self,
        sample_index: usize,
        record: &mut SampleRecord,
    ) -> Result<bool, PipelineError> {
        let id = self.sample_id(sample_index, record)?;
        let entry = match self.index.entries.get(&id) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        let stale = self.epoch < entry.cached_epoch
            || self.epoch - entry.cached_epoch >= self.cached_epochs;
        if stale {
            return Ok(false);
        }

        let mut loaded: Vec<(String, Value)> = Vec::new();
        for name in &self.aggregate_names {
            let Some(json) = entry.fields.get(name) else {
                warn!("cache entry {id} is missing aggregate field {name:?}, recomputing");
                return Ok(false);
            };
            match Value::from_json(json) {
                Ok(value) => loaded.push((name.clone(), value)),
                Err(_) => {
                    warn!("cache entry {id} has a corrupt aggregate field {name:?}, recomputing");
                    return Ok(false);
                }
            }
        }
        for name in &self.split_names {
            let path = self.artifact_path(&id, name);
            let tensors = match candle_core::safetensors::load(&path, &self.device) {
                Ok(tensors) => tensors,
                Err(err) => {
                    warn!("cache artifact {} is unreadable, recomputing: {err}", path.display());
                    return Ok(false);
                }
            };
            let value = match (tensors.get("mean"), tensors.get("logvar"), tensors.get("tensor")) {
                (Some(mean), Some(logvar), _) => Value::Distribution(LatentDistribution::new(
                    mean.clone(),
                    logvar.clone(),
                )),
                (_, _, Some(tensor)) => Value::Tensor(tensor.clone()),
                _ => {
                    warn!("cache artifact {} has unexpected contents, recomputing", path.display());
                    return Ok(false);
                }
            };
            loaded.push((name.clone(), value));
        }

        for (name, value) in loaded {
            record.insert(name, value);
        }
        Ok(true)
    }

    /// Persist the split fields of a freshly computed record and stage its
    /// aggregate fields for the next index flush.
    pub fn store(&mut self, sample_index: usize, record: &SampleRecord) -> Result<(), PipelineError> {
        let id = self.sample_id(sample_index, record)?;

        for name in &self.split_names {
            let mut tensors: HashMap<String, Tensor> = HashMap::new();
            match record.get(name)? {
                Value::Tensor(t) => {
                    tensors.insert("tensor".to_string(), t.clone());
                }
                Value::Distribution(d) => {
                    tensors.insert("mean".to_string(), d.mean.clone());
                    tensors.insert("logvar".to_string(), d.logvar.clone());
                }
                _ => {
                    return Err(PipelineError::Config(format!(
                        "split cache field {name:?} must be tensor-valued"
                    )))
                }
            }
            let path = self.artifact_path(&id, name);
            atomic_save(&tensors, &path)?;
        }

        let mut fields = HashMap::new();
        for name in &self.aggregate_names {
            fields.insert(name.clone(), record.get(name)?.to_json()?);
        }
        self.index.entries.insert(
            id,
            IndexEntry {
                cached_epoch: self.epoch,
                fields,
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// Write the aggregate index. Called once per epoch after all misses have
    /// been recomputed; a crash before this point leaves orphaned artifact
    /// files that simply read as misses next run.
    pub fn flush_index(&mut self) -> Result<(), PipelineError> {
        if !self.dirty {
            return Ok(());
        }
        let path = self.index_path();
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string(&self.index)
            .map_err(|err| PipelineError::Config(format!("cannot serialize cache index: {err}")))?;
        fs::write(&tmp, text).map_err(|source| PipelineError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| PipelineError::Io { path, source })?;
        self.dirty = false;
        Ok(())
    }
}

fn atomic_save(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<(), PipelineError> {
    let tmp = path.with_extension("safetensors.tmp");
    candle_core::safetensors::save(tensors, &tmp)?;
    fs::rename(&tmp, path).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

impl PipelineModule for DiskCache {
    fn name(&self) -> &'static str {
        "DiskCache"
    }

    fn inputs(&self) -> Vec<String> {
        let mut inputs = self.split_names.clone();
        inputs.extend(self.aggregate_names.iter().cloned());
        inputs
    }

    fn outputs(&self) -> Vec<String> {
        self.inputs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn record_with_distribution() -> SampleRecord {
        let mut record = SampleRecord::new();
        record.insert("image_path", Value::Path(PathBuf::from("/data/dog.png")));
        record.insert("crop_resolution", Value::Size(512, 512));
        let mean = Tensor::full(0.25f32, (4, 8, 8), &Device::Cpu).unwrap();
        let logvar = Tensor::zeros((4, 8, 8), DType::F32, &Device::Cpu).unwrap();
        record.insert(
            "latent_image_distribution",
            Value::Distribution(LatentDistribution::new(mean, logvar)),
        );
        record
    }

    fn cache(dir: &Path, cached_epochs: usize) -> DiskCache {
        DiskCache::new(
            dir,
            &["latent_image_distribution"],
            &["crop_resolution", "image_path"],
            cached_epochs,
            Device::Cpu,
        )
    }

    #[test]
    fn cache_round_trip_restores_tensors_and_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = cache(dir.path(), 2);
        writer.begin_epoch(0).unwrap();
        writer.store(0, &record_with_distribution()).unwrap();
        writer.flush_index().unwrap();

        // A fresh instance sees everything from disk alone.
        let mut reader = cache(dir.path(), 2);
        reader.begin_epoch(1).unwrap();
        let mut record = SampleRecord::new();
        record.insert("image_path", Value::Path(PathBuf::from("/data/dog.png")));
        assert!(reader.try_load(0, &mut record).unwrap());

        assert_eq!(record.size("crop_resolution").unwrap(), (512, 512));
        let distribution = record.distribution("latent_image_distribution").unwrap();
        let mean = distribution.mean.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(mean.iter().all(|v| (*v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn entries_expire_after_the_cached_epochs_horizon() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = cache(dir.path(), 2);
        writer.begin_epoch(0).unwrap();
        writer.store(0, &record_with_distribution()).unwrap();
        writer.flush_index().unwrap();

        let mut record = SampleRecord::new();
        record.insert("image_path", Value::Path(PathBuf::from("/data/dog.png")));

        let mut reader = cache(dir.path(), 2);
        reader.begin_epoch(1).unwrap();
        assert!(reader.try_load(0, &mut record).unwrap());

        reader.begin_epoch(2).unwrap();
        assert!(!reader.try_load(0, &mut record).unwrap());
    }

    #[test]
    fn corrupt_artifacts_read_as_misses() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = cache(dir.path(), 10);
        writer.begin_epoch(0).unwrap();
        writer.store(0, &record_with_distribution()).unwrap();
        writer.flush_index().unwrap();

        // Truncate the artifact behind the index's back.
        let artifact = dir
            .path()
            .join("00000000-dog-latent_image_distribution.safetensors");
        fs::write(&artifact, b"garbage").unwrap();

        let mut reader = cache(dir.path(), 10);
        reader.begin_epoch(0).unwrap();
        let mut record = SampleRecord::new();
        record.insert("image_path", Value::Path(PathBuf::from("/data/dog.png")));
        assert!(!reader.try_load(0, &mut record).unwrap());
    }

    #[test]
    fn unflushed_entries_are_invisible_to_other_readers() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = cache(dir.path(), 10);
        writer.begin_epoch(0).unwrap();
        writer.store(0, &record_with_distribution()).unwrap();
        // No flush: artifact files exist, the index does not mention them.

        let mut reader = cache(dir.path(), 10);
        reader.begin_epoch(0).unwrap();
        let mut record = SampleRecord::new();
        record.insert("image_path", Value::Path(PathBuf::from("/data/dog.png")));
        assert!(!reader.try_load(0, &mut record).unwrap());
    }
}
