//! Lazily evaluated, module-composed dataset pipeline.
//!
//! A pipeline is an ordered list of stages, each stage a list of modules that
//! read and write named fields on a per-sample record. Stage lists are
//! assembled conditionally from the train config (masked training, aspect
//! bucketing, latent caching), validated at construction, and executed
//! pull-based: consuming a batch triggers computation of exactly the records
//! that batch needs, with the disk cache short-circuiting everything upstream
//! of it.

pub mod image_ops;
pub mod modules;
pub mod record;

pub use record::{Batch, BatchValue, SampleRecord, Value};

use candle_core::Device;
use log::warn;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use thiserror::Error;

use crate::progress::TrainProgress;
use modules::cache::DiskCache;
use modules::output::{AspectBatchSorting, OutputModule};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("module {module} requires field {field:?} which no earlier module produces")]
    UnsatisfiedInput { module: String, field: String },
    #[error("missing field {0:?}")]
    MissingField(String),
    #[error("field {0:?} has an unexpected type")]
    WrongFieldType(String),
    #[error("value cannot be stored as an aggregate cache field")]
    NotAggregatable,
    #[error("corrupt cache entry")]
    CorruptCacheEntry,
    #[error("failed to load image {path}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to save image {path}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("i/o error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
    #[error(transparent)]
    Capability(#[from] anyhow::Error),
}

impl PipelineError {
    /// Per-sample I/O failures are recoverable: the sample is skipped for the
    /// epoch instead of aborting the run.
    pub fn is_sample_error(&self) -> bool {
        matches!(
            self,
            PipelineError::ImageLoad { .. }
                | PipelineError::Io { .. }
                | PipelineError::CorruptCacheEntry
        )
    }
}

/// Execution context handed to a module for one record.
pub struct ModuleContext {
    pub epoch: usize,
    pub sample_index: usize,
    pub rng: StdRng,
    pub device: Device,
}

/// Every module declares the fields it reads and the fields it writes. The
/// declarations are checked once, at pipeline construction.
pub trait PipelineModule {
    fn name(&self) -> &'static str;
    fn inputs(&self) -> Vec<String>;
    fn outputs(&self) -> Vec<String>;
}

/// A module that transforms one record in place.
pub trait MapModule: PipelineModule {
    fn process(
        &self,
        record: &mut SampleRecord,
        ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError>;
}

/// A module that produces the initial set of skeleton records.
pub trait SourceModule: PipelineModule {
    fn enumerate(&self) -> Result<Vec<SampleRecord>, PipelineError>;
}

/// Tagged module slot inside a stage.
pub enum ModuleSlot {
    Source(Box<dyn SourceModule>),
    Map(Box<dyn MapModule>),
    Cache(DiskCache),
    Sort(AspectBatchSorting),
    Output(OutputModule),
}

pub type Stage = Vec<ModuleSlot>;

/// Derives an independent per-record seed from `(base, epoch, index)` with a
/// splitmix64-style finalizer, so neighboring indices do not correlate.
pub fn sample_seed(base: u64, epoch: usize, index: usize) -> u64 {
    let mut x = base
        ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (index as u64).wrapping_mul(0xD1B5_4A32_D192_ED03);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Per-sample memoization state within one epoch. Without a cache, epoch
/// start only advances each record far enough to know its resolution; the
/// remaining modules run when the record's batch is pulled, resuming the
/// per-sample RNG where the prefix left it.
enum RecordState {
    Partial {
        record: SampleRecord,
        applied: usize,
        rng: StdRng,
    },
    Ready(SampleRecord),
}

/// The executable pipeline.
pub struct DataPipeline {
    source: Box<dyn SourceModule>,
    pre_cache: Vec<Box<dyn MapModule>>,
    cache: Option<DiskCache>,
    post_cache: Vec<Box<dyn MapModule>>,
    sorter: AspectBatchSorting,
    output: OutputModule,
    debug: Vec<Box<dyn MapModule>>,
    device: Device,
    base_seed: u64,
    // Number of leading pre-cache modules needed to produce the sorter's
    // resolution field.
    resolution_prefix: usize,

    base_records: Vec<SampleRecord>,
    epoch: usize,
    records: Vec<Option<RecordState>>,
    batches: Vec<Vec<usize>>,
}

impl DataPipeline {
    /// Build a pipeline from ordered stages. Empty or absent stages are
    /// allowed; the flattened module order must satisfy every declared input
    /// and end in exactly one output module. Fails fast on any violation.
    pub fn new(
        stages: Vec<Option<Stage>>,
        device: Device,
        base_seed: u64,
    ) -> Result<Self, PipelineError> {
        let mut source: Option<Box<dyn SourceModule>> = None;
        let mut pre_cache: Vec<Box<dyn MapModule>> = Vec::new();
        let mut cache: Option<DiskCache> = None;
        let mut post_cache: Vec<Box<dyn MapModule>> = Vec::new();
        let mut sorter: Option<AspectBatchSorting> = None;
        let mut output: Option<OutputModule> = None;
        let mut debug: Vec<Box<dyn MapModule>> = Vec::new();

        for slot in stages.into_iter().flatten().flatten() {
            match slot {
                ModuleSlot::Source(s) => {
                    if source.is_some() || !pre_cache.is_empty() || cache.is_some() {
                        return Err(PipelineError::Config(
                            "the source module must be the first module of the pipeline".into(),
                        ));
                    }
                    source = Some(s);
                }
                ModuleSlot::Map(m) => {
                    if output.is_some() {
                        // Modules behind the output are debug-only taps.
                        debug.push(m);
                    } else if cache.is_some() {
                        post_cache.push(m);
                    } else {
                        pre_cache.push(m);
                    }
                }
                ModuleSlot::Cache(c) => {
                    if cache.is_some() {
                        return Err(PipelineError::Config(
                            "at most one disk cache module is supported".into(),
                        ));
                    }
                    cache = Some(c);
                }
                ModuleSlot::Sort(s) => {
                    if sorter.is_some() {
                        return Err(PipelineError::Config(
                            "at most one batch sorting module is supported".into(),
                        ));
                    }
                    sorter = Some(s);
                }
                ModuleSlot::Output(o) => {
                    if output.is_some() {
                        return Err(PipelineError::Config(
                            "at most one output module is supported".into(),
                        ));
                    }
                    output = Some(o);
                }
            }
        }

        let source = source
            .ok_or_else(|| PipelineError::Config("pipeline has no source module".into()))?;
        let sorter = sorter
            .ok_or_else(|| PipelineError::Config("pipeline has no batch sorting module".into()))?;
        let output = output
            .ok_or_else(|| PipelineError::Config("pipeline has no output module".into()))?;

        validate_dataflow(
            source.as_ref(),
            &pre_cache,
            cache.as_ref(),
            &post_cache,
            &sorter,
            &output,
            &debug,
        )?;

        let resolution_field = sorter.resolution_in_name().to_string();
        let resolution_prefix = pre_cache
            .iter()
            .position(|m| m.outputs().contains(&resolution_field))
            .map(|i| i + 1)
            .unwrap_or(pre_cache.len());

        Ok(Self {
            source,
            pre_cache,
            cache,
            post_cache,
            sorter,
            output,
            debug,
            device,
            base_seed,
            resolution_prefix,
            base_records: Vec::new(),
            epoch: 0,
            records: Vec::new(),
            batches: Vec::new(),
        })
    }

    /// Number of samples discovered by the source. Only meaningful after the
    /// first `start_epoch`.
    pub fn sample_count(&self) -> usize {
        self.base_records.len()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Begin an epoch: enumerate sources once, refresh cache validity, resolve
    /// every sample's crop resolution and regroup batches by resolution bucket
    /// with epoch-seeded shuffling. Only the module prefix needed for the
    /// resolution runs here; the heavy tail runs when a batch is pulled.
    pub fn start_epoch(&mut self, epoch: usize, batch_size: usize) -> Result<(), PipelineError> {
        if batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be at least 1".into()));
        }
        if self.base_records.is_empty() {
            self.base_records = self.source.enumerate()?;
            if self.base_records.is_empty() {
                return Err(PipelineError::Config(
                    "no training samples found in any concept directory".into(),
                ));
            }
        }

        self.epoch = epoch;
        self.records = (0..self.base_records.len()).map(|_| None).collect();

        if let Some(cache) = &mut self.cache {
            cache.begin_epoch(epoch)?;
        }

        let resolution_name = self.sorter.resolution_in_name().to_string();
        let mut resolutions: Vec<(usize, (usize, usize))> = Vec::new();
        for index in 0..self.base_records.len() {
            match self.resolve_resolution(index, &resolution_name) {
                Ok(size) => resolutions.push((index, size)),
                Err(err) if err.is_sample_error() => {
                    warn!(
                        "skipping sample {} in epoch {epoch}: {err}",
                        self.sample_label(index)
                    );
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(cache) = &mut self.cache {
            cache.flush_index()?;
        }

        let mut rng = StdRng::seed_from_u64(sample_seed(self.base_seed, epoch, usize::MAX));
        self.batches = self.sorter.sort(&resolutions, batch_size, &mut rng);
        Ok(())
    }

    /// Assemble one batch by position within the current epoch. Samples whose
    /// deferred modules fail with a recoverable error are dropped from the
    /// batch; `None` means every sample of the batch failed.
    pub fn batch(&mut self, batch_index: usize) -> Result<Option<Batch>, PipelineError> {
        let indices = self
            .batches
            .get(batch_index)
            .ok_or_else(|| {
                PipelineError::Config(format!("batch index {batch_index} out of range"))
            })?
            .clone();

        let mut ready: Vec<usize> = Vec::with_capacity(indices.len());
        for &index in &indices {
            match self.ensure_record(index) {
                Ok(()) => ready.push(index),
                Err(err) if err.is_sample_error() => {
                    warn!(
                        "dropping sample {} from batch {batch_index}: {err}",
                        self.sample_label(index)
                    );
                }
                Err(err) => return Err(err),
            }
        }
        if ready.is_empty() {
            return Ok(None);
        }
        let records: Vec<&SampleRecord> = ready
            .iter()
            .map(|&i| match self.records[i].as_ref() {
                Some(RecordState::Ready(record)) => record,
                _ => unreachable!("record resolved above"),
            })
            .collect();
        self.output.collate(&records).map(Some)
    }

    fn sample_label(&self, index: usize) -> String {
        self.base_records[index]
            .path("image_path")
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| format!("#{index}"))
    }

    /// Resolve one sample's bucketed resolution without running the full
    /// chain. A cache hit reads it from the aggregate index; a cache miss
    /// warms the cache for the epoch; without a cache only the modules up to
    /// the bucketing step run, and the partial record is kept for the pull.
    fn resolve_resolution(
        &mut self,
        index: usize,
        resolution_name: &str,
    ) -> Result<(usize, usize), PipelineError> {
        let mut record = self.base_records[index].clone();
        let mut ctx = ModuleContext {
            epoch: self.epoch,
            sample_index: index,
            rng: StdRng::seed_from_u64(sample_seed(self.base_seed, self.epoch, index)),
            device: self.device.clone(),
        };

        if let Some(cache) = &mut self.cache {
            let cached = cache.try_load(index, &mut record)?;
            if !cached {
                for module in &self.pre_cache {
                    module.process(&mut record, &mut ctx)?;
                }
                cache.store(index, &record)?;
            }
            // The heavy fields live on disk; reload when the batch is pulled.
            record.size(resolution_name)
        } else {
            for module in &self.pre_cache[..self.resolution_prefix] {
                module.process(&mut record, &mut ctx)?;
            }
            let size = record.size(resolution_name)?;
            self.records[index] = Some(RecordState::Partial {
                record,
                applied: self.resolution_prefix,
                rng: ctx.rng,
            });
            Ok(size)
        }
    }

    /// Finish computing the record for one sample, unless it is already
    /// complete. Resumes a partial record at the module it stopped at, with
    /// the per-sample RNG state it had there, so the sample stream is the
    /// same as if the whole chain had run in one go.
    fn ensure_record(&mut self, index: usize) -> Result<(), PipelineError> {
        let (mut record, applied, rng) = match self.records[index].take() {
            Some(RecordState::Ready(record)) => {
                self.records[index] = Some(RecordState::Ready(record));
                return Ok(());
            }
            Some(RecordState::Partial {
                record,
                applied,
                rng,
            }) => (record, applied, rng),
            None => (
                self.base_records[index].clone(),
                0,
                StdRng::seed_from_u64(sample_seed(self.base_seed, self.epoch, index)),
            ),
        };
        let mut ctx = ModuleContext {
            epoch: self.epoch,
            sample_index: index,
            rng,
            device: self.device.clone(),
        };

        if applied == 0 {
            // Fresh record: with a cache this is a reload of what
            // `start_epoch` stored, falling back to recomputation when a
            // cache entry vanished mid-epoch.
            let cached = match &self.cache {
                Some(cache) => cache.try_load(index, &mut record)?,
                None => false,
            };
            if !cached {
                for module in &self.pre_cache {
                    module.process(&mut record, &mut ctx)?;
                }
                if let Some(cache) = &mut self.cache {
                    cache.store(index, &record)?;
                }
            }
        } else {
            for module in &self.pre_cache[applied..] {
                module.process(&mut record, &mut ctx)?;
            }
        }
        for module in &self.post_cache {
            module.process(&mut record, &mut ctx)?;
        }
        for module in &self.debug {
            module.process(&mut record, &mut ctx)?;
        }

        self.records[index] = Some(RecordState::Ready(record));
        Ok(())
    }
}

fn validate_dataflow(
    source: &dyn SourceModule,
    pre_cache: &[Box<dyn MapModule>],
    cache: Option<&DiskCache>,
    post_cache: &[Box<dyn MapModule>],
    sorter: &AspectBatchSorting,
    output: &OutputModule,
    debug: &[Box<dyn MapModule>],
) -> Result<(), PipelineError> {
    let mut available: Vec<String> = source.outputs();

    let mut check = |module: &dyn PipelineModule,
                     available: &mut Vec<String>|
     -> Result<(), PipelineError> {
        for input in module.inputs() {
            if !available.contains(&input) {
                return Err(PipelineError::UnsatisfiedInput {
                    module: module.name().to_string(),
                    field: input,
                });
            }
        }
        for out in module.outputs() {
            if !available.contains(&out) {
                available.push(out);
            }
        }
        Ok(())
    };

    for module in pre_cache {
        check(module.as_ref(), &mut available)?;
    }
    if let Some(cache) = cache {
        check(cache, &mut available)?;
    }
    for module in post_cache {
        check(module.as_ref(), &mut available)?;
    }
    check(sorter, &mut available)?;
    check(output, &mut available)?;
    for module in debug {
        check(module.as_ref(), &mut available)?;
    }
    Ok(())
}

/// Epoch-aware batch iteration for the trainer, resuming at the batch offset
/// recorded in the train progress.
pub struct TrainDataLoader {
    pipeline: DataPipeline,
    batch_size: usize,
    cursor: usize,
}

impl TrainDataLoader {
    pub fn new(pipeline: DataPipeline, batch_size: usize) -> Self {
        Self {
            pipeline,
            batch_size,
            cursor: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batch_count(&self) -> usize {
        self.pipeline.batch_count()
    }

    /// Start (or resume) the epoch recorded in `progress`. A nonzero
    /// `epoch_sample` skips the batches that were already consumed before the
    /// interruption.
    pub fn start_epoch(&mut self, progress: &TrainProgress) -> Result<(), PipelineError> {
        self.pipeline.start_epoch(progress.epoch, self.batch_size)?;
        self.cursor = progress.epoch_sample / self.batch_size;
        Ok(())
    }

    pub fn next_batch(&mut self) -> Option<Result<Batch, PipelineError>> {
        while self.cursor < self.pipeline.batch_count() {
            let result = self.pipeline.batch(self.cursor);
            self.cursor += 1;
            match result {
                Ok(Some(batch)) => return Some(Ok(batch)),
                // The whole batch fell away; move on to the next one.
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }
}
