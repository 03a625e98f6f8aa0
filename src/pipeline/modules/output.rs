use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};

use crate::pipeline::{Batch, BatchValue, PipelineError, PipelineModule, SampleRecord, Value};

/// Groups samples by crop resolution and emits shuffled full batches, so that
/// every batch stacks tensors of a single shape. Incomplete trailing groups
/// are dropped for the epoch; their samples come back next epoch under a
/// different shuffle.
pub struct AspectBatchSorting {
    resolution_in_name: String,
}

impl AspectBatchSorting {
    pub fn new(resolution_in_name: &str) -> Self {
        Self {
            resolution_in_name: resolution_in_name.to_string(),
        }
    }

    pub fn resolution_in_name(&self) -> &str {
        &self.resolution_in_name
    }

    /// Batch composition for one epoch. `resolutions` pairs each sample index
    /// with its crop resolution; the rng decides intra-group order and the
    /// final interleaving of batches across groups.
    pub fn sort(
        &self,
        resolutions: &[(usize, (usize, usize))],
        batch_size: usize,
        rng: &mut StdRng,
    ) -> Vec<Vec<usize>> {
        // BTreeMap keeps group iteration order independent of hash state.
        let mut groups: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
        for (index, resolution) in resolutions {
            groups.entry(*resolution).or_default().push(*index);
        }

        let mut batches: Vec<Vec<usize>> = Vec::new();
        for indices in groups.values_mut() {
            indices.shuffle(rng);
            for chunk in indices.chunks(batch_size) {
                if chunk.len() == batch_size {
                    batches.push(chunk.to_vec());
                }
            }
        }
        batches.shuffle(rng);
        batches
    }
}

impl PipelineModule for AspectBatchSorting {
    fn name(&self) -> &'static str {
        "AspectBatchSorting"
    }

    fn inputs(&self) -> Vec<String> {
        vec![self.resolution_in_name.clone()]
    }

    fn outputs(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Terminal stage: whitelists the fields the trainer consumes and collates
/// per-sample records into batch tensors.
pub struct OutputModule {
    names: Vec<String>,
}

impl OutputModule {
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn collate(&self, records: &[&SampleRecord]) -> Result<Batch, PipelineError> {
        if records.is_empty() {
            return Err(PipelineError::Config("cannot collate an empty batch".into()));
        }
        let mut fields: HashMap<String, BatchValue> = HashMap::new();
        for name in &self.names {
            let value = match records[0].get(name)? {
                Value::Tensor(_) => {
                    let tensors = records
                        .iter()
                        .map(|r| r.tensor(name).cloned())
                        .collect::<Result<Vec<_>, _>>()?;
                    BatchValue::Tensor(Tensor::stack(&tensors, 0)?)
                }
                Value::Path(_) => {
                    let paths = records
                        .iter()
                        .map(|r| r.path(name).cloned())
                        .collect::<Result<Vec<_>, _>>()?;
                    BatchValue::Paths(paths)
                }
                Value::Text(_) => {
                    let texts = records
                        .iter()
                        .map(|r| r.text(name).map(str::to_string))
                        .collect::<Result<Vec<_>, _>>()?;
                    BatchValue::Texts(texts)
                }
                other => {
                    return Err(PipelineError::Config(format!(
                        "output field {name:?} has non-collatable type {}",
                        other.type_name()
                    )))
                }
            };
            fields.insert(name.clone(), value);
        }
        Ok(Batch::new(fields, records.len()))
    }
}

impl PipelineModule for OutputModule {
    fn name(&self) -> &'static str {
        "OutputModule"
    }

    fn inputs(&self) -> Vec<String> {
        self.names.clone()
    }

    fn outputs(&self) -> Vec<String> {
        Vec::new()
    }
}
