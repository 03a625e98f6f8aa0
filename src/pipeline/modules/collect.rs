//! Concept enumeration: walk concept directories and derive per-sample paths.

use once_cell::sync::Lazy;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Concept;
use crate::pipeline::{
    MapModule, ModuleContext, PipelineError, PipelineModule, SampleRecord, SourceModule, Value,
};

static SUPPORTED_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    ["bmp", "jpg", "jpeg", "png", "tif", "tiff", "webp"]
        .into_iter()
        .collect()
});

/// Source module: one skeleton record per discovered image, carrying
/// `image_path`, `concept` and the concept's masking flag. Mask label files
/// are excluded from the walk.
pub struct CollectPaths {
    concepts: Vec<Concept>,
    exclude_postfixes: Vec<String>,
}

impl CollectPaths {
    pub fn new(concepts: Vec<Concept>) -> Self {
        Self {
            concepts,
            exclude_postfixes: vec!["-masklabel".to_string()],
        }
    }

    fn walk(&self, dir: &Path, recurse: bool, out: &mut Vec<PathBuf>) -> Result<(), PipelineError> {
        let entries = fs::read_dir(dir).map_err(|source| PipelineError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| PipelineError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                if recurse {
                    self.walk(&path, recurse, out)?;
                }
                continue;
            }
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase());
            let supported = ext
                .as_deref()
                .map(|e| SUPPORTED_EXTENSIONS.contains(e))
                .unwrap_or(false);
            if !supported {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            if self.exclude_postfixes.iter().any(|p| stem.ends_with(p)) {
                continue;
            }
            out.push(path);
        }
        Ok(())
    }
}

impl PipelineModule for CollectPaths {
    fn name(&self) -> &'static str {
        "CollectPaths"
    }

    fn inputs(&self) -> Vec<String> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<String> {
        vec![
            "image_path".into(),
            "concept".into(),
            "concept_masking".into(),
        ]
    }
}

impl SourceModule for CollectPaths {
    fn enumerate(&self) -> Result<Vec<SampleRecord>, PipelineError> {
        // Concepts walk in parallel; order stays deterministic because the
        // per-concept results are sorted and concatenated in concept order.
        let per_concept: Vec<Result<Vec<SampleRecord>, PipelineError>> = self
            .concepts
            .par_iter()
            .map(|concept| {
                let mut paths = Vec::new();
                self.walk(&concept.path, concept.include_subdirectories, &mut paths)?;
                paths.sort();
                Ok(paths
                    .into_iter()
                    .map(|path| {
                        let mut record = SampleRecord::new();
                        record.insert("image_path", Value::Path(path));
                        record.insert("concept", Value::Text(concept.name.clone()));
                        record.insert("concept_masking", Value::Int(concept.enable_masking as i64));
                        record
                    })
                    .collect())
            })
            .collect();

        let mut records = Vec::new();
        for result in per_concept {
            records.extend(result?);
        }
        Ok(records)
    }
}

/// Derives one path from another by replacing the extension and appending a
/// postfix to the stem, e.g. `dog.jpg` -> `dog-masklabel.png`.
///
/// An optional gate field (an int, 0 or 1) turns the module off per record:
/// samples of a concept that opted out of masking simply never get a
/// `mask_path`, and the downstream loader falls back instead.
pub struct ModifyPath {
    in_name: String,
    out_name: String,
    postfix: String,
    extension: String,
    gate_in_name: Option<String>,
}

impl ModifyPath {
    pub fn new(in_name: &str, out_name: &str, postfix: &str, extension: &str) -> Self {
        Self {
            in_name: in_name.to_string(),
            out_name: out_name.to_string(),
            postfix: postfix.to_string(),
            extension: extension.to_string(),
            gate_in_name: None,
        }
    }

    pub fn gated_by(mut self, gate_in_name: &str) -> Self {
        self.gate_in_name = Some(gate_in_name.to_string());
        self
    }
}

impl PipelineModule for ModifyPath {
    fn name(&self) -> &'static str {
        "ModifyPath"
    }

    fn inputs(&self) -> Vec<String> {
        let mut inputs = vec![self.in_name.clone()];
        if let Some(gate) = &self.gate_in_name {
            inputs.push(gate.clone());
        }
        inputs
    }

    fn outputs(&self) -> Vec<String> {
        vec![self.out_name.clone()]
    }
}

impl MapModule for ModifyPath {
    fn process(
        &self,
        record: &mut SampleRecord,
        _ctx: &mut ModuleContext,
    ) -> Result<(), PipelineError> {
        if let Some(gate) = &self.gate_in_name {
            if record.int(gate)? == 0 {
                return Ok(());
            }
        }
        let path = record.path(&self.in_name)?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| PipelineError::Config(format!("path {path:?} has no stem")))?;
        let file_name = format!("{}{}{}", stem, self.postfix, self.extension);
        let derived = path.with_file_name(file_name);
        record.insert(self.out_name.clone(), Value::Path(derived));
        Ok(())
    }
}
