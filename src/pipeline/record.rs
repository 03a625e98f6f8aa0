//! The per-sample record that flows through the pipeline, and the batch type
//! handed to the trainer.

use candle_core::Tensor;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;

use super::PipelineError;
use crate::model::LatentDistribution;

/// A value stored under a named field of a sample record.
#[derive(Debug, Clone)]
pub enum Value {
    Tensor(Tensor),
    Distribution(LatentDistribution),
    Path(PathBuf),
    Text(String),
    Int(i64),
    /// A (width, height) pair, used for resolutions.
    Size(usize, usize),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "tensor",
            Value::Distribution(_) => "distribution",
            Value::Path(_) => "path",
            Value::Text(_) => "text",
            Value::Int(_) => "int",
            Value::Size(..) => "size",
        }
    }

    /// JSON form for aggregate cache fields. Tensor-typed values are split
    /// fields and never go through here.
    pub fn to_json(&self) -> Result<serde_json::Value, PipelineError> {
        match self {
            Value::Path(p) => Ok(json!({ "path": p.to_string_lossy() })),
            Value::Text(s) => Ok(json!({ "text": s })),
            Value::Int(i) => Ok(json!({ "int": i })),
            Value::Size(w, h) => Ok(json!({ "size": [w, h] })),
            Value::Tensor(_) | Value::Distribution(_) => {
                Err(PipelineError::NotAggregatable)
            }
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, PipelineError> {
        if let Some(p) = value.get("path").and_then(|v| v.as_str()) {
            return Ok(Value::Path(PathBuf::from(p)));
        }
        if let Some(s) = value.get("text").and_then(|v| v.as_str()) {
            return Ok(Value::Text(s.to_string()));
        }
        if let Some(i) = value.get("int").and_then(|v| v.as_i64()) {
            return Ok(Value::Int(i));
        }
        if let Some(size) = value.get("size").and_then(|v| v.as_array()) {
            if let (Some(w), Some(h)) = (
                size.first().and_then(|v| v.as_u64()),
                size.get(1).and_then(|v| v.as_u64()),
            ) {
                return Ok(Value::Size(w as usize, h as usize));
            }
        }
        Err(PipelineError::CorruptCacheEntry)
    }
}

/// Mutable field map for one data item while it flows through the stages.
#[derive(Debug, Clone, Default)]
pub struct SampleRecord {
    fields: HashMap<String, Value>,
}

impl SampleRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&Value, PipelineError> {
        self.fields
            .get(name)
            .ok_or_else(|| PipelineError::MissingField(name.to_string()))
    }

    pub fn tensor(&self, name: &str) -> Result<&Tensor, PipelineError> {
        match self.get(name)? {
            Value::Tensor(t) => Ok(t),
            _ => Err(PipelineError::WrongFieldType(name.to_string())),
        }
    }

    pub fn distribution(&self, name: &str) -> Result<&LatentDistribution, PipelineError> {
        match self.get(name)? {
            Value::Distribution(d) => Ok(d),
            _ => Err(PipelineError::WrongFieldType(name.to_string())),
        }
    }

    pub fn path(&self, name: &str) -> Result<&PathBuf, PipelineError> {
        match self.get(name)? {
            Value::Path(p) => Ok(p),
            _ => Err(PipelineError::WrongFieldType(name.to_string())),
        }
    }

    pub fn text(&self, name: &str) -> Result<&str, PipelineError> {
        match self.get(name)? {
            Value::Text(s) => Ok(s),
            _ => Err(PipelineError::WrongFieldType(name.to_string())),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, PipelineError> {
        match self.get(name)? {
            Value::Int(i) => Ok(*i),
            _ => Err(PipelineError::WrongFieldType(name.to_string())),
        }
    }

    pub fn size(&self, name: &str) -> Result<(usize, usize), PipelineError> {
        match self.get(name)? {
            Value::Size(w, h) => Ok((*w, *h)),
            _ => Err(PipelineError::WrongFieldType(name.to_string())),
        }
    }
}

/// One field of an emitted batch.
#[derive(Debug, Clone)]
pub enum BatchValue {
    /// Per-sample tensors stacked along a new leading batch axis.
    Tensor(Tensor),
    Paths(Vec<PathBuf>),
    Texts(Vec<String>),
}

/// An emitted batch: the configured output fields, uniform shape within each
/// tensor field.
#[derive(Debug, Clone)]
pub struct Batch {
    fields: HashMap<String, BatchValue>,
    len: usize,
}

impl Batch {
    pub fn new(fields: HashMap<String, BatchValue>, len: usize) -> Self {
        Self { fields, len }
    }

    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(|s| s.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn tensor(&self, name: &str) -> Result<&Tensor, PipelineError> {
        match self.fields.get(name) {
            Some(BatchValue::Tensor(t)) => Ok(t),
            Some(_) => Err(PipelineError::WrongFieldType(name.to_string())),
            None => Err(PipelineError::MissingField(name.to_string())),
        }
    }

    pub fn paths(&self, name: &str) -> Result<&[PathBuf], PipelineError> {
        match self.fields.get(name) {
            Some(BatchValue::Paths(p)) => Ok(p),
            Some(_) => Err(PipelineError::WrongFieldType(name.to_string())),
            None => Err(PipelineError::MissingField(name.to_string())),
        }
    }

    pub fn texts(&self, name: &str) -> Result<&[String], PipelineError> {
        match self.fields.get(name) {
            Some(BatchValue::Texts(t)) => Ok(t),
            Some(_) => Err(PipelineError::WrongFieldType(name.to_string())),
            None => Err(PipelineError::MissingField(name.to_string())),
        }
    }
}
