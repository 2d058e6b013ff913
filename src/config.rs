//! Configuration types for nano-batch.
//!
//! A [`ModelConfig`] is the static description of one deployed model as the
//! model repository hands it over: batch limits, instance count, expected
//! inputs and at most one batching block. It deserializes from JSON with
//! `serde_json`; every optional field has a default.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::policy::QueuePolicy;
use crate::core::request::InferenceRequest;
use crate::error::{Error, Result};

/// Model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name, used for thread names and logs.
    pub name: String,
    /// Maximum batch size (0 = the model does not support batching).
    #[serde(default)]
    pub max_batch_size: usize,
    /// Number of execution instances, each with its own worker.
    #[serde(default = "default_instance_count")]
    pub instance_count: usize,
    /// Expected inputs; requests are validated against these when forming batches.
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    /// Dynamic batching for stateless requests.
    #[serde(default)]
    pub dynamic_batching: Option<DynamicBatchingConfig>,
    /// Sequence batching for stateful requests.
    #[serde(default)]
    pub sequence_batching: Option<SequenceBatchingConfig>,
}

fn default_instance_count() -> usize {
    1
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "model".to_string(),
            max_batch_size: 8,
            instance_count: 1,
            inputs: Vec::new(),
            dynamic_batching: Some(DynamicBatchingConfig::default()),
            sequence_batching: None,
        }
    }
}

impl ModelConfig {
    /// Parse a model configuration from a JSON string and validate it.
    ///
    /// # Example
    ///
    /// ```
    /// use nano_batch::ModelConfig;
    ///
    /// let config = ModelConfig::from_json_str(
    ///     r#"{
    ///         "name": "resnet",
    ///         "max_batch_size": 8,
    ///         "dynamic_batching": { "preferred_batch_size": [4, 8] }
    ///     }"#,
    /// )
    /// .unwrap();
    /// assert_eq!(config.preferred_batch_size(), 8);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a model configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Effective batch size limit; a non-batching model executes one request at a time.
    pub fn effective_max_batch_size(&self) -> usize {
        self.max_batch_size.max(1)
    }

    /// The batch size the dynamic batcher aims for.
    ///
    /// This is the largest preferred size not above the max batch size, or the
    /// max batch size itself when no preferred size is configured.
    pub fn preferred_batch_size(&self) -> usize {
        let max = self.effective_max_batch_size();
        self.dynamic_batching
            .as_ref()
            .and_then(|db| {
                db.preferred_batch_size
                    .iter()
                    .copied()
                    .filter(|&size| size <= max)
                    .max()
            })
            .unwrap_or(max)
    }

    /// Look up the declared input with the given name.
    pub fn input(&self, name: &str) -> Option<&InputConfig> {
        self.inputs.iter().find(|input| input.name == name)
    }

    /// Check the configuration for contradictions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("model name must not be empty".into()));
        }
        if self.instance_count == 0 {
            return Err(Error::Config(format!(
                "model '{}': instance_count must be at least 1",
                self.name
            )));
        }
        if self.dynamic_batching.is_some() && self.sequence_batching.is_some() {
            return Err(Error::Config(format!(
                "model '{}': dynamic_batching and sequence_batching are mutually exclusive",
                self.name
            )));
        }
        for input in &self.inputs {
            if input.dims.iter().any(|&d| d == 0 || d < -1) {
                return Err(Error::Config(format!(
                    "model '{}': input '{}' has invalid dims {:?}",
                    self.name, input.name, input.dims
                )));
            }
        }
        if let Some(db) = &self.dynamic_batching {
            db.validate(self)?;
        }
        if let Some(sb) = &self.sequence_batching {
            sb.validate(self)?;
        }
        Ok(())
    }
}

/// One expected input tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Input name.
    pub name: String,
    /// Per-request shape, without the batch dimension; `-1` matches any extent.
    pub dims: Vec<i64>,
}

impl InputConfig {
    /// Check a concrete shape against the declared dims.
    pub fn accepts(&self, shape: &[usize]) -> bool {
        shape.len() == self.dims.len()
            && self
                .dims
                .iter()
                .zip(shape)
                .all(|(&want, &got)| want == -1 || want as usize == got)
    }
}

/// Check a request's inputs against the declared inputs.
///
/// An empty declaration accepts any request. Otherwise every declared input
/// must be present with an accepted shape and nothing else may be sent.
pub fn check_inputs(
    declared: &[InputConfig],
    request: &InferenceRequest,
) -> std::result::Result<(), String> {
    if declared.is_empty() {
        return Ok(());
    }
    for input in declared {
        let tensor = request
            .input(&input.name)
            .ok_or_else(|| format!("missing input '{}'", input.name))?;
        if !input.accepts(tensor.dims()) {
            return Err(format!(
                "input '{}' has shape {:?}, expected {:?}",
                input.name,
                tensor.dims(),
                input.dims
            ));
        }
    }
    if let Some(extra) = request
        .inputs()
        .iter()
        .find(|sent| !declared.iter().any(|input| input.name == sent.name))
    {
        return Err(format!("unexpected input '{}'", extra.name));
    }
    Ok(())
}

/// Dynamic batching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicBatchingConfig {
    /// Batch sizes the backend executes most efficiently.
    #[serde(default)]
    pub preferred_batch_size: Vec<usize>,
    /// Longest time a request may wait for a batch to fill.
    #[serde(default, alias = "max_queue_delay_microseconds")]
    pub max_queue_delay_micros: u64,
    /// Number of priority levels (0 or 1 = a single level). Level 1 is the highest.
    #[serde(default)]
    pub priority_levels: u32,
    /// Level assigned to requests that carry no priority.
    #[serde(default)]
    pub default_priority_level: u32,
    /// Policy for levels without an explicit entry.
    #[serde(default)]
    pub default_queue_policy: QueuePolicy,
    /// Per-level policy overrides, keyed by level.
    #[serde(default)]
    pub priority_queue_policy: BTreeMap<u32, QueuePolicy>,
    /// Whether an expired `DELAY` request on any level closes the forming batch.
    ///
    /// When false, only the highest pending level can force closure; expired
    /// requests further down still ride along in the next batch that closes.
    #[serde(default)]
    pub delay_closes_across_levels: bool,
}

impl Default for DynamicBatchingConfig {
    fn default() -> Self {
        Self {
            preferred_batch_size: Vec::new(),
            max_queue_delay_micros: 100,
            priority_levels: 0,
            default_priority_level: 0,
            default_queue_policy: QueuePolicy::default(),
            priority_queue_policy: BTreeMap::new(),
            delay_closes_across_levels: false,
        }
    }
}

impl DynamicBatchingConfig {
    /// Queue layout described by this block.
    pub fn queue_layout(&self) -> QueueLayout {
        QueueLayout {
            levels: self.priority_levels.max(1),
            default_level: self.default_priority_level.max(1),
            default_policy: self.default_queue_policy.clone(),
            level_policies: self.priority_queue_policy.clone(),
        }
    }

    fn validate(&self, model: &ModelConfig) -> Result<()> {
        if model.max_batch_size == 0 && !self.preferred_batch_size.is_empty() {
            return Err(Error::Config(format!(
                "model '{}': preferred_batch_size requires max_batch_size > 0",
                model.name
            )));
        }
        for &size in &self.preferred_batch_size {
            if size == 0 || size > model.effective_max_batch_size() {
                return Err(Error::Config(format!(
                    "model '{}': preferred batch size {} outside 1..={}",
                    model.name,
                    size,
                    model.effective_max_batch_size()
                )));
            }
        }
        if self.priority_levels > 1
            && (self.default_priority_level == 0
                || self.default_priority_level > self.priority_levels)
        {
            return Err(Error::Config(format!(
                "model '{}': default_priority_level {} outside 1..={}",
                model.name, self.default_priority_level, self.priority_levels
            )));
        }
        let levels = self.priority_levels.max(1);
        if let Some(level) = self
            .priority_queue_policy
            .keys()
            .find(|&&level| level == 0 || level > levels)
        {
            return Err(Error::Config(format!(
                "model '{}': queue policy for unknown priority level {}",
                model.name, level
            )));
        }
        Ok(())
    }
}

/// Sequence batching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceBatchingConfig {
    /// Slots per instance, i.e. sequences each instance can hold at once.
    pub max_candidate_sequences: usize,
    /// Idle time after which a sequence's slot is reclaimed (0 = never).
    #[serde(default)]
    pub max_sequence_idle_microseconds: u64,
    /// Whether a new sequence waits for a slot (true) or is rejected (false).
    #[serde(default = "default_blocking")]
    pub blocking: bool,
    /// Names of the control signals handed to the backend.
    #[serde(default)]
    pub control_input: ControlInputConfig,
    /// Policy for sequence requests, including the slot backlog.
    #[serde(default)]
    pub queue_policy: QueuePolicy,
    /// How long a timed-out correlation id keeps answering `SEQUENCE_TIMEOUT`
    /// before it is forgotten and treated as unknown.
    #[serde(default = "default_timed_out_retention")]
    pub timed_out_retention_microseconds: u64,
}

fn default_blocking() -> bool {
    true
}

fn default_timed_out_retention() -> u64 {
    60_000_000
}

impl Default for SequenceBatchingConfig {
    fn default() -> Self {
        Self {
            max_candidate_sequences: 4,
            max_sequence_idle_microseconds: 0,
            blocking: true,
            control_input: ControlInputConfig::default(),
            queue_policy: QueuePolicy::default(),
            timed_out_retention_microseconds: default_timed_out_retention(),
        }
    }
}

impl SequenceBatchingConfig {
    fn validate(&self, model: &ModelConfig) -> Result<()> {
        if self.max_candidate_sequences == 0 {
            return Err(Error::Config(format!(
                "model '{}': max_candidate_sequences must be at least 1",
                model.name
            )));
        }
        if self.max_candidate_sequences > model.effective_max_batch_size() {
            return Err(Error::Config(format!(
                "model '{}': {} sequence slots exceed max batch size {}",
                model.name,
                self.max_candidate_sequences,
                model.effective_max_batch_size()
            )));
        }
        Ok(())
    }
}

/// Names used for the per-slot control signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlInputConfig {
    pub start: String,
    pub end: String,
    pub ready: String,
    pub correlation_id: String,
}

impl Default for ControlInputConfig {
    fn default() -> Self {
        Self {
            start: "START".to_string(),
            end: "END".to_string(),
            ready: "READY".to_string(),
            correlation_id: "CORRID".to_string(),
        }
    }
}

/// Shape of a set of priority queues.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueLayout {
    /// Number of levels, at least one.
    pub levels: u32,
    /// Level used for requests without a valid priority.
    pub default_level: u32,
    /// Policy for levels without an override.
    pub default_policy: QueuePolicy,
    /// Per-level overrides.
    pub level_policies: BTreeMap<u32, QueuePolicy>,
}

impl QueueLayout {
    /// A single FIFO level governed by `policy`.
    pub fn single(policy: QueuePolicy) -> Self {
        Self {
            levels: 1,
            default_level: 1,
            default_policy: policy,
            level_policies: BTreeMap::new(),
        }
    }

    /// Policy governing `level` (1-based).
    pub fn policy_for(&self, level: u32) -> &QueuePolicy {
        self.level_policies
            .get(&level)
            .unwrap_or(&self.default_policy)
    }
}

impl Default for QueueLayout {
    fn default() -> Self {
        Self::single(QueuePolicy::default())
    }
}
