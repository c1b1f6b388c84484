//! Backend descriptors and orchestrator configuration.
//!
//! Configuration is read once at process start. Files may be TOML, YAML or
//! JSON (detected from the extension); `${VAR}` / `$VAR` references are
//! substituted before parsing, and `SATYA_*` environment variables override
//! top-level keys (`__` separates nested keys).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, InferenceResult};

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "SATYA";

const DEFAULT_CONFIDENCE_FLOOR: f64 = 0.1;

// ============================================================================
// Capability and tier
// ============================================================================

/// What a backend can be asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Answer,
    Hints,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Answer => write!(f, "answer"),
            Self::Hints => write!(f, "hints"),
        }
    }
}

/// Position of a backend in the escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Cheap backend tried first
    Primary,
    /// Heavier backend tried only after the primary is rejected
    Fallback,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// The closed set of adapter variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Span selection over the context (short-form variant)
    #[serde(rename = "extractive")]
    Extractive,
    /// Short templated completion (short-form variant)
    #[serde(rename = "seq2seq")]
    Seq2Seq,
    /// Larger autoregressive model over a GGUF artifact (long-form variant)
    #[serde(rename = "generative")]
    Generative,
}

impl BackendKind {
    pub fn is_short_form(&self) -> bool {
        matches!(self, Self::Extractive | Self::Seq2Seq)
    }

    fn default_tasks(&self) -> Vec<Task> {
        match self {
            Self::Extractive => vec![Task::Answer],
            Self::Seq2Seq => vec![Task::Hints],
            Self::Generative => vec![Task::Answer, Task::Hints],
        }
    }

    fn default_tier(&self) -> Tier {
        match self {
            Self::Generative => Tier::Fallback,
            Self::Extractive | Self::Seq2Seq => Tier::Primary,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Extractive => write!(f, "extractive"),
            Self::Seq2Seq => write!(f, "seq2seq"),
            Self::Generative => write!(f, "generative"),
        }
    }
}

// ============================================================================
// Generation parameters
// ============================================================================

/// Sampling and length bounds for one generate call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Hard upper bound on generated tokens; guarantees termination
    pub max_tokens: usize,
    /// Sampling temperature (0.0 = greedy)
    pub temperature: f32,
    /// Top-p nucleus sampling threshold
    pub top_p: f32,
    /// Generation stops at the first of these markers
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            stop: Vec::new(),
        }
    }
}

impl GenerationParams {
    pub fn new(max_tokens: usize) -> Result<Self, &'static str> {
        if max_tokens == 0 {
            return Err("max_tokens must be > 0");
        }
        Ok(Self {
            max_tokens,
            ..Default::default()
        })
    }

    /// Set sampling temperature
    pub fn with_temperature(mut self, temp: f32) -> Result<Self, &'static str> {
        if !(0.0..=2.0).contains(&temp) {
            return Err("temperature must be between 0.0 and 2.0");
        }
        self.temperature = temp;
        Ok(self)
    }

    /// Set the nucleus threshold
    pub fn with_top_p(mut self, top_p: f32) -> Result<Self, &'static str> {
        if !(top_p > 0.0 && top_p <= 1.0) {
            return Err("top_p must be in (0.0, 1.0]");
        }
        self.top_p = top_p;
        Ok(self)
    }

    pub fn with_stop<I, S>(mut self, stop: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop = stop.into_iter().map(Into::into).collect();
        self
    }

    /// Parameters for the adapter's single internal retry: same bounds,
    /// cooler sampling.
    pub fn simplified(&self) -> Self {
        Self {
            temperature: (self.temperature * 0.7).min(0.5),
            ..self.clone()
        }
    }

    /// Copy with `max_tokens` lowered to `limit` if it is larger.
    pub fn capped(&self, limit: usize) -> Self {
        Self {
            max_tokens: self.max_tokens.min(limit.max(1)),
            ..self.clone()
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_tokens == 0 {
            return Err("max_tokens must be > 0".into());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!(
                "temperature {} must be between 0.0 and 2.0",
                self.temperature
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(format!("top_p {} must be in (0.0, 1.0]", self.top_p));
        }
        Ok(())
    }
}

// ============================================================================
// Backend descriptor
// ============================================================================

/// Static description of one model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Unique backend identifier (e.g. "qna", "phi2")
    pub id: String,
    /// Human-readable model name
    #[serde(default)]
    pub name: String,
    /// Version tag reported by diagnostics
    #[serde(default = "default_version")]
    pub version: String,
    pub kind: BackendKind,
    /// Tasks this backend can serve
    pub tasks: Vec<Task>,
    pub tier: Tier,
    /// Declared resident footprint, used for budget admission
    pub footprint_mb: u64,
    /// Model directory, or the GGUF file itself for generative backends
    pub artifact_path: PathBuf,
    /// Quantization label (e.g. "q4_k_m"), diagnostics only
    #[serde(default)]
    pub quantization: Option<String>,
    /// Inference threads; host default when unset
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Context window in tokens
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Upper bound on a single runtime invocation
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// External runtime executable (generative backends)
    #[serde(default)]
    pub runtime_binary: Option<PathBuf>,
    /// Default generation parameters
    #[serde(default)]
    pub params: GenerationParams,
    /// Overrides `params` for hint generation
    #[serde(default)]
    pub hint_params: Option<GenerationParams>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_batch_size() -> usize {
    512
}

fn default_context_window() -> usize {
    2048
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_confidence_floor() -> f64 {
    DEFAULT_CONFIDENCE_FLOOR
}

impl BackendDescriptor {
    /// Descriptor with kind-appropriate defaults for tasks, tier and footprint.
    pub fn new(id: impl Into<String>, kind: BackendKind, artifact_path: impl Into<PathBuf>) -> Self {
        let id = id.into();
        let (footprint_mb, context_window) = match kind {
            BackendKind::Extractive => (300, 512),
            BackendKind::Seq2Seq => (300, 512),
            BackendKind::Generative => (2000, 2048),
        };
        Self {
            name: id.clone(),
            id,
            version: default_version(),
            kind,
            tasks: kind.default_tasks(),
            tier: kind.default_tier(),
            footprint_mb,
            artifact_path: artifact_path.into(),
            quantization: None,
            threads: None,
            batch_size: default_batch_size(),
            context_window,
            timeout_secs: default_timeout_secs(),
            runtime_binary: None,
            params: GenerationParams::default(),
            hint_params: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.tasks = tasks.into_iter().collect();
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_footprint_mb(mut self, footprint_mb: u64) -> Self {
        self.footprint_mb = footprint_mb;
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_hint_params(mut self, params: GenerationParams) -> Self {
        self.hint_params = Some(params);
        self
    }

    pub fn with_quantization(mut self, quantization: impl Into<String>) -> Self {
        self.quantization = Some(quantization.into());
        self
    }

    pub fn with_runtime_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.runtime_binary = Some(binary.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set number of CPU threads
    pub fn with_threads(mut self, threads: usize) -> Result<Self, &'static str> {
        if threads == 0 {
            return Err("threads must be > 0");
        }
        self.threads = Some(threads);
        Ok(self)
    }

    pub fn supports(&self, task: Task) -> bool {
        self.tasks.contains(&task)
    }

    /// Default parameters for `task`.
    pub fn params_for(&self, task: Task) -> &GenerationParams {
        match (task, &self.hint_params) {
            (Task::Hints, Some(hint_params)) => hint_params,
            _ => &self.params,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("backend id must not be empty".into());
        }
        if self.tasks.is_empty() {
            return Err(format!("backend '{}' declares no tasks", self.id));
        }
        if self.kind == BackendKind::Extractive && self.supports(Task::Hints) {
            return Err(format!(
                "backend '{}' is extractive and cannot serve hints",
                self.id
            ));
        }
        if self.timeout_secs == 0 {
            return Err(format!("backend '{}': timeout_secs must be > 0", self.id));
        }
        if self.context_window == 0 || self.batch_size == 0 {
            return Err(format!(
                "backend '{}': context_window and batch_size must be > 0",
                self.id
            ));
        }
        if self.threads == Some(0) {
            return Err(format!("backend '{}': threads must be > 0", self.id));
        }
        self.params
            .validate()
            .map_err(|e| format!("backend '{}' params: {e}", self.id))?;
        if let Some(hint_params) = &self.hint_params {
            hint_params
                .validate()
                .map_err(|e| format!("backend '{}' hint_params: {e}", self.id))?;
        }
        Ok(())
    }
}

// ============================================================================
// Orchestrator configuration
// ============================================================================

/// How many backends may be resident at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidencyPolicy {
    /// Primary and fallback may stay resident together while the budget allows
    #[default]
    Concurrent,
    /// Loading any backend first releases every other resident backend
    SingleResident,
}

impl fmt::Display for ResidencyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concurrent => write!(f, "concurrent"),
            Self::SingleResident => write!(f, "single_resident"),
        }
    }
}

/// Configuration for the `TieredOrchestrator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub backends: Vec<BackendDescriptor>,
    #[serde(default)]
    pub residency: ResidencyPolicy,
    /// Memory budget for resident backends; derived from host RAM when unset
    #[serde(default)]
    pub memory_budget_mb: Option<u64>,
    /// Confidence reported with default (canned) responses
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    /// Escalate primary answers scoring below this value
    #[serde(default)]
    pub answer_min_confidence: Option<f64>,
}

impl OrchestratorConfig {
    pub fn new(backends: Vec<BackendDescriptor>) -> Self {
        Self {
            backends,
            residency: ResidencyPolicy::default(),
            memory_budget_mb: None,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            answer_min_confidence: None,
        }
    }

    /// The stock deployment: an extractive QA model and a seq2seq hint model
    /// as primaries, and a quantized GGUF model as the shared fallback.
    ///
    /// ```text
    /// <models_dir>/qna   extractive   answer   primary
    /// <models_dir>/hint  seq2seq      hints    primary
    /// <models_dir>/phi2  generative   both     fallback
    /// ```
    pub fn default_layout(models_dir: impl AsRef<Path>) -> Self {
        let root = models_dir.as_ref();

        let qna = BackendDescriptor::new("qna", BackendKind::Extractive, root.join("qna"))
            .with_name("DistilBERT QnA")
            .with_footprint_mb(260)
            .with_params(GenerationParams {
                max_tokens: 64,
                temperature: 0.0,
                top_p: 1.0,
                stop: Vec::new(),
            });

        let hint = BackendDescriptor::new("hint", BackendKind::Seq2Seq, root.join("hint"))
            .with_name("T5-small Hint")
            .with_footprint_mb(240)
            .with_params(GenerationParams {
                max_tokens: 64,
                temperature: 0.0,
                top_p: 1.0,
                stop: Vec::new(),
            });

        let phi2 = BackendDescriptor::new("phi2", BackendKind::Generative, root.join("phi2"))
            .with_name("Phi-2")
            .with_quantization("q4_k_m")
            .with_footprint_mb(1800)
            .with_params(
                GenerationParams {
                    max_tokens: 150,
                    temperature: 0.7,
                    top_p: 0.9,
                    stop: Vec::new(),
                }
                .with_stop(["\n\n", "###"]),
            )
            .with_hint_params(
                GenerationParams {
                    max_tokens: 200,
                    temperature: 0.85,
                    top_p: 0.95,
                    stop: Vec::new(),
                }
                .with_stop(["\n4", "###"]),
            );

        Self::new(vec![qna, hint, phi2])
    }

    pub fn with_residency(mut self, residency: ResidencyPolicy) -> Self {
        self.residency = residency;
        self
    }

    pub fn with_memory_budget_mb(mut self, budget_mb: u64) -> Self {
        self.memory_budget_mb = Some(budget_mb);
        self
    }

    pub fn with_confidence_floor(mut self, floor: f64) -> Self {
        self.confidence_floor = floor;
        self
    }

    pub fn with_answer_min_confidence(mut self, threshold: f64) -> Self {
        self.answer_min_confidence = Some(threshold);
        self
    }

    /// Load, substitute, apply `SATYA_*` overrides and validate.
    pub fn from_file(path: impl AsRef<Path>) -> InferenceResult<Self> {
        let path = path.as_ref();
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| {
            InferenceError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::build(&content, format, true)
    }

    /// Parse configuration text in the given format (no environment overrides).
    pub fn from_source(content: &str, format: FileFormat) -> InferenceResult<Self> {
        Self::build(content, format, false)
    }

    fn build(content: &str, format: FileFormat, with_env: bool) -> InferenceResult<Self> {
        let substituted = substitute_env_vars(content);

        let mut builder = Cfg::builder().add_source(File::from_str(&substituted, format));
        if with_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Self = builder
            .build()
            .map_err(|e| InferenceError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| InferenceError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn descriptor(&self, backend_id: &str) -> Option<&BackendDescriptor> {
        self.backends.iter().find(|d| d.id == backend_id)
    }

    pub fn validate(&self) -> InferenceResult<()> {
        if self.backends.is_empty() {
            return Err(InferenceError::Config("no backends configured".into()));
        }

        for (i, descriptor) in self.backends.iter().enumerate() {
            descriptor.validate().map_err(InferenceError::Config)?;

            if self.backends[..i].iter().any(|d| d.id == descriptor.id) {
                return Err(InferenceError::Config(format!(
                    "duplicate backend id '{}'",
                    descriptor.id
                )));
            }

            for task in &descriptor.tasks {
                if let Some(other) = self.backends[..i]
                    .iter()
                    .find(|d| d.tier == descriptor.tier && d.supports(*task))
                {
                    return Err(InferenceError::Config(format!(
                        "backends '{}' and '{}' both claim the {} {} slot",
                        other.id, descriptor.id, descriptor.tier, task
                    )));
                }
            }
        }

        for task in [Task::Answer, Task::Hints] {
            let has_tier = |tier: Tier| {
                self.backends
                    .iter()
                    .any(|d| d.tier == tier && d.supports(task))
            };
            if has_tier(Tier::Fallback) && !has_tier(Tier::Primary) {
                return Err(InferenceError::Config(format!(
                    "{task} has a fallback backend but no primary"
                )));
            }
        }

        if !(0.1..=0.95).contains(&self.confidence_floor) {
            return Err(InferenceError::Config(format!(
                "confidence_floor {} must be within [0.1, 0.95]",
                self.confidence_floor
            )));
        }
        if let Some(threshold) = self.answer_min_confidence {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(InferenceError::Config(format!(
                    "answer_min_confidence {threshold} must be within [0, 1]"
                )));
            }
        }
        if self.memory_budget_mb == Some(0) {
            return Err(InferenceError::Config(
                "memory_budget_mb must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Loading helpers
// ============================================================================

/// Detect configuration format from file extension
pub fn detect_format(path: &Path) -> InferenceResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| InferenceError::Config("no file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        other => Err(InferenceError::Config(format!(
            "unsupported config format: {other}"
        ))),
    }
}

static BRACED_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));
static BARE_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("valid regex"));

/// Substitute `${VAR}` and `$VAR` references with environment values.
///
/// Unknown variables are left untouched.
pub fn substitute_env_vars(content: &str) -> String {
    let braced = BRACED_VAR.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    });

    BARE_VAR
        .replace_all(&braced, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r####"
residency = "single_resident"
memory_budget_mb = 2048

[[backends]]
id = "qna"
kind = "extractive"
tasks = ["answer"]
tier = "primary"
footprint_mb = 260
artifact_path = "/models/qna"

[[backends]]
id = "phi2"
kind = "generative"
tasks = ["answer", "hints"]
tier = "fallback"
footprint_mb = 1800
artifact_path = "/models/phi2"
runtime_binary = "/usr/local/bin/llama-cli"

[backends.params]
max_tokens = 150
temperature = 0.7
top_p = 0.9
stop = ["\n\n", "###"]

[backends.hint_params]
max_tokens = 200
temperature = 0.85
top_p = 0.95

[[backends]]
id = "hint"
kind = "seq2seq"
tasks = ["hints"]
tier = "primary"
footprint_mb = 240
artifact_path = "/models/hint"
"####;

    #[test]
    fn test_default_layout_is_valid() {
        let cfg = OrchestratorConfig::default_layout("/models");
        cfg.validate().unwrap();
        assert_eq!(cfg.backends.len(), 3);
        assert_eq!(cfg.confidence_floor, 0.1);
        assert_eq!(cfg.residency, ResidencyPolicy::Concurrent);

        let phi2 = cfg.descriptor("phi2").unwrap();
        assert_eq!(phi2.tier, Tier::Fallback);
        assert_eq!(phi2.params_for(Task::Answer).max_tokens, 150);
        assert_eq!(phi2.params_for(Task::Hints).max_tokens, 200);
        assert_eq!(phi2.artifact_path, PathBuf::from("/models/phi2"));
    }

    #[test]
    fn test_parse_toml() {
        let cfg = OrchestratorConfig::from_source(SAMPLE, FileFormat::Toml).unwrap();
        assert_eq!(cfg.residency, ResidencyPolicy::SingleResident);
        assert_eq!(cfg.memory_budget_mb, Some(2048));
        assert_eq!(cfg.backends.len(), 3);

        let qna = &cfg.backends[0];
        assert_eq!(qna.kind, BackendKind::Extractive);
        assert_eq!(qna.version, "1.0");
        assert_eq!(qna.params, GenerationParams::default());

        let phi2 = &cfg.backends[1];
        assert_eq!(phi2.params.stop, vec!["\n\n".to_string(), "###".to_string()]);
        assert_eq!(phi2.params_for(Task::Hints).temperature, 0.85);
        assert_eq!(
            phi2.runtime_binary.as_deref(),
            Some(Path::new("/usr/local/bin/llama-cli"))
        );

        let hint = cfg.descriptor("hint").unwrap();
        assert_eq!(hint.kind, BackendKind::Seq2Seq);
        assert_eq!(hint.tier, Tier::Primary);
        assert_eq!(hint.tasks, vec![Task::Hints]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let a = BackendDescriptor::new("qna", BackendKind::Extractive, "/a");
        let b = BackendDescriptor::new("qna", BackendKind::Seq2Seq, "/b");
        let err = OrchestratorConfig::new(vec![a, b]).validate().unwrap_err();
        assert!(err.to_string().contains("duplicate backend id"));
    }

    #[test]
    fn test_extractive_hints_rejected() {
        let a = BackendDescriptor::new("qna", BackendKind::Extractive, "/a")
            .with_tasks([Task::Answer, Task::Hints]);
        assert!(OrchestratorConfig::new(vec![a]).validate().is_err());
    }

    #[test]
    fn test_shared_slot_rejected() {
        let a = BackendDescriptor::new("qna", BackendKind::Extractive, "/a");
        let b = BackendDescriptor::new("t5", BackendKind::Seq2Seq, "/b")
            .with_tasks([Task::Answer]);
        let err = OrchestratorConfig::new(vec![a, b]).validate().unwrap_err();
        assert!(err.to_string().contains("primary answer slot"));
    }

    #[test]
    fn test_fallback_without_primary_rejected() {
        let phi2 = BackendDescriptor::new("phi2", BackendKind::Generative, "/p");
        let err = OrchestratorConfig::new(vec![phi2]).validate().unwrap_err();
        assert!(err.to_string().contains("no primary"));
    }

    #[test]
    fn test_floor_out_of_range_rejected() {
        let cfg = OrchestratorConfig::default_layout("/m").with_confidence_floor(0.0);
        assert!(cfg.validate().is_err());
        let cfg = OrchestratorConfig::default_layout("/m").with_confidence_floor(0.95);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_params_builders() {
        assert!(GenerationParams::new(0).is_err());
        assert!(GenerationParams::new(8).unwrap().with_temperature(3.0).is_err());
        assert!(GenerationParams::new(8).unwrap().with_top_p(0.0).is_err());

        let params = GenerationParams::new(64)
            .unwrap()
            .with_temperature(0.7)
            .unwrap()
            .with_stop(["###"]);
        let retry = params.simplified();
        assert!(retry.temperature < params.temperature);
        assert_eq!(retry.max_tokens, 64);
        assert_eq!(retry.stop, params.stop);
        assert_eq!(params.capped(16).max_tokens, 16);
        assert_eq!(params.capped(1024).max_tokens, 64);
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(Path::new("satya.toml")).unwrap(), FileFormat::Toml);
        assert_eq!(detect_format(Path::new("satya.yml")).unwrap(), FileFormat::Yaml);
        assert_eq!(detect_format(Path::new("satya.json")).unwrap(), FileFormat::Json);
        assert!(detect_format(Path::new("satya.txt")).is_err());
        assert!(detect_format(Path::new("satya")).is_err());
    }

    #[test]
    fn test_substitute_leaves_unknown_vars() {
        let out = substitute_env_vars("path = \"${SATYA_SURELY_UNSET_VAR_42}/qna\"");
        assert_eq!(out, "path = \"${SATYA_SURELY_UNSET_VAR_42}/qna\"");
    }

    #[test]
    fn test_from_file_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("satya.yaml");
        std::fs::write(
            &path,
            r#"
confidence_floor: 0.2
backends:
  - id: hint
    kind: seq2seq
    tasks: [hints]
    tier: primary
    footprint_mb: 240
    artifact_path: /models/hint
"#,
        )
        .unwrap();

        let cfg = OrchestratorConfig::from_file(&path).unwrap();
        assert_eq!(cfg.confidence_floor, 0.2);
        assert_eq!(cfg.backends[0].kind, BackendKind::Seq2Seq);
        assert_eq!(cfg.backends[0].tasks, vec![Task::Hints]);
    }
}
