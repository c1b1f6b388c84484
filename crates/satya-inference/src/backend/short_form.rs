//! Short-form adapter: extractive span models and seq2seq generators.
//!
//! The artifact is a model directory holding a `config.json`. When a
//! compiled graph (`*.onnx`, directly or under `onnx/`) sits next to the
//! model files the loader is offered the compiled path; otherwise the
//! general pipeline. The handle reports the mode the runtime actually
//! runs in, which is the pipeline when no compiled runtime is built.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::info;

use super::prompt::{self, is_effectively_empty};
use super::runtime::{ExecutionMode, ResolvedArtifact, RuntimeLoader, RuntimeOutput};
use super::{as_load_error, generate_with_retry, BackendAdapter, BackendHandle, Cleaned, GENERATIVE_BASE_CONFIDENCE};
use crate::config::{BackendDescriptor, BackendKind, GenerationParams};
use crate::error::{InferenceError, InferenceResult};
use crate::types::{GenerationResult, InferenceRequest, OutputKind};

pub struct ShortFormAdapter {
    descriptor: BackendDescriptor,
    loader: Arc<dyn RuntimeLoader>,
}

impl ShortFormAdapter {
    pub fn new(descriptor: BackendDescriptor, loader: Arc<dyn RuntimeLoader>) -> Self {
        Self { descriptor, loader }
    }
}

#[async_trait]
impl BackendAdapter for ShortFormAdapter {
    fn describe(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn load(&self) -> InferenceResult<BackendHandle> {
        let started = Instant::now();
        let descriptor = self.descriptor.clone();
        let artifact = tokio::task::spawn_blocking(move || inspect_model_dir(&descriptor))
            .await
            .map_err(|e| InferenceError::load(&self.descriptor.id, e.to_string()))??;

        let runtime = self
            .loader
            .load(&self.descriptor, &artifact)
            .await
            .map_err(|e| as_load_error(&self.descriptor.id, e))?;

        let mode = runtime.mode();
        if mode != artifact.mode {
            info!(
                backend = %self.descriptor.id,
                found = %artifact.mode,
                using = %mode,
                "execution mode differs from artifact"
            );
        }
        info!(
            backend = %self.descriptor.id,
            %mode,
            size_mb = artifact.size_bytes / (1024 * 1024),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "short-form backend loaded"
        );

        Ok(BackendHandle {
            backend_id: self.descriptor.id.clone(),
            runtime,
            mode,
            artifact: artifact.path,
            size_bytes: artifact.size_bytes,
            loaded_at: Utc::now(),
        })
    }

    async fn generate(
        &self,
        handle: &BackendHandle,
        request: &InferenceRequest,
        params: &GenerationParams,
    ) -> InferenceResult<GenerationResult> {
        let kind = self.descriptor.kind;
        generate_with_retry(
            &self.descriptor,
            handle,
            params,
            |simplified| prompt::render(kind, request, simplified),
            |output| clean_output(kind, output),
        )
        .await
    }
}

fn clean_output(kind: BackendKind, output: RuntimeOutput) -> Option<Cleaned> {
    let text = prompt::strip_answer_prefix(&output.text);
    if is_effectively_empty(text) {
        return None;
    }

    let (kind, raw_confidence) = match (kind, output.span_probabilities) {
        (BackendKind::Extractive, Some((start, end))) => (OutputKind::Extractive, (start + end) / 2.0),
        (BackendKind::Extractive, None) => (OutputKind::Extractive, 0.5),
        _ => (OutputKind::Generative, GENERATIVE_BASE_CONFIDENCE),
    };

    Some(Cleaned {
        text: text.to_string(),
        kind,
        raw_confidence,
        token_logprobs: output.token_logprobs,
    })
}

/// Validate a model directory and pick the execution mode.
pub fn inspect_model_dir(descriptor: &BackendDescriptor) -> InferenceResult<ResolvedArtifact> {
    let id = descriptor.id.as_str();
    let dir = descriptor.artifact_path.as_path();

    if !dir.is_dir() {
        return Err(InferenceError::load(
            id,
            format!("model directory not found: {}", dir.display()),
        ));
    }

    let config_path = dir.join("config.json");
    let raw = std::fs::read_to_string(&config_path)
        .map_err(|e| InferenceError::load(id, format!("cannot read {}: {e}", config_path.display())))?;
    let config: Value = serde_json::from_str(&raw)
        .map_err(|e| InferenceError::load(id, format!("invalid config.json: {e}")))?;
    let Some(config) = config.as_object() else {
        return Err(InferenceError::load(id, "config.json is not a JSON object"));
    };

    if let Some(architectures) = config.get("architectures").and_then(Value::as_array) {
        let suffix = match descriptor.kind {
            BackendKind::Extractive => "ForQuestionAnswering",
            _ => "ForConditionalGeneration",
        };
        let compatible = architectures
            .iter()
            .filter_map(Value::as_str)
            .any(|arch| arch.ends_with(suffix));
        if !compatible {
            return Err(InferenceError::load(
                id,
                format!("architectures {architectures:?} incompatible with {} runtime", descriptor.kind),
            ));
        }
    }

    let mode = if compiled_graph_path(dir).is_some() {
        ExecutionMode::CompiledGraph
    } else {
        ExecutionMode::Pipeline
    };

    Ok(ResolvedArtifact {
        path: dir.to_path_buf(),
        mode,
        size_bytes: dir_size(dir),
    })
}

/// First `*.onnx` file (by name) in `dir` or `dir/onnx`.
pub(crate) fn compiled_graph_path(dir: &Path) -> Option<PathBuf> {
    let find_onnx = |d: &Path| {
        let mut graphs: Vec<PathBuf> = std::fs::read_dir(d)
            .ok()?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("onnx"))
            .collect();
        graphs.sort();
        graphs.into_iter().next()
    };
    find_onnx(dir).or_else(|| find_onnx(&dir.join("onnx")))
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(ft) if ft.is_dir() => dir_size(&entry.path()),
            Ok(ft) if ft.is_file() => entry.metadata().map(|m| m.len()).unwrap_or(0),
            _ => 0,
        })
        .sum()
}
