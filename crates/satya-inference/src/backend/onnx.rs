//! ONNX Runtime reader for compiled extractive graphs.
//!
//! Only built with the `onnx` feature. The model directory must hold the
//! compiled graph and the WordPiece `vocab.txt` it was exported with; the
//! graph takes `input_ids` and `attention_mask` and returns `start_logits`
//! and `end_logits`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

use super::runtime::{ExecutionMode, NativeRuntime, Prompt, ResolvedArtifact, RuntimeOutput};
use super::short_form::compiled_graph_path;
use super::wordpiece::{WordPieceVocab, best_span};
use crate::config::{BackendDescriptor, GenerationParams};
use crate::error::{InferenceError, InferenceResult};

/// Longest sequence fed to the graph.
const MAX_SEQUENCE: usize = 512;

pub struct OnnxSpanReader {
    backend_id: String,
    session: Arc<Mutex<Session>>,
    vocab: Arc<WordPieceVocab>,
    max_len: usize,
}

impl OnnxSpanReader {
    /// Build the session. Blocking; call from the blocking pool.
    pub fn load(
        descriptor: &BackendDescriptor,
        artifact: &ResolvedArtifact,
        threads: usize,
    ) -> InferenceResult<Self> {
        let id = descriptor.id.as_str();
        let graph = compiled_graph_path(&artifact.path)
            .ok_or_else(|| InferenceError::load(id, "no compiled graph in model directory"))?;
        let vocab = WordPieceVocab::from_file(
            &artifact.path.join("vocab.txt"),
            lowercases(&artifact.path),
        )
        .map_err(|e| InferenceError::load(id, e))?;

        let fail = |e: &dyn std::fmt::Display| InferenceError::load(id, format!("onnx runtime: {e}"));
        let session = Session::builder()
            .map_err(|e| fail(&e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| fail(&e))?
            .with_intra_threads(threads)
            .map_err(|e| fail(&e))?
            .commit_from_file(&graph)
            .map_err(|e| fail(&e))?;

        info!(backend = id, graph = %graph.display(), vocab = vocab.len(), threads, "onnx session ready");
        Ok(Self {
            backend_id: id.to_string(),
            session: Arc::new(Mutex::new(session)),
            vocab: Arc::new(vocab),
            max_len: descriptor.context_window.min(MAX_SEQUENCE),
        })
    }
}

/// `do_lower_case` from `tokenizer_config.json`; uncased when absent.
fn lowercases(dir: &Path) -> bool {
    std::fs::read_to_string(dir.join("tokenizer_config.json"))
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|config| config.get("do_lower_case").and_then(Value::as_bool))
        .unwrap_or(true)
}

#[async_trait]
impl NativeRuntime for OnnxSpanReader {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::CompiledGraph
    }

    async fn run(&self, prompt: &Prompt, params: &GenerationParams) -> InferenceResult<RuntimeOutput> {
        let encoding = self
            .vocab
            .encode_pair(&prompt.question, &prompt.context, self.max_len);
        if encoding.context_tokens() == 0 {
            return Ok(RuntimeOutput::default());
        }

        let session = self.session.clone();
        let input_ids = encoding.input_ids.clone();
        let attention_mask = encoding.attention_mask.clone();
        let logits = tokio::task::spawn_blocking(move || -> Result<(Vec<f32>, Vec<f32>), String> {
            let shape = vec![1_i64, input_ids.len() as i64];
            let input_ids = Tensor::from_array((shape.clone(), input_ids)).map_err(|e| e.to_string())?;
            let attention_mask = Tensor::from_array((shape, attention_mask)).map_err(|e| e.to_string())?;

            let mut session = session.lock();
            let outputs = session
                .run(ort::inputs!["input_ids" => input_ids, "attention_mask" => attention_mask])
                .map_err(|e| e.to_string())?;
            let (_, start) = outputs["start_logits"]
                .try_extract_tensor::<f32>()
                .map_err(|e| e.to_string())?;
            let (_, end) = outputs["end_logits"]
                .try_extract_tensor::<f32>()
                .map_err(|e| e.to_string())?;
            Ok((start.to_vec(), end.to_vec()))
        })
        .await
        .map_err(|e| InferenceError::generation(&self.backend_id, e.to_string()))?
        .map_err(|e| InferenceError::generation(&self.backend_id, e))?;

        let (start_logits, end_logits) = logits;
        let Some(span) = best_span(&encoding, &start_logits, &end_logits, params.max_tokens) else {
            return Ok(RuntimeOutput::default());
        };
        Ok(RuntimeOutput::text(&prompt.context[span.start..span.end])
            .with_span_probabilities(span.start_probability, span.end_probability))
    }

    fn supports_concurrent_generation(&self) -> bool {
        false
    }
}
