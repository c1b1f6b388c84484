//! Built-in CPU runtimes.
//!
//! - [`LexicalSpanReader`]: extractive reader that picks the context
//!   sentence best covering the question terms. A lexical stand-in for a
//!   neural reader; it never reads the model weights.
//! - [`TemplateHintComposer`]: short templated hints built from the
//!   question terms that occur in the context. Also a stand-in.
//! - [`LlamaCliRuntime`]: runs a GGUF model through an external llama.cpp
//!   `llama-cli` process.
//!
//! With the `onnx` feature, extractive backends that ship a compiled graph
//! run it through ONNX Runtime instead of the lexical reader. Without it,
//! or for seq2seq backends, the compiled graph is ignored and the handle
//! reports the pipeline mode.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::prompt::{split_sentences, truncate_at_stop, truncate_chars};
use super::runtime::{ExecutionMode, NativeRuntime, Prompt, ResolvedArtifact, RuntimeLoader, RuntimeOutput};
use crate::config::{BackendDescriptor, GenerationParams, Task};
use crate::error::{InferenceError, InferenceResult};
use crate::hardware::HostResources;

/// Executable looked up on `PATH` when a descriptor names none.
pub const DEFAULT_LLAMA_BINARY: &str = "llama-cli";

/// Logit scale applied to sentence overlap scores.
const SPAN_SHARPNESS: f64 = 2.0;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "what", "which", "who", "whom", "why", "how",
    "when", "where", "does", "did", "do", "is", "a", "an", "of", "to", "in", "on", "at", "by",
    "with", "from", "that", "this", "these", "those", "it", "its", "be", "been", "can", "could",
    "would", "should", "will", "about", "into", "than", "then", "there", "their", "they", "them",
    "has", "have", "had", "not", "but", "or", "as", "if", "so", "you", "your", "explain",
    "describe", "define", "name", "list", "give",
];

// ============================================================================
// Lexical helpers
// ============================================================================

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Question terms worth matching, in order of first appearance.
fn content_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    words(text)
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

fn overlap(sentence: &str, terms: &[String]) -> usize {
    let present: HashSet<String> = words(sentence).collect();
    terms.iter().filter(|t| present.contains(*t)).count()
}

pub(crate) fn softmax_at(logits: &[f64], index: usize) -> f64 {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let total: f64 = logits.iter().map(|l| (l - max).exp()).sum();
    if total > 0.0 {
        (logits[index] - max).exp() / total
    } else {
        0.0
    }
}

/// Index of the sentence with the highest overlap; ties go to the earliest.
fn best_sentence(sentences: &[&str], terms: &[String]) -> Option<(usize, Vec<usize>)> {
    if sentences.is_empty() {
        return None;
    }
    let scores: Vec<usize> = sentences.iter().map(|s| overlap(s, terms)).collect();
    let mut best = 0;
    for (i, score) in scores.iter().enumerate() {
        if *score > scores[best] {
            best = i;
        }
    }
    Some((best, scores))
}

fn limit_words(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words.max(1))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Extractive: lexical span reader
// ============================================================================

/// Selects the context sentence that covers the most question terms.
///
/// The start distribution is a softmax over per-sentence overlap; the end
/// distribution favours dense sentences (overlap relative to length).
#[derive(Debug, Default)]
pub struct LexicalSpanReader;

#[async_trait]
impl NativeRuntime for LexicalSpanReader {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Pipeline
    }

    async fn run(&self, prompt: &Prompt, params: &GenerationParams) -> InferenceResult<RuntimeOutput> {
        let sentences = split_sentences(&prompt.context);
        let terms = content_terms(&prompt.question);
        let Some((best, scores)) = best_sentence(&sentences, &terms) else {
            return Ok(RuntimeOutput::default());
        };

        let start_logits: Vec<f64> = scores.iter().map(|s| *s as f64 * SPAN_SHARPNESS).collect();
        let end_logits: Vec<f64> = sentences
            .iter()
            .zip(&scores)
            .map(|(sentence, score)| {
                let len = sentence.split_whitespace().count().max(1) as f64;
                *score as f64 * SPAN_SHARPNESS / len.ln().max(1.0)
            })
            .collect();

        let text = limit_words(sentences[best], params.max_tokens);
        Ok(RuntimeOutput::text(text).with_span_probabilities(
            softmax_at(&start_logits, best),
            softmax_at(&end_logits, best),
        ))
    }
}

/// Loader for extractive backends: the ONNX reader for compiled graphs
/// when built with `onnx`, the lexical reader otherwise.
#[derive(Debug, Default)]
pub struct LexicalSpanLoader;

#[async_trait]
impl RuntimeLoader for LexicalSpanLoader {
    async fn load(
        &self,
        descriptor: &BackendDescriptor,
        artifact: &ResolvedArtifact,
    ) -> InferenceResult<Arc<dyn NativeRuntime>> {
        #[cfg(feature = "onnx")]
        if artifact.mode == ExecutionMode::CompiledGraph {
            let threads = inference_threads(descriptor).await;
            let descriptor = descriptor.clone();
            let artifact = artifact.clone();
            let id = descriptor.id.clone();
            let reader = tokio::task::spawn_blocking(move || {
                super::onnx::OnnxSpanReader::load(&descriptor, &artifact, threads)
            })
            .await
            .map_err(|e| InferenceError::load(&id, e.to_string()))??;
            return Ok(Arc::new(reader));
        }

        if artifact.mode == ExecutionMode::CompiledGraph {
            warn!(
                backend = %descriptor.id,
                "compiled graph found but no graph runtime is built, using the lexical reader"
            );
        }
        Ok(Arc::new(LexicalSpanReader))
    }
}

// ============================================================================
// Seq2seq: template hint composer
// ============================================================================

/// Templated hints (or a best-sentence answer) from question terms found
/// in the context. Produces nothing for an empty context.
#[derive(Debug, Default)]
pub struct TemplateHintComposer;

impl TemplateHintComposer {
    fn keywords(prompt: &Prompt) -> Vec<String> {
        let context_words: HashSet<String> = words(&prompt.context).collect();
        let mut keywords: Vec<String> = content_terms(&prompt.question)
            .into_iter()
            .filter(|t| context_words.contains(t))
            .collect();

        if keywords.is_empty() {
            keywords = content_terms(&prompt.context);
        }
        keywords.truncate(2);
        keywords
    }

    fn compose_hints(prompt: &Prompt, max_words: usize) -> String {
        let keywords = Self::keywords(prompt);
        let Some(first) = keywords.first() else {
            return String::new();
        };

        let sentences = split_sentences(&prompt.context);
        let terms = content_terms(&prompt.question);
        let anchor = best_sentence(&sentences, &terms)
            .map(|(i, _)| truncate_chars(sentences[i], 100).trim_end_matches('.').to_string())
            .unwrap_or_default();

        let mut hints = vec![format!("Focus on what the passage says about {first}.")];
        if !anchor.is_empty() {
            hints.push(format!("Re-read this part carefully: \"{anchor}\"."));
        }
        match keywords.get(1) {
            Some(second) => hints.push(format!("Think about how {first} connects to {second}.")),
            None => hints.push(format!("Ask yourself why {first} matters in this passage.")),
        }

        let mut budget = max_words.max(1);
        let mut lines = Vec::new();
        for (i, hint) in hints.iter().enumerate() {
            let len = hint.split_whitespace().count();
            if i > 0 && len > budget {
                break;
            }
            budget = budget.saturating_sub(len);
            lines.push(format!("{}. {hint}", i + 1));
        }
        lines.join("\n")
    }
}

#[async_trait]
impl NativeRuntime for TemplateHintComposer {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Pipeline
    }

    async fn run(&self, prompt: &Prompt, params: &GenerationParams) -> InferenceResult<RuntimeOutput> {
        if prompt.context.trim().is_empty() {
            return Ok(RuntimeOutput::default());
        }
        let text = match prompt.task {
            Task::Hints => Self::compose_hints(prompt, params.max_tokens),
            Task::Answer => {
                let sentences = split_sentences(&prompt.context);
                let terms = content_terms(&prompt.question);
                best_sentence(&sentences, &terms)
                    .map(|(i, _)| limit_words(sentences[i], params.max_tokens))
                    .unwrap_or_default()
            }
        };
        Ok(RuntimeOutput::text(text))
    }
}

/// Loader for seq2seq backends. There is no built-in seq2seq graph
/// runtime, so a compiled graph is never used here.
#[derive(Debug, Default)]
pub struct TemplateHintLoader;

#[async_trait]
impl RuntimeLoader for TemplateHintLoader {
    async fn load(
        &self,
        descriptor: &BackendDescriptor,
        artifact: &ResolvedArtifact,
    ) -> InferenceResult<Arc<dyn NativeRuntime>> {
        if artifact.mode == ExecutionMode::CompiledGraph {
            debug!(backend = %descriptor.id, "ignoring compiled seq2seq graph");
        }
        Ok(Arc::new(TemplateHintComposer))
    }
}

/// Configured thread count, else the host default detected off the runtime
/// thread.
async fn inference_threads(descriptor: &BackendDescriptor) -> usize {
    match descriptor.threads {
        Some(threads) => threads,
        None => HostResources::detect_async().await.default_threads(),
    }
}

// ============================================================================
// Generative: llama-cli process runner
// ============================================================================

/// Runs one `llama-cli` process per generation.
///
/// Each process maps the whole model, so calls on one backend are
/// serialized. The child is killed if the adapter's timeout drops the call.
#[derive(Debug, Clone)]
pub struct LlamaCliRuntime {
    binary: PathBuf,
    model: PathBuf,
    backend_id: String,
    threads: usize,
    context_window: usize,
    batch_size: usize,
}

impl LlamaCliRuntime {
    fn args(&self, prompt: &Prompt, params: &GenerationParams) -> Vec<String> {
        vec![
            "-m".into(),
            self.model.display().to_string(),
            "-p".into(),
            prompt.text.clone(),
            "-n".into(),
            params.max_tokens.to_string(),
            "--temp".into(),
            params.temperature.to_string(),
            "--top-p".into(),
            params.top_p.to_string(),
            "-t".into(),
            self.threads.to_string(),
            "-c".into(),
            self.context_window.to_string(),
            "-b".into(),
            self.batch_size.to_string(),
            "--no-display-prompt".into(),
            "-no-cnv".into(),
        ]
    }
}

#[async_trait]
impl NativeRuntime for LlamaCliRuntime {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Gguf
    }

    async fn run(&self, prompt: &Prompt, params: &GenerationParams) -> InferenceResult<RuntimeOutput> {
        debug!(backend = %self.backend_id, max_tokens = params.max_tokens, "spawning llama-cli");

        let output = Command::new(&self.binary)
            .args(self.args(prompt, params))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| InferenceError::generation(&self.backend_id, format!("spawn failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            return Err(InferenceError::generation(
                &self.backend_id,
                format!("llama-cli exited with {}: {tail}", output.status),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let text = truncate_at_stop(&stdout, &params.stop).trim().to_string();
        Ok(RuntimeOutput::text(text))
    }

    fn supports_concurrent_generation(&self) -> bool {
        false
    }
}

/// Resolves the `llama-cli` binary and builds a [`LlamaCliRuntime`].
#[derive(Debug, Default)]
pub struct LlamaCliLoader;

#[async_trait]
impl RuntimeLoader for LlamaCliLoader {
    async fn load(
        &self,
        descriptor: &BackendDescriptor,
        artifact: &ResolvedArtifact,
    ) -> InferenceResult<Arc<dyn NativeRuntime>> {
        let requested = descriptor
            .runtime_binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LLAMA_BINARY));

        let binary = resolve_binary(&requested).ok_or_else(|| {
            InferenceError::load(
                &descriptor.id,
                format!("runtime binary '{}' not found", requested.display()),
            )
        })?;

        let threads = inference_threads(descriptor).await;

        Ok(Arc::new(LlamaCliRuntime {
            binary,
            model: artifact.path.clone(),
            backend_id: descriptor.id.clone(),
            threads,
            context_window: descriptor.context_window,
            batch_size: descriptor.batch_size,
        }))
    }
}

/// Explicit paths must exist; bare names are searched on `PATH`.
pub fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 || binary.is_absolute() {
        return binary.is_file().then(|| binary.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(question: &str, context: &str, task: Task) -> Prompt {
        Prompt {
            text: question.to_string(),
            question: question.to_string(),
            context: context.to_string(),
            task,
            simplified: false,
        }
    }

    const CONTEXT: &str = "The cell is the basic unit of life. \
        Mitochondria produce energy for the cell through respiration. \
        Ribosomes build proteins.";

    #[tokio::test]
    async fn test_span_reader_selects_best_sentence() {
        let out = LexicalSpanReader
            .run(
                &prompt("What do mitochondria produce?", CONTEXT, Task::Answer),
                &GenerationParams::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            out.text,
            "Mitochondria produce energy for the cell through respiration."
        );
        let (start, end) = out.span_probabilities.unwrap();
        assert!(start > 0.5 && start <= 1.0);
        assert!(end > 0.0 && end <= 1.0);
    }

    #[tokio::test]
    async fn test_span_reader_empty_context() {
        let out = LexicalSpanReader
            .run(&prompt("Why?", "   ", Task::Answer), &GenerationParams::default())
            .await
            .unwrap();
        assert!(out.text.is_empty());
        assert!(out.span_probabilities.is_none());
    }

    #[tokio::test]
    async fn test_template_hints() {
        let out = TemplateHintComposer
            .run(
                &prompt("How do mitochondria help the cell?", CONTEXT, Task::Hints),
                &GenerationParams::default(),
            )
            .await
            .unwrap();

        let lines: Vec<&str> = out.text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("1. Focus on what the passage says about mitochondria"));
        assert!(lines[2].contains("mitochondria connects to cell"));
        assert!(!out.text.to_lowercase().contains("question"));
    }

    #[tokio::test]
    async fn test_template_hints_empty_context() {
        let out = TemplateHintComposer
            .run(&prompt("Why?", "", Task::Hints), &GenerationParams::default())
            .await
            .unwrap();
        assert!(out.text.is_empty());
    }

    #[test]
    fn test_content_terms_skip_stopwords() {
        assert_eq!(
            content_terms("What is the role of the Mitochondria in a cell?"),
            vec!["role", "mitochondria", "cell"]
        );
    }

    #[test]
    fn test_resolve_binary() {
        assert!(resolve_binary(Path::new("/definitely/not/here/llama-cli")).is_none());

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("llama-cli");
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        assert_eq!(resolve_binary(&bin), Some(bin));
    }

    #[tokio::test]
    async fn test_builtin_loaders_report_pipeline_for_compiled_artifacts() {
        let artifact = ResolvedArtifact {
            path: PathBuf::from("/models/hint"),
            mode: ExecutionMode::CompiledGraph,
            size_bytes: 1,
        };
        let descriptor =
            BackendDescriptor::new("hint", crate::config::BackendKind::Seq2Seq, "/models/hint");
        let runtime = TemplateHintLoader.load(&descriptor, &artifact).await.unwrap();
        assert_eq!(runtime.mode(), ExecutionMode::Pipeline);

        #[cfg(not(feature = "onnx"))]
        {
            let descriptor =
                BackendDescriptor::new("qna", crate::config::BackendKind::Extractive, "/models/qna");
            let runtime = LexicalSpanLoader.load(&descriptor, &artifact).await.unwrap();
            assert_eq!(runtime.mode(), ExecutionMode::Pipeline);
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_llama_loader_resolves_host_threads() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("llama-cli");
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        let model = dir.path().join("phi-2.gguf");
        std::fs::write(&model, b"GGUF").unwrap();

        let mut descriptor =
            BackendDescriptor::new("phi2", crate::config::BackendKind::Generative, &model);
        descriptor.runtime_binary = Some(bin);
        assert!(descriptor.threads.is_none());

        let artifact = ResolvedArtifact {
            path: model,
            mode: ExecutionMode::Gguf,
            size_bytes: 4,
        };
        let runtime = LlamaCliLoader.load(&descriptor, &artifact).await.unwrap();
        assert_eq!(runtime.mode(), ExecutionMode::Gguf);
        assert!(inference_threads(&descriptor).await >= 1);

        descriptor.threads = Some(2);
        assert_eq!(inference_threads(&descriptor).await, 2);
    }

    #[test]
    fn test_llama_args_bounded() {
        let runtime = LlamaCliRuntime {
            binary: PathBuf::from("llama-cli"),
            model: PathBuf::from("/models/phi2.gguf"),
            backend_id: "phi2".into(),
            threads: 4,
            context_window: 2048,
            batch_size: 512,
        };
        let params = GenerationParams::new(150).unwrap();
        let args = runtime.args(&prompt("q", "c", Task::Answer), &params);
        let n = args.iter().position(|a| a == "-n").unwrap();
        assert_eq!(args[n + 1], "150");
        assert!(args.contains(&"--no-display-prompt".to_string()));
        assert!(!runtime.supports_concurrent_generation());
    }
}
