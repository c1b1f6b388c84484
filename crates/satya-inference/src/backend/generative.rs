//! Generative adapter: larger autoregressive models in GGUF format.
//!
//! Higher latency and memory cost than the short-form backends; routed as
//! the fallback tier.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::prompt::{self, is_effectively_empty};
use super::runtime::{ExecutionMode, ResolvedArtifact, RuntimeLoader, RuntimeOutput};
use super::{as_load_error, generate_with_retry, BackendAdapter, BackendHandle, Cleaned, GENERATIVE_BASE_CONFIDENCE};
use crate::config::{BackendDescriptor, BackendKind, GenerationParams, Task};
use crate::error::{InferenceError, InferenceResult};
use crate::types::{GenerationResult, InferenceRequest, OutputKind};

/// Leading bytes of every GGUF file.
pub const GGUF_MAGIC: &[u8; 4] = b"GGUF";

pub struct GenerativeAdapter {
    descriptor: BackendDescriptor,
    loader: Arc<dyn RuntimeLoader>,
}

impl GenerativeAdapter {
    pub fn new(descriptor: BackendDescriptor, loader: Arc<dyn RuntimeLoader>) -> Self {
        Self { descriptor, loader }
    }

    /// Answer requests honour the requested answer length, never exceeding
    /// the backend's own token limit.
    fn effective_params(&self, request: &InferenceRequest, params: &GenerationParams) -> GenerationParams {
        match request.task {
            Task::Answer => params.capped(request.answer_length.max_tokens()),
            Task::Hints => params.clone(),
        }
    }
}

#[async_trait]
impl BackendAdapter for GenerativeAdapter {
    fn describe(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn load(&self) -> InferenceResult<BackendHandle> {
        let started = Instant::now();
        let descriptor = self.descriptor.clone();
        let artifact = tokio::task::spawn_blocking(move || inspect_gguf(&descriptor))
            .await
            .map_err(|e| InferenceError::load(&self.descriptor.id, e.to_string()))??;

        let runtime = self
            .loader
            .load(&self.descriptor, &artifact)
            .await
            .map_err(|e| as_load_error(&self.descriptor.id, e))?;

        info!(
            backend = %self.descriptor.id,
            model = %artifact.path.display(),
            size_mb = artifact.size_bytes / (1024 * 1024),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generative backend loaded"
        );

        Ok(BackendHandle {
            backend_id: self.descriptor.id.clone(),
            runtime,
            mode: ExecutionMode::Gguf,
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
        let params = self.effective_params(request, params);
        let task = request.task;
        generate_with_retry(
            &self.descriptor,
            handle,
            &params,
            |simplified| prompt::render(BackendKind::Generative, request, simplified),
            |output| clean_output(task, output),
        )
        .await
    }
}

fn clean_output(task: Task, output: RuntimeOutput) -> Option<Cleaned> {
    let text = match task {
        Task::Answer => prompt::strip_answer_prefix(&output.text),
        Task::Hints => output.text.trim(),
    };
    if is_effectively_empty(text) {
        return None;
    }

    // Hint prompts end with "1." so the model continues the first item.
    let text = match task {
        Task::Hints if !text.starts_with("1.") => format!("1. {text}"),
        _ => text.to_string(),
    };

    Some(Cleaned {
        text,
        kind: OutputKind::Generative,
        raw_confidence: GENERATIVE_BASE_CONFIDENCE,
        token_logprobs: output.token_logprobs,
    })
}

/// Locate the GGUF file and check its magic bytes.
///
/// The artifact path may be the file itself or a directory; in a directory
/// the first `*.gguf` file (by name) is used.
pub fn inspect_gguf(descriptor: &BackendDescriptor) -> InferenceResult<ResolvedArtifact> {
    let id = descriptor.id.as_str();
    let path = descriptor.artifact_path.as_path();

    let file = if path.is_dir() {
        find_gguf(path).ok_or_else(|| {
            InferenceError::load(id, format!("no .gguf file in {}", path.display()))
        })?
    } else if path.is_file() {
        path.to_path_buf()
    } else {
        return Err(InferenceError::load(
            id,
            format!("model file not found: {}", path.display()),
        ));
    };

    let mut magic = [0u8; 4];
    std::fs::File::open(&file)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map_err(|e| InferenceError::load(id, format!("cannot read {}: {e}", file.display())))?;
    if &magic != GGUF_MAGIC {
        return Err(InferenceError::load(
            id,
            format!("{} is not a GGUF file", file.display()),
        ));
    }

    let size_bytes = std::fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
    Ok(ResolvedArtifact {
        path: file,
        mode: ExecutionMode::Gguf,
        size_bytes,
    })
}

fn find_gguf(dir: &Path) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("gguf"))
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::runtime::{NativeRuntime, Prompt};
    use crate::types::AnswerLength;
    use parking_lot::Mutex;

    struct Echo {
        seen: Mutex<Vec<(String, usize)>>,
        reply: String,
    }

    #[async_trait]
    impl NativeRuntime for Echo {
        fn mode(&self) -> ExecutionMode {
            ExecutionMode::Gguf
        }

        async fn run(&self, prompt: &Prompt, params: &GenerationParams) -> InferenceResult<RuntimeOutput> {
            self.seen.lock().push((prompt.text.clone(), params.max_tokens));
            Ok(RuntimeOutput::text(self.reply.clone()))
        }
    }

    struct EchoLoader(Arc<Echo>);

    #[async_trait]
    impl RuntimeLoader for EchoLoader {
        async fn load(
            &self,
            _descriptor: &BackendDescriptor,
            _artifact: &ResolvedArtifact,
        ) -> InferenceResult<Arc<dyn NativeRuntime>> {
            Ok(self.0.clone())
        }
    }

    fn gguf_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("phi2.Q4_K_M.gguf"), b"GGUF\x03\x00\x00\x00rest").unwrap();
        dir
    }

    fn adapter(path: &Path, reply: &str) -> (GenerativeAdapter, Arc<Echo>) {
        let echo = Arc::new(Echo {
            seen: Mutex::new(Vec::new()),
            reply: reply.to_string(),
        });
        let descriptor = BackendDescriptor::new("phi2", BackendKind::Generative, path)
            .with_params(GenerationParams::new(150).unwrap());
        (
            GenerativeAdapter::new(descriptor, Arc::new(EchoLoader(echo.clone()))),
            echo,
        )
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("model.gguf");
        std::fs::write(&file, b"PK\x03\x04zip").unwrap();
        let descriptor = BackendDescriptor::new("phi2", BackendKind::Generative, &file);
        let err = inspect_gguf(&descriptor).unwrap_err();
        assert!(err.to_string().contains("not a GGUF file"));
    }

    #[test]
    fn test_missing_and_empty_dir_rejected() {
        let descriptor = BackendDescriptor::new("phi2", BackendKind::Generative, "/no/phi2.gguf");
        assert!(inspect_gguf(&descriptor).unwrap_err().is_fatal_for_backend());

        let dir = tempfile::tempdir().unwrap();
        let descriptor = BackendDescriptor::new("phi2", BackendKind::Generative, dir.path());
        assert!(inspect_gguf(&descriptor).is_err());
    }

    #[test]
    fn test_directory_resolves_gguf_file() {
        let dir = gguf_dir();
        let descriptor = BackendDescriptor::new("phi2", BackendKind::Generative, dir.path());
        let artifact = inspect_gguf(&descriptor).unwrap();
        assert_eq!(artifact.path, dir.path().join("phi2.Q4_K_M.gguf"));
        assert_eq!(artifact.mode, ExecutionMode::Gguf);
    }

    #[tokio::test]
    async fn test_answer_strips_prefix_and_caps_length() {
        let dir = gguf_dir();
        let (adapter, echo) = adapter(dir.path(), "Answer: Plants make food using sunlight.");
        let handle = adapter.load().await.unwrap();

        let request = InferenceRequest::answer("how do plants eat?", "Photosynthesis ...")
            .with_answer_length(AnswerLength::VeryShort);
        let result = adapter
            .generate(&handle, &request, &adapter.describe().params)
            .await
            .unwrap();

        assert_eq!(result.text, "Plants make food using sunlight.");
        assert_eq!(result.raw_confidence, GENERATIVE_BASE_CONFIDENCE);
        assert_eq!(echo.seen.lock()[0].1, 64);
    }

    #[tokio::test]
    async fn test_hints_get_first_number() {
        let dir = gguf_dir();
        let (adapter, _) = adapter(dir.path(), "Check units.\n2. Convert grams.\n3. Divide.");
        let handle = adapter.load().await.unwrap();
        let result = adapter
            .generate(&handle, &InferenceRequest::hints("q", "c"), &GenerationParams::default())
            .await
            .unwrap();
        assert!(result.text.starts_with("1. Check units."));
    }
}
