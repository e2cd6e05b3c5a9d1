//! In-memory fakes for the pipeline's collaborators.
//!
//! Used by this crate's tests and by downstream crates that need to drive a
//! [`Pipeline`] without network services or `ffmpeg`.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use podforge_core::BlobRef;
use tempfile::TempDir;

use crate::audio::AudioTooling;
use crate::error::{ServiceError, StageError};
use crate::pipeline::{Pipeline, PipelineConfig, PipelineServices};
use crate::script::prompt::{DIALOGUE_PREAMBLE, SUMMARY_PREAMBLE, TITLE_PREAMBLE};
use crate::services::{
    AudioStream, BlobStore, DocumentParser, SpeechSynthesisService, TextGenerationService,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn pop_failure(failures: &Mutex<VecDeque<ServiceError>>) -> Option<ServiceError> {
    lock(failures).pop_front()
}

/// Wrap `text` the way [`FakeDocumentParser`] expects.
pub fn fake_pdf(text: &str) -> Vec<u8> {
    format!("%PDF-fake\n{text}").into_bytes()
}

/// A script of `turns` alternating lines of `words` words each.
pub fn sample_dialogue(turns: usize, words: usize) -> String {
    (0..turns)
        .map(|i| {
            let label = if i % 2 == 0 { "DOROTHY" } else { "WILL" };
            let text = (0..words)
                .map(|w| format!("word{i}_{w}"))
                .collect::<Vec<_>>()
                .join(" ");
            format!("{label}: {text}\n")
        })
        .collect()
}

const MEM_SCHEME: &str = "mem://";

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

/// Blob store backed by a `HashMap`; references look like `mem://<key>`.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    downloads: AtomicUsize,
    uploads: AtomicUsize,
    upload_failures: Mutex<VecDeque<ServiceError>>,
    download_failures: Mutex<VecDeque<ServiceError>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_of(blob: &BlobRef) -> &str {
        blob.as_str().strip_prefix(MEM_SCHEME).unwrap_or(blob.as_str())
    }

    pub fn insert(&self, key: &str, bytes: Vec<u8>) -> BlobRef {
        lock(&self.objects).insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: "application/octet-stream".to_string(),
            },
        );
        BlobRef::new(format!("{MEM_SCHEME}{key}"))
    }

    pub fn get(&self, blob: &BlobRef) -> Option<Vec<u8>> {
        lock(&self.objects)
            .get(Self::key_of(blob))
            .map(|o| o.bytes.clone())
    }

    pub fn content_type(&self, blob: &BlobRef) -> Option<String> {
        lock(&self.objects)
            .get(Self::key_of(blob))
            .map(|o| o.content_type.clone())
    }

    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Make the next `n` uploads fail with `err`.
    pub fn fail_uploads(&self, n: usize, err: ServiceError) {
        lock(&self.upload_failures).extend(std::iter::repeat_n(err, n));
    }

    /// Make the next `n` downloads fail with `err`.
    pub fn fail_downloads(&self, n: usize, err: ServiceError) {
        lock(&self.download_failures).extend(std::iter::repeat_n(err, n));
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn download(&self, blob: &BlobRef) -> Result<Vec<u8>, ServiceError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = pop_failure(&self.download_failures) {
            return Err(err);
        }
        self.get(blob)
            .ok_or_else(|| ServiceError::NotFound(blob.to_string()))
    }

    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<BlobRef, ServiceError> {
        if let Some(err) = pop_failure(&self.upload_failures) {
            return Err(err);
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        lock(&self.objects).insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(BlobRef::new(format!("{MEM_SCHEME}{key}")))
    }
}

/// Text service answering each prompt kind with a fixed reply.
#[derive(Debug, Default)]
pub struct ScriptedTextService {
    summary: String,
    dialogue: String,
    title: String,
    prompts: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<ServiceError>>,
}

impl ScriptedTextService {
    pub fn new(
        summary: impl Into<String>,
        dialogue: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            summary: summary.into(),
            dialogue: dialogue.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    /// Every prompt received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.prompts).len()
    }

    /// Make the next `n` calls fail with `err`.
    pub fn fail_next(&self, n: usize, err: ServiceError) {
        lock(&self.failures).extend(std::iter::repeat_n(err, n));
    }
}

#[async_trait]
impl TextGenerationService for ScriptedTextService {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
        lock(&self.prompts).push(prompt.to_string());
        if let Some(err) = pop_failure(&self.failures) {
            return Err(err);
        }
        if prompt.starts_with(SUMMARY_PREAMBLE) {
            Ok(self.summary.clone())
        } else if prompt.starts_with(DIALOGUE_PREAMBLE) {
            Ok(self.dialogue.clone())
        } else if prompt.starts_with(TITLE_PREAMBLE) {
            Ok(self.title.clone())
        } else {
            Err(ServiceError::invalid_response("unrecognized prompt"))
        }
    }
}

/// Speech service emitting deterministic bytes derived from the text.
///
/// Each character of the text becomes `bytes_per_char` bytes, delivered in
/// small pieces to exercise streaming.
#[derive(Debug)]
pub struct FakeSpeechService {
    bytes_per_char: usize,
    silent: bool,
    calls: Mutex<Vec<(String, String)>>,
    failures: Mutex<VecDeque<ServiceError>>,
    mid_stream: Mutex<Option<(usize, ServiceError)>>,
}

impl Default for FakeSpeechService {
    fn default() -> Self {
        Self {
            bytes_per_char: 4,
            silent: false,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            mid_stream: Mutex::new(None),
        }
    }
}

const PIECE_LEN: usize = 64;

impl FakeSpeechService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stream ends without yielding audio.
    pub fn with_silence(mut self) -> Self {
        self.silent = true;
        self
    }

    /// `(voice_id, text)` of every call, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        lock(&self.calls).clone()
    }

    pub fn fail_next(&self, n: usize, err: ServiceError) {
        lock(&self.failures).extend(std::iter::repeat_n(err, n));
    }

    /// The next stream yields `pieces` pieces and then `err`.
    pub fn fail_mid_stream_after(&self, pieces: usize, err: ServiceError) {
        *lock(&self.mid_stream) = Some((pieces, err));
    }
}

#[async_trait]
impl SpeechSynthesisService for FakeSpeechService {
    async fn synthesize(&self, voice_id: &str, text: &str) -> Result<AudioStream, ServiceError> {
        lock(&self.calls).push((voice_id.to_string(), text.to_string()));
        if let Some(err) = pop_failure(&self.failures) {
            return Err(err);
        }

        let payload: Vec<u8> = if self.silent {
            Vec::new()
        } else {
            text.bytes()
                .flat_map(|b| std::iter::repeat_n(b, self.bytes_per_char))
                .collect()
        };
        let mut items: Vec<Result<Vec<u8>, ServiceError>> =
            payload.chunks(PIECE_LEN).map(|c| Ok(c.to_vec())).collect();

        if let Some((pieces, err)) = lock(&self.mid_stream).take() {
            items.truncate(pieces);
            items.push(Err(err));
        }
        Ok(futures_util::stream::iter(items).boxed())
    }
}

/// Parser for [`fake_pdf`] documents: everything after the first line.
#[derive(Debug, Default, Clone, Copy)]
pub struct FakeDocumentParser;

impl DocumentParser for FakeDocumentParser {
    fn extension(&self) -> &'static str {
        "pdf"
    }

    fn sniff(&self, header: &[u8]) -> bool {
        header.starts_with(b"%PDF-")
    }

    fn extract_text(&self, path: &Path) -> Result<String, String> {
        let raw = std::fs::read(path).map_err(|e| e.to_string())?;
        let raw = String::from_utf8_lossy(&raw);
        Ok(raw.split_once('\n').map(|(_, rest)| rest).unwrap_or_default().to_string())
    }
}

/// Audio tooling that concatenates bytes and derives durations from sizes.
#[derive(Debug)]
pub struct FakeAudioTooling {
    bytes_per_second: u64,
    failing_probe: bool,
    concat_failures: AtomicUsize,
    decode_calls: AtomicUsize,
}

impl FakeAudioTooling {
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second: bytes_per_second.max(1),
            failing_probe: false,
            concat_failures: AtomicUsize::new(0),
            decode_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_failing_probe(mut self) -> Self {
        self.failing_probe = true;
        self
    }

    pub fn fail_concat(&self, n: usize) {
        self.concat_failures.store(n, Ordering::SeqCst);
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    async fn seconds(&self, path: &Path) -> Result<f64, StageError> {
        let len = tokio::fs::metadata(path).await?.len();
        Ok(len as f64 / self.bytes_per_second as f64)
    }
}

fn parse_list_entry(line: &str) -> Option<PathBuf> {
    let quoted = line.trim().strip_prefix("file '")?.strip_suffix('\'')?;
    Some(PathBuf::from(quoted.replace(r"'\''", "'")))
}

#[async_trait]
impl AudioTooling for FakeAudioTooling {
    async fn concat(&self, list_file: &Path, output: &Path) -> Result<(), StageError> {
        let pending = self.concat_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.concat_failures.store(pending - 1, Ordering::SeqCst);
            return Err(StageError::tool("ffmpeg", "injected concat failure"));
        }

        let list = tokio::fs::read_to_string(list_file).await?;
        let mut joined = Vec::new();
        for line in list.lines().filter(|l| !l.trim().is_empty()) {
            let path = parse_list_entry(line)
                .ok_or_else(|| StageError::tool("ffmpeg", format!("bad list entry {line:?}")))?;
            joined.extend(tokio::fs::read(&path).await?);
        }
        tokio::fs::write(output, joined).await?;
        Ok(())
    }

    async fn probe_duration(&self, path: &Path) -> Result<f64, StageError> {
        if self.failing_probe {
            return Err(StageError::tool("ffprobe", "no duration"));
        }
        self.seconds(path).await
    }

    async fn decode_duration(&self, path: &Path) -> Result<f64, StageError> {
        self.decode_calls.fetch_add(1, Ordering::SeqCst);
        self.seconds(path).await
    }
}

/// A [`Pipeline`] wired to fakes, with its workspace root in a temp dir.
pub struct TestHarness {
    pub blobs: Arc<InMemoryBlobStore>,
    pub text: Arc<ScriptedTextService>,
    pub speech: Arc<FakeSpeechService>,
    pub tooling: Arc<FakeAudioTooling>,
    workspace_root: TempDir,
}

impl TestHarness {
    pub const SUMMARY: &'static str = "A summary of how the moon drives the tides.";
    pub const TITLE: &'static str = "\"Tides, Explained\"";

    /// Harness whose text service answers the dialogue prompt with `dialogue`.
    ///
    /// Audio is sized at 16 bytes per second of "speech".
    pub fn new(dialogue: &str) -> Self {
        Self::with_audio_rate(dialogue, 16)
    }

    pub fn with_audio_rate(dialogue: &str, bytes_per_second: u64) -> Self {
        Self {
            blobs: Arc::new(InMemoryBlobStore::new()),
            text: Arc::new(ScriptedTextService::new(Self::SUMMARY, dialogue, Self::TITLE)),
            speech: Arc::new(FakeSpeechService::new()),
            tooling: Arc::new(FakeAudioTooling::new(bytes_per_second)),
            workspace_root: tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}")),
        }
    }

    pub fn upload_source(&self, key: &str, text: &str) -> BlobRef {
        self.blobs.insert(key, fake_pdf(text))
    }

    pub fn services(&self) -> PipelineServices {
        PipelineServices {
            blobs: self.blobs.clone(),
            text: self.text.clone(),
            speech: self.speech.clone(),
            parser: Arc::new(FakeDocumentParser),
            tooling: self.tooling.clone(),
        }
    }

    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            workspace_root: self.workspace_root.path().to_path_buf(),
            ..PipelineConfig::default()
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.services(), self.config())
    }

    /// No attempt left anything behind.
    pub fn workspace_is_empty(&self) -> bool {
        std::fs::read_dir(self.workspace_root.path())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }
}
