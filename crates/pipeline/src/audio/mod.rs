//! Audio assembly: chunk concatenation and duration measurement.

pub mod ffmpeg;
pub mod process;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::error::StageError;

pub use ffmpeg::FfmpegTooling;

/// One synthesized audio segment on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position of the utterance in the script.
    pub index: usize,
    pub path: PathBuf,
    pub bytes: u64,
}

/// The assembled audio file.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub path: PathBuf,
    /// Measured duration, rounded to the nearest second.
    pub duration_seconds: u32,
}

/// External audio tooling used by the assembler.
#[async_trait]
pub trait AudioTooling: Send + Sync {
    /// Concatenate the files listed in a concat-demuxer list without re-encoding.
    async fn concat(&self, list_file: &Path, output: &Path) -> Result<(), StageError>;

    /// Container-level duration, in seconds.
    async fn probe_duration(&self, path: &Path) -> Result<f64, StageError>;

    /// Duration obtained by decoding the whole file, in seconds.
    async fn decode_duration(&self, path: &Path) -> Result<f64, StageError>;
}

/// Render a concat-demuxer list for `chunks`, in the given order.
pub fn concat_list(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .map(|c| {
            let path = c.path.to_string_lossy().replace('\'', r"'\''");
            format!("file '{path}'\n")
        })
        .collect()
}

/// Round a measured duration to whole seconds, clamping at zero.
pub fn round_duration(secs: f64) -> u32 {
    if !secs.is_finite() || secs <= 0.0 {
        return 0;
    }
    secs.round().min(u32::MAX as f64) as u32
}

pub struct AudioAssembler {
    tooling: Arc<dyn AudioTooling>,
}

impl AudioAssembler {
    pub fn new(tooling: Arc<dyn AudioTooling>) -> Self {
        Self { tooling }
    }

    /// Concatenate `chunks` exactly in the given order into `output` and
    /// measure the result.
    #[instrument(skip_all, fields(chunks = chunks.len(), output = %output.display()), err)]
    pub async fn assemble(&self, chunks: &[Chunk], output: &Path) -> Result<Artifact, StageError> {
        if chunks.is_empty() {
            return Err(StageError::tool("concat", "no audio chunks to assemble"));
        }

        let list_file = output.with_extension("concat.txt");
        tokio::fs::write(&list_file, concat_list(chunks)).await?;
        let concatenated = self.tooling.concat(&list_file, output).await;
        if let Err(err) = tokio::fs::remove_file(&list_file).await {
            warn!(error = %err, "failed to remove concat list");
        }
        concatenated?;

        let duration_seconds = self.measure_duration(output).await?;
        info!(duration_seconds, "audio assembled");
        Ok(Artifact {
            path: output.to_path_buf(),
            duration_seconds,
        })
    }

    /// Duration of an audio file in whole seconds.
    ///
    /// Falls back to a full decode when the container probe fails or reports
    /// nothing usable.
    pub async fn measure_duration(&self, path: &Path) -> Result<u32, StageError> {
        let secs = match self.tooling.probe_duration(path).await {
            Ok(secs) if secs.is_finite() && secs > 0.0 => secs,
            Ok(secs) => {
                warn!(secs, "probe returned unusable duration, decoding instead");
                self.tooling.decode_duration(path).await?
            }
            Err(err) => {
                warn!(error = %err, "probe failed, decoding instead");
                self.tooling.decode_duration(path).await?
            }
        };
        Ok(round_duration(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeAudioTooling;

    async fn write_chunks(dir: &Path, parts: &[&[u8]]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for (index, bytes) in parts.iter().enumerate() {
            let path = dir.join(format!("chunk_{index:05}.mp3"));
            tokio::fs::write(&path, bytes).await.unwrap();
            chunks.push(Chunk {
                index,
                path,
                bytes: bytes.len() as u64,
            });
        }
        chunks
    }

    #[tokio::test]
    async fn concatenates_in_given_order_and_cleans_list() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = write_chunks(dir.path(), &[b"aaa", b"bb", b"c"]).await;
        let assembler = AudioAssembler::new(Arc::new(FakeAudioTooling::new(1)));
        let out = dir.path().join("podcast.mp3");

        let artifact = assembler.assemble(&chunks, &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"aaabbc");
        assert_eq!(artifact.duration_seconds, 6);
        assert!(!out.with_extension("concat.txt").exists());

        let reversed: Vec<_> = chunks.iter().rev().cloned().collect();
        let out2 = dir.path().join("reversed.mp3");
        assembler.assemble(&reversed, &out2).await.unwrap();
        assert_eq!(std::fs::read(&out2).unwrap(), b"cbbaaa");
    }

    #[tokio::test]
    async fn probe_failure_falls_back_to_decode() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = write_chunks(dir.path(), &[&[0u8; 25]]).await;
        let tooling = Arc::new(FakeAudioTooling::new(10).with_failing_probe());
        let assembler = AudioAssembler::new(tooling.clone());

        let artifact = assembler
            .assemble(&chunks, &dir.path().join("out.mp3"))
            .await
            .unwrap();
        assert_eq!(artifact.duration_seconds, 3);
        assert_eq!(tooling.decode_calls(), 1);
    }

    #[tokio::test]
    async fn empty_chunk_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = AudioAssembler::new(Arc::new(FakeAudioTooling::new(1)));
        assert!(assembler.assemble(&[], &dir.path().join("o.mp3")).await.is_err());
    }

    #[test]
    fn list_quotes_paths() {
        let chunks = vec![Chunk {
            index: 0,
            path: PathBuf::from("/tmp/it's/chunk_00000.mp3"),
            bytes: 1,
        }];
        assert_eq!(concat_list(&chunks), "file '/tmp/it'\\''s/chunk_00000.mp3'\n");
    }

    #[test]
    fn rounding() {
        assert_eq!(round_duration(754.4), 754);
        assert_eq!(round_duration(754.5), 755);
        assert_eq!(round_duration(-1.0), 0);
        assert_eq!(round_duration(f64::NAN), 0);
    }

    /// Runs against the real binaries; returns early when they are missing.
    #[tokio::test]
    async fn real_ffmpeg_concat_is_deterministic() {
        let tooling = Arc::new(FfmpegTooling::default());
        let dir = tempfile::tempdir().unwrap();

        let mut chunks = Vec::new();
        for (index, freq) in [440, 660].into_iter().enumerate() {
            let path = dir.path().join(format!("chunk_{index:05}.mp3"));
            let generated = process::run_tool_checked(
                tooling.ffmpeg(),
                [
                    "-nostdin".to_string(),
                    "-v".to_string(),
                    "error".to_string(),
                    "-f".to_string(),
                    "lavfi".to_string(),
                    "-i".to_string(),
                    format!("sine=frequency={freq}:duration=2"),
                    "-c:a".to_string(),
                    "libmp3lame".to_string(),
                    path.to_string_lossy().into_owned(),
                ],
                std::time::Duration::from_secs(30),
            )
            .await;
            if generated.is_err() {
                eprintln!("skipping: ffmpeg with libmp3lame not available");
                return;
            }
            let bytes = std::fs::metadata(&path).unwrap().len();
            chunks.push(Chunk { index, path, bytes });
        }

        let assembler = AudioAssembler::new(tooling.clone());
        let a = assembler.assemble(&chunks, &dir.path().join("a.mp3")).await.unwrap();
        let b = assembler.assemble(&chunks, &dir.path().join("b.mp3")).await.unwrap();
        assert_eq!(std::fs::read(&a.path).unwrap(), std::fs::read(&b.path).unwrap());
        assert!((3..=5).contains(&a.duration_seconds), "{}", a.duration_seconds);

        let probed = tooling.probe_duration(&a.path).await.unwrap();
        let decoded = tooling.decode_duration(&a.path).await.unwrap();
        assert!((probed - decoded).abs() <= 1.0, "probe {probed} vs decode {decoded}");

        let reversed: Vec<_> = chunks.iter().rev().cloned().collect();
        let c = assembler.assemble(&reversed, &dir.path().join("c.mp3")).await.unwrap();
        assert_ne!(std::fs::read(&a.path).unwrap(), std::fs::read(&c.path).unwrap());
    }
}
