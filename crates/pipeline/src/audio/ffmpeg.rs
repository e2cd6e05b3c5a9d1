//! `ffmpeg`/`ffprobe` backed [`AudioTooling`].

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::AudioTooling;
use super::process::run_tool_checked;
use crate::error::StageError;

static RE_OUT_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^out_time=(\d+):(\d{2}):(\d{2}(?:\.\d+)?)\s*$").expect("valid out_time regex")
});

/// Default per-invocation limit for external tools.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct FfmpegTooling {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl FfmpegTooling {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            timeout,
        }
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }

    pub fn ffprobe(&self) -> &Path {
        &self.ffprobe
    }
}

impl Default for FfmpegTooling {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe", DEFAULT_TOOL_TIMEOUT)
    }
}

#[async_trait]
impl AudioTooling for FfmpegTooling {
    async fn concat(&self, list_file: &Path, output: &Path) -> Result<(), StageError> {
        run_tool_checked(
            &self.ffmpeg,
            [
                OsStr::new("-nostdin"),
                OsStr::new("-hide_banner"),
                OsStr::new("-loglevel"),
                OsStr::new("error"),
                OsStr::new("-y"),
                OsStr::new("-f"),
                OsStr::new("concat"),
                OsStr::new("-safe"),
                OsStr::new("0"),
                OsStr::new("-i"),
                list_file.as_os_str(),
                OsStr::new("-c"),
                OsStr::new("copy"),
                OsStr::new("-map_metadata"),
                OsStr::new("-1"),
                OsStr::new("-fflags"),
                OsStr::new("+bitexact"),
                output.as_os_str(),
            ],
            self.timeout,
        )
        .await?;
        Ok(())
    }

    async fn probe_duration(&self, path: &Path) -> Result<f64, StageError> {
        let out = run_tool_checked(
            &self.ffprobe,
            [
                OsStr::new("-v"),
                OsStr::new("error"),
                OsStr::new("-show_entries"),
                OsStr::new("format=duration"),
                OsStr::new("-of"),
                OsStr::new("default=noprint_wrappers=1:nokey=1"),
                path.as_os_str(),
            ],
            self.timeout,
        )
        .await?;
        parse_probe_duration(&out.stdout).ok_or_else(|| {
            StageError::tool(
                "ffprobe",
                format!("no duration in output {:?}", out.stdout.trim()),
            )
        })
    }

    async fn decode_duration(&self, path: &Path) -> Result<f64, StageError> {
        let out = run_tool_checked(
            &self.ffmpeg,
            [
                OsStr::new("-nostdin"),
                OsStr::new("-hide_banner"),
                OsStr::new("-v"),
                OsStr::new("error"),
                OsStr::new("-i"),
                path.as_os_str(),
                OsStr::new("-f"),
                OsStr::new("null"),
                OsStr::new("-progress"),
                OsStr::new("pipe:1"),
                OsStr::new("-"),
            ],
            self.timeout,
        )
        .await?;
        parse_progress_duration(&out.stdout)
            .ok_or_else(|| StageError::tool("ffmpeg", "decode produced no progress time"))
    }
}

/// Parse `ffprobe -show_entries format=duration` output.
pub fn parse_probe_duration(stdout: &str) -> Option<f64> {
    let secs: f64 = stdout.lines().map(str::trim).find(|l| !l.is_empty())?.parse().ok()?;
    (secs.is_finite() && secs > 0.0).then_some(secs)
}

/// Last `out_time=` entry of `ffmpeg -progress` output, in seconds.
pub fn parse_progress_duration(stdout: &str) -> Option<f64> {
    let caps = RE_OUT_TIME.captures_iter(stdout).last()?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    (total > 0.0).then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_output_is_parsed() {
        assert_eq!(parse_probe_duration("754.368000\n"), Some(754.368));
        assert_eq!(parse_probe_duration("N/A\n"), None);
        assert_eq!(parse_probe_duration(""), None);
        assert_eq!(parse_probe_duration("0.000000"), None);
    }

    #[test]
    fn progress_output_uses_last_entry() {
        let out = "frame=0\nout_time_us=-9223372036854775807\nout_time=-2562047788:00:54.775807\nprogress=continue\n\
                   out_time_us=5015510\nout_time=00:00:05.015510\nprogress=continue\n\
                   out_time_us=12600000\nout_time=00:12:34.600000\nprogress=end\n";
        let secs = parse_progress_duration(out).unwrap();
        assert!((secs - 754.6).abs() < 1e-6);
        assert_eq!(parse_progress_duration("progress=end\n"), None);
    }
}
