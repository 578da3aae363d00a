//! FFmpeg-backed transcoder.
//!
//! Shells out to `ffprobe` for the input duration and to `ffmpeg` with
//! `-progress pipe:1`, turning its key=value progress stream into percent and
//! ETA updates.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{TranscodeError, TranscodeProgress, TranscodeRequest, Transcoder};
use crate::config::NormalizationConfig;

const STDERR_TAIL_BYTES: usize = 4096;

/// Encoder settings for normalization.
#[derive(Debug, Clone)]
pub struct TranscodeOptions {
    /// Video codec, `copy` to keep the source stream
    pub video_codec: String,
    /// Audio codec, `copy` to keep the source stream
    pub audio_codec: String,
    /// Audio bitrate when re-encoding audio
    pub audio_bitrate: String,
    /// Move the index to the front so receivers can start before the end
    pub faststart: bool,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "192k".to_string(),
            faststart: true,
        }
    }
}

/// Production transcoder running the ffmpeg binaries.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_path: PathBuf,
    ffprobe_path: PathBuf,
    options: TranscodeOptions,
}

impl FfmpegTranscoder {
    pub fn new(config: &NormalizationConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffprobe_path: config.ffprobe_path.clone(),
            options: TranscodeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TranscodeOptions) -> Self {
        self.options = options;
        self
    }

    /// Checks that `ffmpeg -version` runs.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Reads the container duration, `None` when ffprobe cannot tell.
    async fn probe_duration(&self, input: &Path) -> Option<Duration> {
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(input)
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            tracing::debug!(
                "ffprobe failed for {}: {}",
                input.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }
        let seconds: f64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
        (seconds.is_finite() && seconds > 0.0).then(|| Duration::from_secs_f64(seconds))
    }

    fn build_command(&self, request: &TranscodeRequest) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-nostdin", "-nostats", "-y"])
            .arg("-i")
            .arg(&request.input)
            // Only video and audio; subtitle and attachment streams break mp4
            .args(["-map", "0:v:0", "-map", "0:a?"])
            .arg("-c:v")
            .arg(&self.options.video_codec);

        if self.options.video_codec == "libx264" {
            cmd.args(["-preset", "veryfast", "-crf", "22", "-pix_fmt", "yuv420p"]);
        }

        cmd.arg("-c:a").arg(&self.options.audio_codec);
        if self.options.audio_codec != "copy" {
            cmd.arg("-b:a").arg(&self.options.audio_bitrate);
        }

        if self.options.faststart && request.container == "mp4" {
            cmd.args(["-movflags", "+faststart"]);
        }

        cmd.arg("-f")
            .arg(&request.container)
            .args(["-progress", "pipe:1"])
            .arg(&request.output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        progress: watch::Sender<TranscodeProgress>,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError> {
        let started = Instant::now();
        let duration = self.probe_duration(&request.input).await;

        let mut cmd = self.build_command(request);
        tracing::info!(
            "Starting ffmpeg: {} -> {}",
            request.input.display(),
            request.output.display()
        );
        tracing::debug!("ffmpeg command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|source| TranscodeError::Spawn {
            program: self.ffmpeg_path.display().to_string(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or_else(|| TranscodeError::Failed {
            reason: "ffmpeg stdout not captured".to_string(),
        })?;
        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(read_tail(stderr)));

        let mut parser = ProgressParser::new(duration);
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to kill ffmpeg: {}", e);
                    }
                    return Err(TranscodeError::Cancelled);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(update) = parser.feed(&line) {
                            // Nobody listening is fine
                            let _ = progress.send(update);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Failed to read ffmpeg progress: {}", e);
                        break;
                    }
                },
            }
        }

        let exited = tokio::select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status?),
        };
        let Some(status) = exited else {
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill ffmpeg: {}", e);
            }
            return Err(TranscodeError::Cancelled);
        };

        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            tracing::error!("ffmpeg exited with {}: {}", status, stderr_tail);
            return Err(TranscodeError::Failed {
                reason: format!("ffmpeg exited with {status}: {}", stderr_tail.trim()),
            });
        }

        if request.container == "mp4" {
            validate_mp4_header(&request.output).await?;
        }

        tracing::info!(
            "Transcoded {} in {:.2}s",
            request.input.display(),
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }
}

/// Keeps only the last bytes of a stream, for error messages.
async fn read_tail(mut reader: impl AsyncRead + Unpin) -> String {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

/// Checks for the `ftyp` box every mp4 starts with.
async fn validate_mp4_header(path: &Path) -> Result<(), TranscodeError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| TranscodeError::InvalidOutput {
            reason: format!("cannot open output: {e}"),
        })?;
    let mut header = [0u8; 12];
    file.read_exact(&mut header)
        .await
        .map_err(|_| TranscodeError::InvalidOutput {
            reason: "output too small to be an mp4 file".to_string(),
        })?;
    if &header[4..8] != b"ftyp" {
        return Err(TranscodeError::InvalidOutput {
            reason: "output does not start with an ftyp box".to_string(),
        });
    }
    Ok(())
}

/// Incremental parser for ffmpeg's `-progress` key=value output.
///
/// A block of keys ends with `progress=continue` or `progress=end`; one
/// update is emitted per block.
#[derive(Debug)]
pub struct ProgressParser {
    duration: Option<Duration>,
    out_time: Duration,
    speed: Option<f64>,
}

impl ProgressParser {
    pub fn new(duration: Option<Duration>) -> Self {
        Self {
            duration,
            out_time: Duration::ZERO,
            speed: None,
        }
    }

    /// Consumes one line, returning an update at the end of each block.
    pub fn feed(&mut self, line: &str) -> Option<TranscodeProgress> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            // Despite the name, out_time_ms is also in microseconds
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<u64>() {
                    self.out_time = Duration::from_micros(us);
                }
                None
            }
            "speed" => {
                self.speed = value.trim_end_matches('x').trim().parse().ok();
                None
            }
            "progress" if value == "end" => Some(TranscodeProgress {
                percent: 100.0,
                eta: Some(Duration::ZERO),
            }),
            "progress" => Some(self.snapshot()),
            _ => None,
        }
    }

    fn snapshot(&self) -> TranscodeProgress {
        let Some(duration) = self.duration else {
            return TranscodeProgress::default();
        };
        let percent = (self.out_time.as_secs_f64() / duration.as_secs_f64() * 100.0).clamp(0.0, 100.0);
        let remaining = duration.saturating_sub(self.out_time).as_secs_f64();
        let eta = self
            .speed
            .filter(|s| *s > 0.0)
            .map(|s| Duration::from_secs_f64(remaining / s));
        TranscodeProgress { percent, eta }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_progress_parser_blocks() {
        let mut parser = ProgressParser::new(Some(Duration::from_secs(100)));
        assert_eq!(parser.feed("frame=120"), None);
        assert_eq!(parser.feed("out_time_us=25000000"), None);
        assert_eq!(parser.feed("speed=2.5x"), None);

        let update = parser.feed("progress=continue").unwrap();
        assert_eq!(update.percent, 25.0);
        assert_eq!(update.eta, Some(Duration::from_secs(30)));

        let done = parser.feed("progress=end").unwrap();
        assert_eq!(done.percent, 100.0);
    }

    #[test]
    fn test_progress_parser_without_duration() {
        let mut parser = ProgressParser::new(None);
        parser.feed("out_time_us=5000000");
        parser.feed("speed=N/A");
        let update = parser.feed("progress=continue").unwrap();
        assert_eq!(update, TranscodeProgress::default());
    }

    #[test]
    fn test_build_command_arguments() {
        let transcoder = FfmpegTranscoder::new(&NormalizationConfig::default());
        let request = TranscodeRequest {
            input: PathBuf::from("/videos/in.mkv"),
            output: PathBuf::from("/videos/.tidecast-x-in.mp4.partial"),
            container: "mp4".to_string(),
        };
        let cmd = transcoder.build_command(&request);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(args.windows(2).any(|w| w == ["-f", "mp4"]));
        assert!(args.windows(2).any(|w| w == ["-progress", "pipe:1"]));
        assert!(args.windows(2).any(|w| w == ["-movflags", "+faststart"]));
        assert_eq!(args.last().unwrap(), "/videos/.tidecast-x-in.mp4.partial");
    }

    #[test]
    fn test_stream_copy_skips_encoder_settings() {
        let transcoder =
            FfmpegTranscoder::new(&NormalizationConfig::default()).with_options(TranscodeOptions {
                video_codec: "copy".to_string(),
                audio_codec: "copy".to_string(),
                audio_bitrate: "192k".to_string(),
                faststart: false,
            });
        let request = TranscodeRequest {
            input: PathBuf::from("/videos/in.mkv"),
            output: PathBuf::from("/videos/out.mp4"),
            container: "mp4".to_string(),
        };
        let args: Vec<String> = transcoder
            .build_command(&request)
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(args.windows(2).any(|w| w == ["-c:a", "copy"]));
        assert!(!args.iter().any(|a| a == "-b:a" || a == "-movflags"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = tempdir().unwrap();
        let config = NormalizationConfig {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg"),
            ffprobe_path: PathBuf::from("/nonexistent/ffprobe"),
            ..NormalizationConfig::default()
        };
        let transcoder = FfmpegTranscoder::new(&config);
        let request = TranscodeRequest {
            input: dir.path().join("in.mkv"),
            output: dir.path().join("out.mp4"),
            container: "mp4".to_string(),
        };
        let (tx, _rx) = watch::channel(TranscodeProgress::default());

        let result = transcoder
            .transcode(&request, tx, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TranscodeError::Spawn { .. })));
        assert!(!transcoder.is_available().await);
    }

    #[tokio::test]
    async fn test_validate_mp4_header() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.mp4");
        std::fs::write(&good, b"\x00\x00\x00\x18ftypisom\x00\x00\x02\x00").unwrap();
        let bad = dir.path().join("bad.mp4");
        std::fs::write(&bad, b"not an mp4 file at all").unwrap();

        assert!(validate_mp4_header(&good).await.is_ok());
        assert!(matches!(
            validate_mp4_header(&bad).await,
            Err(TranscodeError::InvalidOutput { .. })
        ));
    }
}
