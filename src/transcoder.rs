//! フォーマット正規化（ffmpeg による 16kHz / mono / PCM16 への変換）
//!
//! 申告された Content-Type は信用せず、受理・拒否の判断は ffmpeg の終了コードのみで行います。
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::audio::{self, TargetProfile, CANONICAL};
use crate::config::AudioConfig;
use crate::error::{FormatError, PipelineError};
use crate::guard::{TempArtifact, TempWorkspace};

/// 診断メッセージとして残す stderr の末尾行数
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// 任意フォーマット → 指定プロファイルへの変換器
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn convert(&self, input: &Path, output: &Path, profile: &TargetProfile) -> Result<(), FormatError>;
}

// =============================================================================
// ffmpeg
// =============================================================================

#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: String,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(
            config.ffmpeg_path.clone(),
            Duration::from_secs(config.transcode_timeout_seconds),
        )
    }

    /// `-nostdin -y -i <in> -ar 16000 -ac 1 -c:a pcm_s16le <out>`
    pub fn args(input: &Path, output: &Path, profile: &TargetProfile) -> Vec<OsString> {
        vec![
            "-nostdin".into(),
            "-y".into(),
            "-i".into(),
            input.as_os_str().to_owned(),
            "-ar".into(),
            profile.sample_rate.to_string().into(),
            "-ac".into(),
            profile.channels.to_string().into(),
            "-c:a".into(),
            profile.codec.into(),
            output.as_os_str().to_owned(),
        ]
    }

    /// 起動時チェック: `ffmpeg -version` の 1 行目を返す
    pub async fn ensure_available(&self) -> Result<String, FormatError> {
        let output = Command::new(&self.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(FormatError::Launch)?;

        if !output.status.success() {
            return Err(FormatError::Failed {
                status: output.status.code().unwrap_or(-1),
                diagnostic: stderr_tail(&output.stderr),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn convert(&self, input: &Path, output: &Path, profile: &TargetProfile) -> Result<(), FormatError> {
        // kill_on_drop: タイムアウトや呼び出し元のキャンセルで future が破棄されたら子プロセスも止める
        let child = Command::new(&self.binary)
            .args(Self::args(input, output, profile))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(FormatError::Launch)?;

        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(FormatError::Launch)?,
            Err(_) => {
                warn!(timeout = ?self.timeout, input = %input.display(), "ffmpeg timed out, killed");
                return Err(FormatError::TimedOut(self.timeout));
            }
        };

        if !result.status.success() {
            return Err(FormatError::Failed {
                status: result.status.code().unwrap_or(-1),
                diagnostic: stderr_tail(&result.stderr),
            });
        }

        Ok(())
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
    lines[start..].join("\n")
}

// =============================================================================
// Normalizer
// =============================================================================

/// 入力アーティファクト → 正規化済み WAV アーティファクト
#[derive(Clone)]
pub struct Normalizer {
    transcoder: Arc<dyn Transcoder>,
    workspace: TempWorkspace,
    profile: TargetProfile,
}

impl Normalizer {
    pub fn new(transcoder: Arc<dyn Transcoder>, workspace: TempWorkspace) -> Self {
        Self {
            transcoder,
            workspace,
            profile: CANONICAL,
        }
    }

    pub fn workspace(&self) -> &TempWorkspace {
        &self.workspace
    }

    /// 失敗時は出力アーティファクトを削除してからエラーを返す（部分的な結果は返さない）。
    /// 入力の削除は呼び出し元の責任
    pub async fn normalize(&self, input: &TempArtifact) -> Result<TempArtifact, PipelineError> {
        let output = self.workspace.acquire(".wav")?;

        self.transcoder
            .convert(input.path(), output.path(), &self.profile)
            .await?;

        let size = tokio::fs::metadata(output.path())
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        if size == 0 {
            return Err(FormatError::MissingOutput.into());
        }

        let path = output.path().to_path_buf();
        let metadata = tokio::task::spawn_blocking(move || audio::probe_metadata(path))
            .await
            .map_err(|e| PipelineError::Internal(format!("probe task failed: {e}")))?
            .map_err(FormatError::NotCanonical)?;

        if !metadata.matches(&self.profile) {
            return Err(FormatError::NotCanonical(format!(
                "{} Hz, {} ch, {:?} bit",
                metadata.sample_rate, metadata.channels, metadata.bits_per_sample
            ))
            .into());
        }

        debug!(
            duration_seconds = metadata.duration_seconds,
            size = %audio::format_file_size(metadata.file_size_bytes),
            "audio normalized"
        );
        Ok(output)
    }
}

/// 起動時に ffmpeg の存在を確認（見つからなければ起動失敗）
pub async fn ensure_available(transcoder: &FfmpegTranscoder) -> Result<(), FormatError> {
    let version = transcoder.ensure_available().await?;
    info!(%version, "ffmpeg available");
    Ok(())
}
