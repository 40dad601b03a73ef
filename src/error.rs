//! エラー定義
//!
//! 1 サイクル（正規化 → 文字起こし → 応答）の失敗は `PipelineError` として
//! 明示的に返し、HTTP ステータスや WebSocket の `{"ok": false}` 応答へ変換します。
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// 設定読み込み時のエラー
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access configuration file: {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file: {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize configuration")]
    Serialize(#[source] toml::ser::Error),
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

/// 変換ツール（ffmpeg）による正規化の失敗
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("ffmpeg conversion failed (status {status}): {diagnostic}")]
    Failed { status: i32, diagnostic: String },
    #[error("ffmpeg produced no output")]
    MissingOutput,
    #[error("converted audio is not canonical: {0}")]
    NotCanonical(String),
    #[error("ffmpeg timed out after {0:?}")]
    TimedOut(Duration),
    #[error("failed to launch ffmpeg")]
    Launch(#[source] std::io::Error),
}

/// 認識エンジン呼び出しの失敗
#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("failed to read canonical audio: {0}")]
    Audio(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("engine worker stopped before replying")]
    WorkerGone,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("payload exceeds the {limit} byte upload limit")]
    PayloadTooLarge { limit: u64 },
    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("Model not ready")]
    EngineNotReady,
    #[error(transparent)]
    Format(FormatError),
    #[error(transparent)]
    Transcription(TranscriptionError),
    #[error("invalid text frame: {0}")]
    Protocol(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// クライアントへ返してよいメッセージ（内部障害の詳細は隠す）
    pub fn client_message(&self) -> String {
        match self {
            PipelineError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<FormatError> for PipelineError {
    fn from(err: FormatError) -> Self {
        match err {
            // 起動時に ffmpeg の存在は確認済みなので、ここでの起動失敗は想定外の障害
            FormatError::Launch(source) => {
                PipelineError::Internal(format!("failed to launch ffmpeg: {source}"))
            }
            other => PipelineError::Format(other),
        }
    }
}

impl From<TranscriptionError> for PipelineError {
    fn from(err: TranscriptionError) -> Self {
        match err {
            TranscriptionError::WorkerGone => PipelineError::Internal(err.to_string()),
            other => PipelineError::Transcription(other),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_failure_is_internal() {
        let err: PipelineError =
            FormatError::Launch(std::io::Error::new(std::io::ErrorKind::NotFound, "ffmpeg")).into();
        assert!(matches!(err, PipelineError::Internal(_)));
    }

    #[test]
    fn internal_message_is_not_leaked() {
        let err = PipelineError::Internal("disk /var/secret full".to_string());
        assert_eq!(err.client_message(), "internal server error");

        let err: PipelineError = FormatError::MissingOutput.into();
        assert_eq!(err.client_message(), "ffmpeg produced no output");
    }
}
