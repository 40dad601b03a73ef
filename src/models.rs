use serde::{Deserialize, Serialize};

// =============================================================================
// Core Data Models
// =============================================================================

/// 認識結果の 1 区間（秒単位）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// 1 サイクル分の文字起こし結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub language: Option<String>,
    pub duration: Option<f64>,
    pub transcript: String,
    pub segments: Vec<Segment>,
}

impl TranscriptionResult {
    /// エンジンの生セグメントから結果を組み立てる
    /// - テキストは trim し、空になったセグメントは捨てる
    /// - 時刻は 0 以上、end >= start に揃える
    /// - transcript は残ったセグメントを半角スペースで結合
    pub fn from_segments<I>(language: Option<String>, duration: Option<f64>, raw: I) -> Self
    where
        I: IntoIterator<Item = Segment>,
    {
        let segments: Vec<Segment> = raw
            .into_iter()
            .filter_map(|seg| {
                let text = seg.text.trim();
                if text.is_empty() {
                    return None;
                }
                let start = seg.start.max(0.0);
                Some(Segment {
                    start,
                    end: seg.end.max(start),
                    text: text.to_string(),
                })
            })
            .collect();

        let transcript = segments
            .iter()
            .map(|seg| seg.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string();

        Self {
            language,
            duration,
            transcript,
            segments,
        }
    }
}

/// セッションごとの可変設定（未設定 = 自動判定 / プロンプトなし）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
}

/// "auto" と空文字は自動判定として扱う
pub fn normalize_language(language: Option<String>) -> Option<String> {
    language
        .map(|lang| lang.trim().to_string())
        .filter(|lang| !lang.is_empty() && !lang.eq_ignore_ascii_case("auto"))
}

// =============================================================================
// API Request/Response Models
// =============================================================================

/// 単発アップロードのクエリパラメータ（multipart フィールドが優先）
#[derive(Debug, Default, Deserialize)]
pub struct TranscribeQuery {
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
}

/// WebSocket の応答メッセージ
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SessionReply {
    Transcript {
        ok: bool,
        transcript: String,
        segments: Vec<Segment>,
        duration: Option<f64>,
        language: Option<String>,
    },
    Ack {
        ok: bool,
        msg: String,
    },
    Error {
        ok: bool,
        error: String,
    },
}

impl SessionReply {
    pub fn transcript(result: TranscriptionResult) -> Self {
        SessionReply::Transcript {
            ok: true,
            transcript: result.transcript,
            segments: result.segments,
            duration: result.duration,
            language: result.language,
        }
    }

    pub fn config_updated() -> Self {
        SessionReply::Ack {
            ok: true,
            msg: "config updated".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        SessionReply::Error {
            ok: false,
            error: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"ok":false,"error":"serialization failed"}"#.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub env: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub details: Option<String>,
}

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiErrorCode {
    InvalidInput,
    FileTooLarge,
    UnsupportedFormat,
    RateLimited,
    ModelNotLoaded,
    TranscriptionFailed,
    InternalError,
}

impl ApiErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorCode::InvalidInput => "INVALID_INPUT",
            ApiErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            ApiErrorCode::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ApiErrorCode::RateLimited => "RATE_LIMITED",
            ApiErrorCode::ModelNotLoaded => "MODEL_NOT_LOADED",
            ApiErrorCode::TranscriptionFailed => "TRANSCRIPTION_FAILED",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}
