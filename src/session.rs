//! WebSocket セッションの状態機械
//!
//! ```text
//! AwaitingInitialConfig ──(設定 / タイムアウト / 最初のチャンク)──▶ Active ──(切断)──▶ Closed
//! ```
//!
//! - Active では届いた順にフレームを処理する（チャンク処理が 2 つ同時に走ることはない）
//! - チャンク処理中も受信を続け、切断に気付いたら処理中のサイクルを破棄する
//!   （ffmpeg は kill、一時ファイルは削除）
//! - 処理中に届いたフレームは順番どおりに溜めておき、サイクル完了後に処理する
use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::metrics::TransportKind;
use crate::models::{normalize_language, SessionConfig, SessionReply, TranscriptionResult};
use crate::pipeline::Pipeline;
use crate::transport::{Inbound, SessionTransport, TransportError};

/// チャンク処理中に溜めておけるフレーム数（超えたら受信を一時停止）
pub const MAX_PENDING_FRAMES: usize = 64;
/// ブラウザの MediaRecorder 既定に合わせたチャンクの拡張子
pub const CHUNK_SUFFIX: &str = ".webm";
/// 1013: Try Again Later
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
/// 1011: Internal Error
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

const INVALID_TEXT_FRAME: &str = "invalid text frame";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingInitialConfig,
    Active,
    Closed,
}

// =============================================================================
// Config updates
// =============================================================================

/// 部分更新: `None` = 変更なし, `Some(None)` = リセット, `Some(Some(v))` = 設定
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub language: Option<Option<String>>,
    pub initial_prompt: Option<Option<String>>,
}

impl ConfigUpdate {
    /// テキストフレームを検証する。1 項目でも不正なら全体を拒否
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| PipelineError::Protocol(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| PipelineError::Protocol("expected a JSON object".to_string()))?;

        Ok(Self {
            language: optional_string(object, "language")?,
            initial_prompt: optional_string(object, "initial_prompt")?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.language.is_none() && self.initial_prompt.is_none()
    }

    pub fn apply(self, config: &mut SessionConfig) {
        if let Some(language) = self.language {
            config.language = normalize_language(language);
        }
        if let Some(prompt) = self.initial_prompt {
            config.initial_prompt = prompt.filter(|p| !p.trim().is_empty());
        }
    }
}

fn optional_string(
    object: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<Option<String>>, PipelineError> {
    match object.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(Value::String(s)) => Ok(Some(Some(s.clone()))),
        Some(_) => Err(PipelineError::Protocol(format!("{key} must be a string or null"))),
    }
}

// =============================================================================
// Session
// =============================================================================

enum Flow {
    Continue,
    Disconnected,
}

/// チャンク処理中の select の結果
enum CycleOutcome {
    Finished(Result<TranscriptionResult, PipelineError>),
    Disconnected,
    TransportFault(TransportError),
}

pub struct Session<T: SessionTransport> {
    id: String,
    transport: T,
    pipeline: Pipeline,
    config: SessionConfig,
    state: SessionState,
    initial_config_timeout: Duration,
    pending: VecDeque<Inbound>,
    chunks: u64,
}

impl<T: SessionTransport> Session<T> {
    pub fn new(transport: T, pipeline: Pipeline, initial_config_timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            transport,
            pipeline,
            config: SessionConfig::default(),
            state: SessionState::AwaitingInitialConfig,
            initial_config_timeout,
            pending: VecDeque::new(),
            chunks: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Closed に到達するまでセッションを駆動する
    pub async fn run(mut self) -> SessionState {
        info!(session_id = %self.id, "session opened");

        if self.await_initial_config().await {
            if self.pipeline.engine_ready() {
                self.state = SessionState::Active;
                self.run_active().await;
            } else {
                let reply = SessionReply::error(PipelineError::EngineNotReady.client_message());
                let _ = self.transport.send_text(reply.to_json()).await;
                let _ = self.transport.close(CLOSE_TRY_AGAIN_LATER, "Model not ready").await;
            }
        }

        self.state = SessionState::Closed;
        self.pending.clear();
        info!(session_id = %self.id, chunks = self.chunks, "session closed");
        self.state
    }

    /// 任意の初期設定を短いタイムアウト付きで待つ。切断されていたら false
    async fn await_initial_config(&mut self) -> bool {
        let first = match tokio::time::timeout(self.initial_config_timeout, self.transport.recv()).await {
            // タイムアウトは正常系: 既定値のまま進む
            Err(_) => return true,
            Ok(frame) => frame,
        };

        match first {
            None | Some(Ok(Inbound::Close)) => false,
            Some(Err(e)) => {
                warn!(session_id = %self.id, error = %e, "receive failed before session start");
                false
            }
            Some(Ok(Inbound::Text(text))) => {
                match ConfigUpdate::parse(&text) {
                    Ok(update) => {
                        update.apply(&mut self.config);
                        debug!(session_id = %self.id, config = ?self.config, "initial config applied");
                    }
                    Err(e) => {
                        warn!(session_id = %self.id, error = %e, "malformed initial config, using defaults")
                    }
                }
                true
            }
            // 設定を送らずにいきなり音声を送ってきた場合は最初のチャンクとして扱う
            Some(Ok(binary @ Inbound::Binary(_))) => {
                self.pending.push_back(binary);
                true
            }
        }
    }

    async fn run_active(&mut self) {
        loop {
            let frame = match self.pending.pop_front() {
                Some(frame) => Some(Ok(frame)),
                None => self.transport.recv().await,
            };

            let flow = match frame {
                None | Some(Ok(Inbound::Close)) => Flow::Disconnected,
                Some(Err(e)) => {
                    warn!(session_id = %self.id, error = %e, "transport fault, closing session");
                    self.abort_on_transport_fault().await
                }
                Some(Ok(Inbound::Text(text))) => self.handle_text(&text).await,
                Some(Ok(Inbound::Binary(bytes))) => self.handle_chunk(bytes).await,
            };

            if let Flow::Disconnected = flow {
                return;
            }
        }
    }

    /// 設定更新。検証に通った場合のみ反映する
    async fn handle_text(&mut self, text: &str) -> Flow {
        let reply = match ConfigUpdate::parse(text) {
            Ok(update) => {
                update.apply(&mut self.config);
                info!(
                    session_id = %self.id,
                    language = ?self.config.language,
                    has_prompt = self.config.initial_prompt.is_some(),
                    "session config updated"
                );
                SessionReply::config_updated()
            }
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "rejected config update");
                SessionReply::error(INVALID_TEXT_FRAME)
            }
        };
        self.send(reply).await
    }

    /// 1 チャンク = 1 サイクル。失敗してもセッションは継続する
    async fn handle_chunk(&mut self, bytes: Vec<u8>) -> Flow {
        self.chunks += 1;
        let pipeline = self.pipeline.clone();
        let config = self.config.clone();

        // cycle はこのブロックを抜けた時点で破棄される
        let outcome = {
            let cycle = pipeline.observe(
                TransportKind::WebSocket,
                pipeline.process_bytes(&bytes, CHUNK_SUFFIX, &config),
            );
            tokio::pin!(cycle);

            loop {
                tokio::select! {
                    result = &mut cycle => break CycleOutcome::Finished(result),
                    frame = self.transport.recv(), if self.pending.len() < MAX_PENDING_FRAMES => match frame {
                        Some(Ok(Inbound::Close)) | None => break CycleOutcome::Disconnected,
                        Some(Err(e)) => break CycleOutcome::TransportFault(e),
                        Some(Ok(frame)) => self.pending.push_back(frame),
                    },
                }
            }
        };

        let result = match outcome {
            CycleOutcome::Finished(result) => result,
            // どちらの場合も cycle は破棄済み（ffmpeg は停止、一時ファイルは削除）
            CycleOutcome::Disconnected => {
                info!(session_id = %self.id, "client disconnected mid-cycle, result discarded");
                return Flow::Disconnected;
            }
            CycleOutcome::TransportFault(e) => {
                warn!(session_id = %self.id, error = %e, "transport fault during chunk processing");
                return self.abort_on_transport_fault().await;
            }
        };

        let reply = match result {
            Ok(result) => {
                debug!(
                    session_id = %self.id,
                    segments = result.segments.len(),
                    language = ?result.language,
                    "chunk transcribed"
                );
                SessionReply::transcript(result)
            }
            Err(e) => SessionReply::error(e.client_message()),
        };
        self.send(reply).await
    }

    /// 受信側の障害: 送れるなら最後にエラーを通知し、1011 で閉じる
    async fn abort_on_transport_fault(&mut self) -> Flow {
        let reply = SessionReply::error("transport error");
        let _ = self.transport.send_text(reply.to_json()).await;
        let _ = self.transport.close(CLOSE_INTERNAL_ERROR, "transport error").await;
        Flow::Disconnected
    }

    async fn send(&mut self, reply: SessionReply) -> Flow {
        match self.transport.send_text(reply.to_json()).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "reply not delivered, peer gone");
                Flow::Disconnected
            }
        }
    }
}
