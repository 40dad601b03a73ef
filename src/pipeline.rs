//! 1 サイクル（アップロード原本 → 正規化 → 文字起こし）の実行
//!
//! 単発アップロードと WebSocket の各チャンクの両方から使われます。
//! 一時ファイルはすべて `TempArtifact` が所有し、成功・失敗・キャンセルの
//! どの経路でもサイクル終了までに削除されます。
use std::future::Future;
use std::time::Instant;

use tracing::{error, warn};

use crate::engine::EngineHandle;
use crate::error::PipelineError;
use crate::guard::{TempArtifact, TempWorkspace};
use crate::metrics::{Metrics, TransportKind};
use crate::models::{SessionConfig, TranscriptionResult};
use crate::transcoder::Normalizer;

#[derive(Clone)]
pub struct Pipeline {
    normalizer: Normalizer,
    engine: Option<EngineHandle>,
    metrics: Metrics,
}

impl Pipeline {
    pub fn new(normalizer: Normalizer, engine: Option<EngineHandle>, metrics: Metrics) -> Self {
        Self {
            normalizer,
            engine,
            metrics,
        }
    }

    pub fn workspace(&self) -> &TempWorkspace {
        self.normalizer.workspace()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn engine_ready(&self) -> bool {
        self.engine.is_some()
    }

    pub fn ensure_ready(&self) -> Result<(), PipelineError> {
        if self.engine_ready() {
            Ok(())
        } else {
            Err(PipelineError::EngineNotReady)
        }
    }

    /// 書き込み済みの原本を処理する。原本・正規化済み WAV ともにここで削除される
    pub async fn process_file(
        &self,
        input: TempArtifact,
        config: &SessionConfig,
    ) -> Result<TranscriptionResult, PipelineError> {
        let engine = self.engine.as_ref().ok_or(PipelineError::EngineNotReady)?;

        let canonical = self.normalizer.normalize(&input).await?;
        input.release();

        let result = engine
            .transcribe(
                canonical.path(),
                config.language.as_deref(),
                config.initial_prompt.as_deref(),
            )
            .await?;
        canonical.release();

        Ok(result)
    }

    /// メモリ上のチャンクを一時ファイルへ書き出してから処理する
    pub async fn process_bytes(
        &self,
        bytes: &[u8],
        suffix: &str,
        config: &SessionConfig,
    ) -> Result<TranscriptionResult, PipelineError> {
        self.ensure_ready()?;
        let input = self.workspace().acquire(suffix)?;
        tokio::fs::write(input.path(), bytes).await?;
        self.process_file(input, config).await
    }

    /// リクエスト数・所要時間・エラー数を記録しつつ `cycle` を実行する
    pub async fn observe<F, T>(&self, transport: TransportKind, cycle: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        self.metrics.record_request(transport);
        let started = Instant::now();

        let result = cycle.await;

        let elapsed = started.elapsed();
        self.metrics.observe_duration(elapsed);
        if let Err(err) = &result {
            self.metrics.record_error();
            match err {
                PipelineError::Internal(detail) => {
                    error!(transport = transport.as_str(), error = %detail, "unexpected fault")
                }
                other => warn!(
                    transport = transport.as_str(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %other,
                    "transcription cycle failed"
                ),
            }
        }
        result
    }
}
