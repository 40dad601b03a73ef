// テスト用の共通ヘルパー
// ffmpeg や whisper モデルなしでパイプライン全体を動かすための差し替え実装
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use whisper_stt_service::audio::TargetProfile;
use whisper_stt_service::config::Config;
use whisper_stt_service::engine::{DecodeOptions, EngineHandle, RawTranscription, SpeechRecognizer};
use whisper_stt_service::error::{FormatError, TranscriptionError};
use whisper_stt_service::guard::TempWorkspace;
use whisper_stt_service::handlers::AppState;
use whisper_stt_service::metrics::Metrics;
use whisper_stt_service::models::Segment;
use whisper_stt_service::pipeline::Pipeline;
use whisper_stt_service::transcoder::{Normalizer, Transcoder};

/// 16kHz / mono / 16bit の WAV バイト列
pub fn wav_bytes(samples: &[i16]) -> Vec<u8> {
    let data_size = (samples.len() * 2) as u32;
    let mut wav = Vec::with_capacity(44 + samples.len() * 2);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_size).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&16_000u32.to_le_bytes());
    wav.extend_from_slice(&32_000u32.to_le_bytes()); // byte rate
    wav.extend_from_slice(&2u16.to_le_bytes()); // block align
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_size.to_le_bytes());
    for s in samples {
        wav.extend_from_slice(&s.to_le_bytes());
    }
    wav
}

/// 発話とみなされる振幅の正弦波
pub fn tone(seconds: f32) -> Vec<i16> {
    let n = (seconds * 16_000.0) as usize;
    (0..n).map(|i| ((i as f32 * 0.05).sin() * 8_000.0) as i16).collect()
}

pub fn speech_wav(seconds: f32) -> Vec<u8> {
    wav_bytes(&tone(seconds))
}

/// RIFF ヘッダを持つ入力はそのままコピー、それ以外は ffmpeg と同様に失敗させる
#[derive(Default)]
pub struct PassthroughTranscoder {
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl PassthroughTranscoder {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transcoder for PassthroughTranscoder {
    async fn convert(&self, input: &Path, output: &Path, _profile: &TargetProfile) -> Result<(), FormatError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let bytes = tokio::fs::read(input).await.map_err(FormatError::Launch)?;
        if !bytes.starts_with(b"RIFF") {
            return Err(FormatError::Failed {
                status: 1,
                diagnostic: "Invalid data found when processing input".to_string(),
            });
        }
        tokio::fs::write(output, bytes).await.map_err(FormatError::Launch)?;
        Ok(())
    }
}

/// 言語はそのまま（未指定なら "en"）、テキストはプロンプトがあればそれを返す
#[derive(Default)]
pub struct EchoRecognizer {
    pub calls: AtomicUsize,
}

impl SpeechRecognizer for EchoRecognizer {
    fn recognize(&self, samples: &[f32], options: &DecodeOptions) -> Result<RawTranscription, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = options.initial_prompt.clone().unwrap_or_else(|| "hello world".to_string());
        Ok(RawTranscription {
            language: Some(options.language.clone().unwrap_or_else(|| "en".to_string())),
            segments: vec![Segment {
                start: 0.0,
                end: samples.len() as f64 / 16_000.0,
                text: format!(" {text} "),
            }],
        })
    }
}

/// テスト用の部品一式（TempDir はテスト終了まで保持すること）
pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub workspace: TempWorkspace,
    pub pipeline: Pipeline,
    pub recognizer: Arc<EchoRecognizer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Arc::new(PassthroughTranscoder::default()), true)
    }

    pub fn without_engine() -> Self {
        Self::build(Arc::new(PassthroughTranscoder::default()), false)
    }

    pub fn build(transcoder: Arc<dyn Transcoder>, with_engine: bool) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.temp_dir = dir.path().join("temp").to_string_lossy().to_string();
        config.limits.max_upload_mb = 1;

        let workspace = TempWorkspace::create(config.temp_base()).unwrap();
        let recognizer = Arc::new(EchoRecognizer::default());
        let engine = with_engine.then(|| EngineHandle::start(recognizer.clone(), 1).unwrap());
        let pipeline = Pipeline::new(
            Normalizer::new(transcoder, workspace.clone()),
            engine,
            Metrics::new().unwrap(),
        );

        Self {
            dir,
            config,
            workspace,
            pipeline,
            recognizer,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(self.config.clone(), self.pipeline.clone())
    }

    pub fn leftover_artifacts(&self) -> usize {
        self.workspace.artifacts().unwrap().len()
    }
}
