use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::config::{ComputeType, WhisperConfig};
use crate::engine::{DecodeOptions, RawTranscription, SpeechRecognizer};
use crate::error::TranscriptionError;
use crate::models::Segment;

/// 推論ポリシー: ビームサーチ幅
const BEAM_SIZE: i32 = 5;

/// whisper.cpp バックエンド
/// - モデル（`WhisperContext`）はプロセス起動時に 1 度だけ読み込む
/// - 各推論は独立した `state` を生成して実行する
pub struct WhisperRecognizer {
    context: WhisperContext,
    threads: i32,
}

impl WhisperRecognizer {
    /// モデルを読み込む。失敗はプロセス起動の失敗として扱う
    /// - compute_type = gpu でコンテキスト作成に失敗した場合は CPU で再試行
    pub fn load(config: &WhisperConfig) -> Result<Self> {
        let model_path = config.model_path.as_str();
        if !Path::new(model_path).exists() {
            return Err(anyhow::anyhow!(
                "Whisper model file not found: {}\n\
                 download one with:\n\
                 wget https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.bin -P models/",
                model_path
            ));
        }

        let use_gpu = config.compute_type == ComputeType::Gpu;
        let mut ctx_params = WhisperContextParameters::default();
        ctx_params.use_gpu = use_gpu;

        let context = match WhisperContext::new_with_params(model_path, ctx_params) {
            Ok(ctx) => ctx,
            Err(e) if use_gpu => {
                warn!(error = %e, "GPU context initialization failed, retrying on CPU");
                let mut cpu_params = WhisperContextParameters::default();
                cpu_params.use_gpu = false;
                WhisperContext::new_with_params(model_path, cpu_params)
                    .map_err(|e| anyhow::anyhow!("failed to initialize whisper context: {}", e))?
            }
            Err(e) => return Err(anyhow::anyhow!("failed to initialize whisper context: {}", e)),
        };

        info!(model = model_path, gpu = use_gpu, threads = config.threads, "whisper model loaded");

        Ok(Self {
            context,
            threads: config.threads as i32,
        })
    }

    /// - ビームサーチ（幅 5）
    /// - no_context: 前回呼び出しのテキストで条件付けしない
    /// - 進捗ログ等はサーバーコンソールを汚さないよう無効化
    fn make_params<'a>(&self, options: &'a DecodeOptions) -> FullParams<'a, 'static> {
        let mut params = FullParams::new(SamplingStrategy::BeamSearch {
            beam_size: BEAM_SIZE,
            patience: -1.0,
        });

        params.set_language(Some(options.language.as_deref().unwrap_or("auto")));
        if let Some(prompt) = options.initial_prompt.as_deref() {
            params.set_initial_prompt(prompt);
        }
        params.set_no_context(true);
        params.set_n_threads(self.threads);

        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        params
    }
}

impl SpeechRecognizer for WhisperRecognizer {
    fn recognize(&self, samples: &[f32], options: &DecodeOptions) -> Result<RawTranscription, TranscriptionError> {
        let inference = |what: &str, e: whisper_rs::WhisperError| {
            TranscriptionError::Inference(format!("{what}: {e}"))
        };

        if samples.is_empty() {
            return Ok(RawTranscription {
                language: options.language.clone(),
                segments: Vec::new(),
            });
        }

        let mut state = self
            .context
            .create_state()
            .map_err(|e| inference("failed to create whisper state", e))?;

        let params = self.make_params(options);
        state
            .full(params, samples)
            .map_err(|e| inference("transcription failed", e))?;

        let segment_count = state
            .full_n_segments()
            .map_err(|e| inference("failed to read segment count", e))?;

        let mut segments = Vec::with_capacity(segment_count.max(0) as usize);
        for i in 0..segment_count {
            let text = state
                .full_get_segment_text(i)
                .map_err(|e| inference("failed to read segment text", e))?;
            // t0/t1 は 10ms 単位
            let t0 = state
                .full_get_segment_t0(i)
                .map_err(|e| inference("failed to read segment start", e))?;
            let t1 = state
                .full_get_segment_t1(i)
                .map_err(|e| inference("failed to read segment end", e))?;

            segments.push(Segment {
                start: t0 as f64 / 100.0,
                end: t1 as f64 / 100.0,
                text,
            });
        }

        // 明示指定が優先。無ければ検出結果
        let language = match options.language.clone() {
            Some(lang) => Some(lang),
            None => state
                .full_lang_id_from_state()
                .ok()
                .and_then(whisper_rs::get_lang_str)
                .map(str::to_string),
        };

        Ok(RawTranscription { language, segments })
    }
}
