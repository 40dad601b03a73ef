// whisper_stt_service ライブラリ
// テストから各モジュールにアクセスできるようにするため

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod session;
pub mod transcoder;
pub mod transport;
pub mod vad;

// whisper関連のモジュールは条件コンパイル
#[cfg(feature = "whisper")]
pub mod whisper;

#[cfg(not(feature = "whisper"))]
pub mod whisper {
    // whisper機能が無効の場合: モデルを読み込めないので起動は失敗する
    use crate::config::WhisperConfig;
    use crate::engine::{DecodeOptions, RawTranscription, SpeechRecognizer};
    use crate::error::TranscriptionError;
    use anyhow::Result;

    pub struct WhisperRecognizer;

    impl WhisperRecognizer {
        pub fn load(_config: &WhisperConfig) -> Result<Self> {
            Err(anyhow::anyhow!(
                "Whisper engine not available (feature disabled)"
            ))
        }
    }

    impl SpeechRecognizer for WhisperRecognizer {
        fn recognize(&self, _samples: &[f32], _options: &DecodeOptions) -> Result<RawTranscription, TranscriptionError> {
            Err(TranscriptionError::Inference(
                "Whisper engine not available (feature disabled)".to_string(),
            ))
        }
    }
}
