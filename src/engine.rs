//! 認識エンジンアダプタ
//!
//! プロセスに 1 つだけ存在する認識エンジンを `EngineHandle` で包みます。
//! - 推論は専用 OS スレッド（`engine.workers` 本）がキューから取り出して実行
//! - workers = 1（既定）ならすべての推論が直列化される
//! - 呼び出し側からはロックの見えない普通の async 関数に見える
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::audio::{self, CANONICAL};
use crate::error::TranscriptionError;
use crate::models::{Segment, TranscriptionResult};
use crate::vad::{self, SpeechTimeline, VadConfig};

/// 1 回の推論に渡すデコード設定
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// None なら自動判定
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
}

/// エンジンの生の出力（時刻は渡したサンプル列基準）
#[derive(Debug, Clone, Default)]
pub struct RawTranscription {
    pub language: Option<String>,
    pub segments: Vec<Segment>,
}

/// 16kHz mono f32 サンプル列 → セグメント列
///
/// 実装は同期的でよい（ワーカースレッド上で呼ばれる）。
/// 呼び出しごとに独立で、前回のテキストに依存してはならない
pub trait SpeechRecognizer: Send + Sync {
    fn recognize(&self, samples: &[f32], options: &DecodeOptions) -> Result<RawTranscription, TranscriptionError>;
}

type Reply = oneshot::Sender<Result<RawTranscription, TranscriptionError>>;

struct Job {
    samples: Vec<f32>,
    options: DecodeOptions,
    reply: Reply,
}

#[derive(Clone)]
pub struct EngineHandle {
    jobs: Sender<Job>,
    workers: usize,
    vad: VadConfig,
}

impl EngineHandle {
    /// ワーカースレッドを起動する。すべてのハンドルが破棄されるとワーカーも終了する
    pub fn start(recognizer: Arc<dyn SpeechRecognizer>, workers: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = unbounded::<Job>();

        for index in 0..workers {
            let rx = rx.clone();
            let recognizer = Arc::clone(&recognizer);
            std::thread::Builder::new()
                .name(format!("stt-engine-{index}"))
                .spawn(move || worker_loop(index, rx, recognizer))?;
        }

        info!(workers, "recognition engine workers started");
        Ok(Self {
            jobs: tx,
            workers,
            vad: VadConfig::default(),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// 正規化済み WAV を文字起こしする
    /// - 発話区間だけを推論へ渡し、セグメント時刻を元のタイムラインへ戻す
    /// - 無音のみならエンジンを呼ばずにセグメント 0 件で返す。
    ///   言語判定もできないので、指定が無ければ language は None（JSON では null）
    /// - duration は元音声全体の長さ
    pub async fn transcribe(
        &self,
        canonical_path: &Path,
        language: Option<&str>,
        initial_prompt: Option<&str>,
    ) -> Result<TranscriptionResult, TranscriptionError> {
        let path = canonical_path.to_path_buf();
        let samples = tokio::task::spawn_blocking(move || audio::load_canonical_samples(path))
            .await
            .map_err(|e| TranscriptionError::Audio(format!("decode task failed: {e}")))??;

        let duration = samples.len() as f64 / CANONICAL.sample_rate as f64;
        let requested_language = language.map(str::to_string);

        let regions = vad::detect_speech(&samples, CANONICAL.sample_rate, &self.vad);
        if regions.is_empty() {
            debug!(duration, "no speech detected, skipping inference");
            return Ok(TranscriptionResult::from_segments(requested_language, Some(duration), Vec::new()));
        }

        let (speech, timeline) = SpeechTimeline::extract(&samples, CANONICAL.sample_rate, &regions);
        drop(samples);

        let (reply, response) = oneshot::channel();
        let job = Job {
            samples: speech,
            options: DecodeOptions {
                language: requested_language.clone(),
                initial_prompt: initial_prompt.map(str::to_string),
            },
            reply,
        };
        self.jobs.send(job).map_err(|_| TranscriptionError::WorkerGone)?;

        let raw = response.await.map_err(|_| TranscriptionError::WorkerGone)??;

        let segments = raw.segments.into_iter().map(|seg| Segment {
            start: timeline.to_original(seg.start),
            end: timeline.to_original(seg.end),
            text: seg.text,
        });

        Ok(TranscriptionResult::from_segments(
            raw.language.or(requested_language),
            Some(duration),
            segments,
        ))
    }
}

fn worker_loop(index: usize, jobs: Receiver<Job>, recognizer: Arc<dyn SpeechRecognizer>) {
    for job in jobs.iter() {
        // 依頼元が既にいない（切断済み）なら推論しない
        if job.reply.is_closed() {
            debug!(worker = index, "requester gone, job skipped");
            continue;
        }

        let started = std::time::Instant::now();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| recognizer.recognize(&job.samples, &job.options)))
            .unwrap_or_else(|_| {
                error!(worker = index, "recognizer panicked");
                Err(TranscriptionError::Inference("recognition engine panicked".to_string()))
            });

        debug!(
            worker = index,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "inference finished"
        );
        let _ = job.reply.send(result);
    }
    debug!(worker = index, "engine worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn write_wav(path: &Path, samples: &[i16]) {
        let data_size = (samples.len() * 2) as u32;
        let mut wav = Vec::with_capacity(44 + samples.len() * 2);
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(36 + data_size).to_le_bytes());
        wav.extend_from_slice(b"WAVEfmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&16_000u32.to_le_bytes());
        wav.extend_from_slice(&32_000u32.to_le_bytes());
        wav.extend_from_slice(&2u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&data_size.to_le_bytes());
        for s in samples {
            wav.extend_from_slice(&s.to_le_bytes());
        }
        std::fs::write(path, wav).unwrap();
    }

    fn tone(seconds: f32) -> Vec<i16> {
        let n = (seconds * 16_000.0) as usize;
        (0..n).map(|i| ((i as f32 * 0.05).sin() * 8_000.0) as i16).collect()
    }

    /// 同時実行数を記録し、渡されたサンプル長いっぱいのセグメントを 1 つ返す
    #[derive(Default)]
    struct ProbeRecognizer {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl SpeechRecognizer for ProbeRecognizer {
        fn recognize(&self, samples: &[f32], options: &DecodeOptions) -> Result<RawTranscription, TranscriptionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            Ok(RawTranscription {
                language: Some(options.language.clone().unwrap_or_else(|| "en".to_string())),
                segments: vec![Segment {
                    start: 0.0,
                    end: samples.len() as f64 / 16_000.0,
                    text: " hello ".to_string(),
                }],
            })
        }
    }

    #[tokio::test]
    async fn silence_skips_the_recognizer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silence.wav");
        write_wav(&path, &vec![0i16; 32_000]);

        let recognizer = Arc::new(ProbeRecognizer::default());
        let engine = EngineHandle::start(recognizer.clone(), 1).unwrap();
        let result = engine.transcribe(&path, None, None).await.unwrap();

        assert!(result.segments.is_empty());
        assert_eq!(result.transcript, "");
        assert_eq!(result.duration, Some(2.0));
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn segment_times_follow_the_original_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech.wav");
        let mut samples = vec![0i16; 16_000 * 3];
        samples.extend(tone(1.0));
        samples.extend(vec![0i16; 16_000 * 3]);
        write_wav(&path, &samples);

        let engine = EngineHandle::start(Arc::new(ProbeRecognizer::default()), 1).unwrap();
        let result = engine.transcribe(&path, None, None).await.unwrap();

        assert_eq!(result.language.as_deref(), Some("en"));
        assert_eq!(result.transcript, "hello");
        let seg = &result.segments[0];
        assert!((seg.start - 2.6).abs() < 0.05, "start was {}", seg.start);
        assert!((seg.end - 4.4).abs() < 0.05, "end was {}", seg.end);
        assert_eq!(result.duration, Some(7.0));
    }

    #[tokio::test]
    async fn single_worker_serializes_inference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech.wav");
        write_wav(&path, &tone(1.0));

        let recognizer = Arc::new(ProbeRecognizer::default());
        let engine = EngineHandle::start(recognizer.clone(), 1).unwrap();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                let path = path.clone();
                tokio::spawn(async move { engine.transcribe(&path, Some("ja"), None).await })
            })
            .collect();
        for task in tasks {
            let result = task.await.unwrap().unwrap();
            assert_eq!(result.language.as_deref(), Some("ja"));
        }

        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 4);
        assert_eq!(recognizer.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreadable_audio_is_an_audio_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"definitely not a wav file").unwrap();

        let engine = EngineHandle::start(Arc::new(ProbeRecognizer::default()), 1).unwrap();
        let err = engine.transcribe(&path, None, None).await.unwrap_err();
        assert!(matches!(err, TranscriptionError::Audio(_)));
    }
}
