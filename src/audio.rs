//! 音声ファイルまわりのユーティリティ
//!
//! - 正規化済み WAV のヘッダ検査（16kHz / mono / 16bit）
//! - 正規化済み WAV → Whisper 用 f32 サンプル列の読み込み
//! - 申告 Content-Type の寛容なチェックと一時ファイル拡張子の決定
use std::fs::File;
use std::path::Path;

use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::TranscriptionError;

/// 正規化後の音声フォーマット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetProfile {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u32,
    /// ffmpeg の `-c:a` に渡すコーデック名
    pub codec: &'static str,
}

pub const CANONICAL: TargetProfile = TargetProfile {
    sample_rate: 16_000,
    channels: 1,
    bits_per_sample: 16,
    codec: "pcm_s16le",
};

#[derive(Debug, Clone)]
pub struct AudioMetadata {
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: Option<u32>,
    pub file_size_bytes: u64,
}

impl AudioMetadata {
    pub fn matches(&self, profile: &TargetProfile) -> bool {
        self.sample_rate == profile.sample_rate
            && self.channels == profile.channels
            && self.bits_per_sample == Some(profile.bits_per_sample)
    }
}

/// 音声ファイルのヘッダ情報を取得
pub fn probe_metadata<P: AsRef<Path>>(file_path: P) -> Result<AudioMetadata, String> {
    let path = file_path.as_ref();
    let file_size_bytes = std::fs::metadata(path)
        .map_err(|e| format!("cannot stat {}: {e}", path.display()))?
        .len();
    let file = File::open(path).map_err(|e| format!("cannot open {}: {e}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| format!("unrecognized container: {e}"))?;

    let track = probed
        .format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| "no audio track".to_string())?;

    let params = &track.codec_params;
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| "sample rate unavailable".to_string())?;
    let channels = params.channels.map(|ch| ch.count() as u16).unwrap_or(1);
    let duration_seconds = params
        .n_frames
        .map(|frames| frames as f64 / sample_rate as f64)
        .unwrap_or(0.0);

    Ok(AudioMetadata {
        duration_seconds,
        sample_rate,
        channels,
        bits_per_sample: params.bits_per_sample,
        file_size_bytes,
    })
}

/// 正規化済み WAV を f32 サンプル列（-1.0..1.0, mono）として読み込む
pub fn load_canonical_samples<P: AsRef<Path>>(file_path: P) -> Result<Vec<f32>, TranscriptionError> {
    let path = file_path.as_ref();
    let audio_err = |msg: String| TranscriptionError::Audio(msg);

    let file = File::open(path).map_err(|e| audio_err(format!("cannot open {}: {e}", path.display())))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    hint.with_extension("wav");

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| audio_err(format!("probe failed: {e}")))?;
    let mut format = probed.format;

    let (track_id, codec_params) = {
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| audio_err("no audio track".to_string()))?;
        (track.id, track.codec_params.clone())
    };

    if codec_params.sample_rate != Some(CANONICAL.sample_rate) {
        return Err(audio_err(format!(
            "expected {} Hz audio, got {:?}",
            CANONICAL.sample_rate, codec_params.sample_rate
        )));
    }

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| audio_err(format!("decoder unavailable: {e}")))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::ResetRequired) => break,
            Err(symphonia::core::errors::Error::IoError(ref err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(err) => return Err(audio_err(format!("packet read failed: {err}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(audio_buf) => extract_samples_from_buffer(&audio_buf, &mut samples)?,
            Err(symphonia::core::errors::Error::DecodeError(err)) => {
                tracing::warn!(error = %err, "skipping undecodable packet");
            }
            Err(err) => return Err(audio_err(format!("decode failed: {err}"))),
        }
    }

    Ok(samples)
}

/// 複数チャンネルは平均してモノラル化
fn extract_samples_from_buffer(
    audio_buf: &AudioBufferRef,
    samples: &mut Vec<f32>,
) -> Result<(), TranscriptionError> {
    match audio_buf {
        AudioBufferRef::S16(buf) => {
            let ch = buf.spec().channels.count();
            for i in 0..buf.frames() {
                let sum: f32 = (0..ch).map(|c| buf.chan(c)[i] as f32 / 32768.0).sum();
                samples.push(sum / ch as f32);
            }
        }
        AudioBufferRef::S32(buf) => {
            let ch = buf.spec().channels.count();
            for i in 0..buf.frames() {
                let sum: f32 = (0..ch).map(|c| buf.chan(c)[i] as f32 / i32::MAX as f32).sum();
                samples.push(sum / ch as f32);
            }
        }
        AudioBufferRef::F32(buf) => {
            let ch = buf.spec().channels.count();
            for i in 0..buf.frames() {
                let sum: f32 = (0..ch).map(|c| buf.chan(c)[i]).sum();
                samples.push(sum / ch as f32);
            }
        }
        _ => {
            return Err(TranscriptionError::Audio(
                "unsupported sample format in canonical audio".to_string(),
            ))
        }
    }
    Ok(())
}

// =============================================================================
// Content-Type handling
// =============================================================================

/// よく見かけるアップロード時の Content-Type（参考・ログ用）
pub const KNOWN_CONTENT_TYPES: &[&str] = &[
    "audio/wav",
    "audio/x-wav",
    "audio/webm",
    "audio/ogg",
    "audio/mpeg",
    "audio/mp3",
    "audio/mp4",
    "audio/x-m4a",
    "audio/aac",
    "audio/flac",
    "application/octet-stream",
];

/// `audio/webm;codecs=opus` → `audio/webm`
pub fn normalize_content_type(content_type: Option<&str>) -> String {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

/// 寛容なチェック: 未指定・任意の `audio/*`・既知の型はすべて OK。
/// 最終判断は ffmpeg の終了コードに任せる
pub fn content_type_ok(content_type: Option<&str>) -> bool {
    let base = normalize_content_type(content_type);
    base.is_empty() || base.starts_with("audio/") || KNOWN_CONTENT_TYPES.contains(&base.as_str())
}

/// 一時ファイルの拡張子（ファイル名 → MIME の順で推定、不明なら空）
pub fn upload_suffix(filename: Option<&str>, content_type: Option<&str>) -> String {
    let from_name = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()));

    if let Some(suffix) = from_name {
        return suffix;
    }

    let suffix = match normalize_content_type(content_type).as_str() {
        "audio/wav" | "audio/x-wav" | "audio/wave" => ".wav",
        "audio/webm" | "video/webm" => ".webm",
        "audio/ogg" => ".ogg",
        "audio/mpeg" | "audio/mp3" => ".mp3",
        "audio/mp4" | "audio/x-m4a" => ".m4a",
        "audio/aac" => ".aac",
        "audio/flac" => ".flac",
        _ => "",
    };
    suffix.to_string()
}

/// ファイルサイズを人間が読みやすい形式で表示
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size as u64, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
