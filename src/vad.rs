//! 音声区間検出（RMS エネルギーによる簡易 VAD）
//!
//! 無音部分を取り除いた音声だけを推論へ渡し、得られたセグメントの時刻を
//! 元の音声のタイムラインへ戻します。

/// VAD のパラメータ（サンプル数ではなくミリ秒で指定）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    pub frame_ms: u32,
    pub rms_threshold: f32,
    pub speech_pad_ms: u32,
    /// これより短い無音は同じ区間として繋げる
    pub max_gap_ms: u32,
    /// これより短い区間はノイズとして捨てる（パディング前の長さで判定）
    pub min_speech_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            frame_ms: 30,
            rms_threshold: 0.01,
            speech_pad_ms: 400,
            max_gap_ms: 2_000,
            min_speech_ms: 250,
        }
    }
}

/// 発話区間（サンプル index、end は含まない）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechRegion {
    pub start: usize,
    pub end: usize,
}

impl SpeechRegion {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

fn ms_to_samples(ms: u32, sample_rate: u32) -> usize {
    (ms as u64 * sample_rate as u64 / 1_000) as usize
}

/// 発話区間を検出する。無音のみなら空を返す
pub fn detect_speech(samples: &[f32], sample_rate: u32, config: &VadConfig) -> Vec<SpeechRegion> {
    let frame_len = ms_to_samples(config.frame_ms, sample_rate).max(1);

    let mut regions: Vec<SpeechRegion> = Vec::new();
    for (index, frame) in samples.chunks(frame_len).enumerate() {
        let sum_sq: f32 = frame.iter().map(|s| s * s).sum();
        let rms = (sum_sq / frame.len() as f32).sqrt();
        if rms < config.rms_threshold {
            continue;
        }

        let start = index * frame_len;
        let end = start + frame.len();
        match regions.last_mut() {
            Some(last) if last.end == start => last.end = end,
            _ => regions.push(SpeechRegion { start, end }),
        }
    }

    merge_by_gap(&mut regions, ms_to_samples(config.max_gap_ms, sample_rate));

    let min_len = ms_to_samples(config.min_speech_ms, sample_rate);
    regions.retain(|region| region.len() >= min_len && region.len() > 0);

    let pad = ms_to_samples(config.speech_pad_ms, sample_rate);
    for region in regions.iter_mut() {
        region.start = region.start.saturating_sub(pad);
        region.end = (region.end + pad).min(samples.len());
    }
    merge_by_gap(&mut regions, 0);

    regions
}

fn merge_by_gap(regions: &mut Vec<SpeechRegion>, max_gap: usize) {
    if regions.len() < 2 {
        return;
    }
    regions.sort_by_key(|region| region.start);

    let mut merged = Vec::with_capacity(regions.len());
    let mut current = regions[0];
    for region in regions.iter().skip(1) {
        if region.start <= current.end + max_gap {
            current.end = current.end.max(region.end);
        } else {
            merged.push(current);
            current = *region;
        }
    }
    merged.push(current);
    *regions = merged;
}

/// 切り出した音声上の時刻 → 元音声上の時刻 の対応表
#[derive(Debug, Clone)]
pub struct SpeechTimeline {
    sample_rate: u32,
    /// (切り出し後の開始位置, 元音声の区間)
    pieces: Vec<(usize, SpeechRegion)>,
}

impl SpeechTimeline {
    /// 区間を連結した音声と対応表を作る
    pub fn extract(samples: &[f32], sample_rate: u32, regions: &[SpeechRegion]) -> (Vec<f32>, Self) {
        let total: usize = regions.iter().map(SpeechRegion::len).sum();
        let mut speech = Vec::with_capacity(total);
        let mut pieces = Vec::with_capacity(regions.len());

        for region in regions {
            pieces.push((speech.len(), *region));
            speech.extend_from_slice(&samples[region.start..region.end]);
        }

        (speech, Self { sample_rate, pieces })
    }

    /// 秒 → 秒。区間の末尾を越える時刻はその区間の終端に丸める
    pub fn to_original(&self, seconds: f64) -> f64 {
        let rate = self.sample_rate as f64;
        let position = (seconds.max(0.0) * rate).round() as usize;

        let piece = self
            .pieces
            .iter()
            .rev()
            .find(|(offset, _)| *offset <= position)
            .or_else(|| self.pieces.first());

        match piece {
            Some((offset, region)) => {
                let original = (region.start + position.saturating_sub(*offset)).min(region.end);
                original as f64 / rate
            }
            None => seconds,
        }
    }
}
