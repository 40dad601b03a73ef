//! Prometheus メトリクス（`/metrics` で公開）
//!
//! 記録は制御フローに影響しない。登録やエンコードの失敗はログに残すだけ。
use std::time::Duration;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::warn;

pub const REQUESTS_TOTAL: &str = "stt_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "stt_request_duration_seconds";
pub const ERRORS_TOTAL: &str = "stt_errors_total";

/// メトリクスのトランスポート種別ラベル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    WebSocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::WebSocket => "ws",
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    duration: Histogram,
    errors: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(REQUESTS_TOTAL, "Transcription requests by transport"),
            &["transport"],
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new(REQUEST_DURATION_SECONDS, "Time spent in one transcription cycle")
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;
        let errors = IntCounter::new(ERRORS_TOTAL, "Failed transcription cycles")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            registry,
            requests,
            duration,
            errors,
        })
    }

    pub fn record_request(&self, transport: TransportKind) {
        self.requests.with_label_values(&[transport.as_str()]).inc();
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_error(&self) {
        self.errors.inc();
    }

    pub fn requests(&self, transport: TransportKind) -> u64 {
        self.requests.with_label_values(&[transport.as_str()]).get()
    }

    pub fn errors(&self) -> u64 {
        self.errors.get()
    }

    /// テキスト形式（`text/plain; version=0.0.4`）で出力
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request(TransportKind::Http);
        metrics.record_request(TransportKind::WebSocket);
        metrics.record_request(TransportKind::WebSocket);
        metrics.observe_duration(Duration::from_millis(300));
        metrics.record_error();

        assert_eq!(metrics.requests(TransportKind::WebSocket), 2);
        assert_eq!(metrics.errors(), 1);

        let text = metrics.render();
        assert!(text.contains(r#"stt_requests_total{transport="http"} 1"#));
        assert!(text.contains(r#"stt_requests_total{transport="ws"} 2"#));
        assert!(text.contains("stt_request_duration_seconds_count 1"));
        assert!(text.contains("stt_errors_total 1"));
    }

    #[test]
    fn instances_do_not_share_state() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_error();
        assert_eq!(b.errors(), 0);
    }
}
