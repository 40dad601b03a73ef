use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use whisper_stt_service::config::Config;
use whisper_stt_service::engine::EngineHandle;
use whisper_stt_service::guard::TempWorkspace;
use whisper_stt_service::handlers::{build_router, AppState};
use whisper_stt_service::metrics::Metrics;
use whisper_stt_service::pipeline::Pipeline;
use whisper_stt_service::transcoder::{ensure_available, FfmpegTranscoder, Normalizer};
use whisper_stt_service::whisper::WhisperRecognizer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // 設定ファイルの読み込み（環境変数で上書き）と検証
    let config = Config::load_from_env().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    info!(
        name = %config.app.name,
        version = %config.app.version,
        env = %config.app.env,
        addr = %config.server_address(),
        "configuration loaded"
    );

    // ffmpeg が無ければ何も受け付けられないので起動失敗
    let transcoder = FfmpegTranscoder::from_config(&config.audio);
    ensure_available(&transcoder)
        .await
        .with_context(|| format!("ffmpeg not usable at {:?}", config.audio.ffmpeg_path))?;

    // モデルはここで 1 度だけ読み込む。失敗したらリクエストを受け付ける前に終了
    let recognizer = WhisperRecognizer::load(&config.whisper).context("failed to load whisper model")?;
    let engine = EngineHandle::start(Arc::new(recognizer), config.engine.workers)
        .context("failed to start engine workers")?;
    if engine.workers() == 1 {
        info!("inference is serialized on a single worker");
    }

    let workspace = TempWorkspace::create(config.temp_base()).context("failed to create temp workspace")?;
    info!(path = %workspace.path().display(), "temp workspace ready");

    let metrics = Metrics::new().context("failed to register metrics")?;
    let normalizer = Normalizer::new(Arc::new(transcoder), workspace);
    let pipeline = Pipeline::new(normalizer, Some(engine), metrics);

    let addr: SocketAddr = config
        .server_address()
        .parse()
        .with_context(|| format!("invalid server address: {}", config.server_address()))?;
    let app = build_router(AppState::new(config, pipeline));

    info!(%addr, "listening");
    info!("  POST /webhook/audio  - single-shot transcription");
    info!("  GET  /ws/transcribe  - streaming transcription (WebSocket)");
    info!("  GET  /health | /version | /metrics");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}
