//! リソースガード
//!
//! - 一時ファイル（アップロード原本 / 正規化済み WAV）の払い出しと確実な削除
//! - アップロードサイズ上限の事前チェック
//! - クライアント単位のレート制限（固定ウィンドウ）
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::{Builder, TempDir};
use tracing::{debug, warn};

use crate::error::PipelineError;

// =============================================================================
// Temporary artifacts
// =============================================================================

/// プロセス専用の一時ディレクトリ（ドロップ時にディレクトリごと削除）
#[derive(Clone)]
pub struct TempWorkspace {
    dir: Arc<TempDir>,
}

impl TempWorkspace {
    /// `base` 配下に `stt-XXXX` ディレクトリを作成
    pub fn create<P: AsRef<Path>>(base: P) -> io::Result<Self> {
        std::fs::create_dir_all(base.as_ref())?;
        let dir = Builder::new().prefix("stt-").tempdir_in(base.as_ref())?;
        Ok(Self { dir: Arc::new(dir) })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// 書き込み用の一意なパスを確保する
    /// - ファイルは空で作成済み（同時呼び出しでも衝突しない）
    /// - 返却された `TempArtifact` がドロップされると削除される
    pub fn acquire(&self, suffix: &str) -> io::Result<TempArtifact> {
        let file = Builder::new()
            .prefix("audio-")
            .suffix(suffix)
            .tempfile_in(self.dir.path())?;
        let (_handle, path) = file.keep().map_err(|e| e.error)?;
        debug!(path = %path.display(), "temp artifact acquired");
        Ok(TempArtifact { path: Some(path) })
    }

    /// 現在残っている一時ファイル一覧（テスト・診断用）
    pub fn artifacts(&self) -> io::Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(self.dir.path())? {
            paths.push(entry?.path());
        }
        Ok(paths)
    }
}

/// 1 サイクルが所有する一時ファイル
/// 成功・失敗・キャンセル（future のドロップ）いずれの経路でもちょうど 1 回削除される
#[derive(Debug)]
pub struct TempArtifact {
    path: Option<PathBuf>,
}

impl TempArtifact {
    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// 明示的に削除（以降の Drop では何もしない）
    pub fn release(mut self) {
        if let Some(path) = self.path.take() {
            release_temp_paths(&[path.as_path()]);
        }
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            release_temp_paths(&[path.as_path()]);
        }
    }
}

/// ベストエフォートで削除。失敗はログに残すだけで呼び出し元へは返さない
pub fn release_temp_paths(paths: &[&Path]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "temp artifact removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temp artifact"),
        }
    }
}

// =============================================================================
// Upload size
// =============================================================================

/// 申告された Content-Length が上限を超えていれば本文を読む前に拒否
pub fn check_upload_size(declared: Option<u64>, limit: u64) -> Result<(), PipelineError> {
    match declared {
        Some(declared) if declared > limit => Err(PipelineError::PayloadTooLarge { limit }),
        _ => Ok(()),
    }
}

// =============================================================================
// Rate limiting
// =============================================================================

/// この件数を超えたら期限切れのウィンドウを掃除する
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// クライアントキー（リモートアドレス）ごとの固定ウィンドウ制限
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn check(&self, key: &str) -> Result<(), PipelineError> {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> Result<(), PipelineError> {
        let mut windows = self.windows.lock();

        if windows.len() >= PRUNE_THRESHOLD {
            let window = self.window;
            windows.retain(|_, w| now.saturating_duration_since(w.started) < window);
        }

        let entry = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        let elapsed = now.saturating_duration_since(entry.started);
        if elapsed >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.limit {
            let remaining = self.window.saturating_sub(elapsed);
            return Err(PipelineError::RateLimited {
                retry_after_secs: remaining.as_secs().max(1),
            });
        }

        entry.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifacts_are_unique_and_removed_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let workspace = TempWorkspace::create(base.path()).unwrap();

        let a = workspace.acquire(".webm").unwrap();
        let b = workspace.acquire(".webm").unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().exists());
        assert!(a.path().to_string_lossy().ends_with(".webm"));

        drop(a);
        b.release();
        assert!(workspace.artifacts().unwrap().is_empty());
    }

    #[test]
    fn release_of_missing_file_is_silent() {
        let base = tempfile::tempdir().unwrap();
        let workspace = TempWorkspace::create(base.path()).unwrap();
        let artifact = workspace.acquire(".wav").unwrap();
        std::fs::remove_file(artifact.path()).unwrap();
        drop(artifact);
    }

    #[test]
    fn upload_size_ceiling() {
        let limit = 25 * 1024 * 1024;
        assert!(check_upload_size(None, limit).is_ok());
        assert!(check_upload_size(Some(limit), limit).is_ok());
        assert!(matches!(
            check_upload_size(Some(30 * 1024 * 1024), limit),
            Err(PipelineError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn rate_limiter_denies_after_limit_and_recovers() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();

        assert!(limiter.check_at("10.0.0.1", t0).is_ok());
        assert!(limiter.check_at("10.0.0.1", t0).is_ok());
        match limiter.check_at("10.0.0.1", t0 + Duration::from_secs(10)) {
            Err(PipelineError::RateLimited { retry_after_secs }) => assert_eq!(retry_after_secs, 50),
            other => panic!("expected rate limit, got {other:?}"),
        }

        // 別クライアントは独立
        assert!(limiter.check_at("10.0.0.2", t0).is_ok());

        // ウィンドウ経過後は再び許可
        assert!(limiter.check_at("10.0.0.1", t0 + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn rate_limiter_is_shared_across_threads() {
        let limiter = Arc::new(RateLimiter::per_minute(50));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..25).filter(|_| limiter.check("shared").is_ok()).count())
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
    }
}
