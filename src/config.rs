//! サービス設定（TOML + 環境変数による上書き）
//!
//! 設定ファイルが無い場合はデフォルト値で生成し、その後 `ENV` / `WHISPER_MODEL` などの
//! 環境変数で個別の値を上書きします。
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// 設定ファイルのパスを指す環境変数名
pub const CONFIG_PATH_ENV: &str = "WHISPER_STT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub server: ServerConfig,
    pub whisper: WhisperConfig,
    pub engine: EngineConfig,
    pub audio: AudioConfig,
    pub paths: PathsConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub version: String,
    pub env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 空の場合はローカル開発用のオリジンを許可
    pub cors_origins: Vec<String>,
    pub cors_allow_credentials: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeType {
    Cpu,
    Gpu,
}

/// 演算精度の指定名（`int8` / `float16` など）
/// whisper.cpp では精度は ggml ファイル側で決まるため、実行デバイスの選択にだけ使う
const PRECISION_NAMES: &[&str] = &[
    "int8",
    "int8_float16",
    "int8_float32",
    "int8_bfloat16",
    "int16",
    "float16",
    "bfloat16",
    "float32",
    "default",
    "auto",
];

impl ComputeType {
    pub fn is_precision_name(value: &str) -> bool {
        PRECISION_NAMES.contains(&value.trim().to_ascii_lowercase().as_str())
    }
}

impl std::str::FromStr for ComputeType {
    type Err = String;

    /// `float16` / `bfloat16` は GPU、その他の精度名は CPU として扱う
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(ComputeType::Cpu),
            "gpu" | "cuda" | "float16" | "bfloat16" => Ok(ComputeType::Gpu),
            other if PRECISION_NAMES.contains(&other) => Ok(ComputeType::Cpu),
            other => Err(format!("unknown compute type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    /// whisper.cpp ggml モデルファイルパス（モデル識別子）
    pub model_path: String,
    pub compute_type: ComputeType,
    pub threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 推論ワーカー数。1 の場合はすべての推論を直列化する
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub ffmpeg_path: String,
    pub transcode_timeout_seconds: u64,
    pub initial_config_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub temp_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_upload_mb: u64,
    pub ratelimit_rpm: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "Whisper STT Service".to_string(),
            version: "1.0.0".to_string(),
            env: "production".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: Vec::new(),
            cors_allow_credentials: false,
        }
    }
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model_path: "models/ggml-base.en.bin".to_string(),
            compute_type: ComputeType::Cpu,
            threads: 4,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            transcode_timeout_seconds: 120,
            initial_config_timeout_ms: 50,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            temp_dir: "temp".to_string(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_upload_mb: 25,
            ratelimit_rpm: 60,
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 設定ファイルを読み込み、存在しなければデフォルト設定で作成する
    pub fn load_or_create_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load_from_file(path);
        }

        let config = Self::default();
        config.save_to_file(path)?;
        tracing::info!(path = %path.display(), "created default configuration file");
        Ok(config)
    }

    /// `WHISPER_STT_CONFIG`（未設定時は `config.toml`）を読み込み、環境変数で上書き
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.toml".to_string());
        let mut config = Self::load_or_create_default(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// 環境変数相当の値で上書き（テストでは任意のルックアップ関数を渡せる）
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("APP_NAME") {
            self.app.name = v;
        }
        if let Some(v) = lookup("APP_VERSION") {
            self.app.version = v;
        }
        if let Some(v) = lookup("ENV") {
            self.app.env = v;
        }
        if let Some(v) = lookup("WHISPER_MODEL") {
            self.whisper.model_path = v;
        }
        if let Some(v) = lookup("COMPUTE_TYPE") {
            self.whisper.compute_type = v
                .parse()
                .map_err(|message| ConfigError::Invalid { message })?;
            if ComputeType::is_precision_name(&v) {
                tracing::info!(
                    compute_type = %v.trim(),
                    device = ?self.whisper.compute_type,
                    "precision is fixed by the ggml model file, using the value only to pick a device"
                );
            }
        }
        if let Some(v) = lookup("MAX_UPLOAD_MB") {
            self.limits.max_upload_mb = parse_number("MAX_UPLOAD_MB", &v)?;
        }
        if let Some(v) = lookup("RATELIMIT_RPM") {
            self.limits.ratelimit_rpm = parse_number("RATELIMIT_RPM", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(invalid(format!("invalid port: {}", self.server.port)));
        }
        if self.whisper.threads == 0 {
            return Err(invalid("whisper.threads must be at least 1"));
        }
        if self.engine.workers == 0 {
            return Err(invalid("engine.workers must be at least 1"));
        }
        if self.limits.max_upload_mb == 0 {
            return Err(invalid("limits.max_upload_mb must be at least 1"));
        }
        if self.limits.ratelimit_rpm == 0 {
            return Err(invalid("limits.ratelimit_rpm must be at least 1"));
        }
        if self.audio.transcode_timeout_seconds == 0 {
            return Err(invalid("audio.transcode_timeout_seconds must be at least 1"));
        }

        let temp_dir = Path::new(&self.paths.temp_dir);
        if !temp_dir.exists() {
            fs::create_dir_all(temp_dir).map_err(|source| ConfigError::Io {
                path: temp_dir.to_path_buf(),
                source,
            })?;
        }

        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.limits.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn temp_base(&self) -> PathBuf {
        PathBuf::from(&self.paths.temp_dir)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.audio.transcode_timeout_seconds)
    }

    pub fn initial_config_timeout(&self) -> Duration {
        Duration::from_millis(self.audio.initial_config_timeout_ms)
    }

    /// CORS で許可するオリジン（未設定ならローカル開発用の既定値）
    pub fn cors_origins(&self) -> Vec<String> {
        if self.server.cors_origins.is_empty() {
            vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
                "http://localhost:8080".to_string(),
            ]
        } else {
            self.server.cors_origins.clone()
        }
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(format!("{key} must be a number, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_service_settings() {
        let config = Config::default();
        assert_eq!(config.limits.max_upload_mb, 25);
        assert_eq!(config.limits.ratelimit_rpm, 60);
        assert_eq!(config.engine.workers, 1);
        assert_eq!(config.audio.initial_config_timeout_ms, 50);
        assert_eq!(config.max_upload_bytes(), 25 * 1024 * 1024);
    }

    #[test]
    fn overrides_replace_only_given_keys() {
        let env: HashMap<&str, &str> = [("MAX_UPLOAD_MB", "10"), ("COMPUTE_TYPE", "gpu"), ("ENV", "dev")]
            .into_iter()
            .collect();
        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.limits.max_upload_mb, 10);
        assert_eq!(config.whisper.compute_type, ComputeType::Gpu);
        assert_eq!(config.app.env, "dev");
        assert_eq!(config.limits.ratelimit_rpm, 60);
    }

    #[test]
    fn precision_names_map_to_a_device() {
        assert_eq!("int8".parse::<ComputeType>(), Ok(ComputeType::Cpu));
        assert_eq!("INT8_FLOAT16".parse::<ComputeType>(), Ok(ComputeType::Cpu));
        assert_eq!("float16".parse::<ComputeType>(), Ok(ComputeType::Gpu));
        assert!(ComputeType::is_precision_name(" float32 "));
        assert!(!ComputeType::is_precision_name("cuda"));
    }

    #[test]
    fn huge_upload_ceiling_saturates() {
        let mut config = Config::default();
        config.limits.max_upload_mb = u64::MAX / 2;
        assert_eq!(config.max_upload_bytes(), u64::MAX);
    }

    #[test]
    fn non_numeric_override_is_rejected() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| (key == "RATELIMIT_RPM").then(|| "fast".to_string()));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn empty_cors_list_falls_back_to_localhost() {
        let config = Config::default();
        assert!(config.cors_origins().iter().all(|o| o.starts_with("http://localhost")));
    }
}
