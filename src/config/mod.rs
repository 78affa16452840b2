// 配置管理模块

pub mod url_validator;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub use url_validator::UrlValidator;

/// 覆盖 relay.worker_count 的环境变量
pub const WORKER_COUNT_ENV: &str = "RELAY_WORKER_COUNT";

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    pub server: ServerConfig,
    /// 中继配置
    #[serde(default)]
    pub relay: RelayConfig,
    /// 对象存储配置
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    /// 状态存储配置
    #[serde(default)]
    pub state_store: StateStoreConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// CORS允许的源
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        // 容器内监听 0.0.0.0 以便从宿主机访问
        let host = if running_in_container() {
            "0.0.0.0".to_string()
        } else {
            "127.0.0.1".to_string()
        };
        Self {
            host,
            port: 3020,
            cors_origins: vec!["*".to_string()],
        }
    }
}

/// 是否运行在容器中
fn running_in_container() -> bool {
    Path::new("/.dockerenv").exists()
        || std::fs::read_to_string("/proc/1/cgroup")
            .map(|c| c.contains("docker") || c.contains("containerd"))
            .unwrap_or(false)
        || std::env::var("container").is_ok()
}

/// 断点续传协议重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumableRetry {
    /// 每次重试重新创建上传
    #[default]
    Restart,
    /// 复用上次的上传 URL，从已确认偏移继续
    Resume,
}

/// 中继配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// 每个租户的最大并发任务数
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// 断点续传分片大小 (MB)
    #[serde(default = "default_tus_chunk_size_mb")]
    pub tus_chunk_size_mb: u64,
    /// 调试模式（放宽目标地址校验）
    #[serde(default)]
    pub debug: bool,
    /// 目标地址白名单（正则），为空表示不限制
    #[serde(default)]
    pub upload_urls: Vec<String>,
    /// 下载+上传任务的重试间隔（秒）
    #[serde(default = "default_download_retry_delays")]
    pub download_retry_delays_secs: Vec<u64>,
    /// 列目录的重试间隔（秒）
    #[serde(default = "default_list_retry_delays")]
    pub list_retry_delays_secs: Vec<u64>,
    /// 查询文件大小的重试间隔（秒）
    #[serde(default = "default_size_retry_delays")]
    pub size_retry_delays_secs: Vec<u64>,
    /// 出站请求超时（秒），0 表示不限制
    #[serde(default)]
    pub request_timeout_secs: u64,
    /// 出站连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 断点续传重试策略
    #[serde(default)]
    pub resumable_retry: ResumableRetry,
}

fn default_worker_count() -> usize {
    3
}

fn default_tus_chunk_size_mb() -> u64 {
    25
}

fn default_download_retry_delays() -> Vec<u64> {
    vec![5, 10, 15, 30, 60, 120]
}

fn default_list_retry_delays() -> Vec<u64> {
    vec![5, 10, 15, 20]
}

fn default_size_retry_delays() -> Vec<u64> {
    vec![1, 5, 10, 10]
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            tus_chunk_size_mb: default_tus_chunk_size_mb(),
            debug: false,
            upload_urls: Vec::new(),
            download_retry_delays_secs: default_download_retry_delays(),
            list_retry_delays_secs: default_list_retry_delays(),
            size_retry_delays_secs: default_size_retry_delays(),
            request_timeout_secs: 0,
            connect_timeout_secs: default_connect_timeout_secs(),
            resumable_retry: ResumableRetry::default(),
        }
    }
}

fn secs(delays: &[u64]) -> Vec<Duration> {
    delays.iter().map(|s| Duration::from_secs(*s)).collect()
}

impl RelayConfig {
    /// 分片大小（字节）
    pub fn tus_chunk_size(&self) -> usize {
        (self.tus_chunk_size_mb.max(1) * 1024 * 1024) as usize
    }

    pub fn download_retry_delays(&self) -> Vec<Duration> {
        secs(&self.download_retry_delays_secs)
    }

    pub fn list_retry_delays(&self) -> Vec<Duration> {
        secs(&self.list_retry_delays_secs)
    }

    pub fn size_retry_delays(&self) -> Vec<Duration> {
        secs(&self.size_retry_delays_secs)
    }
}

/// 对象存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// 目标桶
    #[serde(default)]
    pub bucket: Option<String>,
    /// 访问策略（如 public-read）
    #[serde(default)]
    pub acl: Option<String>,
    /// 对象键前缀
    #[serde(default)]
    pub key_prefix: String,
    /// 分段大小 (MB)，最小 5
    #[serde(default = "default_part_size_mb")]
    pub part_size_mb: u64,
    /// 区域
    #[serde(default = "default_region")]
    pub region: String,
    /// 自定义服务地址（兼容 S3 的存储），为空时使用 AWS 区域地址
    #[serde(default)]
    pub endpoint: Option<String>,
    /// 使用路径风格地址（`endpoint/bucket/key`）
    #[serde(default)]
    pub path_style: bool,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

fn default_part_size_mb() -> u64 {
    5
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            acl: None,
            key_prefix: String::new(),
            part_size_mb: default_part_size_mb(),
            region: default_region(),
            endpoint: None,
            path_style: false,
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

impl ObjectStoreConfig {
    /// 分段大小（字节），不小于 5 MiB
    pub fn part_size(&self) -> usize {
        (self.part_size_mb.max(5) * 1024 * 1024) as usize
    }

    /// 服务地址
    pub fn endpoint_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.region),
        }
    }
}

/// 状态存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateStoreBackend {
    None,
    #[default]
    Memory,
    Sqlite,
}

/// 状态存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateStoreConfig {
    #[serde(default)]
    pub backend: StateStoreBackend,
    /// SQLite 数据库路径
    #[serde(default = "default_state_store_path")]
    pub path: String,
}

fn default_state_store_path() -> String {
    "data/relay_state.db".to_string()
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            backend: StateStoreBackend::default(),
            path: default_state_store_path(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let server = ServerConfig::default();
        tracing::info!("使用默认配置, 服务器监听地址: {}:{}", server.host, server.port);

        Self {
            server,
            relay: RelayConfig::default(),
            object_store: ObjectStoreConfig::default(),
            state_store: StateStoreConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .url_validator()
            .context("配置文件中的目标地址白名单无效")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置，然后应用环境变量覆盖
    pub async fn load_or_default(path: &str) -> Self {
        let mut config = match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        };

        config.apply_env_overrides(std::env::var(WORKER_COUNT_ENV).ok().as_deref());
        config
    }

    /// 应用环境变量覆盖（无效值忽略）
    pub fn apply_env_overrides(&mut self, worker_count: Option<&str>) {
        if let Some(raw) = worker_count {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => {
                    tracing::info!("{} 覆盖每租户并发数: {}", WORKER_COUNT_ENV, n);
                    self.relay.worker_count = n;
                }
                _ => tracing::warn!("忽略无效的 {}: {}", WORKER_COUNT_ENV, raw),
            }
        }
    }

    /// 按中继配置构造目标地址校验器
    pub fn url_validator(&self) -> Result<UrlValidator> {
        UrlValidator::new(self.relay.debug, &self.relay.upload_urls)
    }
}
