//! 上传协议策略
//!
//! 三种协议组成封闭集合，会话构造时选定、之后不再改变：
//! - `Resumable`：tus 1.0 断点续传，支持暂停/恢复
//! - `ObjectStoreMultipart`：对象存储分段上传
//! - `SimpleHttp`：multipart 表单或原始请求体

mod http;
mod s3;
mod s3_client;
mod sigv4;
mod tus;

pub use http::HttpUpload;
pub use s3::{
    CompletedPart, CompletedUpload, CreateMultipart, ObjectStoreClient, ObjectStoreError,
    ObjectStoreUpload,
};
pub use s3_client::S3Client;
pub use sigv4::{Credentials, Signer};
pub use tus::TusUpload;

use super::buffer::RelayBuffer;
use super::error::RelayError;
use super::options::{Metadata, Protocol, SessionOptions};
use crate::config::{AppConfig, ObjectStoreConfig};
use crate::events::ResponseInfo;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// 请求体切片大小，进度按切片上报
pub(crate) const BODY_SLICE_SIZE: usize = 64 * 1024;

/// 进度回调：(已上传字节, 总字节)
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 对象键命名函数：(文件名, 元数据) -> 对象键
pub type KeyNamer = Arc<dyn Fn(&str, &Metadata) -> String + Send + Sync>;

/// 协议策略共享的运行环境
#[derive(Clone)]
pub struct RelayContext {
    pub http: reqwest::Client,
    /// tus 分片大小（字节）
    pub tus_chunk_size: usize,
    pub object_store: Option<Arc<dyn ObjectStoreClient>>,
    pub object_store_config: ObjectStoreConfig,
    pub key_namer: KeyNamer,
}

impl RelayContext {
    pub fn new(http: reqwest::Client, config: &AppConfig) -> Self {
        let prefix = config.object_store.key_prefix.clone();
        Self {
            http,
            tus_chunk_size: config.relay.tus_chunk_size(),
            object_store: None,
            object_store_config: config.object_store.clone(),
            key_namer: Arc::new(move |file_name, _metadata| format!("{}{}", prefix, file_name)),
        }
    }

    pub fn with_object_store(mut self, client: Arc<dyn ObjectStoreClient>) -> Self {
        self.object_store = Some(client);
        self
    }

    pub fn with_key_namer(mut self, namer: KeyNamer) -> Self {
        self.key_namer = namer;
        self
    }
}

/// 一次上传所需的全部输入
#[derive(Clone)]
pub struct UploadJob {
    pub token: String,
    pub short_token: String,
    pub file_name: String,
    pub options: SessionOptions,
    pub buffer: Arc<RelayBuffer>,
    pub progress: ProgressFn,
}

impl UploadJob {
    pub(crate) fn report(&self, uploaded: u64, total: u64) {
        (self.progress)(uploaded, total)
    }
}

/// 策略完成结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyOutcome {
    /// 目标地址（tus 上传 URL / 对象存储位置）
    pub url: Option<String>,
    pub response: Option<ResponseInfo>,
}

/// 暂停信号（只读端）
#[derive(Debug, Clone)]
pub struct PauseSignal(watch::Receiver<bool>);

impl PauseSignal {
    pub fn is_paused(&self) -> bool {
        *self.0.borrow()
    }

    /// 等待进入暂停状态
    pub async fn paused(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                // 发送端已释放，不会再暂停
                futures::future::pending::<()>().await;
            }
        }
    }

    /// 等待恢复（未暂停时立即返回）
    pub async fn resumed(&mut self) {
        loop {
            if !*self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

pub enum StrategyKind {
    Resumable(TusUpload),
    ObjectStoreMultipart(ObjectStoreUpload),
    SimpleHttp(HttpUpload),
}

/// 协议策略
pub struct ProtocolStrategy {
    kind: StrategyKind,
    pause_tx: watch::Sender<bool>,
}

impl ProtocolStrategy {
    pub fn new(protocol: Protocol, ctx: &RelayContext) -> Self {
        let kind = match protocol {
            Protocol::Resumable => {
                StrategyKind::Resumable(TusUpload::new(ctx.http.clone(), ctx.tus_chunk_size))
            }
            Protocol::ObjectStoreMultipart => StrategyKind::ObjectStoreMultipart(
                ObjectStoreUpload::new(
                    ctx.object_store.clone(),
                    ctx.object_store_config.clone(),
                    ctx.key_namer.clone(),
                ),
            ),
            Protocol::SimpleHttp => StrategyKind::SimpleHttp(HttpUpload::new(ctx.http.clone())),
        };
        let (pause_tx, _) = watch::channel(false);
        Self { kind, pause_tx }
    }

    pub fn protocol(&self) -> Protocol {
        match self.kind {
            StrategyKind::Resumable(_) => Protocol::Resumable,
            StrategyKind::ObjectStoreMultipart(_) => Protocol::ObjectStoreMultipart,
            StrategyKind::SimpleHttp(_) => Protocol::SimpleHttp,
        }
    }

    /// 开始消费缓冲区并上传，直到完成或失败
    pub async fn begin(&self, job: &UploadJob) -> Result<StrategyOutcome, RelayError> {
        match &self.kind {
            StrategyKind::Resumable(tus) => tus.run(job, PauseSignal(self.pause_tx.subscribe())).await,
            StrategyKind::ObjectStoreMultipart(s3) => s3.run(job).await,
            StrategyKind::SimpleHttp(http) => http.run(job).await,
        }
    }

    /// 暂停（仅断点续传支持），返回是否生效
    pub fn pause(&self) -> bool {
        if !self.supports_pause() {
            return false;
        }
        self.pause_tx.send_replace(true);
        true
    }

    pub fn resume(&self) -> bool {
        if !self.supports_pause() {
            return false;
        }
        self.pause_tx.send_replace(false);
        true
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    pub fn supports_pause(&self) -> bool {
        matches!(self.kind, StrategyKind::Resumable(_))
    }

    /// 取消：尽力终止目标端的上传，失败只记日志
    pub async fn cancel(&self, short_token: &str) {
        match &self.kind {
            StrategyKind::Resumable(tus) => tus.terminate(short_token).await,
            StrategyKind::ObjectStoreMultipart(s3) => s3.abort(short_token).await,
            StrategyKind::SimpleHttp(_) => {}
        }
    }

    /// 已分配的 tus 上传 URL
    pub fn upload_url(&self) -> Option<String> {
        match &self.kind {
            StrategyKind::Resumable(tus) => tus.upload_url(),
            _ => None,
        }
    }

    /// 调用方提供的 tus 上传 URL 已被服务端拒绝
    pub fn upload_url_rejected(&self) -> bool {
        match &self.kind {
            StrategyKind::Resumable(tus) => tus.upload_url_rejected(),
            _ => false,
        }
    }
}

/// 把调用方请求头加到请求上
pub(crate) fn apply_headers(
    mut request: reqwest::RequestBuilder,
    headers: &BTreeMap<String, String>,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

/// 汇总响应头，去掉 set-cookie / set-cookie2
pub(crate) fn response_headers(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    let mut collected: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        if name == "set-cookie" || name == "set-cookie2" {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes()).to_string();
        collected
            .entry(name)
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(&value);
            })
            .or_insert(value);
    }
    collected
}
