//! 对象存储分段上传
//!
//! 按 part_size 从缓冲区攒够一段后上传，每段完成后上报进度；
//! 失败或取消时中止分段上传

use super::{KeyNamer, StrategyOutcome, UploadJob};
use crate::config::ObjectStoreConfig;
use crate::events::ResponseInfo;
use crate::relay::error::RelayError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// 对象存储错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object store request failed: {0}")]
    Request(String),
    #[error("object store rejected the request with HTTP {status}: {message}")]
    Status { status: u16, message: String },
}

impl From<ObjectStoreError> for RelayError {
    fn from(err: ObjectStoreError) -> Self {
        let status = match &err {
            ObjectStoreError::Status { status, .. } => Some(*status),
            ObjectStoreError::Request(_) => None,
        };
        RelayError::Transport {
            message: err.to_string(),
            status,
            response: None,
        }
    }
}

/// 创建分段上传的参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateMultipart {
    pub bucket: String,
    pub key: String,
    pub acl: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// 完成后的对象信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompletedUpload {
    pub location: Option<String>,
    pub bucket: String,
    pub key: String,
    #[serde(rename = "ETag")]
    pub etag: Option<String>,
}

/// 对象存储客户端
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// 创建分段上传，返回 upload_id
    async fn create_multipart(&self, request: &CreateMultipart) -> Result<String, ObjectStoreError>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<CompletedPart, ObjectStoreError>;

    async fn complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompletedUpload, ObjectStoreError>;

    async fn abort(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), ObjectStoreError>;
}

/// 进行中的分段上传
#[derive(Debug, Clone)]
struct ActiveUpload {
    bucket: String,
    key: String,
    upload_id: String,
}

pub struct ObjectStoreUpload {
    client: Option<Arc<dyn ObjectStoreClient>>,
    config: ObjectStoreConfig,
    key_namer: KeyNamer,
    active: Mutex<Option<ActiveUpload>>,
}

impl ObjectStoreUpload {
    pub fn new(
        client: Option<Arc<dyn ObjectStoreClient>>,
        config: ObjectStoreConfig,
        key_namer: KeyNamer,
    ) -> Self {
        Self {
            client,
            config,
            key_namer,
            active: Mutex::new(None),
        }
    }

    pub async fn run(&self, job: &UploadJob) -> Result<StrategyOutcome, RelayError> {
        let (client, bucket) = match (&self.client, &self.config.bucket) {
            (Some(client), Some(bucket)) => (client.clone(), bucket.clone()),
            _ => {
                return Err(RelayError::transport(
                    "The object store client is not configured on this relay instance.",
                ))
            }
        };

        let key = (self.key_namer)(&job.file_name, &job.options.metadata);
        let upload_id = client
            .create_multipart(&CreateMultipart {
                bucket: bucket.clone(),
                key: key.clone(),
                acl: self.config.acl.clone(),
                content_type: job.options.content_type(),
            })
            .await?;
        info!(
            "[{}] 对象存储分段上传已创建: bucket={}, key={}",
            job.short_token, bucket, key
        );
        *self.active.lock() = Some(ActiveUpload {
            bucket: bucket.clone(),
            key: key.clone(),
            upload_id: upload_id.clone(),
        });

        match self
            .upload_parts(job, client.as_ref(), &bucket, &key, &upload_id)
            .await
        {
            Ok(completed) => {
                self.active.lock().take();
                let response_text = serde_json::to_string(&completed)
                    .map_err(|e| RelayError::transport(e.to_string()))?;
                let mut headers = BTreeMap::new();
                headers.insert("content-type".to_string(), "application/json".to_string());

                Ok(StrategyOutcome {
                    url: completed.location.clone(),
                    response: Some(ResponseInfo {
                        response_text,
                        status: None,
                        status_text: None,
                        headers,
                    }),
                })
            }
            Err(err) => {
                self.abort(&job.short_token).await;
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        job: &UploadJob,
        client: &dyn ObjectStoreClient,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<CompletedUpload, RelayError> {
        let part_size = self.config.part_size();
        let declared = job.options.size;
        let mut parts = Vec::new();
        let mut loaded = 0u64;
        let mut part = BytesMut::with_capacity(part_size);
        let mut eof = false;

        while !eof {
            while part.len() < part_size {
                match job.buffer.pull(part_size - part.len()).await? {
                    Some(data) => part.extend_from_slice(&data),
                    None => {
                        eof = true;
                        break;
                    }
                }
            }

            // 最后一段可以为空，只有整体为空时才需要上传空段
            if part.is_empty() && !parts.is_empty() {
                break;
            }

            let body = part.split().freeze();
            let len = body.len() as u64;
            let part_number = parts.len() as u32 + 1;
            let completed = client
                .upload_part(bucket, key, upload_id, part_number, body)
                .await?;
            parts.push(completed);

            loaded += len;
            job.report(loaded, declared.max(loaded));
        }

        let completed = client.complete(bucket, key, upload_id, &parts).await?;
        info!(
            "[{}] 对象存储上传完成: {} 段, {} 字节",
            job.short_token,
            parts.len(),
            loaded
        );
        Ok(completed)
    }

    /// 中止进行中的分段上传，失败只记日志
    pub async fn abort(&self, short_token: &str) {
        let active = match self.active.lock().take() {
            Some(active) => active,
            None => return,
        };
        let client = match &self.client {
            Some(client) => client,
            None => return,
        };
        match client
            .abort(&active.bucket, &active.key, &active.upload_id)
            .await
        {
            Ok(()) => info!("[{}] 分段上传已中止", short_token),
            Err(e) => warn!("[{}] 中止分段上传失败: {}", short_token, e),
        }
    }
}
