//! 兼容 S3 的对象存储 REST 客户端
//!
//! 用 SigV4 签名的 reqwest 请求实现分段上传的四个操作

use super::s3::{CompletedPart, CompletedUpload, CreateMultipart, ObjectStoreClient, ObjectStoreError};
use super::sigv4::{canonical_query, host_header, sha256_hex, uri_encode, Credentials, Signer};
use crate::config::ObjectStoreConfig;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{header, Client, Method, Response, Url};
use tracing::debug;

const ACCESS_KEY_ENV: &str = "AWS_ACCESS_KEY_ID";
const SECRET_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";

pub struct S3Client {
    http: Client,
    endpoint: Url,
    path_style: bool,
    signer: Signer,
}

impl S3Client {
    pub fn new(http: Client, endpoint: Url, path_style: bool, signer: Signer) -> Self {
        Self {
            http,
            endpoint,
            path_style,
            signer,
        }
    }

    /// 按配置创建，凭证缺省时读取 AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY
    pub fn from_config(http: Client, config: &ObjectStoreConfig) -> anyhow::Result<Self> {
        let access_key_id = config
            .access_key_id
            .clone()
            .or_else(|| std::env::var(ACCESS_KEY_ENV).ok())
            .ok_or_else(|| anyhow!("对象存储缺少 access_key_id（或 {}）", ACCESS_KEY_ENV))?;
        let secret_access_key = config
            .secret_access_key
            .clone()
            .or_else(|| std::env::var(SECRET_KEY_ENV).ok())
            .ok_or_else(|| anyhow!("对象存储缺少 secret_access_key（或 {}）", SECRET_KEY_ENV))?;

        let endpoint = Url::parse(&config.endpoint_url()).context("对象存储地址无效")?;
        let signer = Signer::new(
            Credentials {
                access_key_id,
                secret_access_key,
            },
            config.region.clone(),
        );
        Ok(Self::new(http, endpoint, config.path_style, signer))
    }

    /// 对象地址：路径风格为 `endpoint/bucket/key`，否则为 `bucket.host/key`
    fn object_url(&self, bucket: &str, key: &str, query: &[(&str, String)]) -> Result<Url, ObjectStoreError> {
        let mut url = self.endpoint.clone();
        let base = url.path().trim_end_matches('/').to_string();
        let key = uri_encode(key, true);
        if self.path_style {
            url.set_path(&format!("{}/{}/{}", base, uri_encode(bucket, false), key));
        } else {
            let host = format!("{}.{}", bucket, url.host_str().unwrap_or_default());
            url.set_host(Some(&host))
                .map_err(|e| ObjectStoreError::Request(format!("invalid bucket host: {}", e)))?;
            url.set_path(&format!("{}/{}", base, key));
        }
        if query.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&canonical_query(query)));
        }
        Ok(url)
    }

    /// 签名并发送
    async fn send(
        &self,
        method: Method,
        url: Url,
        extra_headers: Vec<(String, String)>,
        body: Bytes,
    ) -> Result<Response, ObjectStoreError> {
        let now = Utc::now();
        let payload_hash = sha256_hex(&body);
        let mut headers = extra_headers;
        headers.push(("host".to_string(), host_header(&url)));
        headers.push(("x-amz-content-sha256".to_string(), payload_hash.clone()));
        headers.push(("x-amz-date".to_string(), now.format("%Y%m%dT%H%M%SZ").to_string()));
        let authorization = self
            .signer
            .authorization(method.as_str(), &url, &headers, &payload_hash, now);

        let mut request = self.http.request(method.clone(), url);
        for (name, value) in &headers {
            // Host 由 reqwest 根据 URL 填写
            if name != "host" {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        let resp = request
            .header(header::AUTHORIZATION, authorization)
            .body(body)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.without_url().to_string()))?;
        debug!("对象存储 {} 响应: {}", method, resp.status());

        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            Err(ObjectStoreError::Status {
                status,
                message: error_message(&text),
            })
        }
    }

    async fn read_text(resp: Response) -> Result<String, ObjectStoreError> {
        resp.text()
            .await
            .map_err(|e| ObjectStoreError::Request(format!("failed to read response: {}", e)))
    }
}

#[async_trait]
impl ObjectStoreClient for S3Client {
    async fn create_multipart(&self, request: &CreateMultipart) -> Result<String, ObjectStoreError> {
        let url = self.object_url(&request.bucket, &request.key, &[("uploads", String::new())])?;
        let mut headers = Vec::new();
        if let Some(acl) = &request.acl {
            headers.push(("x-amz-acl".to_string(), acl.clone()));
        }
        if let Some(content_type) = &request.content_type {
            headers.push(("content-type".to_string(), content_type.clone()));
        }

        let resp = self.send(Method::POST, url, headers, Bytes::new()).await?;
        let text = Self::read_text(resp).await?;
        xml_field(&text, "UploadId")
            .ok_or_else(|| ObjectStoreError::Request("response is missing UploadId".to_string()))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<CompletedPart, ObjectStoreError> {
        let url = self.object_url(
            bucket,
            key,
            &[
                ("partNumber", part_number.to_string()),
                ("uploadId", upload_id.to_string()),
            ],
        )?;
        let resp = self.send(Method::PUT, url, Vec::new(), body).await?;
        let etag = resp
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ObjectStoreError::Request(format!("part {} response is missing ETag", part_number)))?;
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompletedUpload, ObjectStoreError> {
        let url = self.object_url(bucket, key, &[("uploadId", upload_id.to_string())])?;
        let body = complete_body(parts);
        let headers = vec![("content-type".to_string(), "application/xml".to_string())];
        let resp = self.send(Method::POST, url, headers, Bytes::from(body)).await?;
        let status = resp.status().as_u16();
        let text = Self::read_text(resp).await?;

        // 完成请求可能以 200 返回错误文档
        if text.contains("<Error>") {
            return Err(ObjectStoreError::Status {
                status,
                message: error_message(&text),
            });
        }
        Ok(CompletedUpload {
            location: xml_field(&text, "Location"),
            bucket: xml_field(&text, "Bucket").unwrap_or_else(|| bucket.to_string()),
            key: xml_field(&text, "Key").unwrap_or_else(|| key.to_string()),
            etag: xml_field(&text, "ETag"),
        })
    }

    async fn abort(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), ObjectStoreError> {
        let url = self.object_url(bucket, key, &[("uploadId", upload_id.to_string())])?;
        self.send(Method::DELETE, url, Vec::new(), Bytes::new()).await?;
        Ok(())
    }
}

fn complete_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            xml_escape(&part.etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// 取第一个同名元素的文本
fn xml_field(xml: &str, name: &str) -> Option<String> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml_unescape(&xml[start..end]))
}

/// 错误文档中的 Code 与 Message
fn error_message(xml: &str) -> String {
    match (xml_field(xml, "Code"), xml_field(xml, "Message")) {
        (Some(code), Some(message)) => format!("{}: {}", code, message),
        (Some(code), None) => code,
        _ => xml.trim().chars().take(200).collect(),
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn xml_unescape(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
