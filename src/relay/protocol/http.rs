//! 普通 HTTP 上传
//!
//! - `use_form_data = true`：缓冲区作为 multipart 表单的文件字段，元数据作为文本字段
//! - `use_form_data = false`：原始字节流作为请求体，Content-Length 为声明大小
//!
//! 进度按流经缓冲区的字节计数，与底层传输的统计无关

use super::{apply_headers, response_headers, StrategyOutcome, UploadJob, BODY_SLICE_SIZE};
use crate::events::ResponseInfo;
use crate::relay::error::RelayError;
use crate::relay::options::metadata_string;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{header, Body, Client};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct HttpUpload {
    client: Client,
}

impl HttpUpload {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn run(&self, job: &UploadJob) -> Result<StrategyOutcome, RelayError> {
        let options = &job.options;
        let endpoint = options
            .endpoint
            .as_deref()
            .ok_or_else(|| RelayError::Validation("no destination specified".to_string()))?;
        let expected = options.size;

        // 按流经缓冲区的字节统计进度
        let counted = Arc::new(AtomicU64::new(0));
        let body_stream = {
            let counted = counted.clone();
            let job = job.clone();
            job.buffer.clone().into_stream(BODY_SLICE_SIZE).map(move |chunk| {
                if let Ok(data) = &chunk {
                    let uploaded =
                        counted.fetch_add(data.len() as u64, Ordering::SeqCst) + data.len() as u64;
                    job.report(uploaded, expected);
                }
                chunk
            })
        };

        let mut request = self
            .client
            .request(options.http_method.as_reqwest(), endpoint);
        request = apply_headers(request, &options.headers);

        request = if options.use_form_data {
            let mut form = Form::new();
            for (key, value) in &options.metadata {
                form = form.text(key.clone(), metadata_string(value));
            }
            let mut part =
                Part::stream(Body::wrap_stream(body_stream)).file_name(job.file_name.clone());
            if let Some(content_type) = options.content_type() {
                match header::HeaderValue::from_str(&content_type) {
                    Ok(value) => {
                        let mut part_headers = header::HeaderMap::new();
                        part_headers.insert(header::CONTENT_TYPE, value);
                        part = part.headers(part_headers);
                    }
                    Err(_) => {
                        debug!("[{}] 忽略无效的 MIME 类型: {}", job.short_token, content_type)
                    }
                }
            }
            request.multipart(form.part(options.fieldname.clone(), part))
        } else {
            request
                .header(header::CONTENT_LENGTH, expected)
                .body(Body::wrap_stream(body_stream))
        };

        info!(
            "[{}] 开始 HTTP 上传: method={:?}, form={}, size={}",
            job.short_token, options.http_method, options.use_form_data, expected
        );

        let resp = request.send().await.map_err(RelayError::from_reqwest)?;
        let status = resp.status();
        let headers = response_headers(resp.headers());
        let response_text = match resp.text().await {
            Ok(text) => text,
            Err(e) if status.as_u16() < 400 => {
                return Err(RelayError::Transport {
                    message: format!("failed to read upload response body: {}", e.without_url()),
                    status: Some(status.as_u16()),
                    response: None,
                });
            }
            Err(e) => {
                warn!("[{}] 读取错误响应体失败: {}", job.short_token, e.without_url());
                String::new()
            }
        };
        let response = ResponseInfo {
            response_text,
            status: Some(status.as_u16()),
            status_text: status.canonical_reason().map(str::to_string),
            headers,
        };

        if status.as_u16() >= 400 {
            return Err(RelayError::http_status(status.as_u16(), response));
        }

        let uploaded = counted.load(Ordering::SeqCst);
        if uploaded != expected {
            return Err(RelayError::ByteCountMismatch {
                uploaded,
                expected,
                response: Some(Box::new(response)),
            });
        }

        Ok(StrategyOutcome {
            url: None,
            response: Some(response),
        })
    }
}
