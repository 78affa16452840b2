//! tus 1.0 断点续传上传
//!
//! 流程：
//! 1. 无上传 URL 时 POST 创建（Upload-Defer-Length: 1），有则 HEAD 读取已确认偏移
//! 2. 按分片从缓冲区读取，PATCH 发送；读到流结束的那一片带上 Upload-Length
//! 3. 暂停时中断进行中的 PATCH，恢复后 HEAD 读取偏移并补发剩余部分
//!
//! 已有上传 URL 失效（HEAD 返回 403/404/410）且配置了 endpoint 时重新创建上传。
//! 每个上传有独立的 Cookie Jar，服务端下发的 cookie 会带到后续请求上（负载均衡会话保持）
//!
//! 声明大小只是临时总量，流结束后以实际字节数为准

use super::{apply_headers, PauseSignal, StrategyOutcome, UploadJob, BODY_SLICE_SIZE};
use crate::relay::buffer::RelayBuffer;
use crate::relay::error::RelayError;
use crate::relay::options::metadata_string;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{header, Body, Client, RequestBuilder, Response};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const TUS_RESUMABLE: &str = "Tus-Resumable";
const TUS_VERSION: &str = "1.0.0";
const UPLOAD_OFFSET: &str = "Upload-Offset";
const UPLOAD_LENGTH: &str = "Upload-Length";

pub struct TusUpload {
    client: Client,
    chunk_size: usize,
    /// 服务端分配的上传 URL
    upload_url: Mutex<Option<String>>,
    /// 调用方提供的上传 URL 已被服务端拒绝
    upload_url_rejected: AtomicBool,
    cookies: Jar,
}

impl TusUpload {
    pub fn new(client: Client, chunk_size: usize) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
            upload_url: Mutex::new(None),
            upload_url_rejected: AtomicBool::new(false),
            cookies: Jar::default(),
        }
    }

    pub fn upload_url(&self) -> Option<String> {
        self.upload_url.lock().clone()
    }

    pub fn upload_url_rejected(&self) -> bool {
        self.upload_url_rejected.load(Ordering::SeqCst)
    }

    pub async fn run(
        &self,
        job: &UploadJob,
        mut pause: PauseSignal,
    ) -> Result<StrategyOutcome, RelayError> {
        if pause.is_paused() {
            info!("[{}] 会话处于暂停状态，等待恢复后再上传", job.short_token);
        }
        pause.resumed().await;

        let (url, mut offset) = self.open(job).await?;
        *self.upload_url.lock() = Some(url.clone());

        if offset > 0 {
            skip_bytes(&job.buffer, offset).await?;
            job.report(offset, job.options.size.max(offset));
        }

        let mut eof = false;
        while !eof {
            let chunk = read_chunk(&job.buffer, self.chunk_size, &mut eof).await?;
            let final_length = eof.then(|| offset + chunk.len() as u64);
            debug!(
                "[{}] 发送分片: offset={}, len={}, final={:?}",
                job.short_token,
                offset,
                chunk.len(),
                final_length
            );
            offset = self
                .send_chunk(job, &url, offset, chunk, final_length, &mut pause)
                .await?;
        }

        info!("[{}] tus 上传完成: {} 字节", job.short_token, offset);
        Ok(StrategyOutcome {
            url: Some(url),
            response: None,
        })
    }

    /// 确定上传 URL 和服务端已确认的偏移
    async fn open(&self, job: &UploadJob) -> Result<(String, u64), RelayError> {
        if let Some(existing) = &job.options.upload_url {
            match self.head_offset(job, existing).await {
                Ok(offset) => {
                    info!("[{}] 复用上传 URL，已确认偏移: {}", job.short_token, offset);
                    return Ok((existing.clone(), offset));
                }
                Err(err) if is_gone(&err) => {
                    self.upload_url_rejected.store(true, Ordering::SeqCst);
                    if job.options.endpoint.is_none() {
                        return Err(err);
                    }
                    warn!("[{}] 上传 URL 已失效，重新创建上传: {}", job.short_token, err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok((self.create(job).await?, 0))
    }

    /// 带上本次上传的 cookie 发送，并记录响应中的 set-cookie
    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response, RelayError> {
        let request = match reqwest::Url::parse(url).ok().and_then(|u| self.cookies.cookies(&u)) {
            Some(cookie) => request.header(header::COOKIE, cookie),
            None => request,
        };
        let resp = request.send().await.map_err(RelayError::from_reqwest)?;
        let mut set_cookies = resp.headers().get_all(header::SET_COOKIE).iter();
        self.cookies.set_cookies(&mut set_cookies, resp.url());
        Ok(resp)
    }

    /// POST 创建上传，返回上传 URL
    async fn create(&self, job: &UploadJob) -> Result<String, RelayError> {
        let endpoint = job
            .options
            .endpoint
            .as_deref()
            .ok_or_else(|| RelayError::Validation("no destination specified".to_string()))?;

        let request = self
            .client
            .post(endpoint)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header("Upload-Defer-Length", "1")
            .header("Upload-Metadata", encode_metadata(job))
            .header("X-Request-ID", uuid::Uuid::new_v4().to_string())
            .header(header::CONTENT_LENGTH, 0);
        let resp = self
            .send(apply_headers(request, &job.options.headers), endpoint)
            .await?;
        let resp = check_status(resp, "create upload")?;

        let location = resp
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RelayError::transport("tus: invalid or missing Location header"))?;
        let url = reqwest::Url::parse(endpoint)
            .and_then(|base| base.join(location))
            .map_err(|_| RelayError::transport("tus: invalid Location header"))?;

        info!("[{}] tus 上传已创建", job.short_token);
        Ok(url.to_string())
    }

    /// HEAD 读取服务端已确认的偏移
    async fn head_offset(&self, job: &UploadJob, url: &str) -> Result<u64, RelayError> {
        let request = self.client.head(url).header(TUS_RESUMABLE, TUS_VERSION);
        let resp = self.send(apply_headers(request, &job.options.headers), url).await?;
        let resp = check_status(resp, "read upload offset")?;
        parse_offset(&resp)
    }

    /// 发送一个分片，暂停时中断并在恢复后补发，返回分片结束后的偏移
    async fn send_chunk(
        &self,
        job: &UploadJob,
        url: &str,
        start: u64,
        chunk: Bytes,
        final_length: Option<u64>,
        pause: &mut PauseSignal,
    ) -> Result<u64, RelayError> {
        let end = start + chunk.len() as u64;
        let mut offset = start;

        loop {
            pause.resumed().await;
            let body = chunk.slice((offset - start) as usize..);

            tokio::select! {
                result = self.patch(job, url, offset, body, final_length) => {
                    let acked = result?;
                    if acked == end {
                        return Ok(end);
                    }
                    if acked <= offset || acked > end {
                        return Err(RelayError::transport(format!(
                            "tus: unexpected Upload-Offset {} (expected {})",
                            acked, end
                        )));
                    }
                    // 服务端只接收了一部分，继续发送剩余
                    offset = acked;
                }
                _ = pause.paused() => {
                    info!("[{}] 上传已暂停，offset={}", job.short_token, offset);
                    pause.resumed().await;
                    info!("[{}] 上传已恢复", job.short_token);

                    let server_offset = self.head_offset(job, url).await?;
                    if server_offset < start || server_offset > end {
                        return Err(RelayError::transport(format!(
                            "tus: server offset {} outside of current chunk {}..{}",
                            server_offset, start, end
                        )));
                    }
                    if server_offset == end && final_length.is_none() {
                        return Ok(end);
                    }
                    offset = server_offset;
                }
            }
        }
    }

    async fn patch(
        &self,
        job: &UploadJob,
        url: &str,
        offset: u64,
        body: Bytes,
        final_length: Option<u64>,
    ) -> Result<u64, RelayError> {
        let len = body.len() as u64;
        let declared = job.options.size;
        let sent = Arc::new(AtomicU64::new(0));
        let reporter = job.clone();

        let slices: Vec<Bytes> = (0..body.len())
            .step_by(BODY_SLICE_SIZE)
            .map(|i| body.slice(i..(i + BODY_SLICE_SIZE).min(body.len())))
            .collect();
        let stream = futures::stream::iter(slices).map(move |slice| {
            let n = sent.fetch_add(slice.len() as u64, Ordering::SeqCst) + slice.len() as u64;
            let uploaded = offset + n;
            let total = final_length.unwrap_or_else(|| declared.max(uploaded));
            reporter.report(uploaded, total);
            Ok::<_, std::io::Error>(slice)
        });

        let mut request = self
            .client
            .patch(url)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(UPLOAD_OFFSET, offset)
            .header(header::CONTENT_TYPE, "application/offset+octet-stream")
            .header(header::CONTENT_LENGTH, len);
        if let Some(total) = final_length {
            request = request.header(UPLOAD_LENGTH, total);
        }
        let request = apply_headers(request, &job.options.headers).body(Body::wrap_stream(stream));
        let resp = self.send(request, url).await?;
        let resp = check_status(resp, "upload chunk")?;

        if len == 0 {
            if let Some(total) = final_length {
                job.report(total, total);
            }
        }
        parse_offset(&resp)
    }

    /// DELETE 终止上传，失败只记日志
    pub async fn terminate(&self, short_token: &str) {
        let url = match self.upload_url() {
            Some(url) => url,
            None => return,
        };
        let request = self.client.delete(&url).header(TUS_RESUMABLE, TUS_VERSION);
        match self.send(request, &url).await {
            Ok(resp) if resp.status().is_success() => {
                info!("[{}] tus 上传已终止", short_token)
            }
            Ok(resp) => warn!("[{}] tus 终止请求返回 HTTP {}", short_token, resp.status()),
            Err(e) => warn!("[{}] tus 终止请求失败: {}", short_token, e),
        }
    }
}

/// Upload-Metadata：`key base64(value)`，逗号分隔；filename/filetype 覆盖调用方同名键
fn encode_metadata(job: &UploadJob) -> String {
    let mut metadata: BTreeMap<String, String> = job
        .options
        .metadata
        .iter()
        .map(|(k, v)| (k.clone(), metadata_string(v)))
        .collect();
    metadata.insert("filename".to_string(), job.file_name.clone());
    match job.options.content_type() {
        Some(filetype) => {
            metadata.insert("filetype".to_string(), filetype);
        }
        None => {
            metadata.remove("filetype");
        }
    }

    metadata
        .iter()
        .filter(|(k, _)| !k.is_empty() && !k.contains(' ') && !k.contains(','))
        .map(|(k, v)| format!("{} {}", k, STANDARD.encode(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn check_status(resp: Response, operation: &str) -> Result<Response, RelayError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    Err(RelayError::Transport {
        message: format!(
            "tus: unexpected response while trying to {}, HTTP {}",
            operation,
            status.as_u16()
        ),
        status: Some(status.as_u16()),
        response: None,
    })
}

/// 上传已不存在或不允许继续
fn is_gone(err: &RelayError) -> bool {
    matches!(
        err,
        RelayError::Transport {
            status: Some(403 | 404 | 410),
            ..
        }
    )
}

fn parse_offset(resp: &Response) -> Result<u64, RelayError> {
    resp.headers()
        .get(UPLOAD_OFFSET)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| RelayError::transport("tus: invalid or missing Upload-Offset header"))
}

/// 读取至多 max 字节，读到流结束时置 eof
async fn read_chunk(buffer: &RelayBuffer, max: usize, eof: &mut bool) -> Result<Bytes, RelayError> {
    let mut chunk = BytesMut::with_capacity(max.min(1024 * 1024));
    while chunk.len() < max {
        match buffer.pull(max - chunk.len()).await? {
            Some(data) => chunk.extend_from_slice(&data),
            None => {
                *eof = true;
                break;
            }
        }
    }
    Ok(chunk.freeze())
}

/// 丢弃已被服务端确认的前 n 个字节
async fn skip_bytes(buffer: &RelayBuffer, n: u64) -> Result<(), RelayError> {
    let mut remaining = n;
    while remaining > 0 {
        let want = remaining.min(BODY_SLICE_SIZE as u64) as usize;
        match buffer.pull(want).await? {
            Some(data) => remaining -= data.len() as u64,
            None => {
                return Err(RelayError::transport(
                    "tus: download ended before the resumed upload offset",
                ))
            }
        }
    }
    Ok(())
}
