//! 公网 URL 来源
//!
//! 文件 ID 即 http(s) URL：HEAD 取 Content-Length 作为大小，GET 流式下载
//!
//! 除非允许访问内网，解析到非公网地址的 URL 会被拒绝

use super::guard::resolves_to_public;
use super::{ByteStream, DirectoryListing, FileRef, ListRequest, LogoutAck, Provider, ProviderError};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode, Url};
use tracing::{debug, warn};

pub struct UrlProvider {
    client: Client,
    /// 允许访问回环/私有/链路本地地址（仅调试模式）
    allow_private: bool,
}

impl UrlProvider {
    pub const NAME: &'static str = "url";

    pub fn new(client: Client, allow_private: bool) -> Self {
        Self {
            client,
            allow_private,
        }
    }

    /// 解析并校验来源 URL
    async fn source_url(&self, id: &str) -> Result<Url, ProviderError> {
        let url = Self::parse(id)?;
        if self.allow_private {
            return Ok(url);
        }
        match resolves_to_public(&url).await {
            Ok(true) => Ok(url),
            Ok(false) => {
                warn!("拒绝访问非公网地址: {}", url.host_str().unwrap_or(""));
                Err(ProviderError::Rejected {
                    message: "request to a private address is not allowed".to_string(),
                })
            }
            Err(e) => Err(ProviderError::Network(format!("failed to resolve host: {}", e))),
        }
    }

    fn parse(id: &str) -> Result<reqwest::Url, ProviderError> {
        let url = reqwest::Url::parse(id).map_err(|_| ProviderError::Api {
            status: Some(400),
            message: "invalid request url".to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            _ => Err(ProviderError::Api {
                status: Some(400),
                message: "invalid request url".to_string(),
            }),
        }
    }

    fn check_status(status: StatusCode) -> Result<(), ProviderError> {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::Auth {
                message: format!("HTTP {}", status.as_u16()),
            });
        }
        if status.is_client_error() || status.is_server_error() {
            return Err(ProviderError::Api {
                status: Some(status.as_u16()),
                message: format!("request to remote url failed with HTTP {}", status.as_u16()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for UrlProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn size(&self, file: &FileRef) -> Result<Option<u64>, ProviderError> {
        let url = self.source_url(&file.id).await?;
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        Self::check_status(resp.status())?;

        let size = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        debug!("URL 文件大小: {:?}", size);
        Ok(size)
    }

    async fn download(&self, file: &FileRef) -> Result<ByteStream, ProviderError> {
        let url = self.source_url(&file.id).await?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        Self::check_status(resp.status())?;

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(ProviderError::from_reqwest))
            .boxed())
    }

    async fn list(&self, _request: &ListRequest) -> Result<DirectoryListing, ProviderError> {
        Err(ProviderError::Api {
            status: Some(400),
            message: "listing is not supported for url provider".to_string(),
        })
    }

    async fn logout(&self, _token: Option<&str>) -> Result<LogoutAck, ProviderError> {
        Ok(LogoutAck { revoked: true })
    }
}
