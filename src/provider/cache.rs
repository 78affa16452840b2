// 文件大小缓存：list 的结果记录每一项的大小，size 优先命中缓存

use super::{ByteStream, DirectoryListing, FileRef, ListRequest, LogoutAck, Provider, ProviderError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// 缓存键：(provider 名称, 文件 ID)
type SizeKey = (String, String);

/// 带大小缓存的 Provider 包装
pub struct CachedProvider {
    inner: Arc<dyn Provider>,
    sizes: Arc<DashMap<SizeKey, u64>>,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn Provider>) -> Self {
        Self::with_cache(inner, Arc::new(DashMap::new()))
    }

    /// 多个 Provider 共享同一缓存
    pub fn with_cache(inner: Arc<dyn Provider>, sizes: Arc<DashMap<SizeKey, u64>>) -> Self {
        Self { inner, sizes }
    }

    fn key(&self, id: &str) -> SizeKey {
        (self.inner.name().to_string(), id.to_string())
    }
}

#[async_trait]
impl Provider for CachedProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn size(&self, file: &FileRef) -> Result<Option<u64>, ProviderError> {
        let key = self.key(&file.id);
        if let Some(size) = self.sizes.get(&key) {
            debug!("文件大小命中缓存: {}:{}", key.0, key.1);
            return Ok(Some(*size));
        }

        let size = self.inner.size(file).await?;
        if let Some(size) = size.filter(|s| *s > 0) {
            self.sizes.insert(key, size);
        }
        Ok(size)
    }

    async fn download(&self, file: &FileRef) -> Result<ByteStream, ProviderError> {
        self.inner.download(file).await
    }

    async fn list(&self, request: &ListRequest) -> Result<DirectoryListing, ProviderError> {
        let listing = self.inner.list(request).await?;
        for item in &listing.items {
            if let Some(size) = item.size.filter(|s| *s > 0) {
                self.sizes.insert(self.key(&item.id), size);
            }
        }
        Ok(listing)
    }

    async fn logout(&self, token: Option<&str>) -> Result<LogoutAck, ProviderError> {
        self.inner.logout(token).await
    }
}
