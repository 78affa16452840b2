// 应用状态

use crate::config::{AppConfig, RelayConfig};
use crate::events::{EventBus, LocalEventBus};
use crate::provider::{
    public_redirect_policy, CachedProvider, ProviderRegistry, PublicOnlyResolver, UrlProvider,
};
use crate::relay::{RelayContext, RelayService, S3Client};
use crate::store::{open_state_store, StateStore};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Arc<AppConfig>,
    /// 中继服务
    pub service: Arc<RelayService>,
    /// 已注册的远端来源
    pub providers: Arc<ProviderRegistry>,
}

impl AppState {
    /// 按配置创建应用状态
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let http = build_http_client(&config.relay)?;
        let store = open_state_store(&config.state_store).context("打开状态存储失败")?;
        let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());

        let mut ctx = RelayContext::new(http.clone(), &config);
        if let Some(bucket) = &config.object_store.bucket {
            let client = S3Client::from_config(http.clone(), &config.object_store)
                .context("创建对象存储客户端失败")?;
            info!("对象存储已启用: bucket={}, endpoint={}", bucket, config.object_store.endpoint_url());
            ctx = ctx.with_object_store(Arc::new(client));
        }
        let validator = config.url_validator().context("目标地址白名单无效")?;
        let service = Arc::new(RelayService::new(
            config.relay.clone(),
            validator,
            ctx,
            bus,
            store,
        ));

        let source = build_source_client(&config.relay)?;
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(CachedProvider::new(Arc::new(UrlProvider::new(
            source,
            config.relay.debug,
        )))));
        info!("已注册远端来源: {:?}", providers.names());

        Ok(Self::from_parts(config, service, providers))
    }

    pub fn from_parts(config: AppConfig, service: Arc<RelayService>, providers: ProviderRegistry) -> Self {
        Self {
            config: Arc::new(config),
            service,
            providers: Arc::new(providers),
        }
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        self.service.bus()
    }

    pub fn store(&self) -> Option<&Arc<dyn StateStore>> {
        self.service.store()
    }
}

fn client_builder(config: &RelayConfig) -> reqwest::ClientBuilder {
    let builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .user_agent(concat!("stream-relay/", env!("CARGO_PKG_VERSION")));
    if config.request_timeout_secs > 0 {
        builder.timeout(Duration::from_secs(config.request_timeout_secs))
    } else {
        builder
    }
}

/// 共享的出站 HTTP 客户端（上传目标）
pub fn build_http_client(config: &RelayConfig) -> anyhow::Result<reqwest::Client> {
    client_builder(config).build().context("创建 HTTP 客户端失败")
}

/// 访问 URL 来源的客户端，非调试模式下只连接公网地址
pub fn build_source_client(config: &RelayConfig) -> anyhow::Result<reqwest::Client> {
    let builder = client_builder(config);
    let builder = if config.debug {
        builder
    } else {
        builder
            .dns_resolver(Arc::new(PublicOnlyResolver))
            .redirect(public_redirect_policy())
    };
    builder.build().context("创建来源 HTTP 客户端失败")
}
