//! 中继服务：把 Provider、会话、重试和租户队列组合成"开始中继"流程
//!
//! 1. 查询文件大小（带重试）
//! 2. 校验会话选项，失败同步返回 400
//! 3. 立即返回 token，后台等待客户端连接后开始：
//!    - 有 tenantId：进入租户队列，按下载重试间隔重试
//!    - 无 tenantId：只执行一次（即最后一次）

use super::error::RelayError;
use super::options::{Protocol, SessionOptions};
use super::protocol::RelayContext;
use super::queue::TenantWorkQueue;
use super::retry::{Attempt, RetryOrchestrator};
use super::session::TransferSession;
use crate::config::{RelayConfig, ResumableRetry, UrlValidator};
use crate::events::EventBus;
use crate::provider::{
    error_to_response, DirectoryListing, FileRef, ListRequest, Provider, ProviderError,
};
use crate::store::StateStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};

/// 同步拒绝开始中继
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RelayRejection {
    pub status: u16,
    pub message: String,
}

impl RelayRejection {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

pub struct RelayService {
    config: RelayConfig,
    validator: UrlValidator,
    ctx: RelayContext,
    bus: Arc<dyn EventBus>,
    store: Option<Arc<dyn StateStore>>,
    queue: TenantWorkQueue,
}

impl RelayService {
    pub fn new(
        config: RelayConfig,
        validator: UrlValidator,
        ctx: RelayContext,
        bus: Arc<dyn EventBus>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        let queue = TenantWorkQueue::new(config.worker_count);
        info!("中继服务初始化: 每租户并发上限={}", queue.worker_count());
        Self {
            config,
            validator,
            ctx,
            bus,
            store,
            queue,
        }
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn context(&self) -> &RelayContext {
        &self.ctx
    }

    pub fn store(&self) -> Option<&Arc<dyn StateStore>> {
        self.store.as_ref()
    }

    /// 开始中继，返回会话 token
    pub async fn start(
        self: &Arc<Self>,
        provider: Arc<dyn Provider>,
        file: FileRef,
        body: &Value,
    ) -> Result<String, RelayRejection> {
        let size = self.file_size(provider.as_ref(), &file).await?;
        let options = SessionOptions::from_request(body, size, &self.validator)
            .map_err(|e| RelayRejection::new(400, e.to_string()))?;

        let session = TransferSession::new(
            options,
            &self.ctx,
            self.bus.clone(),
            self.store.clone(),
        );
        let token = session.token().to_string();
        info!(
            "[{}] 中继已创建: provider={}, size={}",
            session.short_token(),
            provider.name(),
            size
        );

        // 订阅必须在返回 token 之前完成，避免错过客户端的连接信号
        let ready = session.wait_for_client();
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = ready.await {
                debug!("[{}] 客户端连接前会话已结束: {}", session.short_token(), e);
                return;
            }
            debug!("[{}] 客户端已连接", session.short_token());

            match session.options().tenant_id() {
                Some(tenant) => {
                    session.emit_queued();
                    let queued = service.clone();
                    service.queue.enqueue(&tenant, async move {
                        queued.run_with_retry(session, provider, file).await
                    });
                }
                None => service.run_once(session, provider, file).await,
            }
        });

        Ok(token)
    }

    /// 查询文件大小，0 或未知视为无法中继
    async fn file_size(&self, provider: &dyn Provider, file: &FileRef) -> Result<u64, RelayRejection> {
        let result = RetryOrchestrator::new(self.config.size_retry_delays())
            .with_predicate(|e: &ProviderError| e.is_retryable())
            .run(move |_| provider.size(file))
            .await;

        match result {
            Ok(Some(size)) if size > 0 => Ok(size),
            Ok(_) => Err(RelayRejection::new(400, "unable to determine file size")),
            Err(e) => {
                error!("查询文件大小失败: provider={}, error={}", provider.name(), e);
                Err(match error_to_response(&e) {
                    Some((status, message)) => RelayRejection::new(status, message),
                    None => RelayRejection::new(500, "failed to get file size"),
                })
            }
        }
    }

    /// 无租户：只执行一次
    async fn run_once(&self, session: Arc<TransferSession>, provider: Arc<dyn Provider>, file: FileRef) {
        session.mark_last_attempt();
        if let Err(err) = self.attempt(&session, provider.as_ref(), &file).await {
            session.fail(&err);
        }
    }

    /// 按下载重试间隔执行，每次失败后用同一 token 的新会话接替
    async fn run_with_retry(
        self: Arc<Self>,
        session: Arc<TransferSession>,
        provider: Arc<dyn Provider>,
        file: FileRef,
    ) {
        let retry = RetryOrchestrator::new(self.config.download_retry_delays())
            .with_predicate(|e: &RelayError| e.is_retryable());
        let slot = Mutex::new(session);

        let service = self.as_ref();
        let retry_ref = &retry;
        let slot_ref = &slot;
        let provider = provider.as_ref();
        let file = &file;

        let result = retry
            .run(move |attempt: Attempt| async move {
                let session = slot_ref.lock().clone();
                if attempt.is_last {
                    session.mark_last_attempt();
                }
                debug!(
                    "[{}] 第 {}/{} 次尝试",
                    session.short_token(),
                    attempt.index + 1,
                    retry_ref.attempts()
                );

                let result = service.attempt(&session, provider, file).await;
                if let Err(err) = &result {
                    if retry_ref.will_retry(attempt, err) {
                        session.retire();
                        let next = service.next_session(&session);
                        *slot_ref.lock() = next;
                    }
                }
                result
            })
            .await;

        if let Err(err) = result {
            let session = slot.lock().clone();
            session.fail(&err);
        }
    }

    /// 单次尝试：下载并中继
    async fn attempt(
        &self,
        session: &TransferSession,
        provider: &dyn Provider,
        file: &FileRef,
    ) -> Result<(), RelayError> {
        if session.is_stopped() {
            return Err(RelayError::Cancelled);
        }
        let download = match provider.download(file).await {
            Ok(stream) => stream,
            Err(e) => {
                let err = RelayError::from(e);
                session.report_failure(&err);
                return Err(err);
            }
        };
        session.relay(download).await
    }

    /// 同一 token 的接替会话
    fn next_session(&self, previous: &TransferSession) -> Arc<TransferSession> {
        let mut options = previous.options().clone().with_token(previous.token());
        if options.protocol == Protocol::Resumable {
            if previous.upload_url_rejected() {
                debug!("[{}] 上传地址已失效，重试时不再使用", previous.short_token());
                options.upload_url = None;
            }
            if self.config.resumable_retry == ResumableRetry::Resume {
                if let Some(url) = previous.upload_url() {
                    debug!("[{}] 重试复用上传地址: {}", previous.short_token(), url);
                    options.upload_url = Some(url);
                }
            }
        }
        TransferSession::new(options, &self.ctx, self.bus.clone(), self.store.clone())
    }

    /// 列目录（带重试）
    pub async fn list(
        &self,
        provider: &dyn Provider,
        request: &ListRequest,
    ) -> Result<DirectoryListing, ProviderError> {
        RetryOrchestrator::new(self.config.list_retry_delays())
            .with_predicate(|e: &ProviderError| e.is_retryable())
            .run(move |_| provider.list(request))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::events::{topics, BusMessage, LocalEventBus, RelayEvent};
    use crate::provider::{ByteStream, ListItem, LogoutAck};
    use crate::store::{state_key, MemoryStateStore};
    use crate::test_util::spawn_server;
    use async_trait::async_trait;
    use axum::body::Bytes as AxumBytes;
    use axum::routing::post;
    use axum::Router;
    use bytes::Bytes;
    use futures::StreamExt;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const DATA: &[u8] = b"0123456789abcdefgh";

    #[derive(Default)]
    struct FakeProvider {
        size: Option<u64>,
        size_error: Option<ProviderError>,
        download_failures: Mutex<VecDeque<ProviderError>>,
        list_failures: Mutex<VecDeque<ProviderError>>,
        downloads: AtomicUsize,
        lists: AtomicUsize,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        async fn size(&self, _file: &FileRef) -> Result<Option<u64>, ProviderError> {
            match &self.size_error {
                Some(e) => Err(e.clone()),
                None => Ok(self.size),
            }
        }

        async fn download(&self, _file: &FileRef) -> Result<ByteStream, ProviderError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.download_failures.lock().pop_front() {
                return Err(e);
            }
            let (head, tail) = DATA.split_at(10);
            Ok(futures::stream::iter(vec![
                Ok(Bytes::from_static(head)),
                Ok(Bytes::from_static(tail)),
            ])
            .boxed())
        }

        async fn list(&self, _request: &ListRequest) -> Result<DirectoryListing, ProviderError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.list_failures.lock().pop_front() {
                return Err(e);
            }
            Ok(DirectoryListing {
                username: Some("tester".to_string()),
                items: vec![ListItem {
                    id: "a".to_string(),
                    name: "a.txt".to_string(),
                    is_folder: false,
                    mime_type: None,
                    icon: None,
                    thumbnail: None,
                    request_path: "a".to_string(),
                    modified_date: None,
                    size: Some(18),
                }],
                next_page_path: None,
            })
        }

        async fn logout(&self, _token: Option<&str>) -> Result<LogoutAck, ProviderError> {
            Ok(LogoutAck { revoked: true })
        }
    }

    fn fake(size: u64) -> FakeProvider {
        FakeProvider {
            size: Some(size),
            ..Default::default()
        }
    }

    fn api_error(status: u16) -> ProviderError {
        ProviderError::Api {
            status: Some(status),
            message: format!("provider returned {}", status),
        }
    }

    struct Setup {
        service: Arc<RelayService>,
        bus: Arc<LocalEventBus>,
        store: Arc<MemoryStateStore>,
        endpoint: String,
    }

    async fn setup() -> Setup {
        setup_with(|_| {}).await
    }

    async fn setup_with(configure: impl FnOnce(&mut AppConfig)) -> Setup {
        let router = Router::new().route("/f", post(|body: AxumBytes| async move { format!("{}", body.len()) }));
        let base = spawn_server(router).await;

        let mut config = AppConfig::default();
        config.relay.debug = true;
        config.relay.download_retry_delays_secs = vec![0, 0];
        config.relay.list_retry_delays_secs = vec![0, 0];
        config.relay.size_retry_delays_secs = vec![0];
        configure(&mut config);

        let bus = Arc::new(LocalEventBus::new());
        let store = Arc::new(MemoryStateStore::new());
        let ctx = RelayContext::new(reqwest::Client::new(), &config);
        let service = Arc::new(RelayService::new(
            config.relay.clone(),
            config.url_validator().unwrap(),
            ctx,
            bus.clone(),
            Some(store.clone() as Arc<dyn StateStore>),
        ));
        Setup {
            service,
            bus,
            store,
            endpoint: format!("{}/f", base),
        }
    }

    impl Setup {
        /// 订阅事件并发送连接信号
        fn connect(&self, token: &str) -> mpsc::UnboundedReceiver<RelayEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.bus.subscribe(
                &topics::events(token),
                Arc::new(move |message| {
                    if let BusMessage::Event(event) = message {
                        let _ = tx.send(event.clone());
                    }
                }),
            );
            self.bus.publish(&topics::connection(token), BusMessage::Signal);
            rx
        }
    }

    /// 收集事件直到终态
    async fn until_terminal(rx: &mut mpsc::UnboundedReceiver<RelayEvent>) -> Vec<String> {
        let mut actions = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for events")
                .expect("event channel closed");
            let terminal = event.is_terminal();
            actions.push(event.action().to_string());
            if terminal {
                return actions;
            }
        }
    }

    fn outcomes(actions: &[String]) -> Vec<&str> {
        actions
            .iter()
            .map(String::as_str)
            .filter(|a| *a != "progress")
            .collect()
    }

    #[tokio::test]
    async fn test_start_without_tenant_relays_after_connection() {
        let s = setup().await;
        let provider = Arc::new(fake(18));
        let token = s
            .service
            .start(provider.clone(), FileRef::default(), &json!({"endpoint": s.endpoint}))
            .await
            .unwrap();

        // 客户端连接前不开始下载
        tokio::task::yield_now().await;
        assert_eq!(provider.downloads.load(Ordering::SeqCst), 0);

        let mut rx = s.connect(&token);
        let actions = until_terminal(&mut rx).await;
        assert_eq!(outcomes(&actions), vec!["success"]);
        assert_eq!(provider.downloads.load(Ordering::SeqCst), 1);

        let saved = s.store.get(&state_key(&token)).unwrap().unwrap();
        assert!(saved.contains("\"success\""));
    }

    #[tokio::test]
    async fn test_tenant_job_retries_with_same_token() {
        let s = setup().await;
        let provider = Arc::new(fake(18));
        provider.download_failures.lock().push_back(api_error(503));

        let token = s
            .service
            .start(
                provider.clone(),
                FileRef::default(),
                &json!({"endpoint": s.endpoint, "metadata": {"tenantId": "acme"}}),
            )
            .await
            .unwrap();

        let mut rx = s.connect(&token);
        let actions = until_terminal(&mut rx).await;
        assert_eq!(outcomes(&actions), vec!["queued", "retry", "success"]);
        assert_eq!(provider.downloads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_emit_single_error() {
        let s = setup().await;
        let provider = Arc::new(fake(18));
        for _ in 0..3 {
            provider.download_failures.lock().push_back(api_error(500));
        }

        let token = s
            .service
            .start(
                provider.clone(),
                FileRef::default(),
                &json!({"endpoint": s.endpoint, "metadata": {"tenantId": "acme"}}),
            )
            .await
            .unwrap();

        let mut rx = s.connect(&token);
        let actions = until_terminal(&mut rx).await;
        assert_eq!(outcomes(&actions), vec!["queued", "retry", "retry", "error"]);
        assert_eq!(provider.downloads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_error_short_circuits_retry() {
        let s = setup().await;
        let provider = Arc::new(fake(18));
        provider.download_failures.lock().push_back(ProviderError::Auth {
            message: "token expired".to_string(),
        });

        let token = s
            .service
            .start(
                provider.clone(),
                FileRef::default(),
                &json!({"endpoint": s.endpoint, "metadata": {"tenantId": "acme"}}),
            )
            .await
            .unwrap();

        let mut rx = s.connect(&token);
        let actions = until_terminal(&mut rx).await;
        assert_eq!(outcomes(&actions), vec!["queued", "error"]);
        assert_eq!(provider.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_attempt_without_tenant_fails_terminally() {
        let s = setup().await;
        let provider = Arc::new(fake(18));
        provider.download_failures.lock().push_back(api_error(500));

        let token = s
            .service
            .start(provider.clone(), FileRef::default(), &json!({"endpoint": s.endpoint}))
            .await
            .unwrap();

        let mut rx = s.connect(&token);
        let actions = until_terminal(&mut rx).await;
        assert_eq!(outcomes(&actions), vec!["error"]);
    }

    #[tokio::test]
    async fn test_start_rejections() {
        let s = setup().await;

        let zero = Arc::new(fake(0));
        let err = s
            .service
            .start(zero, FileRef::default(), &json!({"endpoint": s.endpoint}))
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(err.message, "unable to determine file size");

        let auth = Arc::new(FakeProvider {
            size_error: Some(ProviderError::Auth {
                message: "denied".to_string(),
            }),
            ..Default::default()
        });
        let err = s
            .service
            .start(auth, FileRef::default(), &json!({"endpoint": s.endpoint}))
            .await
            .unwrap_err();
        assert_eq!(err.status, 401);

        let upstream = Arc::new(FakeProvider {
            size_error: Some(api_error(503)),
            ..Default::default()
        });
        let err = s
            .service
            .start(upstream, FileRef::default(), &json!({"endpoint": s.endpoint}))
            .await
            .unwrap_err();
        assert_eq!(err.status, 502);

        let err = s
            .service
            .start(Arc::new(fake(18)), FileRef::default(), &json!({"protocol": "ftp"}))
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[tokio::test]
    async fn test_cancel_before_connection_never_downloads() {
        let s = setup().await;
        let provider = Arc::new(fake(18));
        let token = s
            .service
            .start(provider.clone(), FileRef::default(), &json!({"endpoint": s.endpoint}))
            .await
            .unwrap();

        s.bus.publish(&topics::cancel(&token), BusMessage::Signal);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        s.bus.publish(&topics::connection(&token), BusMessage::Signal);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(provider.downloads.load(Ordering::SeqCst), 0);
    }

    /// tus 目标：`gone` 已失效，第一次 PATCH 返回 503
    #[derive(Default)]
    struct TusTarget {
        data: Vec<u8>,
        creates: usize,
        gone_heads: usize,
        failed_patch: bool,
    }

    async fn tus_target(state: Arc<Mutex<TusTarget>>) -> String {
        use axum::extract::{Path, State};
        use axum::http::{HeaderMap, StatusCode};
        use axum::response::{IntoResponse, Response};

        type Shared = Arc<Mutex<TusTarget>>;

        async fn create(State(s): State<Shared>) -> Response {
            s.lock().creates += 1;
            (StatusCode::CREATED, [("location", "/files/new")]).into_response()
        }

        async fn head(State(s): State<Shared>, Path(id): Path<String>) -> Response {
            let mut s = s.lock();
            if id == "gone" {
                s.gone_heads += 1;
                return StatusCode::GONE.into_response();
            }
            (StatusCode::OK, [("upload-offset", s.data.len().to_string())]).into_response()
        }

        async fn patch(State(s): State<Shared>, headers: HeaderMap, body: AxumBytes) -> Response {
            let mut s = s.lock();
            if !s.failed_patch {
                s.failed_patch = true;
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
            let offset: usize = headers["upload-offset"].to_str().unwrap().parse().unwrap();
            assert_eq!(offset, s.data.len());
            s.data.extend_from_slice(&body);
            (StatusCode::NO_CONTENT, [("upload-offset", s.data.len().to_string())]).into_response()
        }

        let router = Router::new()
            .route("/files/", post(create))
            .route("/files/:id", axum::routing::head(head).patch(patch))
            .with_state(state);
        spawn_server(router).await
    }

    async fn relay_to_stale_upload_url(policy: ResumableRetry) -> Arc<Mutex<TusTarget>> {
        let s = setup_with(|config| config.relay.resumable_retry = policy).await;
        let target = Arc::new(Mutex::new(TusTarget::default()));
        let base = tus_target(target.clone()).await;

        let token = s
            .service
            .start(
                Arc::new(fake(18)),
                FileRef::default(),
                &json!({
                    "protocol": "tus",
                    "endpoint": format!("{}/files/", base),
                    "uploadUrl": format!("{}/files/gone", base),
                    "metadata": {"tenantId": "acme"}
                }),
            )
            .await
            .unwrap();

        let mut rx = s.connect(&token);
        let actions = until_terminal(&mut rx).await;
        assert_eq!(outcomes(&actions), vec!["queued", "retry", "success"]);
        target
    }

    #[tokio::test]
    async fn test_retry_resumes_the_recreated_upload() {
        let target = relay_to_stale_upload_url(ResumableRetry::Resume).await;
        let t = target.lock();
        assert_eq!(t.data, DATA);
        // 失效地址只探测一次，重试复用新建的上传
        assert_eq!(t.gone_heads, 1);
        assert_eq!(t.creates, 1);
    }

    #[tokio::test]
    async fn test_retry_drops_rejected_upload_url() {
        let target = relay_to_stale_upload_url(ResumableRetry::Restart).await;
        let t = target.lock();
        assert_eq!(t.data, DATA);
        assert_eq!(t.gone_heads, 1);
        assert_eq!(t.creates, 2);
    }

    #[tokio::test]
    async fn test_list_retries_until_success() {
        let s = setup().await;
        let provider = fake(18);
        provider.list_failures.lock().push_back(api_error(500));

        let listing = s
            .service
            .list(&provider, &ListRequest::default())
            .await
            .unwrap();
        assert_eq!(listing.items.len(), 1);
        assert_eq!(provider.lists.load(Ordering::SeqCst), 2);

        let denied = fake(18);
        denied.list_failures.lock().push_back(ProviderError::Auth {
            message: "denied".to_string(),
        });
        assert!(s.service.list(&denied, &ListRequest::default()).await.unwrap_err().is_auth());
        assert_eq!(denied.lists.load(Ordering::SeqCst), 1);
    }
}
