//! 中继会话
//!
//! 一个会话拥有一个中继缓冲区和一个协议策略，负责：
//! - 等待客户端连接后开始
//! - 把下载流泵入缓冲区，由策略消费上传
//! - 发布/保存事件（进度按整数百分比去重）
//! - 响应客户端的暂停/恢复/取消
//!
//! 状态流转：Created → AwaitingClient → Relaying(⇄ Paused) → Succeeded | Failed | Cancelled
//! 终态不可再进入，监听器清理是幂等的

use super::buffer::{Chunk, RelayBuffer};
use super::error::RelayError;
use super::options::{Protocol, SessionOptions};
use super::protocol::{ProgressFn, ProtocolStrategy, RelayContext, StrategyOutcome, UploadJob};
use crate::events::{
    percentage, topics, BusMessage, ErrorPayload, EventBus, ProgressGate, ProgressPayload,
    QueuedPayload, RelayEvent, SubscriptionId, SuccessPayload,
};
use crate::provider::ByteStream;
use crate::store::{state_key, StateStore};
use futures::StreamExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    AwaitingClient,
    Relaying,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Succeeded | SessionState::Failed | SessionState::Cancelled
        )
    }
}

/// token 的前 8 个字符，用作日志追踪 ID
pub fn short_token(token: &str) -> String {
    token.chars().take(8).collect()
}

pub struct TransferSession {
    token: String,
    short_token: String,
    file_name: String,
    options: SessionOptions,
    state: Mutex<SessionState>,
    buffer: Arc<RelayBuffer>,
    strategy: ProtocolStrategy,
    bus: Arc<dyn EventBus>,
    store: Option<Arc<dyn StateStore>>,
    gate: Arc<ProgressGate>,
    bytes_uploaded: Arc<AtomicU64>,
    /// relay 已被调用
    started: AtomicBool,
    /// 监听器已清理
    stopped: AtomicBool,
    /// 最后一次尝试，失败时不发布 retry
    last_attempt: AtomicBool,
    cancel_token: CancellationToken,
    /// 下载端错误（优先于缓冲区中止错误上报）
    download_error: Arc<Mutex<Option<RelayError>>>,
    subscriptions: Mutex<Vec<(String, SubscriptionId)>>,
}

impl TransferSession {
    pub fn new(
        options: SessionOptions,
        ctx: &RelayContext,
        bus: Arc<dyn EventBus>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Arc<Self> {
        let token = options
            .token
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let file_name = options.file_name(&token);
        let strategy = ProtocolStrategy::new(options.protocol, ctx);

        let session = Arc::new(Self {
            short_token: short_token(&token),
            token,
            file_name,
            options,
            state: Mutex::new(SessionState::Created),
            buffer: Arc::new(RelayBuffer::new()),
            strategy,
            bus,
            store,
            gate: Arc::new(ProgressGate::new()),
            bytes_uploaded: Arc::new(AtomicU64::new(0)),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            last_attempt: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            download_error: Arc::new(Mutex::new(None)),
            subscriptions: Mutex::new(Vec::new()),
        });
        session.register_listeners();
        debug!(
            "[{}] 会话已创建: protocol={}, size={}",
            session.short_token,
            session.options.protocol.as_str(),
            session.options.size
        );
        session
    }

    fn register_listeners(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.listen(&topics::cancel(&self.token), move |_| {
            if let Some(session) = weak.upgrade() {
                tokio::spawn(async move { session.cancel().await });
            }
        });

        if self.options.protocol == Protocol::Resumable {
            let weak: Weak<Self> = Arc::downgrade(self);
            self.listen(&topics::pause(&self.token), move |_| {
                if let Some(session) = weak.upgrade() {
                    session.pause();
                }
            });
            let weak: Weak<Self> = Arc::downgrade(self);
            self.listen(&topics::resume(&self.token), move |_| {
                if let Some(session) = weak.upgrade() {
                    session.resume();
                }
            });
        }
    }

    fn listen(&self, topic: &str, handler: impl Fn(&BusMessage) + Send + Sync + 'static) {
        let id = self.bus.subscribe(topic, Arc::new(handler));
        self.subscriptions.lock().push((topic.to_string(), id));
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn short_token(&self) -> &str {
        &self.short_token
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded.load(Ordering::SeqCst)
    }

    /// 已流经缓冲区的字节数
    pub fn bytes_written(&self) -> u64 {
        self.buffer.bytes_written()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// tus 上传 URL（已分配时）
    pub fn upload_url(&self) -> Option<String> {
        self.strategy.upload_url()
    }

    pub fn upload_url_rejected(&self) -> bool {
        self.strategy.upload_url_rejected()
    }

    /// 状态转换，终态不可离开，返回是否生效
    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        debug!("[{}] 状态变更: {:?} -> {:?}", self.short_token, *state, next);
        *state = next;
        true
    }

    /// 等待客户端连接
    ///
    /// 订阅在调用时同步完成，返回的 future 在 `connection:<token>` 信号到达时完成
    pub fn wait_for_client(&self) -> impl Future<Output = Result<(), RelayError>> + Send + 'static {
        self.transition(SessionState::AwaitingClient);

        let (tx, rx) = oneshot::channel::<()>();
        let tx = Mutex::new(Some(tx));
        let topic = topics::connection(&self.token);
        let id = self.bus.subscribe_once(
            &topic,
            Arc::new(move |_| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
            }),
        );
        self.subscriptions.lock().push((topic, id));

        let cancel = self.cancel_token.clone();
        async move {
            tokio::select! {
                result = rx => result.map_err(|_| RelayError::Cancelled),
                _ = cancel.cancelled() => Err(RelayError::Cancelled),
            }
        }
    }

    /// 把下载流中继到目标
    ///
    /// 成功时发布 success 并进入终态；可重试的失败发布 retry 并返回错误，
    /// 此时会话不进入终态，由上层决定重试或调用 [`fail`](Self::fail)
    pub async fn relay(&self, download: ByteStream) -> Result<(), RelayError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("[{}] upload 被重复调用，忽略", self.short_token);
            return Ok(());
        }
        if self.is_stopped() {
            warn!("[{}] 会话已停止，忽略上传", self.short_token);
            return Err(RelayError::Cancelled);
        }

        if self.strategy.is_paused() {
            self.transition(SessionState::Paused);
        } else {
            self.transition(SessionState::Relaying);
        }
        info!(
            "[{}] 开始中继: protocol={}, file={}",
            self.short_token,
            self.options.protocol.as_str(),
            self.file_name
        );

        let pump = tokio::spawn(pump(
            download,
            self.buffer.clone(),
            self.download_error.clone(),
        ));

        let job = self.upload_job();
        let result = tokio::select! {
            result = self.strategy.begin(&job) => result,
            _ = self.cancel_token.cancelled() => Err(RelayError::Cancelled),
        };
        pump.abort();

        match result {
            Ok(outcome) => {
                self.succeed(outcome);
                Ok(())
            }
            Err(RelayError::Cancelled) => Err(RelayError::Cancelled),
            Err(err) => {
                // 下载端失败时缓冲区只会报中止，优先上报下载错误
                let err = self.download_error.lock().take().unwrap_or(err);
                self.buffer.abort(err.to_string());
                self.report_failure(&err);
                Err(err)
            }
        }
    }

    /// 标记为最后一次尝试
    pub fn mark_last_attempt(&self) {
        self.last_attempt.store(true, Ordering::SeqCst);
    }

    /// 记录一次失败的尝试，可重试且不是最后一次时发布 retry
    pub fn report_failure(&self, err: &RelayError) {
        error!("[{}] 中继失败: {}", self.short_token, err);
        if err.is_retryable() && !self.last_attempt.load(Ordering::SeqCst) {
            self.emit(RelayEvent::Retry(ErrorPayload {
                error: err.to_serialized(),
                response: err.response().cloned(),
            }));
        }
    }

    fn upload_job(&self) -> UploadJob {
        UploadJob {
            token: self.token.clone(),
            short_token: self.short_token.clone(),
            file_name: self.file_name.clone(),
            options: self.options.clone(),
            buffer: self.buffer.clone(),
            progress: self.progress_sink(),
        }
    }

    /// 进度回调：每次都保存到状态存储，整数百分比上升时才发布 progress
    fn progress_sink(&self) -> ProgressFn {
        let bus = self.bus.clone();
        let store = self.store.clone();
        let token = self.token.clone();
        let short = self.short_token.clone();
        let gate = self.gate.clone();
        let uploaded = self.bytes_uploaded.clone();

        Arc::new(move |bytes_uploaded, bytes_total| {
            uploaded.store(bytes_uploaded, Ordering::SeqCst);
            let event = RelayEvent::Progress(ProgressPayload::new(bytes_uploaded, bytes_total));
            save_state(store.as_deref(), &token, &short, &event);

            let percent = percentage(bytes_uploaded, bytes_total);
            if !gate.should_emit(percent) {
                return;
            }
            debug!(
                "[{}] 上传进度: {}/{} ({:.2}%)",
                short, bytes_uploaded, bytes_total, percent
            );
            bus.publish(&topics::events(&token), BusMessage::Event(event));
        })
    }

    fn succeed(&self, outcome: StrategyOutcome) {
        if !self.transition(SessionState::Succeeded) {
            return;
        }
        info!("[{}] 上传成功", self.short_token);
        self.emit(RelayEvent::Success(SuccessPayload {
            complete: true,
            url: outcome.url,
            response: outcome.response,
        }));
        self.cleanup();
    }

    /// 最终失败：发布 error 并进入 Failed
    pub fn fail(&self, err: &RelayError) {
        if !self.transition(SessionState::Failed) {
            return;
        }
        error!("[{}] 上传最终失败: {}", self.short_token, err);
        self.emit(RelayEvent::Error(ErrorPayload {
            error: err.to_serialized(),
            response: err.response().cloned(),
        }));
        self.buffer.abort(err.to_string());
        self.cleanup();
    }

    /// 放弃本次尝试：清理监听器但不发布终态事件，随后由同 token 的新会话接替
    pub fn retire(&self) {
        debug!("[{}] 会话退役，等待重试", self.short_token);
        self.buffer.abort("retired");
        self.cleanup();
    }

    /// 取消：中止进行中的上传并尽力终止目标端上传
    pub async fn cancel(&self) {
        if !self.transition(SessionState::Cancelled) {
            return;
        }
        info!("[{}] 上传已取消", self.short_token);
        self.cancel_token.cancel();
        self.buffer.abort("cancelled");
        self.strategy.cancel(&self.short_token).await;
        self.cleanup();
    }

    /// 暂停（仅断点续传）
    pub fn pause(&self) -> bool {
        if self.state().is_terminal() || !self.strategy.pause() {
            return false;
        }
        info!("[{}] 收到暂停请求", self.short_token);
        let mut state = self.state.lock();
        if *state == SessionState::Relaying {
            *state = SessionState::Paused;
        }
        true
    }

    pub fn resume(&self) -> bool {
        if self.state().is_terminal() || !self.strategy.resume() {
            return false;
        }
        info!("[{}] 收到恢复请求", self.short_token);
        let mut state = self.state.lock();
        if *state == SessionState::Paused {
            *state = SessionState::Relaying;
        }
        true
    }

    pub fn emit_queued(&self) {
        self.emit(RelayEvent::Queued(QueuedPayload::default()));
    }

    fn emit(&self, event: RelayEvent) {
        publish(
            self.bus.as_ref(),
            self.store.as_deref(),
            &self.token,
            &self.short_token,
            event,
        );
    }

    /// 清理监听器（幂等）
    fn cleanup(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for (topic, id) in subscriptions {
            self.bus.unsubscribe(&topic, id);
        }
        debug!("[{}] 监听器已清理", self.short_token);
    }
}

/// 保存到状态存储（尽力而为）并发布到 token 主题
fn publish(
    bus: &dyn EventBus,
    store: Option<&dyn StateStore>,
    token: &str,
    short_token: &str,
    event: RelayEvent,
) {
    save_state(store, token, short_token, &event);
    bus.publish(&topics::events(token), BusMessage::Event(event));
}

/// 保存最近一次事件，供客户端重连时回放
fn save_state(store: Option<&dyn StateStore>, token: &str, short_token: &str, event: &RelayEvent) {
    let Some(store) = store else {
        return;
    };
    match serde_json::to_string(event) {
        Ok(json) => {
            if let Err(e) = store.set(&state_key(token), &json) {
                warn!("[{}] 保存会话状态失败: {:#}", short_token, e);
            }
        }
        Err(e) => warn!("[{}] 序列化事件失败: {}", short_token, e),
    }
}

/// 把下载流泵入缓冲区，每推入一块等待消费者取空
async fn pump(
    mut download: ByteStream,
    buffer: Arc<RelayBuffer>,
    download_error: Arc<Mutex<Option<RelayError>>>,
) {
    let result: Result<(), RelayError> = async {
        while let Some(item) = download.next().await {
            buffer.push(Chunk::Data(item?))?;
            buffer.drained().await?;
        }
        buffer.push(Chunk::End)?;
        Ok(())
    }
    .await;

    if let Err(err) = result {
        if !buffer.is_aborted() {
            debug!("下载中断: {}", err);
            *download_error.lock() = Some(err.clone());
            buffer.abort(err.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, UrlValidator};
    use crate::events::LocalEventBus;
    use crate::provider::ProviderError;
    use crate::store::MemoryStateStore;
    use crate::test_util::spawn_server;
    use axum::body::Bytes as AxumBytes;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use bytes::Bytes;
    use serde_json::json;

    struct Harness {
        bus: Arc<LocalEventBus>,
        store: Arc<MemoryStateStore>,
        ctx: RelayContext,
        base: String,
    }

    async fn harness() -> Harness {
        let router = Router::new()
            .route("/f", post(|body: AxumBytes| async move { format!("got {}", body.len()) }))
            .route("/fail", post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "broken") }));
        let base = spawn_server(router).await;
        Harness {
            bus: Arc::new(LocalEventBus::new()),
            store: Arc::new(MemoryStateStore::new()),
            ctx: RelayContext::new(reqwest::Client::new(), &AppConfig::default()),
            base,
        }
    }

    impl Harness {
        fn session(&self, body: serde_json::Value, size: u64, token: &str) -> Arc<TransferSession> {
            let validator = UrlValidator::new(true, &[]).unwrap();
            let options = SessionOptions::from_request(&body, size, &validator)
                .unwrap()
                .with_token(token);
            TransferSession::new(
                options,
                &self.ctx,
                self.bus.clone(),
                Some(self.store.clone() as Arc<dyn StateStore>),
            )
        }

        fn record(&self, token: &str) -> Arc<Mutex<Vec<RelayEvent>>> {
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = events.clone();
            self.bus.subscribe(
                &topics::events(token),
                Arc::new(move |message| {
                    if let BusMessage::Event(event) = message {
                        sink.lock().push(event.clone());
                    }
                }),
            );
            events
        }
    }

    fn stream_of(chunks: Vec<&'static [u8]>) -> ByteStream {
        futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, ProviderError>(Bytes::from_static(c))),
        )
        .boxed()
    }

    #[tokio::test]
    async fn test_multipart_success_emits_progress_then_success() {
        let h = harness().await;
        let session = h.session(json!({"endpoint": format!("{}/f", h.base)}), 18, "tok-success");
        let events = h.record("tok-success");

        session
            .relay(stream_of(vec![b"0123456789", b"abcdefgh"]))
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Succeeded);
        assert_eq!(session.bytes_uploaded(), 18);
        assert_eq!(session.bytes_written(), 18);

        let events = events.lock();
        let last_progress = events
            .iter()
            .filter_map(|e| match e {
                RelayEvent::Progress(p) => Some(p.clone()),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last_progress.bytes_uploaded, 18);
        assert_eq!(last_progress.bytes_total, 18);
        assert_eq!(last_progress.progress, "100.00");
        match events.last().unwrap() {
            RelayEvent::Success(p) => {
                assert!(p.complete);
                assert!(p.response.as_ref().unwrap().response_text.starts_with("got "));
            }
            other => panic!("unexpected {:?}", other),
        }

        // 最近事件已保存
        let saved = h.store.get(&state_key("tok-success")).unwrap().unwrap();
        assert!(saved.contains("\"action\":\"success\""));
        // 监听器已清理
        assert_eq!(h.bus.subscriber_count(&topics::cancel("tok-success")), 0);
    }

    #[tokio::test]
    async fn test_server_error_emits_retry_without_terminal_state() {
        let h = harness().await;
        let session = h.session(json!({"endpoint": format!("{}/fail", h.base)}), 18, "tok-500");
        let events = h.record("tok-500");

        let err = session
            .relay(stream_of(vec![b"0123456789abcdefgh"]))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!session.state().is_terminal());

        {
            let events = events.lock();
            match events.last().unwrap() {
                RelayEvent::Retry(p) => assert!(!p.error.message.is_empty()),
                other => panic!("unexpected {:?}", other),
            }
            assert!(!events.iter().any(|e| matches!(e, RelayEvent::Success(_))));
        }

        session.fail(&err);
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(events.lock().last(), Some(RelayEvent::Error(_))));

        // 终态不可再进入
        session.fail(&err);
        assert_eq!(
            events
                .lock()
                .iter()
                .filter(|e| matches!(e, RelayEvent::Error(_)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_last_attempt_does_not_emit_retry() {
        let h = harness().await;
        let session = h.session(json!({"endpoint": format!("{}/fail", h.base)}), 3, "tok-last");
        let events = h.record("tok-last");

        session.mark_last_attempt();
        let err = session.relay(stream_of(vec![b"abc"])).await.unwrap_err();
        let outcomes = |events: &[RelayEvent]| -> Vec<RelayEvent> {
            events
                .iter()
                .filter(|e| !matches!(e, RelayEvent::Progress(_)))
                .cloned()
                .collect()
        };
        assert!(outcomes(&events.lock()).is_empty());

        session.fail(&err);
        let outcomes = outcomes(&events.lock());
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            RelayEvent::Error(p) => assert_eq!(p.error.name, "TransportError"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_byte_count_mismatch_never_succeeds() {
        let h = harness().await;
        let session = h.session(json!({"endpoint": format!("{}/f", h.base)}), 18, "tok-short");
        let events = h.record("tok-short");

        let err = session.relay(stream_of(vec![b"0123456789"])).await.unwrap_err();
        assert!(err.is_retryable());
        let events = events.lock();
        assert!(matches!(events.last(), Some(RelayEvent::Retry(_))));
        assert!(!events.iter().any(|e| matches!(e, RelayEvent::Success(_))));
    }

    #[tokio::test]
    async fn test_token_is_preserved() {
        let h = harness().await;
        let session = h.session(json!({"endpoint": format!("{}/f", h.base)}), 1, "keep-this-token");
        assert_eq!(session.token(), "keep-this-token");
        assert_eq!(session.short_token(), "keep-thi");
        assert_eq!(session.file_name(), "uppy-file-keep-this-token");
    }

    #[tokio::test]
    async fn test_relay_twice_is_noop() {
        let h = harness().await;
        let session = h.session(json!({"endpoint": format!("{}/f", h.base)}), 3, "tok-twice");
        let events = h.record("tok-twice");

        session.relay(stream_of(vec![b"abc"])).await.unwrap();
        session.relay(stream_of(vec![b"abc"])).await.unwrap();
        assert_eq!(
            events
                .lock()
                .iter()
                .filter(|e| matches!(e, RelayEvent::Success(_)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_via_bus_is_terminal_and_idempotent() {
        let h = harness().await;
        let session = h.session(json!({"endpoint": format!("{}/f", h.base)}), 3, "tok-cancel");

        h.bus.publish(&topics::cancel("tok-cancel"), BusMessage::Signal);
        for _ in 0..50 {
            if session.state() == SessionState::Cancelled {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(session.is_stopped());

        session.cancel().await;
        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(matches!(
            session.relay(stream_of(vec![b"abc"])).await,
            Err(RelayError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_wait_for_client() {
        let h = harness().await;
        let session = h.session(json!({"endpoint": format!("{}/f", h.base)}), 3, "tok-wait");

        let ready = session.wait_for_client();
        assert_eq!(session.state(), SessionState::AwaitingClient);

        h.bus.publish(&topics::connection("tok-wait"), BusMessage::Signal);
        ready.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_client() {
        let h = harness().await;
        let session = h.session(json!({"endpoint": format!("{}/f", h.base)}), 3, "tok-wait2");

        let ready = session.wait_for_client();
        session.cancel().await;
        assert!(matches!(ready.await, Err(RelayError::Cancelled)));
    }

    #[tokio::test]
    async fn test_download_error_is_reported() {
        let h = harness().await;
        let session = h.session(json!({"endpoint": format!("{}/f", h.base)}), 18, "tok-dl");
        let events = h.record("tok-dl");

        let download = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"0123")),
            Err(ProviderError::Api {
                status: Some(503),
                message: "provider unavailable".to_string(),
            }),
        ])
        .boxed();

        let err = session.relay(download).await.unwrap_err();
        assert_eq!(err.name(), "ProviderApiError");
        match events.lock().last() {
            Some(RelayEvent::Retry(p)) => assert_eq!(p.error.message, "provider unavailable"),
            other => panic!("unexpected {:?}", other),
        };
    }

    #[tokio::test]
    async fn test_auth_error_does_not_emit_retry() {
        let h = harness().await;
        let session = h.session(json!({"endpoint": format!("{}/f", h.base)}), 18, "tok-auth");
        let events = h.record("tok-auth");

        let download = futures::stream::iter(vec![Err(ProviderError::Auth {
            message: "token revoked".to_string(),
        })])
        .boxed();

        let err = session.relay(download).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_deduplicated() {
        let h = harness().await;
        let chunk: &'static [u8] = &[7u8; 1000];
        let chunks = vec![chunk; 40];
        let session = h.session(json!({"endpoint": format!("{}/f", h.base)}), 40_000, "tok-mono");
        let events = h.record("tok-mono");

        session.relay(stream_of(chunks)).await.unwrap();

        let percents: Vec<i64> = events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RelayEvent::Progress(p) => Some(p.progress.parse::<f64>().unwrap().floor() as i64),
                _ => None,
            })
            .collect();
        assert!(!percents.is_empty());
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(percents.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_every_progress_is_saved_but_published_once_per_percent() {
        let h = harness().await;
        let session = h.session(json!({"endpoint": format!("{}/f", h.base)}), 1000, "tok-save");
        let events = h.record("tok-save");
        let progress = session.progress_sink();

        progress(0, 1000);
        progress(5, 1000);

        let published: Vec<u64> = events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RelayEvent::Progress(p) => Some(p.bytes_uploaded),
                _ => None,
            })
            .collect();
        // 0% 会发布一次，0.5% 仍是 0% 不再发布
        assert_eq!(published, vec![0]);

        let saved = h.store.get(&state_key("tok-save")).unwrap().unwrap();
        let saved: serde_json::Value = serde_json::from_str(&saved).unwrap();
        assert_eq!(saved["action"], "progress");
        assert_eq!(saved["payload"]["bytesUploaded"], 5);
    }

    #[tokio::test]
    async fn test_pause_ignored_for_simple_http() {
        let h = harness().await;
        let session = h.session(json!({"endpoint": format!("{}/f", h.base)}), 3, "tok-nopause");
        assert!(!session.pause());
        assert!(!session.resume());
        // 非断点续传不订阅暂停主题
        assert_eq!(h.bus.subscriber_count(&topics::pause("tok-nopause")), 0);
        assert_eq!(h.bus.subscriber_count(&topics::cancel("tok-nopause")), 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume_for_resumable() {
        let h = harness().await;
        let session = h.session(
            json!({"protocol": "tus", "endpoint": format!("{}/files/", h.base)}),
            3,
            "tok-tus",
        );

        h.bus.publish(&topics::pause("tok-tus"), BusMessage::Signal);
        assert!(session.strategy.is_paused());
        h.bus.publish(&topics::resume("tok-tus"), BusMessage::Signal);
        assert!(!session.strategy.is_paused());
    }
}
