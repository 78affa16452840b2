//! WebSocket 路由处理器

use super::message::ClientAction;
use crate::events::{topics, BusMessage, EventBus};
use crate::relay::session::short_token;
use crate::store::state_key;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// GET /api/v1/ws/:token
///
/// 升级 HTTP 连接为 WebSocket，绑定到一个会话
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    Path(token): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, token, state))
}

async fn handle_socket(socket: WebSocket, token: String, state: AppState) {
    let short = short_token(&token);
    info!("[{}] WebSocket 已连接", short);

    let bus = state.bus().clone();
    let (tx, mut outbound) = mpsc::unbounded_channel::<String>();

    // 断线重连：先回放最近一次事件
    if let Some(store) = state.store() {
        match store.get(&state_key(&token)) {
            Ok(Some(last)) => {
                debug!("[{}] 回放最近事件", short);
                let _ = tx.send(last);
            }
            Ok(None) => {}
            Err(e) => warn!("[{}] 读取会话状态失败: {:#}", short, e),
        }
    }

    let topic = topics::events(&token);
    let subscription = bus.subscribe(
        &topic,
        Arc::new(move |message| {
            if let BusMessage::Event(event) = message {
                let _ = tx.send(event.to_json());
            }
        }),
    );
    bus.publish(&topics::connection(&token), BusMessage::Signal);

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let recv_bus = bus.clone();
    let recv_token = token.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => handle_client_message(recv_bus.as_ref(), &recv_token, &text),
                Message::Binary(data) => {
                    if let Ok(text) = String::from_utf8(data) {
                        handle_client_message(recv_bus.as_ref(), &recv_token, &text);
                    }
                }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    });

    // 等待任一任务结束
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    bus.unsubscribe(&topic, subscription);
    info!("[{}] WebSocket 已断开", short);
}

/// 把客户端指令转发到会话的控制主题
fn handle_client_message(bus: &dyn EventBus, token: &str, text: &str) {
    match serde_json::from_str::<ClientAction>(text) {
        Ok(action) => {
            debug!("[{}] 收到客户端指令: {:?}", short_token(token), action);
            bus.publish(&action.topic(token), BusMessage::Signal);
        }
        Err(e) => warn!("[{}] 解析客户端消息失败: {}", short_token(token), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::events::{LocalEventBus, ProgressPayload, RelayEvent};
    use crate::server::api_routes;
    use crate::test_util::spawn_server;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[tokio::test]
    async fn test_socket_replays_last_event_and_signals_connection() {
        let state = AppState::new(AppConfig::default()).unwrap();
        let token = "tok-ws";
        let stored = RelayEvent::Progress(ProgressPayload::new(5, 10)).to_json();
        state
            .store()
            .unwrap()
            .set(&state_key(token), &stored)
            .unwrap();

        let (connected_tx, mut connected) = mpsc::unbounded_channel();
        state.bus().subscribe(
            &topics::connection(token),
            Arc::new(move |_| {
                let _ = connected_tx.send(());
            }),
        );
        let (cancel_tx, mut cancelled) = mpsc::unbounded_channel();
        state.bus().subscribe(
            &topics::cancel(token),
            Arc::new(move |_| {
                let _ = cancel_tx.send(());
            }),
        );

        let base = spawn_server(Router::new().nest("/api/v1", api_routes(state.clone()))).await;
        let url = format!("{}/api/v1/ws/{}", base.replacen("http", "ws", 1), token);
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        // 第一帧是回放的最近事件
        let first = timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.into_text().unwrap(), stored);
        timeout(Duration::from_secs(5), connected.recv())
            .await
            .unwrap()
            .unwrap();

        // 连接后发布的事件实时推送
        state.bus().publish(
            &topics::events(token),
            BusMessage::Event(RelayEvent::Progress(ProgressPayload::new(10, 10))),
        );
        let live = timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&live.into_text().unwrap()).unwrap();
        assert_eq!(value["action"], "progress");
        assert_eq!(value["payload"]["bytesUploaded"], 10);

        socket
            .send(WsMessage::Text(r#"{"action":"cancel","payload":{}}"#.to_string()))
            .await
            .unwrap();
        timeout(Duration::from_secs(5), cancelled.recv())
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_client_message_publishes_control_topic() {
        let bus = LocalEventBus::new();
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = cancels.clone();
        bus.subscribe(
            &topics::cancel("tok"),
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        handle_client_message(&bus, "tok", r#"{"action":"cancel","payload":{}}"#);
        handle_client_message(&bus, "tok", r#"{"action":"pause"}"#);
        handle_client_message(&bus, "tok", "not json");
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }
}
