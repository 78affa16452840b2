// 测试辅助：在 127.0.0.1:0 上启动临时 axum 服务

use axum::Router;
use tokio::net::TcpListener;

/// 启动服务并返回 `http://127.0.0.1:<port>`
pub async fn spawn_server(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}
