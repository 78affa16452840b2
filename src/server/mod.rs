// Web服务器模块

pub mod error;
pub mod handlers;
pub mod state;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    routing::{get, post},
    Router,
};

/// `/api/v1` 下的路由
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/:provider/get/:id", post(handlers::start_relay))
        .route("/:provider/list/", get(handlers::list_root))
        .route("/:provider/list/*id", get(handlers::list_directory))
        .route("/:provider/logout", post(handlers::logout))
        .route("/ws/:token", get(websocket::handle_websocket))
        .with_state(state)
}
