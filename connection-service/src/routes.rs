//! 连接服务路由模块

use axum::{
    routing::{delete, get, put},
    Router,
};

use crate::handlers::{
    close_tunnel, create_connection, delete_connection, delete_connections, edit_connection,
    events, get_config, health_check, list_connections, list_tunnels, reload_config,
    test_connection,
};
use crate::state::AppState;

/// 创建连接管理路由
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/connections",
            get(list_connections)
                .post(create_connection)
                .delete(delete_connections),
        )
        .route(
            "/api/connections/{identity}",
            put(edit_connection).delete(delete_connection),
        )
        .route("/api/connections/{identity}/test", get(test_connection))
        .route("/api/tunnels", get(list_tunnels))
        .route("/api/tunnels/{identity}", delete(close_tunnel))
        .route("/api/config", get(get_config).put(reload_config))
        .route("/api/events", get(events))
        .route("/api/health", get(health_check))
}
