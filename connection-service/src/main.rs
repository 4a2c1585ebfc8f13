//! 数据库连接生命周期服务
//!
//! 负责：
//! - 按连接标识缓存客户端，同一标识的创建串行化
//! - SSH 隧道的引用计数与端口转发
//! - 向配置面板与树视图推送连接事件

mod driver;
mod events;
mod handlers;
mod pool_manager;
mod routes;
mod service;
mod ssh;
mod state;
#[cfg(test)]
mod testing;
mod tunnel_manager;

use anyhow::Context;
use axum::{middleware, routing::get, Json, Router};
use common::config::AppConfig;
use common::middleware::request_id::request_id_middleware;
use state::AppState;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;

const SERVICE_NAME: &str = "connection-service";

#[derive(OpenApi)]
#[openapi(
    info(
        title = "连接服务 API",
        version = "0.1.0",
        description = "数据库连接生命周期服务"
    ),
    paths(
        handlers::list_connections,
        handlers::create_connection,
        handlers::edit_connection,
        handlers::delete_connection,
        handlers::delete_connections,
        handlers::test_connection,
        handlers::list_tunnels,
        handlers::close_tunnel,
        handlers::reload_config,
        handlers::get_config,
        handlers::events,
        handlers::health_check,
    ),
    components(schemas(
        common::models::ConnectionDescription,
        common::models::ConnectionItem,
        common::models::SavedConnections,
        common::models::ScopedConnections,
        common::models::SshDescriptor,
        common::models::SshAuth,
        common::models::AlgorithmPreferences,
        common::models::Dialect,
        common::models::Scope,
        common::models::Category,
        common::models::ConnectionEvent,
        common::models::TreeNotice,
        common::errors::ErrorKind,
        common::errors::ErrorPayload,
        tunnel_manager::TunnelInfo,
        handlers::ConnectionTestResult,
        handlers::HealthResponse,
    )),
    tags(
        (name = "connections", description = "连接管理端点"),
        (name = "tunnels", description = "SSH 隧道端点"),
        (name = "events", description = "事件推送端点"),
        (name = "health", description = "健康检查端点")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env 不存在时忽略
    dotenv::dotenv().ok();

    // 初始化日志追踪
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // 加载配置
    let config = AppConfig::load_with_service(SERVICE_NAME);
    let state = AppState::new(config.clone());
    let service = state.service.clone();

    let app = create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!(service = SERVICE_NAME, address = %addr, "启动服务");

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定地址失败: {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务运行失败")?;

    // 关闭所有客户端，最后一个引用释放时隧道随之关闭
    let closed = service.remove_all(None).await;
    info!(connections = closed.len(), "服务已停止");
    Ok(())
}

fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::router())
        .route("/api-docs/openapi.json", get(openapi_json))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "无法监听 Ctrl+C 信号");
        std::future::pending::<()>().await;
    }
    info!("收到关闭信号");
}
