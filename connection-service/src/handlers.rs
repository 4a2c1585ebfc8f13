//! Handler模块

use std::convert::Infallible;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use utoipa::{IntoParams, ToSchema};

use common::errors::{AppError, ErrorPayload};
use common::identity::{ConnectionIdentity, TunnelIdentity};
use common::models::connection::{ConnectionDescription, ConnectionItem, SavedConnections, Scope};
use common::models::event::ConnectionEvent;
use common::response::ApiResponse;

use crate::state::AppState;
use crate::tunnel_manager::TunnelInfo;

/// 列出所有活动连接
#[utoipa::path(
    get,
    path = "/api/connections",
    tag = "connections",
    responses(
        (status = 200, description = "连接列表", body = ApiResponse<Vec<ConnectionItem>>)
    )
)]
pub async fn list_connections(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<ConnectionItem>>>, AppError> {
    let data = state.service.list().await;
    Ok(Json(ApiResponse::ok_with_service(data, &state.config.service_name)))
}

/// 建立连接
#[utoipa::path(
    post,
    path = "/api/connections",
    tag = "connections",
    request_body = ConnectionDescription,
    responses(
        (status = 200, description = "连接成功", body = ApiResponse<ConnectionEvent>),
        (status = 400, description = "连接描述无效"),
        (status = 401, description = "认证失败"),
        (status = 502, description = "无法连接")
    )
)]
pub async fn create_connection(
    State(state): State<AppState>,
    Json(description): Json<ConnectionDescription>,
) -> Result<Json<ApiResponse<ConnectionEvent>>, AppError> {
    let started = Instant::now();
    let handle = state.service.connect(description).await?;
    let event = ConnectionEvent::success(handle.identity().to_string(), handle.display_key());
    Ok(Json(
        ApiResponse::ok_with_service(event, &state.config.service_name)
            .with_duration(started.elapsed().as_millis() as u64),
    ))
}

/// 编辑连接（先移除旧连接，再重新连接）
#[utoipa::path(
    put,
    path = "/api/connections/{identity}",
    tag = "connections",
    request_body = ConnectionDescription,
    params(
        ("identity" = String, Path, description = "编辑前的连接标识")
    ),
    responses(
        (status = 200, description = "重新连接成功", body = ApiResponse<ConnectionEvent>)
    )
)]
pub async fn edit_connection(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Json(description): Json<ConnectionDescription>,
) -> Result<Json<ApiResponse<ConnectionEvent>>, AppError> {
    let started = Instant::now();
    let previous = ConnectionIdentity::from(identity);
    let handle = state.service.edit(&previous, description).await?;
    let event = ConnectionEvent::success(handle.identity().to_string(), handle.display_key());
    Ok(Json(
        ApiResponse::ok_with_service(event, &state.config.service_name)
            .with_duration(started.elapsed().as_millis() as u64),
    ))
}

/// 移除连接（幂等）
#[utoipa::path(
    delete,
    path = "/api/connections/{identity}",
    tag = "connections",
    params(
        ("identity" = String, Path, description = "连接标识")
    ),
    responses(
        (status = 200, description = "是否移除了活动连接", body = ApiResponse<bool>)
    )
)]
pub async fn delete_connection(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Json<ApiResponse<bool>> {
    let removed = state.service.remove(&ConnectionIdentity::from(identity)).await;
    Json(ApiResponse::ok_with_service(removed, &state.config.service_name))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ScopeQuery {
    /// 仅移除该作用域的连接；缺省时移除全部
    pub scope: Option<Scope>,
}

/// 批量移除连接
#[utoipa::path(
    delete,
    path = "/api/connections",
    tag = "connections",
    params(ScopeQuery),
    responses(
        (status = 200, description = "被移除的连接标识", body = ApiResponse<Vec<String>>)
    )
)]
pub async fn delete_connections(
    State(state): State<AppState>,
    Query(query): Query<ScopeQuery>,
) -> Json<ApiResponse<Vec<String>>> {
    let removed = state
        .service
        .remove_all(query.scope)
        .await
        .into_iter()
        .map(|identity| identity.to_string())
        .collect();
    Json(ApiResponse::ok_with_service(removed, &state.config.service_name))
}

/// 测试连接
#[utoipa::path(
    get,
    path = "/api/connections/{identity}/test",
    tag = "connections",
    params(
        ("identity" = String, Path, description = "连接标识")
    ),
    responses(
        (status = 200, description = "连接测试结果", body = ApiResponse<ConnectionTestResult>),
        (status = 404, description = "连接未找到")
    )
)]
pub async fn test_connection(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<ApiResponse<ConnectionTestResult>>, AppError> {
    let result = match state.service.test(&ConnectionIdentity::from(identity.clone())).await {
        Ok(latency_ms) => ConnectionTestResult {
            identity,
            success: true,
            latency_ms: Some(latency_ms),
            error: None,
        },
        Err(AppError::Connect(err)) => ConnectionTestResult {
            identity,
            success: false,
            latency_ms: None,
            error: Some(err.payload()),
        },
        Err(other) => return Err(other),
    };
    Ok(Json(ApiResponse::ok_with_service(result, &state.config.service_name)))
}

/// 列出活动的 SSH 隧道
#[utoipa::path(
    get,
    path = "/api/tunnels",
    tag = "tunnels",
    responses(
        (status = 200, description = "隧道列表", body = ApiResponse<Vec<TunnelInfo>>)
    )
)]
pub async fn list_tunnels(State(state): State<AppState>) -> Json<ApiResponse<Vec<TunnelInfo>>> {
    let data = state.service.tunnels().await;
    Json(ApiResponse::ok_with_service(data, &state.config.service_name))
}

/// 强制关闭 SSH 隧道
#[utoipa::path(
    delete,
    path = "/api/tunnels/{identity}",
    tag = "tunnels",
    params(
        ("identity" = String, Path, description = "SSH 标识 user@host:port")
    ),
    responses(
        (status = 200, description = "隧道已关闭", body = ApiResponse<bool>),
        (status = 404, description = "隧道未找到")
    )
)]
pub async fn close_tunnel(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<ApiResponse<bool>>, AppError> {
    state.service.close_tunnel(&TunnelIdentity::from(identity)).await?;
    Ok(Json(ApiResponse::ok_with_service(true, &state.config.service_name)))
}

/// 重新加载已保存的连接配置
#[utoipa::path(
    put,
    path = "/api/config",
    tag = "connections",
    request_body = SavedConnections,
    responses(
        (status = 200, description = "已保存的连接数", body = ApiResponse<usize>),
        (status = 400, description = "配置分区错误")
    )
)]
pub async fn reload_config(
    State(state): State<AppState>,
    Json(saved): Json<SavedConnections>,
) -> Result<Json<ApiResponse<usize>>, AppError> {
    let count = state.service.reload(saved).await?;
    Ok(Json(ApiResponse::ok_with_service(count, &state.config.service_name)))
}

/// 导出已保存的连接配置
#[utoipa::path(
    get,
    path = "/api/config",
    tag = "connections",
    responses(
        (status = 200, description = "已保存的连接配置（不含连接时字段）", body = ApiResponse<SavedConnections>)
    )
)]
pub async fn get_config(State(state): State<AppState>) -> Json<ApiResponse<SavedConnections>> {
    let saved = state.service.saved().await;
    Json(ApiResponse::ok_with_service(saved, &state.config.service_name))
}

/// 事件流（SSE）：`connection` 为连接结果，`tree` 为树视图通知
#[utoipa::path(
    get,
    path = "/api/events",
    tag = "events",
    responses(
        (status = 200, description = "text/event-stream")
    )
)]
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let connection = broadcast_stream(state.events.subscribe(), "connection");
    let tree = broadcast_stream(state.events.subscribe_tree(), "tree");
    Sse::new(stream::select(connection, tree)).keep_alive(KeepAlive::default())
}

/// Turns a broadcast receiver into SSE events. Lagging subscribers skip ahead.
fn broadcast_stream<T>(
    rx: broadcast::Receiver<T>,
    name: &'static str,
) -> impl Stream<Item = Result<Event, Infallible>>
where
    T: Clone + Serialize + Send + 'static,
{
    stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(message) => match Event::default().event(name).json_data(&message) {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(e) => tracing::warn!(error = %e, "failed to encode event"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(stream = name, skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// 健康检查端点
#[utoipa::path(
    get,
    path = "/api/health",
    tag = "health",
    responses(
        (status = 200, description = "服务运行正常", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: state.config.service_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        connections: state.service.list().await.len(),
        tunnels: state.service.tunnels().await.len(),
    })
}

/// 连接测试结果
#[derive(Serialize, ToSchema)]
pub struct ConnectionTestResult {
    /// 连接标识
    pub identity: String,
    /// 测试是否成功
    pub success: bool,
    /// 连接延迟（毫秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// 错误信息（如果测试失败）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// 健康检查响应
#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    /// 服务状态
    pub status: String,
    /// 服务名称
    pub service: String,
    /// 服务版本
    pub version: String,
    /// 当前时间戳
    pub timestamp: DateTime<Utc>,
    /// 活动连接数
    pub connections: usize,
    /// 活动隧道数
    pub tunnels: usize,
}
