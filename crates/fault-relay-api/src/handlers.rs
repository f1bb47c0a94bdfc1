//! API route handlers.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use fault_relay_core::{
    ConnectionInfo, Direction, ProxyCollection, ProxyConfig, ProxyInfo, ProxyUpdate, Toxic,
    ToxicRequest, ToxicUpdate,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiResult;

/// API response wrapper.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }

    pub fn created(data: T) -> (StatusCode, Json<Self>) {
        (StatusCode::CREATED, Self::ok(data))
    }
}

/// Version response.
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
}

/// Toxic listing filter.
#[derive(Debug, Deserialize)]
pub struct ToxicQuery {
    pub stream: Option<Direction>,
}

/// Version endpoint.
pub async fn version() -> Json<ApiResponse<VersionResponse>> {
    ApiResponse::ok(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Enable every proxy and drop all toxics.
pub async fn reset(State(proxies): State<ProxyCollection>) -> ApiResult<StatusCode> {
    proxies.reset().await?;
    info!("Reset all proxies");
    Ok(StatusCode::NO_CONTENT)
}

/// Create the proxies in the body that do not exist yet.
pub async fn populate(
    State(proxies): State<ProxyCollection>,
    payload: Result<Json<Vec<ProxyConfig>>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApiResponse<Vec<ProxyInfo>>>)> {
    let Json(configs) = payload?;
    let populated = proxies.populate(configs).await?;

    let mut infos = Vec::with_capacity(populated.len());
    for proxy in populated {
        infos.push(proxy.info().await);
    }
    Ok(ApiResponse::created(infos))
}

/// List every proxy.
pub async fn list_proxies(
    State(proxies): State<ProxyCollection>,
) -> Json<ApiResponse<Vec<ProxyInfo>>> {
    let mut infos = Vec::new();
    for proxy in proxies.list().await {
        infos.push(proxy.info().await);
    }
    ApiResponse::ok(infos)
}

/// Create a proxy.
pub async fn create_proxy(
    State(proxies): State<ProxyCollection>,
    payload: Result<Json<ProxyConfig>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApiResponse<ProxyInfo>>)> {
    let Json(config) = payload?;
    let proxy = proxies.add(config).await?;
    Ok(ApiResponse::created(proxy.info().await))
}

/// Delete every proxy.
pub async fn destroy_all(State(proxies): State<ProxyCollection>) -> StatusCode {
    proxies.destroy_all().await;
    StatusCode::NO_CONTENT
}

/// Get one proxy.
pub async fn get_proxy(
    State(proxies): State<ProxyCollection>,
    Path(name): Path<String>,
) -> ApiResult<Json<ApiResponse<ProxyInfo>>> {
    let proxy = proxies.get(&name).await?;
    Ok(ApiResponse::ok(proxy.info().await))
}

/// Update listen, upstream or enabled.
pub async fn update_proxy(
    State(proxies): State<ProxyCollection>,
    Path(name): Path<String>,
    payload: Result<Json<ProxyUpdate>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<ProxyInfo>>> {
    let Json(update) = payload?;
    let proxy = proxies.get(&name).await?;
    let info = proxy.update(update).await?;
    Ok(ApiResponse::ok(info))
}

/// Delete one proxy.
pub async fn delete_proxy(
    State(proxies): State<ProxyCollection>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    proxies.remove(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Live links of a proxy.
pub async fn list_links(
    State(proxies): State<ProxyCollection>,
    Path(name): Path<String>,
) -> ApiResult<Json<ApiResponse<Vec<ConnectionInfo>>>> {
    let proxy = proxies.get(&name).await?;
    Ok(ApiResponse::ok(proxy.links().await))
}

/// Toxics of a proxy, optionally for one direction.
pub async fn list_toxics(
    State(proxies): State<ProxyCollection>,
    Path(name): Path<String>,
    query: Result<Query<ToxicQuery>, QueryRejection>,
) -> ApiResult<Json<ApiResponse<Vec<Toxic>>>> {
    let Query(query) = query?;
    let proxy = proxies.get(&name).await?;
    let toxics = proxy
        .toxics()
        .into_iter()
        .filter(|t| query.stream.map_or(true, |stream| t.stream == stream))
        .collect();
    Ok(ApiResponse::ok(toxics))
}

/// Add a toxic to a proxy.
pub async fn create_toxic(
    State(proxies): State<ProxyCollection>,
    Path(name): Path<String>,
    payload: Result<Json<ToxicRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApiResponse<Toxic>>)> {
    let Json(request) = payload?;
    let proxy = proxies.get(&name).await?;
    let toxic = proxy.add_toxic(request.into_toxic()?).await?;
    Ok(ApiResponse::created(toxic))
}

/// Get one toxic.
pub async fn get_toxic(
    State(proxies): State<ProxyCollection>,
    Path((name, toxic)): Path<(String, String)>,
) -> ApiResult<Json<ApiResponse<Toxic>>> {
    let proxy = proxies.get(&name).await?;
    Ok(ApiResponse::ok(proxy.toxic(&toxic)?))
}

/// Replace toxicity or attributes of a toxic.
pub async fn update_toxic(
    State(proxies): State<ProxyCollection>,
    Path((name, toxic)): Path<(String, String)>,
    payload: Result<Json<ToxicUpdate>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<Toxic>>> {
    let Json(update) = payload?;
    let proxy = proxies.get(&name).await?;
    Ok(ApiResponse::ok(proxy.update_toxic(&toxic, &update).await?))
}

/// Remove a toxic.
pub async fn delete_toxic(
    State(proxies): State<ProxyCollection>,
    Path((name, toxic)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let proxy = proxies.get(&name).await?;
    proxy.remove_toxic(&toxic).await?;
    Ok(StatusCode::NO_CONTENT)
}
