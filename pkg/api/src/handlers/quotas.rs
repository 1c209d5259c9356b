use axum::{
    Json,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use pkg_quota::accessor::quota_key;
use pkg_state::client::StoreError;
use pkg_types::quota::ClusterQuota;
use tracing::{info, warn};

use crate::AppState;

pub async fn create_cluster_quota(
    State(state): State<AppState>,
    Json(mut quota): Json<ClusterQuota>,
) -> impl IntoResponse {
    if let Err(e) = pkg_types::validate::validate_name(&quota.name) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    for resource in quota.spec.hard.keys() {
        if let Err(e) = pkg_types::validate::validate_resource_name(resource) {
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    }
    if let Err(e) = quota.spec.selector.validate() {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    quota.created_at = Utc::now();
    quota.status.total.hard = quota.spec.hard.clone();

    let data = match serde_json::to_vec(&quota) {
        Ok(d) => d,
        Err(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Serialization failed").into_response();
        }
    };
    // expected=0 makes the write a create-if-absent.
    let key = quota_key(&quota.name);
    match state.store.put_versioned(&key, &data, Some(0)).await {
        Ok(_) => {
            info!("Created cluster quota: {}", quota.name);
            (StatusCode::CREATED, Json(quota)).into_response()
        }
        Err(StoreError::VersionConflict { .. }) => {
            (StatusCode::CONFLICT, "Cluster quota already exists").into_response()
        }
        Err(e) => {
            warn!("Failed to create cluster quota: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create cluster quota").into_response()
        }
    }
}

pub async fn list_cluster_quotas(State(state): State<AppState>) -> impl IntoResponse {
    let entries = state
        .store
        .list_versioned("/registry/clusterquotas/")
        .await
        .unwrap_or_default();
    let quotas: Vec<ClusterQuota> = entries
        .into_iter()
        .filter_map(|(_, v, _)| serde_json::from_slice(&v).ok())
        .collect();
    (StatusCode::OK, Json(quotas)).into_response()
}

pub async fn get_cluster_quota(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> impl IntoResponse {
    let key = quota_key(&name);
    match state.store.get_versioned(&key).await {
        Ok(Some((data, _))) => match serde_json::from_slice::<ClusterQuota>(&data) {
            Ok(quota) => (StatusCode::OK, Json(quota)).into_response(),
            Err(e) => {
                warn!("Corrupt cluster quota {}: {}", name, e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Corrupt cluster quota").into_response()
            }
        },
        Ok(None) => (StatusCode::NOT_FOUND, "Cluster quota not found").into_response(),
        Err(e) => {
            warn!("Failed to read cluster quota: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to read cluster quota").into_response()
        }
    }
}
