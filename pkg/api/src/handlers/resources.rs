use axum::{
    Json,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use pkg_admission::{AdmissionAttributes, AdmissionError};
use pkg_quota::evaluator::{Operation, QuotaObject};
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;

/// Run the quota admission check for a workload create; `Err` is a ready
/// HTTP response. Internal failures deny the write (fail closed).
async fn admit_create(
    state: &AppState,
    namespace: &str,
    object: QuotaObject,
) -> Result<(), axum::response::Response> {
    let attrs = AdmissionAttributes {
        operation: Operation::Create,
        namespace: namespace.to_string(),
        subresource: None,
        dry_run: false,
        object: Some(object),
        old_object: None,
    };
    match state.admission.evaluate(attrs).await {
        Ok(()) => Ok(()),
        Err(AdmissionError::Forbidden(reason)) => {
            info!("Admission denied in {}: {}", namespace, reason);
            Err((StatusCode::FORBIDDEN, reason).into_response())
        }
        Err(AdmissionError::Internal(e)) => {
            warn!("Admission failed in {}, denying: {}", namespace, e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Admission check failed").into_response())
        }
    }
}

// ============================================================
// Namespaces
// ============================================================

pub async fn create_namespace(
    State(state): State<AppState>,
    Json(mut ns): Json<pkg_types::namespace::Namespace>,
) -> impl IntoResponse {
    if let Err(e) = pkg_types::validate::validate_name(&ns.name) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    ns.created_at = Utc::now();
    let key = format!("/registry/namespaces/{}", ns.name);
    match serde_json::to_vec(&ns) {
        Ok(data) => {
            if let Err(e) = state.store.put(&key, &data).await {
                warn!("Failed to create namespace: {}", e);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to create namespace",
                )
                    .into_response();
            }
            info!("Created namespace: {}", ns.name);
            (StatusCode::CREATED, Json(ns)).into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Serialization failed").into_response(),
    }
}

pub async fn get_namespace(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
) -> impl IntoResponse {
    let key = format!("/registry/namespaces/{}", ns);
    match state.store.get(&key).await {
        Ok(Some(data)) => match serde_json::from_slice::<pkg_types::namespace::Namespace>(&data) {
            Ok(namespace) => (StatusCode::OK, Json(namespace)).into_response(),
            Err(e) => {
                warn!("Corrupt namespace {}: {}", ns, e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Corrupt namespace").into_response()
            }
        },
        Ok(None) => (StatusCode::NOT_FOUND, "Namespace not found").into_response(),
        Err(e) => {
            warn!("Failed to read namespace: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to read namespace").into_response()
        }
    }
}

pub async fn list_namespaces(State(state): State<AppState>) -> impl IntoResponse {
    let entries = state
        .store
        .list_prefix("/registry/namespaces/")
        .await
        .unwrap_or_default();
    let namespaces: Vec<pkg_types::namespace::Namespace> = entries
        .into_iter()
        .filter_map(|(_, v)| serde_json::from_slice(&v).ok())
        .collect();
    (StatusCode::OK, Json(namespaces)).into_response()
}

// ============================================================
// Pods
// ============================================================

pub async fn create_pod(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
    Json(mut pod): Json<pkg_types::pod::Pod>,
) -> impl IntoResponse {
    pod.id = Uuid::new_v4().to_string();
    pod.namespace = ns.clone();
    pod.phase = pkg_types::pod::PodPhase::Pending;
    pod.created_at = Utc::now();

    if let Err(response) = admit_create(&state, &ns, QuotaObject::Pod(pod.clone())).await {
        return response;
    }

    let key = format!("/registry/pods/{}/{}", ns, pod.id);
    match serde_json::to_vec(&pod) {
        Ok(data) => {
            if let Err(e) = state.store.put(&key, &data).await {
                warn!("Failed to create pod: {}", e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create pod").into_response();
            }
            info!("Created pod {}/{} (id={})", ns, pod.name, pod.id);
            (StatusCode::CREATED, Json(pod)).into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Serialization failed").into_response(),
    }
}

pub async fn list_pods(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
) -> impl IntoResponse {
    let prefix = format!("/registry/pods/{}/", ns);
    let entries = state.store.list_prefix(&prefix).await.unwrap_or_default();
    let pods: Vec<pkg_types::pod::Pod> = entries
        .into_iter()
        .filter_map(|(_, v)| serde_json::from_slice(&v).ok())
        .collect();
    (StatusCode::OK, Json(pods)).into_response()
}

pub async fn delete_pod(
    State(state): State<AppState>,
    AxumPath((ns, pod_id)): AxumPath<(String, String)>,
) -> impl IntoResponse {
    let key = format!("/registry/pods/{}/{}", ns, pod_id);
    match state.store.get(&key).await {
        Ok(Some(_)) => {
            if let Err(e) = state.store.delete(&key).await {
                warn!("Failed to delete pod: {}", e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete pod")
                    .into_response();
            }
            // Freed quota is replenished by the reconciler's recount.
            info!("Deleted pod {}/{}", ns, pod_id);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, "Pod not found").into_response(),
        Err(e) => {
            warn!("Failed to read pod: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to read pod").into_response()
        }
    }
}

// ============================================================
// Services
// ============================================================

pub async fn create_service(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
    Json(mut svc): Json<pkg_types::service::Service>,
) -> impl IntoResponse {
    svc.id = Uuid::new_v4().to_string();
    svc.namespace = ns.clone();
    svc.created_at = Utc::now();

    if let Err(response) = admit_create(&state, &ns, QuotaObject::Service(svc.clone())).await {
        return response;
    }

    let key = format!("/registry/services/{}/{}", ns, svc.id);
    match serde_json::to_vec(&svc) {
        Ok(data) => {
            if let Err(e) = state.store.put(&key, &data).await {
                warn!("Failed to create service: {}", e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create service")
                    .into_response();
            }
            info!("Created service {}/{}", ns, svc.name);
            (StatusCode::CREATED, Json(svc)).into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Serialization failed").into_response(),
    }
}

pub async fn list_services(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
) -> impl IntoResponse {
    let prefix = format!("/registry/services/{}/", ns);
    let entries = state.store.list_prefix(&prefix).await.unwrap_or_default();
    let services: Vec<pkg_types::service::Service> = entries
        .into_iter()
        .filter_map(|(_, v)| serde_json::from_slice(&v).ok())
        .collect();
    (StatusCode::OK, Json(services)).into_response()
}

// ============================================================
// Persistent volume claims
// ============================================================

pub async fn create_pvc(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
    Json(mut claim): Json<pkg_types::volume::PersistentVolumeClaim>,
) -> impl IntoResponse {
    claim.id = Uuid::new_v4().to_string();
    claim.namespace = ns.clone();
    claim.phase = pkg_types::volume::PVCPhase::Pending;
    claim.created_at = Utc::now();

    if let Err(response) =
        admit_create(&state, &ns, QuotaObject::PersistentVolumeClaim(claim.clone())).await
    {
        return response;
    }

    let key = format!("/registry/persistentvolumeclaims/{}/{}", ns, claim.id);
    match serde_json::to_vec(&claim) {
        Ok(data) => {
            if let Err(e) = state.store.put(&key, &data).await {
                warn!("Failed to create claim: {}", e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create claim")
                    .into_response();
            }
            info!("Created claim {}/{}", ns, claim.name);
            (StatusCode::CREATED, Json(claim)).into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Serialization failed").into_response(),
    }
}

pub async fn list_pvcs(
    State(state): State<AppState>,
    AxumPath(ns): AxumPath<String>,
) -> impl IntoResponse {
    let prefix = format!("/registry/persistentvolumeclaims/{}/", ns);
    let entries = state.store.list_prefix(&prefix).await.unwrap_or_default();
    let claims: Vec<pkg_types::volume::PersistentVolumeClaim> = entries
        .into_iter()
        .filter_map(|(_, v)| serde_json::from_slice(&v).ok())
        .collect();
    (StatusCode::OK, Json(claims)).into_response()
}
