use axum::{
    Router,
    routing::{get, post},
};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

use crate::AppState;
use crate::handlers::{quotas, resources};
use pkg_admission::QuotaAdmission;
use pkg_controllers::quota::ClusterQuotaController;
use pkg_quota::accessor::QuotaAccessor;
use pkg_quota::locks::LockFactory;
use pkg_quota::registry::EvaluatorRegistry;
use pkg_state::client::StateStore;

/// Server configuration passed from the binary's CLI.
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub data_dir: String,
    pub resync: Duration,
}

pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    // Initialize core subsystems
    let store = StateStore::new(&config.data_dir).await?;
    let accessor = Arc::new(QuotaAccessor::new(store.clone()));
    let locks = Arc::new(LockFactory::new());
    let admission = Arc::new(QuotaAdmission::new(
        Arc::new(EvaluatorRegistry::for_admission()),
        accessor.clone(),
        locks,
    ));

    let state = AppState {
        store: store.clone(),
        admission,
    };

    // Seed the default namespace
    seed_default_namespace(&store).await?;

    // Start the quota reconciler background task
    let controller = Arc::new(
        ClusterQuotaController::new(
            store.clone(),
            accessor,
            Arc::new(EvaluatorRegistry::for_controller(store.clone())),
        )
        .with_resync(config.resync),
    );
    controller.start();

    let app = Router::new()
        .route(
            "/api/v1/namespaces",
            post(resources::create_namespace).get(resources::list_namespaces),
        )
        .route("/api/v1/namespaces/{ns}", get(resources::get_namespace))
        .route(
            "/api/v1/namespaces/{ns}/pods",
            post(resources::create_pod).get(resources::list_pods),
        )
        .route(
            "/api/v1/namespaces/{ns}/pods/{pod_id}",
            axum::routing::delete(resources::delete_pod),
        )
        .route(
            "/api/v1/namespaces/{ns}/services",
            post(resources::create_service).get(resources::list_services),
        )
        .route(
            "/api/v1/namespaces/{ns}/persistentvolumeclaims",
            post(resources::create_pvc).get(resources::list_pvcs),
        )
        .route(
            "/api/v1/clusterquotas",
            post(quotas::create_cluster_quota).get(quotas::list_cluster_quotas),
        )
        .route(
            "/api/v1/clusterquotas/{name}",
            get(quotas::get_cluster_quota),
        )
        .with_state(state);

    info!("Starting API server on {}", config.addr);
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Seed the default namespace on startup.
async fn seed_default_namespace(store: &StateStore) -> anyhow::Result<()> {
    let key = "/registry/namespaces/default";
    if store.get(key).await?.is_none() {
        let ns = pkg_types::namespace::Namespace {
            name: "default".to_string(),
            labels: std::collections::HashMap::new(),
            created_at: Utc::now(),
        };
        let data = serde_json::to_vec(&ns)?;
        store.put(key, &data).await?;
        info!("Seeded namespace: default");
    }
    Ok(())
}
