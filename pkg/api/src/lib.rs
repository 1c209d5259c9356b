pub mod handlers;
pub mod server;

use pkg_admission::QuotaAdmission;
use pkg_state::client::StateStore;
use std::sync::Arc;

/// Shared application state injected into all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub admission: Arc<QuotaAdmission>,
}
