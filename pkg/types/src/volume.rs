use crate::quantity::ResourceList;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PVCPhase {
    #[default]
    Pending,
    Bound,
    Lost,
}

impl std::fmt::Display for PVCPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PVCPhase::Pending => write!(f, "Pending"),
            PVCPhase::Bound => write!(f, "Bound"),
            PVCPhase::Lost => write!(f, "Lost"),
        }
    }
}

/// Persistent volume claim: a request for storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentVolumeClaim {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub namespace: String,
    /// Storage class name (e.g. "default", "fast-ssd")
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    /// Requested quantities keyed by resource name ("storage").
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub phase: PVCPhase,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}
