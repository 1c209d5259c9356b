use crate::quantity::{self, ResourceList};
use crate::selector::LabelSelector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Tracked resource names ---

pub const RESOURCE_PODS: &str = "pods";
pub const RESOURCE_SERVICES: &str = "services";
pub const RESOURCE_SERVICES_NODEPORTS: &str = "services.nodeports";
pub const RESOURCE_PVCS: &str = "persistentvolumeclaims";
pub const RESOURCE_REQUESTS_CPU: &str = "requests.cpu";
pub const RESOURCE_REQUESTS_MEMORY: &str = "requests.memory";
pub const RESOURCE_REQUESTS_STORAGE: &str = "requests.storage";

/// Per-storage-class resource names take the form `<class><SUFFIX>`,
/// e.g. `fast-ssd.storageclass.storage.k8s.io/requests.storage`.
pub const STORAGE_CLASS_SUFFIX: &str = ".storageclass.storage.k8s.io/requests.storage";

pub fn storage_class_resource(class: &str) -> String {
    format!("{}{}", class, STORAGE_CLASS_SUFFIX)
}

// --- Scopes ---

/// Object-scope predicate restricting which objects a quota charges,
/// independent of resource-name matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "camelCase")]
pub enum QuotaScope {
    /// Pods with an active deadline (bounded lifetime).
    Terminating,
    /// Pods without an active deadline.
    NotTerminating,
    /// Objects whose priority class is one of `values`.
    PriorityClass { values: Vec<String> },
}

// --- Cluster quota document ---

/// Hard ceilings plus the namespace selector and scope predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterQuotaSpec {
    pub hard: ResourceList,
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default)]
    pub scopes: Vec<QuotaScope>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuotaTotals {
    #[serde(default)]
    pub hard: ResourceList,
    #[serde(default)]
    pub used: ResourceList,
}

/// Usage attributed to one namespace matched by the document's selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceUsage {
    pub namespace: String,
    #[serde(default)]
    pub used: ResourceList,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterQuotaStatus {
    #[serde(default)]
    pub total: QuotaTotals,
    #[serde(default)]
    pub namespaces: Vec<NamespaceUsage>,
}

/// Cluster-scoped quota document: ceilings for the aggregate usage of all
/// namespaces matched by the selector. `status.total.used` must equal the
/// sum of the per-namespace records once reconciliation has settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterQuota {
    pub name: String,
    pub spec: ClusterQuotaSpec,
    #[serde(default)]
    pub status: ClusterQuotaStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ClusterQuota {
    /// Resource names this document tracks (the keys of `spec.hard`).
    pub fn tracked_resources(&self) -> Vec<String> {
        self.spec.hard.keys().cloned().collect()
    }

    /// Find the usage record for a namespace, if present.
    pub fn namespace_usage(&self, namespace: &str) -> Option<&NamespaceUsage> {
        self.status
            .namespaces
            .iter()
            .find(|n| n.namespace == namespace)
    }

    /// Replace (or insert) the usage record for a namespace.
    pub fn set_namespace_usage(&mut self, namespace: &str, used: ResourceList) {
        match self
            .status
            .namespaces
            .iter_mut()
            .find(|n| n.namespace == namespace)
        {
            Some(record) => record.used = used,
            None => self.status.namespaces.push(NamespaceUsage {
                namespace: namespace.to_string(),
                used,
            }),
        }
    }

    /// Apply a signed usage delta on behalf of one namespace: the namespace
    /// record and the total both move by `delta`, floored at zero, and
    /// `total.hard` is refreshed from the spec.
    pub fn apply_usage_delta(&mut self, namespace: &str, delta: &ResourceList) {
        let ns_used = self
            .namespace_usage(namespace)
            .map(|record| record.used.clone())
            .unwrap_or_default();
        self.set_namespace_usage(namespace, quantity::max_zero(&quantity::add(&ns_used, delta)));
        self.status.total.used =
            quantity::max_zero(&quantity::add(&self.status.total.used, delta));
        self.status.total.hard = self.spec.hard.clone();
    }

    /// Recompute `status.total.used` as the sum of all namespace records
    /// and refresh `status.total.hard` from the spec.
    pub fn recompute_total(&mut self) {
        let mut total = ResourceList::new();
        for record in &self.status.namespaces {
            total = quantity::add(&total, &record.used);
        }
        self.status.total.used = total;
        self.status.total.hard = self.spec.hard.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::Quantity;

    fn quota() -> ClusterQuota {
        let mut hard = ResourceList::new();
        hard.insert(RESOURCE_PODS.to_string(), Quantity::from_units(10));
        ClusterQuota {
            name: "team-a".to_string(),
            spec: ClusterQuotaSpec {
                hard,
                selector: LabelSelector::default(),
                scopes: vec![],
            },
            status: ClusterQuotaStatus::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn total_is_sum_of_namespace_records() {
        let mut q = quota();
        let mut used_a = ResourceList::new();
        used_a.insert(RESOURCE_PODS.to_string(), Quantity::from_units(3));
        let mut used_b = ResourceList::new();
        used_b.insert(RESOURCE_PODS.to_string(), Quantity::from_units(4));
        q.set_namespace_usage("ns-a", used_a);
        q.set_namespace_usage("ns-b", used_b);
        q.recompute_total();
        assert_eq!(q.status.total.used[RESOURCE_PODS], Quantity::from_units(7));
        assert_eq!(q.status.total.hard[RESOURCE_PODS], Quantity::from_units(10));
    }

    #[test]
    fn set_namespace_usage_replaces_wholesale() {
        let mut q = quota();
        let mut used = ResourceList::new();
        used.insert(RESOURCE_PODS.to_string(), Quantity::from_units(3));
        q.set_namespace_usage("ns-a", used.clone());
        used.insert(RESOURCE_PODS.to_string(), Quantity::from_units(1));
        q.set_namespace_usage("ns-a", used);
        assert_eq!(q.status.namespaces.len(), 1);
        q.recompute_total();
        assert_eq!(q.status.total.used[RESOURCE_PODS], Quantity::from_units(1));
    }

    #[test]
    fn apply_usage_delta_moves_record_and_total() {
        let mut q = quota();
        let mut used = ResourceList::new();
        used.insert(RESOURCE_PODS.to_string(), Quantity::from_units(2));
        q.set_namespace_usage("ns-a", used);
        q.recompute_total();

        let mut delta = ResourceList::new();
        delta.insert(RESOURCE_PODS.to_string(), Quantity::from_units(3));
        q.apply_usage_delta("ns-a", &delta);
        assert_eq!(
            q.namespace_usage("ns-a").unwrap().used[RESOURCE_PODS],
            Quantity::from_units(5)
        );
        assert_eq!(q.status.total.used[RESOURCE_PODS], Quantity::from_units(5));

        // A refund larger than what is recorded floors at zero.
        let mut refund = ResourceList::new();
        refund.insert(RESOURCE_PODS.to_string(), Quantity::from_units(-9));
        q.apply_usage_delta("ns-a", &refund);
        assert_eq!(
            q.namespace_usage("ns-a").unwrap().used[RESOURCE_PODS],
            Quantity::zero()
        );
        assert_eq!(q.status.total.used[RESOURCE_PODS], Quantity::zero());
    }

    #[test]
    fn storage_class_resource_name() {
        assert_eq!(
            storage_class_resource("fast-ssd"),
            "fast-ssd.storageclass.storage.k8s.io/requests.storage"
        );
    }
}
