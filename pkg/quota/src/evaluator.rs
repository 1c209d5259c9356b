use async_trait::async_trait;
use pkg_types::pod::Pod;
use pkg_types::quantity::ResourceList;
use pkg_types::quota::QuotaScope;
use pkg_types::service::Service;
use pkg_types::volume::PersistentVolumeClaim;

/// Write operation kind an evaluator may be asked to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Identifies one object kind, e.g. `pods` or `persistentvolumeclaims`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupResource {
    pub group: &'static str,
    pub resource: &'static str,
}

impl GroupResource {
    pub const fn core(resource: &'static str) -> Self {
        Self {
            group: "",
            resource,
        }
    }
}

impl std::fmt::Display for GroupResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// Closed set of object kinds tracked by quota.
#[derive(Debug, Clone)]
pub enum QuotaObject {
    Pod(Pod),
    Service(Service),
    PersistentVolumeClaim(PersistentVolumeClaim),
}

impl QuotaObject {
    pub fn group_resource(&self) -> GroupResource {
        match self {
            QuotaObject::Pod(_) => GroupResource::core("pods"),
            QuotaObject::Service(_) => GroupResource::core("services"),
            QuotaObject::PersistentVolumeClaim(_) => {
                GroupResource::core("persistentvolumeclaims")
            }
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            QuotaObject::Pod(p) => &p.namespace,
            QuotaObject::Service(s) => &s.namespace,
            QuotaObject::PersistentVolumeClaim(c) => &c.namespace,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            QuotaObject::Pod(p) => &p.name,
            QuotaObject::Service(s) => &s.name,
            QuotaObject::PersistentVolumeClaim(c) => &c.name,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    #[error("object is not a {0}")]
    UnsupportedObjectKind(GroupResource),
    #[error("{0}")]
    ConstraintViolation(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Per-kind usage strategy. One evaluator per object kind decouples what
/// counts as "used" from the generic locking and accounting machinery.
#[async_trait]
pub trait ResourceEvaluator: Send + Sync {
    /// The kind this evaluator handles.
    fn group_resource(&self) -> GroupResource;

    /// Whether this evaluator must run for the given write operation.
    fn handles(&self, operation: Operation) -> bool;

    /// Filter a quota document's tracked resource names down to the ones
    /// this evaluator can charge (exact, object-count, and per-class
    /// suffix matches).
    fn matching_resources(&self, tracked: &[String]) -> Vec<String>;

    /// The subset of `scopes` that apply to this object.
    fn matching_scopes(
        &self,
        object: &QuotaObject,
        scopes: &[QuotaScope],
    ) -> Result<Vec<QuotaScope>, EvaluatorError>;

    /// Scopes in `limited` that `matched` does not cover.
    fn uncovered_quota_scopes(
        &self,
        limited: &[QuotaScope],
        matched: &[QuotaScope],
    ) -> Result<Vec<QuotaScope>, EvaluatorError> {
        Ok(limited
            .iter()
            .filter(|scope| !matched.contains(scope))
            .cloned()
            .collect())
    }

    /// Fail when the object lacks fields needed to evaluate a resource name
    /// the quota requires. Local and synchronous, no side effects.
    fn constraints(&self, required: &[String], object: &QuotaObject)
    -> Result<(), EvaluatorError>;

    /// Usage contribution of one object instance.
    fn usage(&self, object: &QuotaObject) -> Result<ResourceList, EvaluatorError>;

    /// Full recount: list every object of this kind in `namespace` (honoring
    /// `scopes`) and sum `usage` over all instances. Reconciler-only; needs
    /// a store-wired evaluator.
    async fn usage_stats(
        &self,
        namespace: &str,
        scopes: &[QuotaScope],
    ) -> Result<ResourceList, EvaluatorError>;
}

/// Match helper shared by evaluators: tracked names that appear in the
/// evaluator's supported set.
pub(crate) fn intersect_tracked(tracked: &[String], supported: &[&str]) -> Vec<String> {
    tracked
        .iter()
        .filter(|name| supported.contains(&name.as_str()))
        .cloned()
        .collect()
}
