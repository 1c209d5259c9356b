use crate::evaluator::{
    EvaluatorError, GroupResource, Operation, QuotaObject, ResourceEvaluator,
};
use async_trait::async_trait;
use pkg_state::client::StateStore;
use pkg_types::quantity::{Quantity, ResourceList};
use pkg_types::quota::{
    QuotaScope, RESOURCE_PVCS, RESOURCE_REQUESTS_STORAGE, STORAGE_CLASS_SUFFIX,
    storage_class_resource,
};
use pkg_types::volume::PersistentVolumeClaim;

/// Evaluator for persistent volume claims: counts claims and sums requested
/// storage, including per-storage-class resource names.
pub struct PvcEvaluator {
    store: Option<StateStore>,
    /// When set, claim updates (volume expansion) are re-evaluated too.
    allow_expansion: bool,
}

impl PvcEvaluator {
    pub fn new(store: Option<StateStore>, allow_expansion: bool) -> Self {
        Self {
            store,
            allow_expansion,
        }
    }

    fn claim<'a>(
        &self,
        object: &'a QuotaObject,
    ) -> Result<&'a PersistentVolumeClaim, EvaluatorError> {
        match object {
            QuotaObject::PersistentVolumeClaim(claim) => Ok(claim),
            _ => Err(EvaluatorError::UnsupportedObjectKind(self.group_resource())),
        }
    }
}

#[async_trait]
impl ResourceEvaluator for PvcEvaluator {
    fn group_resource(&self) -> GroupResource {
        GroupResource::core("persistentvolumeclaims")
    }

    fn handles(&self, operation: Operation) -> bool {
        match operation {
            Operation::Create => true,
            Operation::Update => self.allow_expansion,
            Operation::Delete => false,
        }
    }

    fn matching_resources(&self, tracked: &[String]) -> Vec<String> {
        tracked
            .iter()
            .filter(|name| {
                name.as_str() == RESOURCE_PVCS
                    || name.as_str() == RESOURCE_REQUESTS_STORAGE
                    || name.ends_with(STORAGE_CLASS_SUFFIX)
            })
            .cloned()
            .collect()
    }

    fn matching_scopes(
        &self,
        object: &QuotaObject,
        _scopes: &[QuotaScope],
    ) -> Result<Vec<QuotaScope>, EvaluatorError> {
        // Scopes are pod predicates; claims never match any.
        self.claim(object)?;
        Ok(vec![])
    }

    fn constraints(
        &self,
        required: &[String],
        object: &QuotaObject,
    ) -> Result<(), EvaluatorError> {
        let claim = self.claim(object)?;
        for name in required {
            let needs_storage = name.as_str() == RESOURCE_REQUESTS_STORAGE
                || name.ends_with(STORAGE_CLASS_SUFFIX);
            if name.as_str() == RESOURCE_PVCS {
                continue;
            }
            if !needs_storage {
                return Err(EvaluatorError::ConstraintViolation(format!(
                    "resource '{}' is not evaluated for persistentvolumeclaims",
                    name
                )));
            }
            if !claim.requests.contains_key("storage") {
                return Err(EvaluatorError::ConstraintViolation(format!(
                    "claim '{}' must specify a storage request because quota tracks '{}'",
                    claim.name, name
                )));
            }
        }
        Ok(())
    }

    fn usage(&self, object: &QuotaObject) -> Result<ResourceList, EvaluatorError> {
        let claim = self.claim(object)?;
        let mut usage = ResourceList::new();
        usage.insert(RESOURCE_PVCS.to_string(), Quantity::from_units(1));
        if let Some(storage) = claim.requests.get("storage") {
            usage.insert(RESOURCE_REQUESTS_STORAGE.to_string(), *storage);
            if let Some(class) = &claim.storage_class {
                usage.insert(storage_class_resource(class), *storage);
            }
        }
        Ok(usage)
    }

    async fn usage_stats(
        &self,
        namespace: &str,
        scopes: &[QuotaScope],
    ) -> Result<ResourceList, EvaluatorError> {
        let store = self.store.as_ref().ok_or_else(|| {
            EvaluatorError::Internal(anyhow::anyhow!(
                "pvc evaluator is not wired to a store; usage_stats is controller-only"
            ))
        })?;
        // A scoped quota never charges claims.
        if !scopes.is_empty() {
            return Ok(ResourceList::new());
        }

        let prefix = format!("/registry/persistentvolumeclaims/{}/", namespace);
        let entries = store.list_prefix(&prefix).await?;
        let mut total = ResourceList::new();
        for (_, value) in entries {
            let claim: PersistentVolumeClaim = match serde_json::from_slice(&value) {
                Ok(c) => c,
                Err(_) => continue,
            };
            total = pkg_types::quantity::add(
                &total,
                &self.usage(&QuotaObject::PersistentVolumeClaim(claim))?,
            );
        }
        Ok(total)
    }
}
