use crate::evaluator::{
    EvaluatorError, GroupResource, Operation, QuotaObject, ResourceEvaluator, intersect_tracked,
};
use async_trait::async_trait;
use pkg_state::client::StateStore;
use pkg_types::quantity::{Quantity, ResourceList};
use pkg_types::quota::{QuotaScope, RESOURCE_SERVICES, RESOURCE_SERVICES_NODEPORTS};
use pkg_types::service::Service;

const SUPPORTED: &[&str] = &[RESOURCE_SERVICES, RESOURCE_SERVICES_NODEPORTS];

/// Evaluator for services: counts services and allocated node ports.
pub struct ServiceEvaluator {
    store: Option<StateStore>,
}

impl ServiceEvaluator {
    pub fn new(store: Option<StateStore>) -> Self {
        Self { store }
    }

    fn service<'a>(&self, object: &'a QuotaObject) -> Result<&'a Service, EvaluatorError> {
        match object {
            QuotaObject::Service(svc) => Ok(svc),
            _ => Err(EvaluatorError::UnsupportedObjectKind(self.group_resource())),
        }
    }
}

#[async_trait]
impl ResourceEvaluator for ServiceEvaluator {
    fn group_resource(&self) -> GroupResource {
        GroupResource::core("services")
    }

    fn handles(&self, operation: Operation) -> bool {
        matches!(operation, Operation::Create | Operation::Update)
    }

    fn matching_resources(&self, tracked: &[String]) -> Vec<String> {
        intersect_tracked(tracked, SUPPORTED)
    }

    fn matching_scopes(
        &self,
        object: &QuotaObject,
        _scopes: &[QuotaScope],
    ) -> Result<Vec<QuotaScope>, EvaluatorError> {
        // Scopes are pod predicates; services never match any.
        self.service(object)?;
        Ok(vec![])
    }

    fn constraints(
        &self,
        required: &[String],
        object: &QuotaObject,
    ) -> Result<(), EvaluatorError> {
        self.service(object)?;
        for name in required {
            if !SUPPORTED.contains(&name.as_str()) {
                return Err(EvaluatorError::ConstraintViolation(format!(
                    "resource '{}' is not evaluated for services",
                    name
                )));
            }
        }
        Ok(())
    }

    fn usage(&self, object: &QuotaObject) -> Result<ResourceList, EvaluatorError> {
        let svc = self.service(object)?;
        let mut usage = ResourceList::new();
        usage.insert(RESOURCE_SERVICES.to_string(), Quantity::from_units(1));
        let node_ports = svc.node_port_count();
        if node_ports > 0 {
            usage.insert(
                RESOURCE_SERVICES_NODEPORTS.to_string(),
                Quantity::from_units(node_ports as i64),
            );
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
                "service evaluator is not wired to a store; usage_stats is controller-only"
            ))
        })?;
        // A scoped quota never charges services.
        if !scopes.is_empty() {
            return Ok(ResourceList::new());
        }

        let prefix = format!("/registry/services/{}/", namespace);
        let entries = store.list_prefix(&prefix).await?;
        let mut total = ResourceList::new();
        for (_, value) in entries {
            let svc: Service = match serde_json::from_slice(&value) {
                Ok(s) => s,
                Err(_) => continue,
            };
            total = pkg_types::quantity::add(&total, &self.usage(&QuotaObject::Service(svc))?);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{make_node_port_service, make_service};

    #[test]
    fn counts_services_and_node_ports() {
        let evaluator = ServiceEvaluator::new(None);

        let plain = make_service("s1", "default");
        let usage = evaluator.usage(&QuotaObject::Service(plain)).unwrap();
        assert_eq!(usage[RESOURCE_SERVICES], Quantity::from_units(1));
        assert!(!usage.contains_key(RESOURCE_SERVICES_NODEPORTS));

        let node_port = make_node_port_service("s2", "default", 2);
        let usage = evaluator.usage(&QuotaObject::Service(node_port)).unwrap();
        assert_eq!(usage[RESOURCE_SERVICES_NODEPORTS], Quantity::from_units(2));
    }

    #[test]
    fn never_matches_scopes() {
        let evaluator = ServiceEvaluator::new(None);
        let svc = make_service("s1", "default");
        let matched = evaluator
            .matching_scopes(&QuotaObject::Service(svc), &[QuotaScope::Terminating])
            .unwrap();
        assert!(matched.is_empty());
    }
}
