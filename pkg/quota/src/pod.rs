use crate::evaluator::{
    EvaluatorError, GroupResource, Operation, QuotaObject, ResourceEvaluator, intersect_tracked,
};
use async_trait::async_trait;
use pkg_state::client::StateStore;
use pkg_types::pod::Pod;
use pkg_types::quantity::{Quantity, ResourceList};
use pkg_types::quota::{
    QuotaScope, RESOURCE_PODS, RESOURCE_REQUESTS_CPU, RESOURCE_REQUESTS_MEMORY,
};

const SUPPORTED: &[&str] = &[RESOURCE_PODS, RESOURCE_REQUESTS_CPU, RESOURCE_REQUESTS_MEMORY];

/// Evaluator for pods: counts live pods and sums container CPU/memory
/// requests. Pods in a terminal phase charge nothing.
pub struct PodEvaluator {
    /// Present only in the controller configuration; admission evaluators
    /// never list objects.
    store: Option<StateStore>,
}

impl PodEvaluator {
    pub fn new(store: Option<StateStore>) -> Self {
        Self { store }
    }

    fn pod<'a>(&self, object: &'a QuotaObject) -> Result<&'a Pod, EvaluatorError> {
        match object {
            QuotaObject::Pod(pod) => Ok(pod),
            _ => Err(EvaluatorError::UnsupportedObjectKind(self.group_resource())),
        }
    }

    /// Whether every scope in `scopes` matches this pod.
    fn covered_by_scopes(
        &self,
        object: &QuotaObject,
        scopes: &[QuotaScope],
    ) -> Result<bool, EvaluatorError> {
        let matched = self.matching_scopes(object, scopes)?;
        Ok(matched.len() == scopes.len())
    }
}

#[async_trait]
impl ResourceEvaluator for PodEvaluator {
    fn group_resource(&self) -> GroupResource {
        GroupResource::core("pods")
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
        scopes: &[QuotaScope],
    ) -> Result<Vec<QuotaScope>, EvaluatorError> {
        let pod = self.pod(object)?;
        let mut matched = Vec::new();
        for scope in scopes {
            let hit = match scope {
                QuotaScope::Terminating => pod.spec.active_deadline_seconds.is_some(),
                QuotaScope::NotTerminating => pod.spec.active_deadline_seconds.is_none(),
                QuotaScope::PriorityClass { values } => pod
                    .spec
                    .priority_class
                    .as_ref()
                    .is_some_and(|pc| values.contains(pc)),
            };
            if hit {
                matched.push(scope.clone());
            }
        }
        Ok(matched)
    }

    fn constraints(
        &self,
        required: &[String],
        object: &QuotaObject,
    ) -> Result<(), EvaluatorError> {
        let pod = self.pod(object)?;
        for name in required {
            let request_key = match name.as_str() {
                RESOURCE_REQUESTS_CPU => "cpu",
                RESOURCE_REQUESTS_MEMORY => "memory",
                RESOURCE_PODS => continue,
                other => {
                    return Err(EvaluatorError::ConstraintViolation(format!(
                        "resource '{}' is not evaluated for pods",
                        other
                    )));
                }
            };
            for container in &pod.spec.containers {
                if !container.resources.requests.contains_key(request_key) {
                    return Err(EvaluatorError::ConstraintViolation(format!(
                        "container '{}' must specify a {} request because quota tracks '{}'",
                        container.name, request_key, name
                    )));
                }
            }
        }
        Ok(())
    }

    fn usage(&self, object: &QuotaObject) -> Result<ResourceList, EvaluatorError> {
        let pod = self.pod(object)?;
        let mut usage = ResourceList::new();
        if pod.phase.is_terminal() {
            return Ok(usage);
        }
        usage.insert(RESOURCE_PODS.to_string(), Quantity::from_units(1));

        let mut cpu = Quantity::zero();
        let mut memory = Quantity::zero();
        let mut has_cpu = false;
        let mut has_memory = false;
        for container in &pod.spec.containers {
            if let Some(q) = container.resources.requests.get("cpu") {
                cpu = cpu.add(*q);
                has_cpu = true;
            }
            if let Some(q) = container.resources.requests.get("memory") {
                memory = memory.add(*q);
                has_memory = true;
            }
        }
        if has_cpu {
            usage.insert(RESOURCE_REQUESTS_CPU.to_string(), cpu);
        }
        if has_memory {
            usage.insert(RESOURCE_REQUESTS_MEMORY.to_string(), memory);
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
                "pod evaluator is not wired to a store; usage_stats is controller-only"
            ))
        })?;

        let prefix = format!("/registry/pods/{}/", namespace);
        let entries = store.list_prefix(&prefix).await?;
        let mut total = ResourceList::new();
        for (_, value) in entries {
            let pod: Pod = match serde_json::from_slice(&value) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let object = QuotaObject::Pod(pod);
            if !self.covered_by_scopes(&object, scopes)? {
                continue;
            }
            total = pkg_types::quantity::add(&total, &self.usage(&object)?);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{make_pod, pod_with_requests};
    use pkg_types::pod::PodPhase;

    #[test]
    fn counts_one_pod_and_sums_requests() {
        let evaluator = PodEvaluator::new(None);
        let pod = pod_with_requests("p1", "default", "200m", "128Mi");
        let usage = evaluator.usage(&QuotaObject::Pod(pod)).unwrap();
        assert_eq!(usage[RESOURCE_PODS], Quantity::from_units(1));
        assert_eq!(usage[RESOURCE_REQUESTS_CPU], Quantity::from_millis(200));
        assert_eq!(
            usage[RESOURCE_REQUESTS_MEMORY],
            Quantity::from_units(128 * 1024 * 1024)
        );
    }

    #[test]
    fn terminal_pods_charge_nothing() {
        let evaluator = PodEvaluator::new(None);
        let mut pod = make_pod("p1", "default");
        pod.phase = PodPhase::Succeeded;
        let usage = evaluator.usage(&QuotaObject::Pod(pod)).unwrap();
        assert!(usage.is_empty());
    }

    #[test]
    fn rejects_wrong_kind() {
        let evaluator = PodEvaluator::new(None);
        let svc = crate::fixtures::make_service("s1", "default");
        let err = evaluator.usage(&QuotaObject::Service(svc)).unwrap_err();
        assert!(matches!(err, EvaluatorError::UnsupportedObjectKind(_)));
    }

    #[test]
    fn matching_resources_filters_to_pod_names() {
        let evaluator = PodEvaluator::new(None);
        let tracked = vec![
            RESOURCE_PODS.to_string(),
            RESOURCE_REQUESTS_CPU.to_string(),
            "requests.storage".to_string(),
        ];
        let matched = evaluator.matching_resources(&tracked);
        assert_eq!(matched, vec![RESOURCE_PODS, RESOURCE_REQUESTS_CPU]);
    }

    #[test]
    fn constraints_require_requests_on_every_container() {
        let evaluator = PodEvaluator::new(None);
        let pod = make_pod("p1", "default"); // no requests set
        let err = evaluator
            .constraints(
                &[RESOURCE_REQUESTS_CPU.to_string()],
                &QuotaObject::Pod(pod),
            )
            .unwrap_err();
        assert!(matches!(err, EvaluatorError::ConstraintViolation(_)));

        let pod = pod_with_requests("p2", "default", "100m", "64Mi");
        assert!(
            evaluator
                .constraints(
                    &[RESOURCE_REQUESTS_CPU.to_string()],
                    &QuotaObject::Pod(pod)
                )
                .is_ok()
        );
    }

    #[test]
    fn scope_matching() {
        let evaluator = PodEvaluator::new(None);
        let mut pod = make_pod("p1", "default");
        pod.spec.priority_class = Some("critical".to_string());
        pod.spec.active_deadline_seconds = Some(300);
        let object = QuotaObject::Pod(pod);

        let scopes = vec![
            QuotaScope::Terminating,
            QuotaScope::NotTerminating,
            QuotaScope::PriorityClass {
                values: vec!["critical".to_string()],
            },
        ];
        let matched = evaluator.matching_scopes(&object, &scopes).unwrap();
        assert_eq!(
            matched,
            vec![
                QuotaScope::Terminating,
                QuotaScope::PriorityClass {
                    values: vec!["critical".to_string()],
                },
            ]
        );

        let uncovered = evaluator.uncovered_quota_scopes(&scopes, &matched).unwrap();
        assert_eq!(uncovered, vec![QuotaScope::NotTerminating]);
    }
}
