use crate::evaluator::{GroupResource, QuotaObject, ResourceEvaluator};
use crate::pod::PodEvaluator;
use crate::pvc::PvcEvaluator;
use crate::service::ServiceEvaluator;
use pkg_state::client::StateStore;
use std::sync::Arc;

/// Immutable collection of evaluators, built once per process. Dispatch is a
/// linear scan; the set is tens of kinds at most.
pub struct EvaluatorRegistry {
    evaluators: Vec<Arc<dyn ResourceEvaluator>>,
}

impl EvaluatorRegistry {
    /// Admission configuration: evaluators without a listing client, so
    /// matching and per-object usage stay side-effect free.
    pub fn for_admission() -> Self {
        Self {
            evaluators: vec![
                Arc::new(PodEvaluator::new(None)),
                Arc::new(ServiceEvaluator::new(None)),
                Arc::new(PvcEvaluator::new(None, false)),
            ],
        }
    }

    /// Controller configuration: evaluators wired to a live store for full
    /// recounts via `usage_stats`.
    pub fn for_controller(store: StateStore) -> Self {
        Self {
            evaluators: vec![
                Arc::new(PodEvaluator::new(Some(store.clone()))),
                Arc::new(ServiceEvaluator::new(Some(store.clone()))),
                Arc::new(PvcEvaluator::new(Some(store), false)),
            ],
        }
    }

    pub fn list(&self) -> &[Arc<dyn ResourceEvaluator>] {
        &self.evaluators
    }

    pub fn get(&self, group_resource: GroupResource) -> Option<Arc<dyn ResourceEvaluator>> {
        self.evaluators
            .iter()
            .find(|e| e.group_resource() == group_resource)
            .cloned()
    }

    pub fn evaluator_for(&self, object: &QuotaObject) -> Option<Arc<dyn ResourceEvaluator>> {
        self.get(object.group_resource())
    }
}
