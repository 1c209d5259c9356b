use pkg_quota::accessor::QuotaAccessor;
use pkg_quota::registry::EvaluatorRegistry;
use pkg_state::client::StateStore;
use pkg_state::watch::{EventType, WatchEvent};
use pkg_types::namespace::Namespace;
use pkg_types::pod::Pod;
use pkg_types::quantity::{self, ResourceList};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Controller that recomputes each quota document's usage from a full
/// namespace scan and corrects drift left by the incremental admission path
/// (missed events, writes that bypassed admission, process restarts).
///
/// Runs on a fixed resync interval and on quota-relevant change events.
pub struct ClusterQuotaController {
    store: StateStore,
    accessor: Arc<QuotaAccessor>,
    registry: Arc<EvaluatorRegistry>,
    resync: Duration,
    max_concurrent: usize,
}

impl ClusterQuotaController {
    pub fn new(
        store: StateStore,
        accessor: Arc<QuotaAccessor>,
        registry: Arc<EvaluatorRegistry>,
    ) -> Self {
        Self {
            store,
            accessor,
            registry,
            resync: Duration::from_secs(300),
            max_concurrent: 8,
        }
    }

    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    /// Start the controller loop as a background task.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "ClusterQuotaController started (resync={}s, workers={})",
                self.resync.as_secs(),
                self.max_concurrent
            );
            let mut event_rx = self.store.event_log.subscribe();
            let mut interval = tokio::time::interval(self.resync);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.reconcile_all().await {
                            warn!("ClusterQuotaController reconcile error: {}", e);
                            interval.reset_after(Duration::from_secs(1));
                        }
                    }
                    result = event_rx.recv() => {
                        match result {
                            Ok(ref event) if is_quota_relevant(event) => {
                                // Coalesce the burst already queued: those
                                // writes landed before the recount starts, so
                                // one pass covers them. Events arriving during
                                // the recount stay queued and drive another.
                                while event_rx.try_recv().is_ok() {}
                                if let Err(e) = self.reconcile_all().await {
                                    warn!("ClusterQuotaController reconcile error: {}", e);
                                    interval.reset_after(Duration::from_secs(1));
                                } else {
                                    interval.reset();
                                }
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                                if let Err(e) = self.reconcile_all().await {
                                    warn!("ClusterQuotaController reconcile error: {}", e);
                                }
                                interval.reset();
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    }

    /// One pass over every quota document, at most `max_concurrent` at a time.
    /// A failing document does not block the others; the first error is
    /// returned so the loop requeues promptly.
    pub async fn reconcile_all(self: &Arc<Self>) -> anyhow::Result<()> {
        let entries = self.store.list_versioned("/registry/clusterquotas/").await?;
        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        for (key, _, _) in entries {
            let Some(name) = key.strip_prefix("/registry/clusterquotas/") else {
                continue;
            };
            let name = name.to_string();
            let controller = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = controller.reconcile(&name).await;
                (name, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (name, result) = joined?;
            if let Err(e) = result {
                warn!("Failed to reconcile quota '{}': {}", name, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Full recount for one document. Returns the requeue delay; errors
    /// propagate so the surrounding loop retries immediately.
    pub async fn reconcile(&self, name: &str) -> anyhow::Result<Option<Duration>> {
        let entry = self.accessor.get_quota(name).await?;
        entry.quota.spec.selector.validate().map_err(|e| {
            anyhow::anyhow!("quota '{}' has an invalid selector: {}", name, e)
        })?;

        let namespaces = self.list_namespaces().await?;
        let matching: Vec<&Namespace> = namespaces
            .iter()
            .filter(|ns| entry.quota.spec.selector.matches(&ns.labels))
            .collect();
        let matching_names: HashSet<&str> =
            matching.iter().map(|ns| ns.name.as_str()).collect();

        let mut updated = entry.quota.clone();

        // Replace each matching namespace's record wholesale with a recount.
        for ns in &matching {
            let mut used = ResourceList::new();
            for evaluator in self.registry.list() {
                let stats = evaluator
                    .usage_stats(&ns.name, &updated.spec.scopes)
                    .await?;
                used = quantity::add(&used, &stats);
            }
            updated.set_namespace_usage(&ns.name, used);
        }

        // Namespaces that no longer match the selector lose their records;
        // their last contribution leaves the total through the recompute.
        updated
            .status
            .namespaces
            .retain(|record| matching_names.contains(record.namespace.as_str()));
        updated.recompute_total();

        if updated.status == entry.quota.status {
            debug!("Quota '{}' unchanged, skipping status write", name);
            return Ok(Some(self.resync));
        }

        self.accessor
            .replace_quota_status(updated, entry.version)
            .await?;
        info!("Reconciled quota '{}'", name);
        Ok(Some(self.resync))
    }

    async fn list_namespaces(&self) -> anyhow::Result<Vec<Namespace>> {
        let entries = self.store.list_prefix("/registry/namespaces/").await?;
        Ok(entries
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_slice(&v).ok())
            .collect())
    }
}

/// Whether a change event can move quota usage. Quota document writes are
/// excluded so the controller's own status updates do not requeue it.
fn is_quota_relevant(event: &WatchEvent) -> bool {
    let key = event.key.as_str();
    if key.starts_with("/registry/namespaces/")
        || key.starts_with("/registry/services/")
        || key.starts_with("/registry/persistentvolumeclaims/")
    {
        return true;
    }
    if key.starts_with("/registry/pods/") {
        return match event.event_type {
            EventType::Delete => true,
            EventType::Put => match (&event.prior, &event.value) {
                (Some(prior), Some(value)) => {
                    match (
                        serde_json::from_slice::<Pod>(prior),
                        serde_json::from_slice::<Pod>(value),
                    ) {
                        // Updates matter only when the pod crosses the
                        // terminal-phase boundary in either direction.
                        (Ok(old), Ok(new)) => {
                            old.phase.is_terminal() != new.phase.is_terminal()
                        }
                        _ => true,
                    }
                }
                // Creates (and unreadable priors) always requeue.
                _ => true,
            },
        };
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pkg_quota::accessor::{namespace_key, quota_key};
    use pkg_types::pod::{ContainerSpec, PodPhase, PodSpec, ResourceRequirements};
    use pkg_types::quantity::Quantity;
    use pkg_types::quota::{
        ClusterQuota, ClusterQuotaSpec, ClusterQuotaStatus, RESOURCE_PODS,
    };
    use pkg_types::selector::{LabelSelector, LabelSelectorRequirement, SelectorOperator};
    use std::collections::HashMap;

    fn controller(store: &StateStore) -> Arc<ClusterQuotaController> {
        Arc::new(ClusterQuotaController::new(
            store.clone(),
            Arc::new(QuotaAccessor::new(store.clone())),
            Arc::new(EvaluatorRegistry::for_controller(store.clone())),
        ))
    }

    async fn seed_namespace(store: &StateStore, name: &str, labels: &[(&str, &str)]) {
        let ns = Namespace {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            created_at: Utc::now(),
        };
        store
            .put(&namespace_key(name), &serde_json::to_vec(&ns).unwrap())
            .await
            .unwrap();
    }

    async fn seed_pod(store: &StateStore, namespace: &str, name: &str, phase: PodPhase) {
        let pod = Pod {
            id: format!("{}-id", name),
            name: name.to_string(),
            namespace: namespace.to_string(),
            spec: PodSpec {
                containers: vec![ContainerSpec {
                    name: "app".to_string(),
                    image: "nginx:latest".to_string(),
                    command: vec![],
                    env: HashMap::new(),
                    resources: ResourceRequirements::default(),
                }],
                priority_class: None,
                active_deadline_seconds: None,
            },
            phase,
            labels: HashMap::new(),
            created_at: Utc::now(),
        };
        let key = format!("/registry/pods/{}/{}", namespace, pod.id);
        store
            .put(&key, &serde_json::to_vec(&pod).unwrap())
            .await
            .unwrap();
    }

    async fn seed_quota(store: &StateStore, quota: &ClusterQuota) {
        store
            .put_versioned(
                &quota_key(&quota.name),
                &serde_json::to_vec(quota).unwrap(),
                None,
            )
            .await
            .unwrap();
    }

    fn make_quota(name: &str, selector: LabelSelector) -> ClusterQuota {
        ClusterQuota {
            name: name.to_string(),
            spec: ClusterQuotaSpec {
                hard: [(RESOURCE_PODS.to_string(), Quantity::from_units(10))].into(),
                selector,
                scopes: vec![],
            },
            status: ClusterQuotaStatus::default(),
            created_at: Utc::now(),
        }
    }

    async fn read_quota(store: &StateStore, name: &str) -> (ClusterQuota, u64) {
        let (bytes, version) = store.get_versioned(&quota_key(name)).await.unwrap().unwrap();
        (serde_json::from_slice(&bytes).unwrap(), version)
    }

    #[tokio::test]
    async fn full_recount_corrects_drift() {
        let store = StateStore::new_in_memory().await.unwrap();
        seed_namespace(&store, "ns-a", &[]).await;
        seed_pod(&store, "ns-a", "p1", PodPhase::Running).await;
        seed_pod(&store, "ns-a", "p2", PodPhase::Running).await;
        seed_pod(&store, "ns-a", "p3", PodPhase::Succeeded).await; // terminal, free

        // Seed a document whose recorded usage has drifted.
        let mut quota = make_quota("team-a", LabelSelector::default());
        quota.set_namespace_usage(
            "ns-a",
            [(RESOURCE_PODS.to_string(), Quantity::from_units(7))].into(),
        );
        quota.recompute_total();
        seed_quota(&store, &quota).await;

        let controller = controller(&store);
        controller.reconcile("team-a").await.unwrap();

        let (reconciled, _) = read_quota(&store, "team-a").await;
        assert_eq!(
            reconciled.status.total.used[RESOURCE_PODS],
            Quantity::from_units(2)
        );
        assert_eq!(
            reconciled.namespace_usage("ns-a").unwrap().used[RESOURCE_PODS],
            Quantity::from_units(2)
        );
        assert_eq!(
            reconciled.status.total.hard[RESOURCE_PODS],
            Quantity::from_units(10)
        );
    }

    #[tokio::test]
    async fn second_reconcile_is_a_no_op() {
        let store = StateStore::new_in_memory().await.unwrap();
        seed_namespace(&store, "ns-a", &[]).await;
        seed_pod(&store, "ns-a", "p1", PodPhase::Running).await;
        seed_quota(&store, &make_quota("team-a", LabelSelector::default())).await;

        let controller = controller(&store);
        controller.reconcile("team-a").await.unwrap();
        let (_, version_after_first) = read_quota(&store, "team-a").await;

        controller.reconcile("team-a").await.unwrap();
        let (_, version_after_second) = read_quota(&store, "team-a").await;
        assert_eq!(
            version_after_first, version_after_second,
            "no-op reconcile must not write"
        );
    }

    #[tokio::test]
    async fn relabeled_namespace_loses_its_record() {
        let store = StateStore::new_in_memory().await.unwrap();
        seed_namespace(&store, "ns-a", &[("team", "a")]).await;
        seed_namespace(&store, "ns-b", &[("team", "a")]).await;
        seed_pod(&store, "ns-a", "p1", PodPhase::Running).await;
        seed_pod(&store, "ns-b", "p2", PodPhase::Running).await;

        let selector = LabelSelector {
            match_labels: [("team".to_string(), "a".to_string())].into(),
            ..Default::default()
        };
        seed_quota(&store, &make_quota("team-a", selector)).await;

        let controller = controller(&store);
        controller.reconcile("team-a").await.unwrap();
        let (quota, _) = read_quota(&store, "team-a").await;
        assert_eq!(quota.status.total.used[RESOURCE_PODS], Quantity::from_units(2));

        // ns-b stops matching the selector.
        seed_namespace(&store, "ns-b", &[("team", "b")]).await;
        controller.reconcile("team-a").await.unwrap();

        let (quota, _) = read_quota(&store, "team-a").await;
        assert!(quota.namespace_usage("ns-b").is_none());
        assert_eq!(quota.status.total.used[RESOURCE_PODS], Quantity::from_units(1));
    }

    #[tokio::test]
    async fn invalid_selector_blocks_only_that_document() {
        let store = StateStore::new_in_memory().await.unwrap();
        seed_namespace(&store, "ns-a", &[]).await;
        seed_quota(&store, &make_quota("good", LabelSelector::default())).await;

        let bad_selector = LabelSelector {
            match_expressions: vec![LabelSelectorRequirement {
                key: "team".to_string(),
                operator: SelectorOperator::In,
                values: vec![],
            }],
            ..Default::default()
        };
        seed_quota(&store, &make_quota("bad", bad_selector)).await;

        let controller = controller(&store);
        assert!(controller.reconcile("bad").await.is_err());
        assert!(controller.reconcile("good").await.is_ok());

        // The sweep surfaces the bad document's error but still processes
        // the good one.
        assert!(controller.reconcile_all().await.is_err());
        let (good, _) = read_quota(&store, "good").await;
        assert!(good.status.total.hard.contains_key(RESOURCE_PODS));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writes_during_a_recount_are_not_lost() {
        let store = StateStore::new_in_memory().await.unwrap();
        seed_namespace(&store, "ns-a", &[]).await;
        seed_quota(&store, &make_quota("team-a", LabelSelector::default())).await;

        let controller = Arc::new(
            ClusterQuotaController::new(
                store.clone(),
                Arc::new(QuotaAccessor::new(store.clone())),
                Arc::new(EvaluatorRegistry::for_controller(store.clone())),
            )
            // Resync far out of reach: only change events may drive recounts.
            .with_resync(Duration::from_secs(3600)),
        );
        let handle = controller.start();

        // Pod writes land while event-driven recounts are already in flight;
        // each one must still be counted without waiting for the resync.
        for i in 0..10 {
            seed_pod(&store, "ns-a", &format!("p{}", i), PodPhase::Running).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let (quota, _) = read_quota(&store, "team-a").await;
            if quota.status.total.used.get(RESOURCE_PODS).copied()
                == Some(Quantity::from_units(10))
            {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "recount never converged: {:?}",
                quota.status.total.used
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();
    }

    #[test]
    fn event_relevance_filters_quota_writes_and_idle_updates() {
        let put = |key: &str, value: Option<Vec<u8>>, prior: Option<Vec<u8>>| WatchEvent {
            seq: 1,
            event_type: EventType::Put,
            key: key.to_string(),
            value,
            prior,
        };

        // Quota status writes never requeue the controller.
        assert!(!is_quota_relevant(&put(
            "/registry/clusterquotas/team-a",
            Some(vec![]),
            None
        )));

        // Pod create requeues.
        assert!(is_quota_relevant(&put(
            "/registry/pods/ns-a/p1",
            Some(vec![]),
            None
        )));

        // Pod update crossing the terminal boundary requeues.
        let running = serde_json::to_vec(&serde_json::json!({
            "id": "p1-id", "name": "p1", "namespace": "ns-a",
            "spec": {"containers": []}, "phase": "Running",
            "created_at": Utc::now(),
        }))
        .unwrap();
        let failed = serde_json::to_vec(&serde_json::json!({
            "id": "p1-id", "name": "p1", "namespace": "ns-a",
            "spec": {"containers": []}, "phase": "Failed",
            "created_at": Utc::now(),
        }))
        .unwrap();
        assert!(is_quota_relevant(&put(
            "/registry/pods/ns-a/p1",
            Some(failed),
            Some(running.clone())
        )));

        // A phase-preserving update does not.
        assert!(!is_quota_relevant(&put(
            "/registry/pods/ns-a/p1",
            Some(running.clone()),
            Some(running)
        )));
    }
}
