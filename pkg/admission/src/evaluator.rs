use pkg_quota::accessor::{AccessorError, QuotaAccessor, VersionedQuota};
use pkg_quota::evaluator::{EvaluatorError, Operation, QuotaObject, ResourceEvaluator};
use pkg_quota::locks::LockFactory;
use pkg_quota::registry::EvaluatorRegistry;
use pkg_state::client::StoreError;
use pkg_types::quantity::{self, ResourceList};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// One incoming write request as seen by the admission hook.
#[derive(Debug, Clone)]
pub struct AdmissionAttributes {
    pub operation: Operation,
    /// Empty for cluster-scoped requests, which quota ignores.
    pub namespace: String,
    /// Sub-resource requests (status, scale, ...) are ignored outright.
    pub subresource: Option<String>,
    pub dry_run: bool,
    pub object: Option<QuotaObject>,
    /// Prior state on updates; its usage is credited back.
    pub old_object: Option<QuotaObject>,
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// User-facing denial (limit exceeded, constraint violation).
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Transient or infrastructure failure; callers fail closed.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

fn classify(err: EvaluatorError) -> AdmissionError {
    match err {
        EvaluatorError::ConstraintViolation(msg) => AdmissionError::Forbidden(msg),
        EvaluatorError::UnsupportedObjectKind(gr) => {
            AdmissionError::Internal(anyhow::anyhow!("evaluator dispatched wrong kind: {}", gr))
        }
        EvaluatorError::Internal(e) => AdmissionError::Internal(e),
    }
}

fn internal(err: AccessorError) -> AdmissionError {
    AdmissionError::Internal(anyhow::Error::from(err))
}

/// Webhook-style admission evaluator: atomically checks and charges usage
/// against every applicable quota document before a write is committed.
pub struct QuotaAdmission {
    registry: Arc<EvaluatorRegistry>,
    accessor: Arc<QuotaAccessor>,
    locks: Arc<LockFactory>,
    /// Bounded concurrency so a store outage cannot pile up unbounded
    /// in-flight evaluations; excess requests queue on the semaphore.
    permits: Arc<Semaphore>,
    /// Attempts per document on optimistic-concurrency conflicts.
    max_attempts: u32,
}

impl QuotaAdmission {
    pub const DEFAULT_WORKERS: usize = 10;

    pub fn new(
        registry: Arc<EvaluatorRegistry>,
        accessor: Arc<QuotaAccessor>,
        locks: Arc<LockFactory>,
    ) -> Self {
        Self {
            registry,
            accessor,
            locks,
            permits: Arc::new(Semaphore::new(Self::DEFAULT_WORKERS)),
            max_attempts: 3,
        }
    }

    /// Admission entry point. `Ok(())` allows the write; `Forbidden` carries
    /// the user-facing reason; `Internal` must be treated as a denial by the
    /// caller (fail closed).
    pub async fn evaluate(&self, attrs: AdmissionAttributes) -> Result<(), AdmissionError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| AdmissionError::Internal(anyhow::anyhow!("admission pool closed: {}", e)))?;

        // Classification: requests quota can never charge are allowed outright.
        if attrs.subresource.is_some() || attrs.namespace.is_empty() {
            return Ok(());
        }
        let Some(object) = attrs.object.clone() else {
            return Ok(());
        };
        let Some(evaluator) = self.registry.evaluator_for(&object) else {
            return Ok(());
        };
        if !evaluator.handles(attrs.operation) {
            return Ok(());
        }

        let quotas = self
            .accessor
            .quotas_for_namespace(&attrs.namespace)
            .await
            .map_err(internal)?;
        let mut applicable = self.filter_applicable(&object, evaluator.as_ref(), quotas)?;
        if applicable.is_empty() {
            return Ok(());
        }
        applicable.sort_by(|a, b| a.quota.name.cmp(&b.quota.name));

        // Acquire locks in sorted-name order; every concurrent request uses
        // the same order over overlapping document sets, so no deadlock.
        let mut guards = Vec::with_capacity(applicable.len());
        for entry in &applicable {
            let lock = self.locks.get_lock(&entry.quota.name).await;
            guards.push(lock.lock_owned().await);
        }

        let result = self
            .check_and_commit(&attrs, &object, evaluator.as_ref(), &applicable)
            .await;

        // Release in reverse acquisition order on every terminal path.
        while guards.pop().is_some() {}
        result
    }

    /// Keep only documents that track a resource this evaluator can charge
    /// and whose scopes (if any) fully cover the object.
    fn filter_applicable(
        &self,
        object: &QuotaObject,
        evaluator: &dyn ResourceEvaluator,
        quotas: Vec<VersionedQuota>,
    ) -> Result<Vec<VersionedQuota>, AdmissionError> {
        let mut applicable = Vec::new();
        for entry in quotas {
            let tracked = entry.quota.tracked_resources();
            if evaluator.matching_resources(&tracked).is_empty() {
                continue;
            }
            if !entry.quota.spec.scopes.is_empty() {
                let matched = evaluator
                    .matching_scopes(object, &entry.quota.spec.scopes)
                    .map_err(classify)?;
                let uncovered = evaluator
                    .uncovered_quota_scopes(&entry.quota.spec.scopes, &matched)
                    .map_err(classify)?;
                if !uncovered.is_empty() {
                    continue;
                }
            }
            applicable.push(entry);
        }
        Ok(applicable)
    }

    async fn check_and_commit(
        &self,
        attrs: &AdmissionAttributes,
        object: &QuotaObject,
        evaluator: &dyn ResourceEvaluator,
        applicable: &[VersionedQuota],
    ) -> Result<(), AdmissionError> {
        // Signed delta: updates credit the prior object's usage back, so
        // shrinking a request frees quota.
        let mut delta = evaluator.usage(object).map_err(classify)?;
        if attrs.operation == Operation::Update
            && let Some(old) = &attrs.old_object
        {
            delta = quantity::subtract(&delta, &evaluator.usage(old).map_err(classify)?);
        }

        // Check every document before touching any: the common deny path
        // leaves no partial writes at all.
        let mut violations: Vec<String> = Vec::new();
        let mut plans: Vec<(String, ResourceList)> = Vec::new();
        for entry in applicable {
            let tracked = entry.quota.tracked_resources();
            let matched = evaluator.matching_resources(&tracked);
            evaluator.constraints(&matched, object).map_err(classify)?;

            let masked_delta = quantity::mask(&delta, &matched);
            let current = self
                .accessor
                .get_quota(&entry.quota.name)
                .await
                .map_err(internal)?;
            if let Some(message) = exceeded_message(&current.quota, &masked_delta) {
                violations.push(message);
            }
            plans.push((entry.quota.name.clone(), masked_delta));
        }
        if !violations.is_empty() {
            return Err(AdmissionError::Forbidden(violations.join("; ")));
        }
        if attrs.dry_run {
            return Ok(());
        }

        // Commit phase: charge each document, retrying version conflicts with
        // a fresh re-check. A recheck that newly fails (a reconciliation
        // write landed in between) rolls back what was already charged.
        let mut committed: Vec<(String, ResourceList)> = Vec::new();
        for (name, masked_delta) in &plans {
            if masked_delta.values().all(|q| q.is_zero()) {
                continue;
            }
            let mut attempts = 0;
            loop {
                attempts += 1;
                let current = match self.accessor.get_quota(name).await {
                    Ok(current) => current,
                    Err(e) => {
                        self.rollback(&attrs.namespace, &committed).await;
                        return Err(internal(e));
                    }
                };
                if let Some(message) = exceeded_message(&current.quota, masked_delta) {
                    self.rollback(&attrs.namespace, &committed).await;
                    return Err(AdmissionError::Forbidden(message));
                }
                let version = current.version;
                let mut updated = current.quota;
                updated.apply_usage_delta(&attrs.namespace, masked_delta);
                match self.accessor.replace_quota_status(updated, version).await {
                    Ok(_) => {
                        debug!(
                            "Charged quota '{}' for {} '{}' in {}",
                            name,
                            object.group_resource(),
                            object.name(),
                            attrs.namespace
                        );
                        committed.push((name.clone(), masked_delta.clone()));
                        break;
                    }
                    Err(AccessorError::Store(StoreError::VersionConflict { .. }))
                        if attempts < self.max_attempts =>
                    {
                        debug!(
                            "Version conflict charging quota '{}' (attempt {}), retrying",
                            name, attempts
                        );
                        continue;
                    }
                    Err(e) => {
                        self.rollback(&attrs.namespace, &committed).await;
                        return Err(internal(e));
                    }
                }
            }
        }
        Ok(())
    }

    /// Undo charges already applied in this request, newest first. A failure
    /// here is logged and left for the reconciler's full recount to correct.
    async fn rollback(&self, namespace: &str, committed: &[(String, ResourceList)]) {
        for (name, masked_delta) in committed.iter().rev() {
            let refund = async {
                let current = self.accessor.get_quota(name).await?;
                let new_total = quantity::max_zero(&quantity::subtract(
                    &current.quota.status.total.used,
                    masked_delta,
                ));
                self.accessor
                    .update_quota_status(name, namespace, &new_total)
                    .await
            };
            if let Err(e) = refund.await {
                warn!(
                    "Failed to roll back charge on quota '{}': {} (reconciler will correct)",
                    name, e
                );
            }
        }
    }
}

/// Denial message naming every offending resource with requested, used, and
/// limit amounts, or `None` if the delta fits.
fn exceeded_message(
    quota: &pkg_types::quota::ClusterQuota,
    masked_delta: &ResourceList,
) -> Option<String> {
    let mut offenders = Vec::new();
    for (name, delta) in masked_delta {
        if delta.is_zero() || delta.is_negative() {
            continue;
        }
        let Some(hard) = quota.spec.hard.get(name) else {
            continue;
        };
        let used = quota
            .status
            .total
            .used
            .get(name)
            .copied()
            .unwrap_or_default();
        if used.add(*delta) > *hard {
            offenders.push(format!(
                "{}: requested={}, used={}, limited={}",
                name, delta, used, hard
            ));
        }
    }
    if offenders.is_empty() {
        None
    } else {
        Some(format!(
            "exceeded quota '{}': {}",
            quota.name,
            offenders.join(", ")
        ))
    }
}
