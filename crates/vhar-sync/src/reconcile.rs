use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use vhar_scheduler::{HttpTarget, JobDescriptor, JobNamespace, SchedulerAdapter, SchedulerError};

use crate::{normalize_job_name, DataSourceConfig, DataSourceRegistry, Sleeper, TokioSleeper};

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Sources whose job exists after this run.
    pub succeeded: BTreeSet<String>,
    /// Subset of `succeeded` created during this run.
    pub created: BTreeSet<String>,
    /// Last error per source that could not be reconciled.
    pub failed: BTreeMap<String, SchedulerError>,
}

impl ReconcileReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub pruned: BTreeSet<String>,
    pub failed: BTreeMap<String, SchedulerError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Existing,
    Created,
}

/// Makes the scheduler's job set match the enabled sources of a registry.
///
/// Not re-entrant: callers serialize runs. Sources are reconciled with up to
/// `parallelism` in flight and fail independently.
pub struct Reconciler {
    adapter: Arc<dyn SchedulerAdapter>,
    sleeper: Arc<dyn Sleeper>,
    namespace: JobNamespace,
    cancel: CancellationToken,
    parallelism: usize,
}

impl Reconciler {
    pub fn new(adapter: Arc<dyn SchedulerAdapter>, namespace: JobNamespace) -> Self {
        Self {
            adapter,
            sleeper: Arc::new(TokioSleeper),
            namespace,
            cancel: CancellationToken::new(),
            parallelism: 1,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn job_name(&self, source_name: &str) -> String {
        self.namespace.job_name(&normalize_job_name(source_name))
    }

    pub fn build_descriptor(&self, source: &DataSourceConfig) -> JobDescriptor {
        let mut headers = source.headers.clone();
        let body = source
            .body
            .clone()
            .filter(|_| source.http_method.allows_body());
        if body.is_some() && !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }
        let time_zone = if source.time_zone.trim().is_empty() {
            "UTC".to_string()
        } else {
            source.time_zone.clone()
        };
        JobDescriptor {
            name: self.job_name(&source.name),
            description: source.description.clone(),
            schedule: source.schedule.clone(),
            time_zone,
            http_target: HttpTarget {
                uri: source.endpoint.clone(),
                http_method: source.http_method,
                headers,
                body,
            },
        }
    }

    pub async fn reconcile_all(&self, registry: &DataSourceRegistry) -> ReconcileReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("reconcile", %run_id, backend = self.adapter.backend_tag());

        let results: Vec<(String, Result<Outcome, SchedulerError>)> = async {
            stream::iter(registry.enabled())
                .map(|source| async move {
                    let result = self
                        .reconcile_source(source)
                        .instrument(info_span!("reconcile_source", source = %source.name))
                        .await;
                    (source.name.clone(), result)
                })
                .buffer_unordered(self.parallelism)
                .collect()
                .await
        }
        .instrument(span.clone())
        .await;

        let mut report = ReconcileReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            succeeded: BTreeSet::new(),
            created: BTreeSet::new(),
            failed: BTreeMap::new(),
        };
        for (name, result) in results {
            match result {
                Ok(outcome) => {
                    if outcome == Outcome::Created {
                        report.created.insert(name.clone());
                    }
                    report.succeeded.insert(name);
                }
                Err(err) => {
                    report.failed.insert(name, err);
                }
            }
        }
        span.in_scope(|| {
            info!(
                succeeded = report.succeeded.len(),
                created = report.created.len(),
                failed = report.failed.len(),
                "reconciliation finished"
            )
        });
        report
    }

    /// Deletes the job of every disabled source. A job that is already gone
    /// counts as pruned.
    pub async fn prune_disabled(&self, registry: &DataSourceRegistry) -> PruneReport {
        let mut report = PruneReport::default();
        for source in registry.disabled() {
            let job_name = self.job_name(&source.name);
            match self.guarded(self.adapter.delete_job(&job_name)).await {
                Ok(()) => {
                    info!(source = %source.name, job = %job_name, "pruned job of disabled source");
                    report.pruned.insert(source.name.clone());
                }
                Err(err) if err.is_not_found() => {
                    report.pruned.insert(source.name.clone());
                }
                Err(err) => {
                    warn!(source = %source.name, job = %job_name, error = %err, "prune failed");
                    report.failed.insert(source.name.clone(), err);
                }
            }
        }
        report
    }

    async fn reconcile_source(&self, source: &DataSourceConfig) -> Result<Outcome, SchedulerError> {
        source
            .validate()
            .map_err(|err| SchedulerError::InvalidArgument(err.to_string()))?;
        let descriptor = self.build_descriptor(source);

        match self.guarded(self.adapter.get_job(&descriptor.name)).await {
            Ok(_) => {
                info!(job = %descriptor.name, "job already present");
                return Ok(Outcome::Existing);
            }
            Err(err) if err.is_not_found() => {}
            Err(err @ SchedulerError::Cancelled(_)) => return Err(err),
            Err(err) => {
                warn!(job = %descriptor.name, error = %err, "job lookup failed; attempting creation");
            }
        }

        self.create_with_retry(source, &descriptor).await
    }

    async fn create_with_retry(
        &self,
        source: &DataSourceConfig,
        descriptor: &JobDescriptor,
    ) -> Result<Outcome, SchedulerError> {
        let policy = source.effective_retry_policy();
        let attempts = policy.max_attempts();
        let mut attempt = 0;
        loop {
            let err = match self.guarded(self.adapter.create_job(descriptor)).await {
                Ok(_) => {
                    info!(job = %descriptor.name, attempt, "job created");
                    return Ok(Outcome::Created);
                }
                Err(SchedulerError::AlreadyExists(_)) => {
                    info!(job = %descriptor.name, "job created concurrently");
                    return Ok(Outcome::Existing);
                }
                Err(err @ (SchedulerError::InvalidArgument(_) | SchedulerError::Cancelled(_))) => return Err(err),
                Err(err) => err,
            };
            if attempt + 1 >= attempts {
                warn!(job = %descriptor.name, attempts, error = %err, "giving up on job creation");
                return Err(err);
            }

            let delay = policy.delay_for_attempt(attempt);
            warn!(
                job = %descriptor.name,
                attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "job creation failed; backing off"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(SchedulerError::Cancelled(format!(
                        "cancelled while backing off after: {err}"
                    )));
                }
                _ = self.sleeper.sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn guarded<T>(&self, call: impl Future<Output = Result<T, SchedulerError>>) -> Result<T, SchedulerError> {
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled("reconciliation cancelled".into()));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SchedulerError::Cancelled("reconciliation cancelled".into())),
            result = call => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vhar_scheduler::{HttpMethod, InMemoryScheduler};

    use super::*;
    use crate::{RecordingSleeper, RetryPolicy};

    fn reconciler(fake: Arc<InMemoryScheduler>) -> Reconciler {
        Reconciler::new(fake, JobNamespace::new("p", "l")).with_sleeper(Arc::new(RecordingSleeper::new()))
    }

    #[test]
    fn descriptor_drops_body_for_get_and_defaults_time_zone() {
        let r = reconciler(Arc::new(InMemoryScheduler::new()));
        let mut source = DataSourceConfig::new("Canopy Sensors", "*/15 * * * *", "https://soil.example");
        source.body = Some("{}".into());

        let get = r.build_descriptor(&source);
        assert_eq!(get.name, "projects/p/locations/l/jobs/canopy-sensors");
        assert_eq!(get.time_zone, "UTC");
        assert!(get.http_target.body.is_none());
        assert!(get.http_target.headers.is_empty());

        source.http_method = HttpMethod::Put;
        source.time_zone = "Europe/Paris".into();
        let put = r.build_descriptor(&source);
        assert_eq!(put.http_target.body.as_deref(), Some("{}"));
        assert_eq!(put.time_zone, "Europe/Paris");
        assert_eq!(
            put.http_target.headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn invalid_sources_fail_without_touching_the_scheduler() {
        let fake = Arc::new(InMemoryScheduler::new());
        let registry = DataSourceRegistry::new([DataSourceConfig::new("weather", "hourly", "https://w.example")]);
        let report = reconciler(fake.clone()).reconcile_all(&registry).await;
        assert!(matches!(report.failed.get("weather"), Some(SchedulerError::InvalidArgument(_))));
        assert_eq!(fake.get_calls(), 0);
        assert_eq!(fake.create_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_argument_from_create_is_not_retried() {
        let fake = Arc::new(InMemoryScheduler::new());
        fake.fail_creates("weather", SchedulerError::InvalidArgument("bad cron".into()))
            .await;
        let mut source = DataSourceConfig::new("weather", "0 * * * *", "https://w.example");
        source.retry_policy = Some(RetryPolicy::new(3, Duration::from_secs(1)));
        let report = reconciler(fake.clone())
            .reconcile_all(&DataSourceRegistry::new([source]))
            .await;
        assert!(report.failed.contains_key("weather"));
        assert_eq!(fake.create_attempts("weather").await, 1);
    }

    #[tokio::test]
    async fn already_exists_on_create_counts_as_success() {
        let fake = Arc::new(InMemoryScheduler::new());
        fake.fail_gets("weather", SchedulerError::Unavailable("flaky".into())).await;
        fake.fail_creates("weather", SchedulerError::AlreadyExists("weather".into()))
            .await;
        let registry = DataSourceRegistry::new([DataSourceConfig::new("weather", "0 * * * *", "https://w.example")]);
        let report = reconciler(fake).reconcile_all(&registry).await;
        assert!(report.succeeded.contains("weather"));
        assert!(report.created.is_empty());
    }

    #[tokio::test]
    async fn prune_removes_disabled_jobs_and_tolerates_missing_ones() {
        let fake = Arc::new(InMemoryScheduler::new());
        let r = reconciler(fake.clone());
        let mut soil = DataSourceConfig::new("soil", "0 6 * * *", "https://soil.example");
        let mut pests = DataSourceConfig::new("pests", "0 7 * * *", "https://pests.example");
        r.reconcile_all(&DataSourceRegistry::new([soil.clone()])).await;
        assert_eq!(fake.job_ids().await, vec!["soil".to_string()]);

        soil.enabled = false;
        pests.enabled = false;
        let report = r.prune_disabled(&DataSourceRegistry::new([soil, pests])).await;
        assert_eq!(report.pruned.len(), 2);
        assert!(report.failed.is_empty());
        assert!(fake.job_ids().await.is_empty());
    }
}
