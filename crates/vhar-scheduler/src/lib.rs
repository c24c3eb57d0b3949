//! External scheduler port: job descriptors, the adapter contract and its
//! implementations (in-memory fake, hosted REST scheduler, in-process cron).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use vhar_core::HarvestError;

mod cloud;
mod local;

pub use cloud::{CloudSchedulerAdapter, CloudSchedulerConfig};
pub use local::LocalCronAdapter;

pub const CRATE_NAME: &str = "vhar-scheduler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
        }
    }

    /// Only these methods carry a request body on the job's http target.
    pub fn allows_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            other => Err(SchedulerError::InvalidArgument(format!("unsupported http method `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpTarget {
    pub uri: String,
    pub http_method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// What the reconciler asks the scheduler to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Fully-qualified job name.
    pub name: String,
    pub description: Option<String>,
    /// Five-field cron expression.
    pub schedule: String,
    pub time_zone: String,
    pub http_target: HttpTarget,
}

/// The scheduler's view of an existing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJobHandle {
    pub fully_qualified_name: String,
    pub schedule: String,
    pub time_zone: String,
    pub http_target: Option<HttpTarget>,
}

impl From<&JobDescriptor> for ScheduledJobHandle {
    fn from(descriptor: &JobDescriptor) -> Self {
        Self {
            fully_qualified_name: descriptor.name.clone(),
            schedule: descriptor.schedule.clone(),
            time_zone: descriptor.time_zone.clone(),
            http_target: Some(descriptor.http_target.clone()),
        }
    }
}

/// Typed adapter outcome. `NotFound` is the stable "job absent" signal the
/// reconciler branches on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job already exists: {0}")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
    #[error("invalid job request: {0}")]
    InvalidArgument(String),
    #[error("scheduler error: {0}")]
    Internal(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl SchedulerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<SchedulerError> for HarvestError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::NotFound(m) => HarvestError::NotFound(m),
            SchedulerError::AlreadyExists(m) => HarvestError::Conflict(m),
            SchedulerError::InvalidArgument(m) => HarvestError::InvalidArgument(m),
            SchedulerError::Unavailable(m) => HarvestError::Unavailable(m),
            SchedulerError::Cancelled(m) => HarvestError::Cancelled(m),
            other @ (SchedulerError::PermissionDenied(_) | SchedulerError::Internal(_)) => {
                HarvestError::Internal(other.to_string())
            }
        }
    }
}

/// Stateless translation onto a hosted scheduler. Retries and backoff are the
/// caller's concern.
#[async_trait]
pub trait SchedulerAdapter: Send + Sync {
    fn backend_tag(&self) -> &'static str;

    async fn get_job(&self, name: &str) -> Result<ScheduledJobHandle, SchedulerError>;

    async fn create_job(&self, descriptor: &JobDescriptor) -> Result<ScheduledJobHandle, SchedulerError>;

    async fn delete_job(&self, name: &str) -> Result<(), SchedulerError>;
}

/// Project/location pair that scopes job names on the hosted scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobNamespace {
    pub project_id: String,
    pub location_id: String,
}

impl JobNamespace {
    pub fn new(project_id: impl Into<String>, location_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            location_id: location_id.into(),
        }
    }

    pub fn parent(&self) -> String {
        format!("projects/{}/locations/{}", self.project_id, self.location_id)
    }

    pub fn job_name(&self, job_id: &str) -> String {
        format!("{}/jobs/{job_id}", self.parent())
    }
}

/// `projects/p/locations/l/jobs/x` -> `projects/p/locations/l`.
pub fn parent_of(job_name: &str) -> Option<&str> {
    job_name.rsplit_once("/jobs/").map(|(parent, _)| parent)
}

/// Trailing job id of a fully-qualified name, or the name itself.
pub fn job_id_of(job_name: &str) -> &str {
    job_name.rsplit_once("/jobs/").map_or(job_name, |(_, id)| id)
}

#[derive(Debug, Clone)]
enum FailurePlan {
    Always(SchedulerError),
    Times(usize, SchedulerError),
}

impl FailurePlan {
    /// Returns the error to inject for this call, consuming one use.
    fn next(&mut self) -> Option<SchedulerError> {
        match self {
            Self::Always(err) => Some(err.clone()),
            Self::Times(0, _) => None,
            Self::Times(n, err) => {
                *n -= 1;
                Some(err.clone())
            }
        }
    }
}

/// Scheduler fake keyed by job id (the last segment of the job name), with
/// call counters and scripted failures.
#[derive(Debug, Default)]
pub struct InMemoryScheduler {
    jobs: Mutex<BTreeMap<String, ScheduledJobHandle>>,
    get_failures: Mutex<HashMap<String, FailurePlan>>,
    create_failures: Mutex<HashMap<String, FailurePlan>>,
    create_attempts: Mutex<HashMap<String, usize>>,
    get_calls: AtomicUsize,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_creates(&self, job_id: &str, err: SchedulerError) {
        self.create_failures
            .lock()
            .await
            .insert(job_id.to_string(), FailurePlan::Always(err));
    }

    pub async fn fail_creates_times(&self, job_id: &str, times: usize, err: SchedulerError) {
        self.create_failures
            .lock()
            .await
            .insert(job_id.to_string(), FailurePlan::Times(times, err));
    }

    pub async fn fail_gets(&self, job_id: &str, err: SchedulerError) {
        self.get_failures
            .lock()
            .await
            .insert(job_id.to_string(), FailurePlan::Always(err));
    }

    pub async fn insert(&self, handle: ScheduledJobHandle) {
        self.jobs
            .lock()
            .await
            .insert(job_id_of(&handle.fully_qualified_name).to_string(), handle);
    }

    pub async fn job_ids(&self) -> Vec<String> {
        self.jobs.lock().await.keys().cloned().collect()
    }

    pub async fn job(&self, job_id: &str) -> Option<ScheduledJobHandle> {
        self.jobs.lock().await.get(job_id).cloned()
    }

    pub async fn create_attempts(&self, job_id: &str) -> usize {
        self.create_attempts.lock().await.get(job_id).copied().unwrap_or(0)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchedulerAdapter for InMemoryScheduler {
    fn backend_tag(&self) -> &'static str {
        "memory"
    }

    async fn get_job(&self, name: &str) -> Result<ScheduledJobHandle, SchedulerError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let job_id = job_id_of(name);
        if let Some(err) = self.get_failures.lock().await.get_mut(job_id).and_then(FailurePlan::next) {
            return Err(err);
        }
        self.jobs
            .lock()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))
    }

    async fn create_job(&self, descriptor: &JobDescriptor) -> Result<ScheduledJobHandle, SchedulerError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let job_id = job_id_of(&descriptor.name).to_string();
        *self.create_attempts.lock().await.entry(job_id.clone()).or_default() += 1;
        if let Some(err) = self
            .create_failures
            .lock()
            .await
            .get_mut(&job_id)
            .and_then(FailurePlan::next)
        {
            return Err(err);
        }
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job_id) {
            return Err(SchedulerError::AlreadyExists(descriptor.name.clone()));
        }
        let handle = ScheduledJobHandle::from(descriptor);
        jobs.insert(job_id, handle.clone());
        Ok(handle)
    }

    async fn delete_job(&self, name: &str) -> Result<(), SchedulerError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.jobs
            .lock()
            .await
            .remove(job_id_of(name))
            .map(|_| ())
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
pub(crate) fn sample_descriptor(name: &str) -> JobDescriptor {
    JobDescriptor {
        name: name.to_string(),
        description: Some("hourly weather pull".into()),
        schedule: "0 * * * *".into(),
        time_zone: "America/Los_Angeles".into(),
        http_target: HttpTarget {
            uri: "https://harvester.example/ingest/weather".into(),
            http_method: HttpMethod::Post,
            headers: BTreeMap::from([("Content-Type".to_string(), "application/json".to_string())]),
            body: Some(r#"{"source":"weather"}"#.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_builds_fully_qualified_names() {
        let ns = JobNamespace::new("vineyards-prod", "us-west1");
        let name = ns.job_name("satellite-imagery");
        assert_eq!(name, "projects/vineyards-prod/locations/us-west1/jobs/satellite-imagery");
        assert_eq!(parent_of(&name), Some("projects/vineyards-prod/locations/us-west1"));
        assert_eq!(job_id_of(&name), "satellite-imagery");
        assert_eq!(job_id_of("bare"), "bare");
    }

    #[test]
    fn only_mutating_methods_allow_bodies() {
        assert!(!HttpMethod::Get.allows_body());
        assert!(HttpMethod::Post.allows_body());
        assert!(HttpMethod::Put.allows_body());
        assert!(HttpMethod::Patch.allows_body());
        assert_eq!("patch".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert!("DELETE".parse::<HttpMethod>().is_err());
    }

    #[tokio::test]
    async fn fake_reports_not_found_then_finds_created_job() {
        let fake = InMemoryScheduler::new();
        let name = "projects/p/locations/l/jobs/weather";
        assert!(fake.get_job(name).await.unwrap_err().is_not_found());

        fake.create_job(&sample_descriptor(name)).await.unwrap();
        let handle = fake.get_job(name).await.unwrap();
        assert_eq!(handle.fully_qualified_name, name);
        assert_eq!(
            fake.create_job(&sample_descriptor(name)).await.unwrap_err(),
            SchedulerError::AlreadyExists(name.to_string())
        );

        fake.delete_job(name).await.unwrap();
        assert!(fake.delete_job(name).await.unwrap_err().is_not_found());
        assert_eq!(fake.get_calls(), 2);
        assert_eq!(fake.create_calls(), 2);
        assert_eq!(fake.delete_calls(), 2);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let fake = InMemoryScheduler::new();
        let name = "projects/p/locations/l/jobs/soil";
        fake.fail_creates_times("soil", 2, SchedulerError::Unavailable("503".into()))
            .await;
        assert!(fake.create_job(&sample_descriptor(name)).await.is_err());
        assert!(fake.create_job(&sample_descriptor(name)).await.is_err());
        assert!(fake.create_job(&sample_descriptor(name)).await.is_ok());
        assert_eq!(fake.create_attempts("soil").await, 3);
    }

    #[test]
    fn scheduler_errors_map_onto_the_harvest_taxonomy() {
        use vhar_core::ErrorKind;
        let err: HarvestError = SchedulerError::Unavailable("timeout".into()).into();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        let err: HarvestError = SchedulerError::NotFound("x".into()).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err: HarvestError = SchedulerError::PermissionDenied("x".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
