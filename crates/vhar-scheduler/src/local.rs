//! In-process cron backend for single-node deployments and development.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{job_id_of, HttpMethod, HttpTarget, JobDescriptor, ScheduledJobHandle, SchedulerAdapter, SchedulerError};

/// Fires each job's http target from a local `tokio-cron-scheduler`. Jobs
/// live only as long as the process; schedules are evaluated in UTC.
pub struct LocalCronAdapter {
    scheduler: JobScheduler,
    client: reqwest::Client,
    jobs: Mutex<HashMap<String, (Uuid, ScheduledJobHandle)>>,
}

fn internal(context: &str, err: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::Internal(format!("{context}: {err}"))
}

/// The cron engine wants a leading seconds field.
fn with_seconds(schedule: &str) -> String {
    format!("0 {}", schedule.trim())
}

fn reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
    }
}

async fn fire(client: reqwest::Client, job: String, target: HttpTarget) {
    let mut req = client.request(reqwest_method(target.http_method), &target.uri);
    for (name, value) in &target.headers {
        req = req.header(name, value);
    }
    if let Some(body) = target.body.filter(|_| target.http_method.allows_body()) {
        req = req.body(body);
    }
    match req.send().await {
        Ok(resp) if resp.status().is_success() => {
            debug!(job = %job, status = %resp.status(), "local cron job delivered");
        }
        Ok(resp) => warn!(job = %job, status = %resp.status(), "local cron target answered with an error"),
        Err(err) => warn!(job = %job, error = %err, "local cron target unreachable"),
    }
}

impl LocalCronAdapter {
    pub async fn new() -> Result<Self, SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|err| internal("creating cron scheduler", err))?;
        Ok(Self {
            scheduler,
            client: reqwest::Client::new(),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.scheduler
            .start()
            .await
            .map_err(|err| internal("starting cron scheduler", err))
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

#[async_trait]
impl SchedulerAdapter for LocalCronAdapter {
    fn backend_tag(&self) -> &'static str {
        "local"
    }

    async fn get_job(&self, name: &str) -> Result<ScheduledJobHandle, SchedulerError> {
        self.jobs
            .lock()
            .await
            .get(job_id_of(name))
            .map(|(_, handle)| handle.clone())
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))
    }

    async fn create_job(&self, descriptor: &JobDescriptor) -> Result<ScheduledJobHandle, SchedulerError> {
        let job_id = job_id_of(&descriptor.name).to_string();
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job_id) {
            return Err(SchedulerError::AlreadyExists(descriptor.name.clone()));
        }
        if !descriptor.time_zone.eq_ignore_ascii_case("UTC") {
            warn!(job = %job_id, time_zone = %descriptor.time_zone, "local cron runs in UTC; time zone ignored");
        }

        let client = self.client.clone();
        let target = descriptor.http_target.clone();
        let label = job_id.clone();
        let job = Job::new_async(with_seconds(&descriptor.schedule).as_str(), move |_uuid, _sched| {
            Box::pin(fire(client.clone(), label.clone(), target.clone()))
        })
        .map_err(|err| {
            SchedulerError::InvalidArgument(format!("schedule `{}` for {job_id}: {err}", descriptor.schedule))
        })?;
        let uuid = self
            .scheduler
            .add(job)
            .await
            .map_err(|err| internal("adding cron job", err))?;

        let handle = ScheduledJobHandle::from(descriptor);
        jobs.insert(job_id.clone(), (uuid, handle.clone()));
        info!(job = %job_id, schedule = %descriptor.schedule, "local cron job registered");
        Ok(handle)
    }

    async fn delete_job(&self, name: &str) -> Result<(), SchedulerError> {
        let (uuid, _) = self
            .jobs
            .lock()
            .await
            .remove(job_id_of(name))
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;
        self.scheduler
            .remove(&uuid)
            .await
            .map_err(|err| internal("removing cron job", err))
    }
}
