//! REST adapter for a hosted scheduler speaking the Cloud Scheduler v1 API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{parent_of, HttpMethod, HttpTarget, JobDescriptor, ScheduledJobHandle, SchedulerAdapter, SchedulerError};

#[derive(Debug, Clone)]
pub struct CloudSchedulerConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    pub timeout: Duration,
}

impl Default for CloudSchedulerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://cloudscheduler.googleapis.com/v1".to_string(),
            access_token: None,
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CloudSchedulerAdapter {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireJob {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    schedule: String,
    #[serde(default)]
    time_zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    http_target: Option<WireHttpTarget>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHttpTarget {
    uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    http_method: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
    /// Base64-encoded request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

impl From<&JobDescriptor> for WireJob {
    fn from(descriptor: &JobDescriptor) -> Self {
        let target = &descriptor.http_target;
        Self {
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            schedule: descriptor.schedule.clone(),
            time_zone: descriptor.time_zone.clone(),
            http_target: Some(WireHttpTarget {
                uri: target.uri.clone(),
                http_method: Some(target.http_method.as_str().to_string()),
                headers: target.headers.clone(),
                body: target.body.as_ref().map(|b| BASE64.encode(b.as_bytes())),
            }),
        }
    }
}

impl WireJob {
    fn into_handle(self) -> ScheduledJobHandle {
        let http_target = self.http_target.map(|t| HttpTarget {
            uri: t.uri,
            http_method: t
                .http_method
                .as_deref()
                .and_then(|m| m.parse::<HttpMethod>().ok())
                .unwrap_or_default(),
            headers: t.headers,
            body: t
                .body
                .and_then(|b| BASE64.decode(b).ok())
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
        });
        ScheduledJobHandle {
            fully_qualified_name: self.name,
            schedule: self.schedule,
            time_zone: self.time_zone,
            http_target,
        }
    }
}

pub fn classify_status(status: StatusCode, context: &str) -> SchedulerError {
    let msg = format!("{context}: http status {status}");
    match status {
        StatusCode::NOT_FOUND => SchedulerError::NotFound(msg),
        StatusCode::CONFLICT => SchedulerError::AlreadyExists(msg),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SchedulerError::PermissionDenied(msg),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => SchedulerError::InvalidArgument(msg),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS || s == StatusCode::REQUEST_TIMEOUT => {
            SchedulerError::Unavailable(msg)
        }
        _ => SchedulerError::Internal(msg),
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error, context: &str) -> SchedulerError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        SchedulerError::Unavailable(format!("{context}: {err}"))
    } else if err.is_decode() {
        SchedulerError::Internal(format!("{context}: decoding response: {err}"))
    } else {
        SchedulerError::Internal(format!("{context}: {err}"))
    }
}

impl CloudSchedulerAdapter {
    pub fn new(config: CloudSchedulerConfig) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| SchedulerError::Internal(format!("building http client: {err}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, context: &str) -> Result<reqwest::Response, SchedulerError> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err, context))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        Err(classify_status(status, context))
    }

    async fn decode_job(resp: reqwest::Response, context: &str) -> Result<ScheduledJobHandle, SchedulerError> {
        resp.json::<WireJob>()
            .await
            .map(WireJob::into_handle)
            .map_err(|err| classify_reqwest_error(&err, context))
    }
}

#[async_trait]
impl SchedulerAdapter for CloudSchedulerAdapter {
    fn backend_tag(&self) -> &'static str {
        "cloud"
    }

    async fn get_job(&self, name: &str) -> Result<ScheduledJobHandle, SchedulerError> {
        let context = format!("getting job {name}");
        let resp = self.send(self.client.get(self.url(name)), &context).await?;
        Self::decode_job(resp, &context).await
    }

    async fn create_job(&self, descriptor: &JobDescriptor) -> Result<ScheduledJobHandle, SchedulerError> {
        let parent = parent_of(&descriptor.name).ok_or_else(|| {
            SchedulerError::InvalidArgument(format!("job name `{}` is not fully qualified", descriptor.name))
        })?;
        let context = format!("creating job {}", descriptor.name);
        debug!(job = %descriptor.name, schedule = %descriptor.schedule, "posting job to hosted scheduler");
        let req = self
            .client
            .post(self.url(&format!("{parent}/jobs")))
            .json(&WireJob::from(descriptor));
        let resp = self.send(req, &context).await?;
        Self::decode_job(resp, &context).await
    }

    async fn delete_job(&self, name: &str) -> Result<(), SchedulerError> {
        let context = format!("deleting job {name}");
        self.send(self.client.delete(self.url(name)), &context).await?;
        Ok(())
    }
}
