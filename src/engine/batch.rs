// Batch executor contract and implementations

//! # Batch Executor
//!
//! The batch service queues and runs the jobs the scheduler submits. The
//! scheduler only needs four calls from it:
//!
//! - `submit_job`: name, job definition, queue, dependency list, env vars → job id
//! - `describe_job_definitions`: revisions registered under a name
//! - `describe_jobs`: current status of a set of jobs
//! - `cancel_job`: best-effort cancellation
//!
//! ## Implementations
//!
//! - [`InMemoryBatchExecutor`]: records every call and can be told to fail a
//!   given submission. Used by tests and by the admin CLI's dry runs.
//! - [`HttpBatchExecutor`]: JSON client for a batch gateway service.

use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::models::{
    BatchJobStatus, JobDefinition, JobDefinitionStatus, JobDescription, JobSubmission,
};
use crate::{Result, SchedulerError};

#[async_trait::async_trait]
pub trait BatchExecutor: Send + Sync {
    /// Submit a job and return its identifier
    async fn submit_job(&self, job: &JobSubmission) -> Result<String>;

    /// All revisions registered under `name` with the given status
    async fn describe_job_definitions(
        &self,
        name: &str,
        status: JobDefinitionStatus,
    ) -> Result<Vec<JobDefinition>>;

    /// Status of each known job. Unknown ids are left out of the result.
    async fn describe_jobs(&self, job_ids: &[String]) -> Result<Vec<JobDescription>>;

    async fn cancel_job(&self, job_id: &str, reason: &str) -> Result<()>;
}

/// In-memory batch executor
#[derive(Default)]
pub struct InMemoryBatchExecutor {
    jobs: DashMap<String, JobDescription>,
    definitions: DashMap<String, Vec<JobDefinition>>,
    submissions: RwLock<Vec<JobSubmission>>,
    cancelled: RwLock<Vec<String>>,
    attempts: AtomicUsize,
    /// 1-based submission attempt that fails; 0 disables
    fail_at: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryBatchExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job definition revision
    pub fn register_job_definition(&self, name: &str, revision: u32, status: JobDefinitionStatus) {
        let definition = JobDefinition {
            job_definition_name: name.to_string(),
            revision,
            job_definition_arn: format!("{}:{}", name, revision),
            status,
        };
        self.definitions
            .entry(name.to_string())
            .or_default()
            .push(definition);
    }

    /// Make the `n`th submission attempt (1-based) fail
    pub fn fail_submission_at(&self, n: usize) {
        self.fail_at.store(n, Ordering::SeqCst);
    }

    /// Make every call fail as if the service were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Record a job the service already knows about
    pub fn insert_job(&self, job_id: &str, job_name: &str, status: BatchJobStatus) {
        self.jobs.insert(
            job_id.to_string(),
            JobDescription {
                job_id: job_id.to_string(),
                job_name: job_name.to_string(),
                status,
                status_reason: None,
            },
        );
    }

    pub fn set_job_status(&self, job_id: &str, status: BatchJobStatus) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.status = status;
        }
    }

    /// Successful submissions in submission order
    pub fn submissions(&self) -> Vec<JobSubmission> {
        self.submissions
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn cancelled_jobs(&self) -> Vec<String> {
        self.cancelled.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Submission attempts, including failed ones
    pub fn submit_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulerError::ExternalService(
                "batch service unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BatchExecutor for InMemoryBatchExecutor {
    async fn submit_job(&self, job: &JobSubmission) -> Result<String> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.unavailable.load(Ordering::SeqCst) || attempt == self.fail_at.load(Ordering::SeqCst) {
            return Err(SchedulerError::JobSubmission {
                job_name: job.job_name.clone(),
                message: format!("submission {} rejected", attempt),
            });
        }

        let job_id = Uuid::new_v4().to_string();
        self.insert_job(&job_id, &job.job_name, BatchJobStatus::Submitted);
        self.submissions
            .write()
            .map_err(|_| SchedulerError::Internal("batch fake lock poisoned".to_string()))?
            .push(job.clone());
        debug!(job_id = %job_id, job_name = %job.job_name, "Recorded job submission");
        Ok(job_id)
    }

    async fn describe_job_definitions(
        &self,
        name: &str,
        status: JobDefinitionStatus,
    ) -> Result<Vec<JobDefinition>> {
        self.check_available()?;
        Ok(self
            .definitions
            .get(name)
            .map(|defs| defs.iter().filter(|d| d.status == status).cloned().collect())
            .unwrap_or_default())
    }

    async fn describe_jobs(&self, job_ids: &[String]) -> Result<Vec<JobDescription>> {
        self.check_available()?;
        Ok(job_ids
            .iter()
            .filter_map(|id| self.jobs.get(id).map(|job| job.value().clone()))
            .collect())
    }

    async fn cancel_job(&self, job_id: &str, reason: &str) -> Result<()> {
        self.check_available()?;
        debug!(job_id = %job_id, reason = %reason, "Cancelling job");
        self.set_job_status(job_id, BatchJobStatus::Failed);
        self.cancelled
            .write()
            .map_err(|_| SchedulerError::Internal("batch fake lock poisoned".to_string()))?
            .push(job_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SubmitJobResponse {
    job_id: String,
}

#[derive(Debug, Serialize)]
struct DescribeJobsRequest<'a> {
    job_ids: &'a [String],
}

#[derive(Debug, Serialize)]
struct CancelJobRequest<'a> {
    reason: &'a str,
}

/// JSON client for a batch gateway
///
/// Routes, relative to the configured endpoint:
///
/// | Call | Route |
/// |---|---|
/// | submit | `POST jobs` |
/// | definitions | `GET job-definitions?name=..&status=..` |
/// | describe | `POST jobs/describe` |
/// | cancel | `POST jobs/{id}/cancel` |
pub struct HttpBatchExecutor {
    client: Client,
    base_url: Url,
}

impl HttpBatchExecutor {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(endpoint)
            .map_err(|e| SchedulerError::InvalidInput(format!("bad batch endpoint {}: {}", endpoint, e)))?;
        // Url::join drops the last path segment unless it ends with '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchedulerError::ExternalService(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    fn route(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| SchedulerError::InvalidInput(format!("bad batch route {}: {}", path, e)))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulerError::ExternalService(format!(
                "batch gateway returned {}: {}",
                status, body
            )));
        }
        response
            .json()
            .await
            .map_err(|e| SchedulerError::ExternalService(format!("failed to parse batch response: {}", e)))
    }
}

#[async_trait::async_trait]
impl BatchExecutor for HttpBatchExecutor {
    async fn submit_job(&self, job: &JobSubmission) -> Result<String> {
        let url = self.route("jobs")?;
        let submission_error = |message: String| SchedulerError::JobSubmission {
            job_name: job.job_name.clone(),
            message,
        };

        let response = self
            .client
            .post(url)
            .json(job)
            .send()
            .await
            .map_err(|e| submission_error(e.to_string()))?;
        let body: SubmitJobResponse = Self::read_json(response)
            .await
            .map_err(|e| submission_error(e.to_string()))?;
        Ok(body.job_id)
    }

    async fn describe_job_definitions(
        &self,
        name: &str,
        status: JobDefinitionStatus,
    ) -> Result<Vec<JobDefinition>> {
        let mut url = self.route("job-definitions")?;
        let status = match status {
            JobDefinitionStatus::Active => "ACTIVE",
            JobDefinitionStatus::Inactive => "INACTIVE",
        };
        url.query_pairs_mut()
            .append_pair("name", name)
            .append_pair("status", status);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SchedulerError::ExternalService(e.to_string()))?;
        Self::read_json(response).await
    }

    async fn describe_jobs(&self, job_ids: &[String]) -> Result<Vec<JobDescription>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.route("jobs/describe")?;
        let response = self
            .client
            .post(url)
            .json(&DescribeJobsRequest { job_ids })
            .send()
            .await
            .map_err(|e| SchedulerError::ExternalService(e.to_string()))?;
        Self::read_json(response).await
    }

    async fn cancel_job(&self, job_id: &str, reason: &str) -> Result<()> {
        let url = self.route(&format!("jobs/{}/cancel", job_id))?;
        let response = self
            .client
            .post(url)
            .json(&CancelJobRequest { reason })
            .send()
            .await
            .map_err(|e| SchedulerError::ExternalService(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SchedulerError::ExternalService(format!(
                "cancel of {} returned {}",
                job_id,
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(name: &str) -> JobSubmission {
        JobSubmission {
            job_name: name.to_string(),
            job_definition: "redshift_engine_prod:1".to_string(),
            job_queue: "default".to_string(),
            depends_on: vec![],
            environment: vec![],
        }
    }

    #[tokio::test]
    async fn test_in_memory_fails_requested_attempt() {
        let executor = InMemoryBatchExecutor::new();
        executor.fail_submission_at(2);

        assert!(executor.submit_job(&submission("a")).await.is_ok());
        let err = executor.submit_job(&submission("b")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobSubmission { .. }));
        assert!(executor.submit_job(&submission("c")).await.is_ok());

        assert_eq!(executor.submit_attempts(), 3);
        assert_eq!(executor.submissions().len(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_filters_definitions_by_status() {
        let executor = InMemoryBatchExecutor::new();
        executor.register_job_definition("emr_engine_prod", 1, JobDefinitionStatus::Active);
        executor.register_job_definition("emr_engine_prod", 2, JobDefinitionStatus::Inactive);

        let active = executor
            .describe_job_definitions("emr_engine_prod", JobDefinitionStatus::Active)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].revision, 1);
    }

    #[tokio::test]
    async fn test_describe_skips_unknown_jobs() {
        let executor = InMemoryBatchExecutor::new();
        executor.insert_job("j1", "load", BatchJobStatus::Running);

        let jobs = executor
            .describe_jobs(&["j1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, BatchJobStatus::Running);
    }

    #[test]
    fn test_http_routes_keep_base_path() {
        let executor = HttpBatchExecutor::new("http://batch.local/api/v1", Duration::from_secs(5)).unwrap();
        assert_eq!(
            executor.route("jobs/describe").unwrap().as_str(),
            "http://batch.local/api/v1/jobs/describe"
        );
    }

    #[test]
    fn test_http_rejects_bad_endpoint() {
        assert!(HttpBatchExecutor::new("not a url", Duration::from_secs(5)).is_err());
    }
}
