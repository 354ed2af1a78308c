//! Sync Job lifecycle against the cluster
//!
//! Prunes finished Jobs left over from earlier runs, submits the new Job,
//! and optionally follows it until it succeeds, fails, or runs out of time.
//!
//! Observed state of a single run's Job: Created → Active → Succeeded/Failed.
//! Only the `succeeded` and `failed` counts gate the outcome; nothing here
//! changes a Job's state.
//!
//! Every API call is attempted exactly once. A watch the server ends
//! cleanly (watches are closed after a few minutes) is reopened from the
//! last seen resource version until the wait times out.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DeleteParams, ListParams, PostParams, WatchEvent, WatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::JobError;

/// Stream of watch events for sync Jobs
pub type JobEventStream = BoxStream<'static, Result<WatchEvent<Job>, kube::Error>>;

/// Trait abstracting the namespaced Job API
///
/// Allows the lifecycle logic to be tested without a cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobClient: Send + Sync {
    /// List Jobs matching a label selector
    async fn list(&self, label_selector: &str) -> Result<Vec<Job>, kube::Error>;

    /// Delete a Job and, in the foreground, its pods
    async fn delete(&self, name: &str) -> Result<(), kube::Error>;

    /// Create a Job
    async fn create(&self, job: &Job) -> Result<Job, kube::Error>;

    /// Open a watch on Jobs matching a label selector, starting after
    /// `resource_version` ("0" for the current state)
    async fn watch(
        &self,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<JobEventStream, kube::Error>;
}

/// Real Kubernetes client implementation
pub struct KubeJobClient {
    api: Api<Job>,
}

impl KubeJobClient {
    /// Create a client for Jobs in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl JobClient for KubeJobClient {
    async fn list(&self, label_selector: &str) -> Result<Vec<Job>, kube::Error> {
        let jobs = self
            .api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(jobs.items)
    }

    async fn delete(&self, name: &str) -> Result<(), kube::Error> {
        self.api.delete(name, &DeleteParams::foreground()).await?;
        Ok(())
    }

    async fn create(&self, job: &Job) -> Result<Job, kube::Error> {
        self.api.create(&PostParams::default(), job).await
    }

    async fn watch(
        &self,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<JobEventStream, kube::Error> {
        let events = self
            .api
            .watch(
                &WatchParams::default().labels(label_selector),
                resource_version,
            )
            .await?;
        Ok(events.boxed())
    }
}

/// Number of pods of a Job that are currently running
pub fn active_count(job: &Job) -> i32 {
    job.status.as_ref().and_then(|s| s.active).unwrap_or(0)
}

/// Check if a Job has at least one succeeded pod
pub fn is_job_succeeded(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .is_some_and(|n| n > 0)
}

/// Check if a Job has at least one failed pod
pub fn is_job_failed(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.failed)
        .is_some_and(|n| n > 0)
}

/// Lifecycle operations for sync Jobs in one namespace
pub struct JobLifecycle<C> {
    client: C,
}

impl<C: JobClient> JobLifecycle<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    /// The underlying Job API
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Delete every Job matching `label_selector` that has no active pods.
    ///
    /// Running Jobs are left alone. The first failed deletion aborts the
    /// prune. Returns the names of the deleted Jobs.
    pub async fn prune(&self, label_selector: &str) -> Result<Vec<String>, JobError> {
        let jobs = self
            .client
            .list(label_selector)
            .await
            .map_err(|e| JobError::cluster_api("list", label_selector, e))?;

        let mut deleted = Vec::new();
        for job in jobs {
            let name = job.name_any();
            if active_count(&job) > 0 {
                debug!(job = %name, "skipping active job");
                continue;
            }
            self.client
                .delete(&name)
                .await
                .map_err(|e| JobError::cluster_api("delete", &name, e))?;
            debug!(job = %name, "deleted finished job");
            deleted.push(name);
        }

        if !deleted.is_empty() {
            info!(count = deleted.len(), "pruned finished sync jobs");
        }
        Ok(deleted)
    }

    /// Create the Job.
    pub async fn submit(&self, job: &Job) -> Result<Job, JobError> {
        let name = job.name_any();
        let created = self
            .client
            .create(job)
            .await
            .map_err(|e| JobError::cluster_api("create", &name, e))?;
        info!(job = %name, "created sync job");
        Ok(created)
    }

    /// Follow the Jobs matching `label_selector` until one finishes.
    ///
    /// Returns `Ok` once a Job reports a succeeded pod, [`JobError::TaskFailed`]
    /// once one reports a failed pod, and [`JobError::Timeout`] if neither
    /// happens within `timeout`. The watch is dropped on return.
    pub async fn await_completion(
        &self,
        label_selector: &str,
        timeout: Duration,
    ) -> Result<(), JobError> {
        match tokio::time::timeout(timeout, self.follow(label_selector)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(selector = %label_selector, ?timeout, "gave up waiting for sync job");
                Err(JobError::Timeout(timeout))
            }
        }
    }

    /// Watch until a verdict, reopening streams the server closes cleanly.
    async fn follow(&self, label_selector: &str) -> Result<(), JobError> {
        let mut resource_version = "0".to_string();
        loop {
            let events = self
                .client
                .watch(label_selector, &resource_version)
                .await
                .map_err(|e| JobError::cluster_api("watch", label_selector, e))?;

            match observe(events, &mut resource_version).await? {
                Watch::Finished => return Ok(()),
                Watch::Closed => {
                    debug!(
                        selector = %label_selector,
                        %resource_version,
                        "watch closed, reopening"
                    );
                }
            }
        }
    }
}

/// How a single watch stream ended without an error
enum Watch {
    Finished,
    Closed,
}

/// Consume one watch stream, recording the last resource version seen.
async fn observe(
    mut events: JobEventStream,
    resource_version: &mut String,
) -> Result<Watch, JobError> {
    while let Some(event) = events.next().await {
        let job = match event {
            Ok(WatchEvent::Added(job))
            | Ok(WatchEvent::Modified(job))
            | Ok(WatchEvent::Deleted(job)) => job,
            Ok(WatchEvent::Bookmark(bookmark)) => {
                *resource_version = bookmark.metadata.resource_version;
                continue;
            }
            Ok(WatchEvent::Error(e)) => {
                return Err(JobError::Protocol(format!(
                    "{} ({}): {}",
                    e.reason, e.code, e.message
                )))
            }
            Err(e) => return Err(JobError::Protocol(e.to_string())),
        };

        if let Some(version) = job.resource_version() {
            *resource_version = version;
        }
        let name = job.name_any();
        if is_job_succeeded(&job) {
            info!(job = %name, "sync job succeeded");
            return Ok(Watch::Finished);
        }
        if is_job_failed(&job) {
            return Err(JobError::TaskFailed { job: name });
        }
        debug!(job = %name, active = active_count(&job), "sync job still running");
    }

    Ok(Watch::Closed)
}
