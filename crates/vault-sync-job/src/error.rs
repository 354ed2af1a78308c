//! Job orchestration error types

use std::time::Duration;

/// Errors raised while resolving, submitting, or observing a sync Job
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// A mandatory setting was neither passed on the command line nor
    /// annotated on the namespace
    #[error(
        "namespace {namespace} is not configured for vault synchronization: annotation {annotation} not found"
    )]
    MissingConfiguration {
        /// Namespace whose annotations were consulted
        namespace: String,
        /// Annotation key that would have supplied the value
        annotation: String,
    },

    /// A list, delete, create, or watch call against the Job API failed
    #[error("could not {operation} batch job {job}: {source}")]
    ClusterApi {
        /// Verb of the failed call (list, delete, create, watch)
        operation: &'static str,
        /// Job name, or the label selector for list/watch calls
        job: String,
        source: kube::Error,
    },

    /// The submitted Job reported a failed pod
    #[error("{job} job failed")]
    TaskFailed { job: String },

    #[error("timeout {0:?} exceeded")]
    Timeout(Duration),

    /// The watch produced something other than a Job status update
    #[error("unexpected watch event: {0}")]
    Protocol(String),
}

impl JobError {
    pub(crate) fn missing(namespace: impl Into<String>, annotation: &str) -> Self {
        Self::MissingConfiguration {
            namespace: namespace.into(),
            annotation: annotation.to_string(),
        }
    }

    pub(crate) fn cluster_api(
        operation: &'static str,
        job: impl Into<String>,
        source: kube::Error,
    ) -> Self {
        Self::ClusterApi {
            operation,
            job: job.into(),
            source,
        }
    }
}
