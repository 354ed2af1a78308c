//! Vault sync Job orchestration
//!
//! Resolves the configuration of a sync run from command-line values and
//! namespace annotations, builds the Kubernetes Job that copies Vault
//! secrets into the namespace, and drives that Job on the cluster:
//! - [`config`]: precedence rules and validation of the run settings
//! - [`job`]: deterministic Job construction from composable options
//! - [`lifecycle`]: pruning of finished Jobs, submission, and waiting

pub mod config;
pub mod error;
pub mod job;
pub mod lifecycle;

pub use config::{resolve, Defaults, NamespaceMetadata, Overrides, RunConfig};
pub use error::JobError;
pub use lifecycle::{JobClient, JobLifecycle, KubeJobClient};
