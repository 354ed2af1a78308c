//! Error types for the CLI

use vault_sync_job::JobError;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "no context is currently set, use \"kubectl config use-context <context>\" to select a new one"
    )]
    NoCurrentContext,

    #[error("only one or none argument is allowed")]
    TooManyArguments,

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("could not read namespace {name}: {source}")]
    Namespace { name: String, source: kube::Error },

    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to encode yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation error: {message}")]
    Validation { message: String },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn kubeconfig(message: impl Into<String>) -> Self {
        Error::Kubeconfig(message.into())
    }
}
