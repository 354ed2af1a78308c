//! Sync Job construction
//!
//! Builds the Kubernetes Job that copies Vault secrets into the namespace.
//! The pod runs a `vault-auth` init container that logs into Vault and
//! writes a token into a shared in-memory volume, followed by a
//! `vault-sync` container that reads the token and synchronizes secrets.
//!
//! A Job starts from a fixed template and is shaped by an ordered list of
//! [`JobOption`]s. Environment variables are sorted by name once all options
//! are applied, so the result does not depend on option order.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, KeyToPath, PodSpec, PodTemplateSpec,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::{Defaults, RunConfig};

/// Base name of every sync Job, also the value of the [`JOB_LABEL`] label
pub const JOB_NAME: &str = "vault-sync";
/// Label carried by every sync Job
pub const JOB_LABEL: &str = "job";
/// Label carrying the per-run suffix
pub const SUFFIX_LABEL: &str = "jobSuffix";

const SERVICE_ACCOUNT: &str = "vault-auth";
const AUTH_CONTAINER: &str = "vault-auth";
const SYNC_CONTAINER: &str = "vault-sync";

const TOKEN_VOLUME: &str = "vault-token";
const TOKEN_DIR: &str = "/home/vault";
const TOKEN_PATH: &str = "/home/vault/.vault-token";

const TRUSTSTORE_VOLUME: &str = "truststore";
const TRUSTSTORE_KEY: &str = "truststore.pem";
const TRUSTSTORE_DIR: &str = "/etc/pki/vault";
const TRUSTSTORE_PATH: &str = "/etc/pki/vault/truststore.pem";

/// Separator between entries of `VAULT_SECRETS`
const SECRETS_SEPARATOR: &str = ",";

/// Format of the run suffix, one-second resolution
const SUFFIX_FORMAT: &str = "%Y%m%d-%H%M%S";

/// A single transformation of the Job template
pub type JobOption = Box<dyn FnOnce(Job) -> Job + Send>;

/// Selector matching every sync Job
pub fn job_selector() -> String {
    format!("{}={}", JOB_LABEL, JOB_NAME)
}

/// Selector matching only the Job of one run
pub fn run_selector(suffix: &str) -> String {
    format!("{},{}={}", job_selector(), SUFFIX_LABEL, suffix)
}

/// Run suffix for a Job started at `now`
pub fn run_suffix<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    now.format(SUFFIX_FORMAT).to_string()
}

/// Build a sync Job from the template and the given options.
pub fn new_job(options: impl IntoIterator<Item = JobOption>) -> Job {
    let mut job = options.into_iter().fold(template(), |job, opt| opt(job));

    let pod = pod_spec(&mut job);
    for container in pod
        .init_containers
        .iter_mut()
        .flatten()
        .chain(pod.containers.iter_mut())
    {
        if let Some(env) = container.env.as_mut() {
            env.sort_by(|a, b| a.name.cmp(&b.name));
        }
    }

    job
}

/// Build the Job for a resolved run configuration.
pub fn build(config: &RunConfig, run_suffix: &str, defaults: &Defaults) -> Job {
    new_job([
        with_suffix(run_suffix),
        with_ttl(defaults.ttl),
        with_backoff_limit(defaults.backoff_limit),
        with_authenticator_image(&config.auth_image),
        with_synchronizer_image(&config.sync_image),
        with_secret_prefix(&config.secret_prefix),
        with_vault_addr(&config.addr),
        with_vault_mount_path(&config.mount_path),
        with_vault_role(&config.role),
        with_vault_secrets([config.effective_secrets_path()]),
        with_truststore(&config.trust_secret),
    ])
}

fn template() -> Job {
    let token_mount = VolumeMount {
        name: TOKEN_VOLUME.to_string(),
        mount_path: TOKEN_DIR.to_string(),
        ..Default::default()
    };
    let token_env = env_var("VAULT_TOKEN_PATH", TOKEN_PATH);

    let container = |name: &str| Container {
        name: name.to_string(),
        image_pull_policy: Some("Always".to_string()),
        volume_mounts: Some(vec![token_mount.clone()]),
        env: Some(vec![token_env.clone()]),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(JOB_NAME.to_string()),
            labels: Some(BTreeMap::from([(
                JOB_LABEL.to_string(),
                JOB_NAME.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    service_account_name: Some(SERVICE_ACCOUNT.to_string()),
                    restart_policy: Some("Never".to_string()),
                    volumes: Some(vec![Volume {
                        name: TOKEN_VOLUME.to_string(),
                        empty_dir: Some(EmptyDirVolumeSource {
                            medium: Some("Memory".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    init_containers: Some(vec![container(AUTH_CONTAINER)]),
                    containers: vec![container(SYNC_CONTAINER)],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Set the init container's authenticator image.
pub fn with_authenticator_image(image: &str) -> JobOption {
    let image = image.to_string();
    Box::new(move |mut job| {
        if let Some(c) = auth_container(&mut job) {
            c.image = Some(image);
        }
        job
    })
}

/// Set the main container's synchronizer image.
pub fn with_synchronizer_image(image: &str) -> JobOption {
    let image = image.to_string();
    Box::new(move |mut job| {
        if let Some(c) = sync_container(&mut job) {
            c.image = Some(image);
        }
        job
    })
}

/// Vault address, needed by both containers.
pub fn with_vault_addr(addr: &str) -> JobOption {
    let env = env_var("VAULT_ADDR", addr);
    Box::new(move |mut job| {
        push_env(auth_container(&mut job), env.clone());
        push_env(sync_container(&mut job), env);
        job
    })
}

/// Mount path of the Kubernetes auth method in Vault.
pub fn with_vault_mount_path(path: &str) -> JobOption {
    let env = env_var("VAULT_AUTH_MOUNT_PATH", path);
    Box::new(move |mut job| {
        push_env(auth_container(&mut job), env);
        job
    })
}

/// Vault role used to log in.
pub fn with_vault_role(role: &str) -> JobOption {
    let env = env_var("VAULT_ROLE", role);
    Box::new(move |mut job| {
        push_env(auth_container(&mut job), env);
        job
    })
}

/// Vault paths to synchronize.
pub fn with_vault_secrets<I, S>(secrets: I) -> JobOption
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = secrets
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(SECRETS_SEPARATOR);
    let env = env_var("VAULT_SECRETS", &joined);
    Box::new(move |mut job| {
        push_env(sync_container(&mut job), env);
        job
    })
}

/// Prefix for the names of synchronized Kubernetes secrets.
///
/// The prefix always ends in `-`; one is appended if missing.
pub fn with_secret_prefix(prefix: &str) -> JobOption {
    let prefix = if prefix.ends_with('-') {
        prefix.to_string()
    } else {
        format!("{}-", prefix)
    };
    let env = env_var("SECRET_PREFIX", &prefix);
    Box::new(move |mut job| {
        push_env(sync_container(&mut job), env);
        job
    })
}

/// Trust Vault's certificate through a CA bundle from a Secret.
///
/// The Secret must hold the CA under `truststore.pem`. It is mounted
/// read-only into both containers and `VAULT_CACERT` points at it. An empty
/// name leaves the Job unchanged.
pub fn with_truststore(secret_name: &str) -> JobOption {
    let secret_name = secret_name.to_string();
    Box::new(move |mut job| {
        if secret_name.is_empty() {
            return job;
        }

        let volume = Volume {
            name: TRUSTSTORE_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name),
                items: Some(vec![KeyToPath {
                    key: TRUSTSTORE_KEY.to_string(),
                    path: TRUSTSTORE_KEY.to_string(),
                    mode: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mount = VolumeMount {
            name: TRUSTSTORE_VOLUME.to_string(),
            mount_path: TRUSTSTORE_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        };
        let env = env_var("VAULT_CACERT", TRUSTSTORE_PATH);

        pod_spec(&mut job)
            .volumes
            .get_or_insert_with(Vec::new)
            .push(volume);
        mount_truststore(auth_container(&mut job), &mount, &env);
        mount_truststore(sync_container(&mut job), &mount, &env);
        job
    })
}

/// Number of pod retries before the Job is marked failed.
pub fn with_backoff_limit(limit: i32) -> JobOption {
    Box::new(move |mut job| {
        job_spec(&mut job).backoff_limit = Some(limit);
        job
    })
}

/// How long a finished Job is kept before the cluster deletes it.
pub fn with_ttl(ttl: Duration) -> JobOption {
    let seconds = i32::try_from(ttl.as_secs()).unwrap_or(i32::MAX);
    Box::new(move |mut job| {
        job_spec(&mut job).ttl_seconds_after_finished = Some(seconds);
        job
    })
}

/// Append `-<suffix>` to the Job name and record the suffix as a label.
pub fn with_suffix(suffix: &str) -> JobOption {
    let suffix = suffix.to_string();
    Box::new(move |mut job| {
        let name = job.metadata.name.take().unwrap_or_default();
        job.metadata.name = Some(format!("{}-{}", name, suffix));
        job.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(SUFFIX_LABEL.to_string(), suffix);
        job
    })
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn push_env(container: Option<&mut Container>, env: EnvVar) {
    if let Some(c) = container {
        c.env.get_or_insert_with(Vec::new).push(env);
    }
}

fn mount_truststore(container: Option<&mut Container>, mount: &VolumeMount, env: &EnvVar) {
    if let Some(c) = container {
        c.volume_mounts
            .get_or_insert_with(Vec::new)
            .push(mount.clone());
        c.env.get_or_insert_with(Vec::new).push(env.clone());
    }
}

fn job_spec(job: &mut Job) -> &mut JobSpec {
    job.spec.get_or_insert_with(Default::default)
}

fn pod_spec(job: &mut Job) -> &mut PodSpec {
    job_spec(job)
        .template
        .spec
        .get_or_insert_with(Default::default)
}

fn auth_container(job: &mut Job) -> Option<&mut Container> {
    pod_spec(job)
        .init_containers
        .as_mut()?
        .iter_mut()
        .find(|c| c.name == AUTH_CONTAINER)
}

fn sync_container(job: &mut Job) -> Option<&mut Container> {
    pod_spec(job)
        .containers
        .iter_mut()
        .find(|c| c.name == SYNC_CONTAINER)
}
