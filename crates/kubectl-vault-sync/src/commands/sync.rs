//! `kubectl vault-sync`: synchronize Vault secrets into the current namespace.
//!
//! Creates a batch Job that runs the vault-kubernetes-synchronizer. Most
//! settings can be stored as annotations on the namespace so a plain
//! invocation is enough once a namespace is set up.
//!
//! # Usage
//!
//! ```bash
//! # Synchronize every secret below the configured secrets path
//! kubectl vault-sync
//!
//! # Synchronize and wait for the Job to finish
//! kubectl vault-sync --wait --timeout=30s
//!
//! # Synchronize a single secret 'confidential'
//! kubectl vault-sync confidential
//!
//! # Print the Job as YAML without creating it
//! kubectl vault-sync --yaml
//! ```

use std::io::Write;
use std::time::Duration;

use chrono::Local;
use clap::Args;
use k8s_openapi::api::core::v1::Namespace;
use kube::Api;
use tracing::{debug, info};

use vault_sync_job::config::{
    ADDR_ANNOTATION, AUTH_IMAGE_ANNOTATION, MOUNT_PATH_ANNOTATION, ROLE_ANNOTATION,
    SECRETS_PATH_ANNOTATION, SYNC_IMAGE_ANNOTATION, TRUST_SECRET_ANNOTATION,
};
use vault_sync_job::job::{self, job_selector, run_selector};
use vault_sync_job::{
    resolve, Defaults, JobClient, JobLifecycle, KubeJobClient, NamespaceMetadata, Overrides,
};

use super::{current_context, kube_client_from_kubeconfig, load_kubeconfig, select, ClusterArgs};
use crate::{Error, Result};

/// Synchronize Vault secrets into Kubernetes secrets
#[derive(Args, Debug, Clone, Default)]
pub struct SyncArgs {
    /// Vault secret to synchronize, relative to the secrets path (omit to synchronize all)
    #[arg(value_name = "KEY")]
    pub keys: Vec<String>,

    #[arg(
        long = "vault-role",
        value_name = "ROLE",
        help = format!("Name of the vault role to use for authentication. If not set, value is taken from namespace annotation '{}'", ROLE_ANNOTATION)
    )]
    pub vault_role: Option<String>,

    #[arg(
        long = "vault-secretspath",
        value_name = "PATH",
        help = format!("Secrets path in vault. If not set, value is taken from namespace annotation '{}'", SECRETS_PATH_ANNOTATION)
    )]
    pub vault_secrets_path: Option<String>,

    #[arg(
        long = "vault-addr",
        value_name = "URL",
        help = format!("The URL of the vault server. If not set, value is taken from namespace annotation '{}'", ADDR_ANNOTATION)
    )]
    pub vault_addr: Option<String>,

    #[arg(
        long = "vault-trust-secret",
        value_name = "NAME",
        help = format!("The kubernetes secret containing a CA certificate 'truststore.pem' to connect to vault. If not set, value is taken from namespace annotation '{}'", TRUST_SECRET_ANNOTATION)
    )]
    pub vault_trust_secret: Option<String>,

    #[arg(
        long = "vault-sync-image",
        value_name = "IMAGE",
        help = format!("The synchronizer image name [default: postfinance/vault-kubernetes-synchronizer:latest]. If not set, value is taken from namespace annotation '{}' if it exists", SYNC_IMAGE_ANNOTATION)
    )]
    pub vault_sync_image: Option<String>,

    #[arg(
        long = "vault-auth-image",
        value_name = "IMAGE",
        help = format!("The authenticator image name [default: postfinance/vault-kubernetes-authenticator:latest]. If not set, value is taken from namespace annotation '{}' if it exists", AUTH_IMAGE_ANNOTATION)
    )]
    pub vault_auth_image: Option<String>,

    #[arg(
        long = "vault-mountpath",
        value_name = "PATH",
        help = format!("Mount path where the Kubernetes auth method is enabled [default: kubernetes]. If not set, value is taken from namespace annotation '{}' if it exists", MOUNT_PATH_ANNOTATION)
    )]
    pub vault_mount_path: Option<String>,

    /// Prefix for secrets in kubernetes [default: v3t-]. A vault secret 'confidential' is synchronized as '<prefix>-confidential'
    #[arg(long = "vault-secret-prefix", value_name = "PREFIX")]
    pub vault_secret_prefix: Option<String>,

    /// Print the Job as YAML to stdout instead of creating it
    #[arg(long)]
    pub yaml: bool,

    /// Wait for the Job to finish or fail
    #[arg(long)]
    pub wait: bool,

    /// How long to wait before giving up, in combination with --wait [default: 30s]
    #[arg(long, value_name = "DURATION", value_parser = parse_timeout)]
    pub timeout: Option<Duration>,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

fn parse_timeout(s: &str) -> Result<Duration> {
    super::parse_duration(s)
}

impl SyncArgs {
    /// User-supplied values, with flag defaults filled in from `defaults`.
    pub fn overrides(&self, defaults: &Defaults) -> Overrides {
        let or = |value: &Option<String>, default: &str| {
            value.clone().unwrap_or_else(|| default.to_string())
        };
        Overrides {
            secrets_path: self.vault_secrets_path.clone().unwrap_or_default(),
            role: self.vault_role.clone().unwrap_or_default(),
            addr: self.vault_addr.clone().unwrap_or_default(),
            mount_path: self.vault_mount_path.clone().unwrap_or_default(),
            trust_secret: self.vault_trust_secret.clone().unwrap_or_default(),
            sync_image: or(&self.vault_sync_image, &defaults.sync_image),
            auth_image: or(&self.vault_auth_image, &defaults.auth_image),
            secret_prefix: or(&self.vault_secret_prefix, &defaults.secret_prefix),
            key: self.keys.first().cloned(),
            yaml: self.yaml,
            wait: self.wait,
            timeout: self.timeout.unwrap_or(defaults.timeout),
        }
    }
}

/// Ensure at most one key was given.
pub fn validate_keys(keys: &[String]) -> Result<()> {
    if keys.len() > 1 {
        return Err(Error::TooManyArguments);
    }
    Ok(())
}

/// Run the sync command.
pub async fn run(args: SyncArgs) -> Result<()> {
    let defaults = Defaults::default();

    // complete
    let kubeconfig = load_kubeconfig(args.cluster.kubeconfig.as_deref())?;

    // validate
    let context = current_context(&kubeconfig, &args.cluster)
        .ok_or(Error::NoCurrentContext)?
        .to_string();
    validate_keys(&args.keys)?;

    // run
    let selection = select(&kubeconfig, &args.cluster, &context);
    let client = kube_client_from_kubeconfig(kubeconfig, &selection.context).await?;

    let namespaces: Api<Namespace> = Api::all(client.clone());
    let namespace = namespaces
        .get(&selection.namespace)
        .await
        .map_err(|source| Error::Namespace {
            name: selection.namespace.clone(),
            source,
        })?;
    let metadata = NamespaceMetadata::from_namespace(&namespace);

    let lifecycle = JobLifecycle::new(KubeJobClient::new(client, &selection.namespace));
    let suffix = job::run_suffix(&Local::now());

    execute(
        &lifecycle,
        args.overrides(&defaults),
        &metadata,
        &defaults,
        &suffix,
        &mut std::io::stdout(),
    )
    .await
}

/// Resolve, prune, build, and submit (or print) the sync Job.
pub async fn execute<C, W>(
    lifecycle: &JobLifecycle<C>,
    overrides: Overrides,
    metadata: &NamespaceMetadata,
    defaults: &Defaults,
    suffix: &str,
    out: &mut W,
) -> Result<()>
where
    C: JobClient,
    W: Write,
{
    let config = resolve(overrides, metadata, defaults)?;

    lifecycle.prune(&job_selector()).await?;

    let secrets_path = config.effective_secrets_path();
    let sync_job = job::build(&config, suffix, defaults);

    if config.yaml {
        debug!("printing job instead of creating it");
        out.write_all(serde_yaml::to_string(&sync_job)?.as_bytes())?;
        return Ok(());
    }

    writeln!(
        out,
        "creating sync batch job to synchronize '{}' vault key",
        secrets_path
    )?;
    out.flush()?;
    lifecycle.submit(&sync_job).await?;

    if !config.wait {
        return Ok(());
    }

    info!(timeout = ?config.timeout, "waiting for sync job to finish");
    lifecycle
        .await_completion(&run_selector(suffix), config.timeout)
        .await?;
    Ok(())
}
