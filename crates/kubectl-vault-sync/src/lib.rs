//! kubectl vault-sync library

pub mod commands;
pub mod error;
pub mod version;

pub use error::{Error, Result};

use clap::{CommandFactory, FromArgMatches, Parser};

const LONG_ABOUT: &str = "\
Synchronize vault secrets into kubernetes secrets.

This plugin creates a batch job that starts a vault-kubernetes-synchronizer container.
For more details visit https://github.com/postfinance/vault-kubernetes.

You can view the created job with: kubectl get jobs -l job=vault-sync

Without a KEY argument, the job synchronizes all keys below the configured secrets path.
The secrets path is taken from the sync.vault.postfinance.ch/secrets-path namespace
annotation or from the command line.

Most options can be set with namespace annotations, for example:
  * sync.vault.postfinance.ch/role: the vault role to use for authentication
  * sync.vault.postfinance.ch/mount-path: the mount path of the Kubernetes auth method";

const EXAMPLES: &str = "\
Examples:
  # synchronize all vault secrets (only works with configured namespace annotations)
  kubectl vault-sync

  # synchronize all vault secrets and wait for the job to finish
  kubectl vault-sync --wait --timeout=30s

  # synchronize the vault secret 'confidential' (needs the secrets-path annotation)
  kubectl vault-sync confidential

  # view the batch job as yaml (creates no batch job)
  kubectl vault-sync --yaml";

/// Synchronize vault secrets into kubernetes secrets
#[derive(Parser, Debug)]
#[command(name = "kubectl-vault_sync", bin_name = "kubectl vault-sync")]
#[command(version, about, long_about = LONG_ABOUT, after_long_help = EXAMPLES)]
pub struct Cli {
    #[command(flatten)]
    pub sync: commands::sync::SyncArgs,
}

impl Cli {
    /// clap command with build details attached to `--version`
    pub fn command_with_version() -> clap::Command {
        Self::command().long_version(version::VersionInfo::current().to_string())
    }

    /// Parse process arguments, exiting on usage errors
    pub fn parse_with_version() -> Self {
        let matches = Self::command_with_version().get_matches();
        Self::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
    }

    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        commands::sync::run(self.sync).await
    }
}
