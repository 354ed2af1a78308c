//! CLI commands

use std::io;
use std::time::Duration;

use clap::Args;
use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Client, Config};
use tracing::debug;

use crate::{Error, Result};

pub mod sync;

/// Namespace used when neither the flag nor the context names one
const DEFAULT_NAMESPACE: &str = "default";

/// Flags selecting the cluster, context, and namespace to work in
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    /// Path to the kubeconfig file (defaults to $KUBECONFIG or ~/.kube/config)
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// Name of the kubeconfig context to use
    #[arg(long)]
    pub context: Option<String>,

    /// Namespace to synchronize secrets into (defaults to the context's namespace)
    #[arg(long, short = 'n')]
    pub namespace: Option<String>,
}

/// Context and namespace selected from a kubeconfig
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub context: String,
    pub namespace: String,
}

/// Read the kubeconfig from `explicit`, or from kube's defaults
/// (`KUBECONFIG` env / `~/.kube/config`).
///
/// Missing default files yield an empty kubeconfig, so the caller reports
/// the absent context rather than a file error.
pub fn load_kubeconfig(explicit: Option<&str>) -> Result<Kubeconfig> {
    match explicit {
        Some(path) => Kubeconfig::read_from(path)
            .map_err(|e| Error::kubeconfig(format!("failed to read {}: {}", path, e))),
        None => empty_if_missing(Kubeconfig::read()),
    }
}

fn empty_if_missing(
    read: std::result::Result<Kubeconfig, KubeconfigError>,
) -> Result<Kubeconfig> {
    match read {
        Ok(kubeconfig) => Ok(kubeconfig),
        Err(KubeconfigError::ReadConfig(e, path)) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no kubeconfig found");
            Ok(Kubeconfig::default())
        }
        Err(KubeconfigError::FindPath) => Ok(Kubeconfig::default()),
        Err(e) => Err(Error::kubeconfig(format!("failed to read kubeconfig: {}", e))),
    }
}

/// The context the command should run in, if any.
///
/// `--context` takes precedence over the kubeconfig's current context.
/// Empty names count as unset.
pub fn current_context<'a>(kubeconfig: &'a Kubeconfig, args: &'a ClusterArgs) -> Option<&'a str> {
    args.context
        .as_deref()
        .or(kubeconfig.current_context.as_deref())
        .filter(|c| !c.is_empty())
}

/// Resolve the namespace for `context`: flag, then the context's own
/// namespace, then `default`.
pub fn select(kubeconfig: &Kubeconfig, args: &ClusterArgs, context: &str) -> Selection {
    let namespace = args
        .namespace
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| {
            kubeconfig
                .contexts
                .iter()
                .find(|c| c.name == context)
                .and_then(|c| c.context.as_ref())
                .and_then(|c| c.namespace.clone())
        })
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

    debug!(%context, %namespace, "selected kubeconfig context");
    Selection {
        context: context.to_string(),
        namespace,
    }
}

/// Build a kube [`Client`] from an already-loaded [`Kubeconfig`] and context.
pub async fn kube_client_from_kubeconfig(kubeconfig: Kubeconfig, context: &str) -> Result<Client> {
    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };
    let config = Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| Error::kubeconfig(e.to_string()))?;
    Ok(Client::try_from(config)?)
}

/// Parse a Go-style duration such as `30s`, `2m`, `1h`, or `1m30s`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::validation("empty duration"));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let invalid = || {
        Error::validation(format!(
            "invalid duration '{}', expected e.g. 30s, 2m, 1h30m",
            s
        ))
    };

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let n: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Some(Duration::from_millis(n)),
            "s" => Some(Duration::from_secs(n)),
            "m" => n.checked_mul(60).map(Duration::from_secs),
            "h" => n.checked_mul(3600).map(Duration::from_secs),
            _ => return Err(invalid()),
        };
        total = unit
            .and_then(|unit| total.checked_add(unit))
            .ok_or_else(invalid)?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}
