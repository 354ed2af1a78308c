//! Run configuration resolution
//!
//! A sync run is configured from two sources: values passed on the command
//! line and annotations on the current namespace. Per field, an explicit
//! value wins, the namespace annotation comes next, and built-in defaults
//! fill in the rest. The four settings the synchronizer cannot run without
//! (secrets path, role, address, auth mount path) must end up non-empty.
//!
//! Image flags carry their default as the flag value, so an image equal to
//! the default cannot be told apart from "not passed" and the annotation is
//! still consulted for it. The mount path has no such flag default: it falls
//! back to [`Defaults::mount_path`] only after the annotation.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use tracing::debug;

use crate::error::JobError;

pub const SYNC_IMAGE_ANNOTATION: &str = "sync.vault.postfinance.ch/sync-image";
pub const AUTH_IMAGE_ANNOTATION: &str = "sync.vault.postfinance.ch/auth-image";
pub const MOUNT_PATH_ANNOTATION: &str = "sync.vault.postfinance.ch/mount-path";
pub const SECRETS_PATH_ANNOTATION: &str = "sync.vault.postfinance.ch/secrets-path";
pub const ROLE_ANNOTATION: &str = "sync.vault.postfinance.ch/role";
pub const ADDR_ANNOTATION: &str = "sync.vault.postfinance.ch/addr";
pub const TRUST_SECRET_ANNOTATION: &str = "sync.vault.postfinance.ch/trust-secret";

/// Built-in defaults, constructed once at start-up and passed to [`resolve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub sync_image: String,
    pub auth_image: String,
    pub mount_path: String,
    pub secret_prefix: String,
    /// How long a finished Job is kept before the cluster removes it
    pub ttl: Duration,
    pub backoff_limit: i32,
    /// Default `--timeout` for `--wait`
    pub timeout: Duration,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            sync_image: "postfinance/vault-kubernetes-synchronizer:latest".to_string(),
            auth_image: "postfinance/vault-kubernetes-authenticator:latest".to_string(),
            mount_path: "kubernetes".to_string(),
            secret_prefix: "v3t-".to_string(),
            ttl: Duration::from_secs(3600),
            backoff_limit: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Values supplied by the user. Empty strings mean "not set".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub secrets_path: String,
    pub role: String,
    pub addr: String,
    pub mount_path: String,
    pub trust_secret: String,
    pub sync_image: String,
    pub auth_image: String,
    pub secret_prefix: String,
    /// Single secret key below the secrets path (positional argument)
    pub key: Option<String>,
    pub yaml: bool,
    pub wait: bool,
    pub timeout: Duration,
}

/// Annotations of the namespace the Job runs in
#[derive(Debug, Clone, Default)]
pub struct NamespaceMetadata {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
}

impl NamespaceMetadata {
    pub fn new(name: impl Into<String>, annotations: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            annotations,
        }
    }

    /// Capture name and annotations of a live Namespace object
    pub fn from_namespace(ns: &Namespace) -> Self {
        Self::new(ns.name_any(), ns.annotations().clone())
    }

    /// Annotation value, treating an empty value as absent
    fn get(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Fully resolved settings for one sync run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub secrets_path: String,
    pub role: String,
    pub addr: String,
    pub mount_path: String,
    /// Secret holding `truststore.pem`; empty when no custom CA is used
    pub trust_secret: String,
    pub sync_image: String,
    pub auth_image: String,
    pub secret_prefix: String,
    pub key: Option<String>,
    pub yaml: bool,
    pub wait: bool,
    pub timeout: Duration,
}

impl RunConfig {
    /// Vault path handed to the synchronizer.
    ///
    /// With a key argument the key is joined onto the configured path and
    /// only that secret is synchronized. Without one, every key below the
    /// configured path is synchronized, which the synchronizer expresses as
    /// a path with a trailing slash.
    pub fn effective_secrets_path(&self) -> String {
        match self.key.as_deref() {
            Some(key) => join_path(&self.secrets_path, key),
            None => format!("{}/", self.secrets_path.trim_end_matches('/')),
        }
    }
}

/// Merge user overrides with namespace annotations.
pub fn resolve(
    overrides: Overrides,
    namespace: &NamespaceMetadata,
    defaults: &Defaults,
) -> Result<RunConfig, JobError> {
    let required = |value: String, annotation: &str| -> Result<String, JobError> {
        if !value.is_empty() {
            return Ok(value);
        }
        namespace
            .get(annotation)
            .map(str::to_string)
            .ok_or_else(|| JobError::missing(&namespace.name, annotation))
    };

    let secrets_path = required(overrides.secrets_path, SECRETS_PATH_ANNOTATION)?;
    let role = required(overrides.role, ROLE_ANNOTATION)?;
    let addr = required(overrides.addr, ADDR_ANNOTATION)?;

    let mount_path = Some(overrides.mount_path.as_str())
        .filter(|v| !v.is_empty())
        .or_else(|| namespace.get(MOUNT_PATH_ANNOTATION))
        .or_else(|| Some(defaults.mount_path.as_str()).filter(|v| !v.is_empty()))
        .map(str::to_string)
        .ok_or_else(|| JobError::missing(&namespace.name, MOUNT_PATH_ANNOTATION))?;

    let trust_secret = if overrides.trust_secret.is_empty() {
        namespace
            .get(TRUST_SECRET_ANNOTATION)
            .unwrap_or_default()
            .to_string()
    } else {
        overrides.trust_secret
    };

    let sync_image = image(
        &overrides.sync_image,
        namespace.get(SYNC_IMAGE_ANNOTATION),
        &defaults.sync_image,
    );
    let auth_image = image(
        &overrides.auth_image,
        namespace.get(AUTH_IMAGE_ANNOTATION),
        &defaults.auth_image,
    );

    debug!(
        namespace = %namespace.name,
        %secrets_path,
        %role,
        %addr,
        %mount_path,
        %sync_image,
        %auth_image,
        "resolved sync configuration"
    );

    Ok(RunConfig {
        secrets_path,
        role,
        addr,
        mount_path,
        trust_secret,
        sync_image,
        auth_image,
        secret_prefix: overrides.secret_prefix,
        key: overrides.key,
        yaml: overrides.yaml,
        wait: overrides.wait,
        timeout: overrides.timeout,
    })
}

/// An override counts as explicit only if it is set and differs from its default
fn overridable<'a>(value: &'a str, default: &str) -> Option<&'a str> {
    (!value.is_empty() && value != default).then_some(value)
}

fn image(value: &str, annotated: Option<&str>, default: &str) -> String {
    overridable(value, default)
        .or(annotated)
        .unwrap_or(default)
        .to_string()
}

/// Join slash-separated path segments and normalize the result.
///
/// Empty and `.` segments are dropped, `..` removes the previous segment,
/// and a leading slash on the first segment is kept.
pub fn join_path(base: &str, elem: &str) -> String {
    let absolute = base.starts_with('/') || (base.is_empty() && elem.starts_with('/'));
    let mut parts: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(elem.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            s => parts.push(s),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace(annotations: &[(&str, &str)]) -> NamespaceMetadata {
        NamespaceMetadata::new(
            "team-a",
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn fully_annotated() -> NamespaceMetadata {
        namespace(&[
            (SECRETS_PATH_ANNOTATION, "secret/team-a"),
            (ROLE_ANNOTATION, "team-a-role"),
            (ADDR_ANNOTATION, "https://vault.annotated"),
            (MOUNT_PATH_ANNOTATION, "k8s-annotated"),
            (TRUST_SECRET_ANNOTATION, "vault-ca"),
            (SYNC_IMAGE_ANNOTATION, "registry.local/sync:1"),
            (AUTH_IMAGE_ANNOTATION, "registry.local/auth:1"),
        ])
    }

    /// Overrides as clap hands them over when no flag is passed
    fn flag_defaults(defaults: &Defaults) -> Overrides {
        Overrides {
            sync_image: defaults.sync_image.clone(),
            auth_image: defaults.auth_image.clone(),
            secret_prefix: defaults.secret_prefix.clone(),
            timeout: defaults.timeout,
            ..Default::default()
        }
    }

    #[test]
    fn explicit_values_win_over_annotations() {
        let defaults = Defaults::default();
        let overrides = Overrides {
            secrets_path: "secret/cli".to_string(),
            role: "cli-role".to_string(),
            addr: "https://vault.cli".to_string(),
            mount_path: "cli-mount".to_string(),
            trust_secret: "cli-ca".to_string(),
            sync_image: "cli/sync:2".to_string(),
            auth_image: "cli/auth:2".to_string(),
            ..flag_defaults(&defaults)
        };

        let config = resolve(overrides, &fully_annotated(), &defaults).unwrap();

        assert_eq!(config.secrets_path, "secret/cli");
        assert_eq!(config.role, "cli-role");
        assert_eq!(config.addr, "https://vault.cli");
        assert_eq!(config.mount_path, "cli-mount");
        assert_eq!(config.trust_secret, "cli-ca");
        assert_eq!(config.sync_image, "cli/sync:2");
        assert_eq!(config.auth_image, "cli/auth:2");
    }

    #[test]
    fn annotations_fill_unset_values() {
        let defaults = Defaults::default();
        let config = resolve(flag_defaults(&defaults), &fully_annotated(), &defaults).unwrap();

        assert_eq!(config.secrets_path, "secret/team-a");
        assert_eq!(config.role, "team-a-role");
        assert_eq!(config.addr, "https://vault.annotated");
        assert_eq!(config.mount_path, "k8s-annotated");
        assert_eq!(config.trust_secret, "vault-ca");
        assert_eq!(config.sync_image, "registry.local/sync:1");
        assert_eq!(config.auth_image, "registry.local/auth:1");
        assert_eq!(config.secret_prefix, "v3t-");
    }

    #[test]
    fn missing_secrets_path_is_reported_first() {
        let overrides = Overrides {
            addr: "https://vault.example".to_string(),
            ..Default::default()
        };
        let ns = namespace(&[(ROLE_ANNOTATION, "r1"), (MOUNT_PATH_ANNOTATION, "k8s")]);

        let err = resolve(overrides, &ns, &Defaults::default()).unwrap_err();

        match err {
            JobError::MissingConfiguration {
                namespace,
                annotation,
            } => {
                assert_eq!(namespace, "team-a");
                assert_eq!(annotation, SECRETS_PATH_ANNOTATION);
            }
            other => panic!("expected MissingConfiguration, got {other:?}"),
        }
    }

    #[test]
    fn each_mandatory_field_is_required() {
        let complete = [
            (SECRETS_PATH_ANNOTATION, "secret/a"),
            (ROLE_ANNOTATION, "role"),
            (ADDR_ANNOTATION, "https://vault"),
            (MOUNT_PATH_ANNOTATION, "k8s"),
        ];
        for missing in complete.iter().map(|(k, _)| *k) {
            let present: Vec<_> = complete
                .iter()
                .copied()
                .filter(|(k, _)| *k != missing)
                .collect();
            // without a built-in mount path the annotation is the only source
            let defaults = Defaults {
                mount_path: String::new(),
                ..Defaults::default()
            };
            let err = resolve(Overrides::default(), &namespace(&present), &defaults).unwrap_err();
            assert!(
                matches!(&err, JobError::MissingConfiguration { annotation, .. } if annotation == missing),
                "expected {missing} to be reported, got {err:?}"
            );
        }
    }

    #[test]
    fn empty_mandatory_annotation_counts_as_missing() {
        let ns = namespace(&[
            (SECRETS_PATH_ANNOTATION, "secret/a"),
            (ROLE_ANNOTATION, ""),
            (ADDR_ANNOTATION, "https://vault"),
        ]);
        let defaults = Defaults::default();

        let err = resolve(flag_defaults(&defaults), &ns, &defaults).unwrap_err();

        assert!(
            matches!(err, JobError::MissingConfiguration { annotation, .. } if annotation == ROLE_ANNOTATION)
        );
    }

    #[test]
    fn default_mount_path_used_without_annotation() {
        let ns = namespace(&[
            (SECRETS_PATH_ANNOTATION, "secret/a"),
            (ROLE_ANNOTATION, "role"),
            (ADDR_ANNOTATION, "https://vault"),
        ]);
        let defaults = Defaults::default();

        let config = resolve(flag_defaults(&defaults), &ns, &defaults).unwrap();

        assert_eq!(config.mount_path, "kubernetes");
    }

    #[test]
    fn explicit_mount_path_wins_even_when_equal_to_default() {
        let defaults = Defaults::default();
        let overrides = Overrides {
            secrets_path: "secret/a".to_string(),
            role: "role".to_string(),
            addr: "https://vault".to_string(),
            mount_path: "kubernetes".to_string(),
            ..flag_defaults(&defaults)
        };
        let ns = namespace(&[(MOUNT_PATH_ANNOTATION, "k8s")]);

        let config = resolve(overrides, &ns, &defaults).unwrap();

        assert_eq!(config.mount_path, "kubernetes");
    }

    #[test]
    fn image_equal_to_default_defers_to_annotation() {
        let defaults = Defaults::default();
        let overrides = Overrides {
            secrets_path: "secret/a".to_string(),
            role: "role".to_string(),
            addr: "https://vault".to_string(),
            ..flag_defaults(&defaults)
        };
        let ns = namespace(&[(SYNC_IMAGE_ANNOTATION, "mirror/sync:pinned")]);

        let config = resolve(overrides, &ns, &defaults).unwrap();

        assert_eq!(config.sync_image, "mirror/sync:pinned");
        assert_eq!(config.auth_image, defaults.auth_image);
    }

    #[test]
    fn empty_image_falls_back_to_default() {
        let overrides = Overrides {
            secrets_path: "secret/a".to_string(),
            role: "role".to_string(),
            addr: "https://vault".to_string(),
            mount_path: "k8s".to_string(),
            ..Default::default()
        };
        let defaults = Defaults::default();

        let config = resolve(overrides, &namespace(&[]), &defaults).unwrap();

        assert_eq!(config.sync_image, defaults.sync_image);
        assert_eq!(config.auth_image, defaults.auth_image);
    }

    #[test]
    fn trust_secret_is_optional() {
        let ns = namespace(&[
            (SECRETS_PATH_ANNOTATION, "secret/a"),
            (ROLE_ANNOTATION, "role"),
            (ADDR_ANNOTATION, "https://vault"),
        ]);
        let defaults = Defaults::default();

        let config = resolve(flag_defaults(&defaults), &ns, &defaults).unwrap();

        assert!(config.trust_secret.is_empty());
    }

    #[test]
    fn key_argument_is_joined_onto_secrets_path() {
        let defaults = Defaults::default();
        let overrides = Overrides {
            key: Some("db-creds".to_string()),
            ..flag_defaults(&defaults)
        };
        let ns = namespace(&[
            (SECRETS_PATH_ANNOTATION, "team/app"),
            (ROLE_ANNOTATION, "role"),
            (ADDR_ANNOTATION, "https://vault"),
        ]);

        let config = resolve(overrides, &ns, &defaults).unwrap();

        assert_eq!(config.effective_secrets_path(), "team/app/db-creds");
    }

    #[test]
    fn path_without_key_gets_single_trailing_slash() {
        let defaults = Defaults::default();
        for base in ["team/app", "team/app/", "team/app///"] {
            let overrides = Overrides {
                secrets_path: base.to_string(),
                role: "role".to_string(),
                addr: "https://vault".to_string(),
                ..flag_defaults(&defaults)
            };
            let config = resolve(overrides, &namespace(&[]), &defaults).unwrap();
            assert_eq!(config.effective_secrets_path(), "team/app/");
        }
    }

    #[test]
    fn join_path_normalizes_segments() {
        assert_eq!(join_path("team/app", "db-creds"), "team/app/db-creds");
        assert_eq!(join_path("team/app/", "/db-creds"), "team/app/db-creds");
        assert_eq!(join_path("/secret//team", "./key"), "/secret/team/key");
        assert_eq!(join_path("team/app", "../other"), "team/other");
        assert_eq!(join_path("", ""), "");
    }
}
