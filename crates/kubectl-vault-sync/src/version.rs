//! Build and version information shown by `--version`

use std::fmt;

/// Program name reported in version output
pub const PROGRAM: &str = "vault_sync";

/// Revision shown when the build did not record a commit
const UNKNOWN_REVISION: &str = "12345678";

/// Version details of the running binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub program: String,
    pub version: String,
    pub revision: String,
    pub build_date: String,
    pub rust_version: String,
}

impl VersionInfo {
    /// Assemble version info; the revision is the first 8 characters of `commit`.
    pub fn new(
        program: &str,
        version: &str,
        commit: Option<&str>,
        build_date: Option<&str>,
        rust_version: Option<&str>,
    ) -> Self {
        let revision = commit
            .filter(|c| c.len() >= 8)
            .and_then(|c| c.get(..8))
            .unwrap_or(UNKNOWN_REVISION);

        Self {
            program: program.to_string(),
            version: version.to_string(),
            revision: revision.to_string(),
            build_date: build_date.unwrap_or_default().to_string(),
            rust_version: rust_version.unwrap_or_default().to_string(),
        }
    }

    /// Version info baked in at build time
    pub fn current() -> Self {
        Self::new(
            PROGRAM,
            env!("CARGO_PKG_VERSION"),
            option_env!("VAULT_SYNC_COMMIT"),
            option_env!("VAULT_SYNC_BUILD_DATE"),
            option_env!("VAULT_SYNC_RUSTC_VERSION"),
        )
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}, version {} (revision: {})",
            self.program, self.version, self.revision
        )?;
        writeln!(f, "  build date:       {}", self.build_date)?;
        write!(f, "  rust version:     {}", self.rust_version)
    }
}
