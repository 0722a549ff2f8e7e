use semver::Version;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

/// Failures surfaced by the ledger core.
///
/// Invariant violations are programmer errors and are never retried.
/// Persistence failures during commit leave the owning transaction in-doubt.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("malformed installable key '{0}'")]
    MalformedKey(String),

    #[error("transaction {txid} is {status}, expected an active transaction")]
    NotActive { txid: u64, status: &'static str },

    #[error("transaction {txid} is in doubt: {reason}")]
    InDoubt { txid: u64, reason: String },

    #[error("failed to persist {}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("plugin list serializer failed for {location}")]
    PluginList {
        location: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Upgrade(#[from] UpgradeError),

    #[error("{} participant(s) failed to roll back", failures.len())]
    RollbackFailed { failures: Vec<anyhow::Error> },

    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),
}

impl LedgerError {
    pub fn invariant(message: impl Into<String>) -> Self {
        LedgerError::Invariant(message.into())
    }
}

/// Raised when a ledger file written by an older release cannot be migrated.
/// The original file is left untouched unless a migration fully completes.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("no upgrade path from ledger version {0}")]
    UnsupportedVersion(Version),

    #[error("ledger {} has no readable fileVersion attribute", path.display())]
    MissingVersion { path: PathBuf },

    #[error("mod '{key}' is referenced by an edit record but missing from the mod list")]
    MissingMod { key: String },

    #[error("failed to rewrite ledger {}", path.display())]
    Rewrite {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}
