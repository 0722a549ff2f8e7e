use crate::error::{LedgerError, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Stable lookup key for an installed mod, derived from its install
/// path/filename. Comparison and hashing only; display metadata lives in
/// [`ModRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModKey(String);

impl ModKey {
    pub fn new(raw: &str) -> Result<Self> {
        let normalized = normalize_key(raw);
        if normalized.is_empty() {
            return Err(LedgerError::invariant(format!(
                "mod key '{raw}' normalizes to an empty string"
            )));
        }
        Ok(ModKey(normalized))
    }

    pub fn from_install_path(path: &Path) -> Result<Self> {
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        Self::new(stem)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_key(raw: &str) -> String {
    let mut out = String::new();
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if matches!(ch, ' ' | '-' | '_' | '.') && !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Identity assigned as the current or previous owner of an installable.
///
/// `Pristine` marks values that preexisted on the system before any mod
/// touched them; `Manager` marks values the application itself maintains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Owner {
    Pristine,
    Manager,
    Mod(ModKey),
}

impl Owner {
    pub fn is_mod(&self, key: &ModKey) -> bool {
        matches!(self, Owner::Mod(owner) if owner == key)
    }

    /// Token form used in the ledger file.
    pub fn ledger_token(&self) -> String {
        match self {
            Owner::Pristine => "pristine".to_string(),
            Owner::Manager => "manager".to_string(),
            Owner::Mod(key) => format!("mod:{key}"),
        }
    }

    pub fn parse_ledger_token(token: &str) -> Result<Self> {
        match token {
            "pristine" => Ok(Owner::Pristine),
            "manager" => Ok(Owner::Manager),
            other => match other.strip_prefix("mod:") {
                Some(key) => Ok(Owner::Mod(ModKey::new(key)?)),
                None => Err(LedgerError::invariant(format!(
                    "unrecognized owner token '{other}'"
                ))),
            },
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ledger_token())
    }
}

/// Value recorded for an installable: the payload an owner wrote, or the
/// pristine baseline seeded before the first edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn text(value: impl Into<String>) -> Self {
        Payload::Text(value.into())
    }

    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Payload::Bytes(value.into())
    }
}

/// Metadata persisted in the ledger's mod list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModRecord {
    pub key: ModKey,
    pub name: String,
    pub install_path: String,
    pub version: String,
    pub machine_version: Version,
    pub installed_at: OffsetDateTime,
}

impl ModRecord {
    pub fn new(key: ModKey, name: &str, install_path: &str) -> Self {
        ModRecord {
            key,
            name: name.to_string(),
            install_path: install_path.to_string(),
            version: String::new(),
            machine_version: Version::new(0, 0, 0),
            installed_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn install_date_rfc3339(&self) -> String {
        self.installed_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::new())
    }
}
