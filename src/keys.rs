use crate::error::{LedgerError, Result};
use std::fmt;

/// Addressable unit of installed state whose ownership is tracked.
///
/// The closed set of key shapes is parsed once at the boundary; everything
/// past that point works with the typed variants, never with raw strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstallableKey {
    /// Relative data file path, case-insensitive, forward slashes.
    File(String),
    /// A single key inside a settings file section.
    Ini {
        file: String,
        section: String,
        key: String,
    },
    /// Opaque byte-addressed resource inside a container, e.g. a shader
    /// package entry. Text form `scheme:container/name`.
    Resource {
        scheme: String,
        container: String,
        name: String,
    },
}

impl InstallableKey {
    pub fn file(path: &str) -> Result<Self> {
        let normalized = normalize_path(path);
        if normalized.is_empty() {
            return Err(LedgerError::MalformedKey(path.to_string()));
        }
        Ok(InstallableKey::File(normalized))
    }

    pub fn ini(file: &str, section: &str, key: &str) -> Result<Self> {
        if file.trim().is_empty() || section.trim().is_empty() || key.trim().is_empty() {
            return Err(LedgerError::MalformedKey(format!(
                "ini:{file}/{section}/{key}"
            )));
        }
        Ok(InstallableKey::Ini {
            file: normalize_path(file),
            section: section.trim().to_ascii_lowercase(),
            key: key.trim().to_ascii_lowercase(),
        })
    }

    pub fn resource(scheme: &str, container: &str, name: &str) -> Result<Self> {
        if !is_scheme(scheme) || container.trim().is_empty() || name.trim().is_empty() {
            return Err(LedgerError::MalformedKey(format!(
                "{scheme}:{container}/{name}"
            )));
        }
        Ok(InstallableKey::Resource {
            scheme: scheme.to_ascii_lowercase(),
            container: container.trim().to_ascii_lowercase(),
            name: name.trim().to_ascii_lowercase(),
        })
    }

    /// Parses the text form stored in ledger files:
    /// `ini:<file>/<section>/<key>`, `<scheme>:<container>/<name>`, or a bare
    /// data file path.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(LedgerError::MalformedKey(raw.to_string()));
        }

        if let Some((scheme, rest)) = trimmed.split_once(':') {
            if is_scheme(scheme) {
                if scheme.eq_ignore_ascii_case("ini") {
                    let mut parts = rest.rsplitn(3, '/');
                    let key = parts.next().unwrap_or_default();
                    let section = parts.next().unwrap_or_default();
                    let file = parts.next().unwrap_or_default();
                    return InstallableKey::ini(file, section, key);
                }
                let (container, name) = rest
                    .split_once('/')
                    .ok_or_else(|| LedgerError::MalformedKey(raw.to_string()))?;
                return InstallableKey::resource(scheme, container, name);
            }
        }

        InstallableKey::file(trimmed)
    }
}

impl fmt::Display for InstallableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallableKey::File(path) => f.write_str(path),
            InstallableKey::Ini { file, section, key } => {
                write!(f, "ini:{file}/{section}/{key}")
            }
            InstallableKey::Resource {
                scheme,
                container,
                name,
            } => write!(f, "{scheme}:{container}/{name}"),
        }
    }
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .trim()
        .trim_start_matches('/')
        .trim_end_matches('/')
        .to_ascii_lowercase()
}

// Single letters are drive prefixes, not schemes.
fn is_scheme(candidate: &str) -> bool {
    candidate.len() >= 2 && candidate.chars().all(|ch| ch.is_ascii_alphabetic())
}
