//! Schema migrations for the install log file. Each task lifts the file from
//! exactly one older version to the next; the registry chains them until the
//! file reaches the current schema. The file on disk is only replaced once a
//! migration renders a complete new document, so a failed upgrade leaves the
//! original untouched.

use crate::error::{LedgerError, Result, UpgradeError};
use crate::install_log::{self, EditRecord, InstallState};
use crate::keys::InstallableKey;
use crate::mods::{ModKey, ModRecord, Owner};
use semver::Version;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::info;

pub trait UpgradeTask: Send + Sync {
    /// Exact schema version this task consumes.
    fn from_version(&self) -> Version;

    fn to_version(&self) -> Version;

    fn describe(&self) -> &'static str;

    /// Rewrites the file at `path` from `from_version` to `to_version`.
    fn run(&self, path: &Path) -> Result<()>;
}

pub struct UpgradeRegistry {
    tasks: Vec<Box<dyn UpgradeTask>>,
}

impl UpgradeRegistry {
    pub fn new(tasks: Vec<Box<dyn UpgradeTask>>) -> Self {
        UpgradeRegistry { tasks }
    }

    /// Registry knowing every migration shipped with this release.
    pub fn standard() -> Self {
        UpgradeRegistry::new(vec![Box::new(InstallLogV4ToV5)])
    }

    /// Version found in the file when it is older than the current schema,
    /// `None` when the file is current or absent.
    pub fn needs_upgrade(&self, path: &Path) -> Result<Option<Version>> {
        if !path.exists() {
            return Ok(None);
        }
        let version = sniff_version(path)?;
        if version == install_log::current_version() {
            Ok(None)
        } else {
            Ok(Some(version))
        }
    }

    /// Whether the file at `path` can be brought to the current schema.
    /// Current or absent files trivially can; otherwise a task chain must
    /// exist from the file's version.
    pub fn can_upgrade(&self, path: &Path) -> Result<bool> {
        match self.needs_upgrade(path)? {
            None => Ok(true),
            Some(version) => Ok(self.chain_exists_from(&version)),
        }
    }

    fn chain_exists_from(&self, from: &Version) -> bool {
        let mut version = from.clone();
        let current = install_log::current_version();
        while version != current {
            match self.task_for(&version) {
                Some(task) => version = task.to_version(),
                None => return false,
            }
        }
        true
    }

    /// Migrates the file at `path` to the current schema, applying as many
    /// chained tasks as it takes. A no-op when the file is already current.
    pub fn upgrade(&self, path: &Path) -> Result<()> {
        while let Some(version) = self.needs_upgrade(path)? {
            let task = self
                .task_for(&version)
                .ok_or(UpgradeError::UnsupportedVersion(version.clone()))?;
            info!(
                from = %task.from_version(),
                to = %task.to_version(),
                path = %path.display(),
                "upgrading install log"
            );
            task.run(path)?;
        }
        Ok(())
    }

    fn task_for(&self, version: &Version) -> Option<&dyn UpgradeTask> {
        self.tasks
            .iter()
            .find(|task| &task.from_version() == version)
            .map(|task| task.as_ref())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename = "installLog")]
struct VersionProbe {
    #[serde(rename = "@fileVersion", default)]
    file_version: Option<String>,
}

fn sniff_version(path: &Path) -> Result<Version> {
    let raw = fs::read_to_string(path).map_err(|err| LedgerError::Persistence {
        path: path.to_path_buf(),
        source: anyhow::Error::new(err).context("read install log"),
    })?;
    let probe: VersionProbe =
        quick_xml::de::from_str(&raw).map_err(|_| UpgradeError::MissingVersion {
            path: path.to_path_buf(),
        })?;
    let token = probe.file_version.ok_or_else(|| UpgradeError::MissingVersion {
        path: path.to_path_buf(),
    })?;
    Version::parse(&token)
        .map_err(|_| UpgradeError::MissingVersion {
            path: path.to_path_buf(),
        })
        .map_err(LedgerError::from)
}

// --- 0.4.0 -> 0.5.0 --------------------------------------------------------
//
// The 0.4.0 format kept a full stack of installing mods per edit and no
// payloads. The current schema keeps only the top two owners, so the
// migration takes the last stack entry as the owner and the one before it as
// the previous owner.

struct InstallLogV4ToV5;

#[derive(Debug, Deserialize)]
#[serde(rename = "installLog")]
struct OldDoc {
    #[serde(rename = "modList", default)]
    mod_list: OldModList,
    #[serde(rename = "dataFiles", default)]
    data_files: OldFileSection,
    #[serde(rename = "iniEdits", default)]
    ini_edits: OldIniSection,
    #[serde(rename = "gameValues", default)]
    game_values: OldValueSection,
}

#[derive(Debug, Default, Deserialize)]
struct OldModList {
    #[serde(rename = "mod", default)]
    mods: Vec<OldModXml>,
}

#[derive(Debug, Deserialize)]
struct OldModXml {
    #[serde(rename = "@key")]
    key: String,
    #[serde(rename = "@path")]
    path: String,
    #[serde(rename = "@version", default)]
    version: String,
    #[serde(rename = "name", default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct OldFileSection {
    #[serde(rename = "file", default)]
    files: Vec<OldFileXml>,
}

#[derive(Debug, Deserialize)]
struct OldFileXml {
    #[serde(rename = "@path")]
    path: String,
    #[serde(rename = "installingMods", default)]
    installing_mods: OldStack,
}

#[derive(Debug, Default, Deserialize)]
struct OldIniSection {
    #[serde(rename = "ini", default)]
    inis: Vec<OldIniXml>,
}

#[derive(Debug, Deserialize)]
struct OldIniXml {
    #[serde(rename = "@file")]
    file: String,
    #[serde(rename = "@section")]
    section: String,
    #[serde(rename = "@key")]
    key: String,
    #[serde(rename = "installingMods", default)]
    installing_mods: OldStack,
}

#[derive(Debug, Default, Deserialize)]
struct OldValueSection {
    #[serde(rename = "value", default)]
    values: Vec<OldValueXml>,
}

#[derive(Debug, Deserialize)]
struct OldValueXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "installingMods", default)]
    installing_mods: OldStack,
}

#[derive(Debug, Default, Deserialize)]
struct OldStack {
    #[serde(rename = "mod", default)]
    mods: Vec<OldStackEntry>,
}

#[derive(Debug, Deserialize)]
struct OldStackEntry {
    #[serde(rename = "@key")]
    key: String,
}

impl UpgradeTask for InstallLogV4ToV5 {
    fn from_version(&self) -> Version {
        Version::new(0, 4, 0)
    }

    fn to_version(&self) -> Version {
        Version::new(0, 5, 0)
    }

    fn describe(&self) -> &'static str {
        "flatten installing-mod stacks into owner and previous owner"
    }

    fn run(&self, path: &Path) -> Result<()> {
        let raw = fs::read_to_string(path).map_err(|err| UpgradeError::Rewrite {
            path: path.to_path_buf(),
            source: anyhow::Error::new(err).context("read old install log"),
        })?;
        let doc: OldDoc = quick_xml::de::from_str(&raw).map_err(|err| UpgradeError::Rewrite {
            path: path.to_path_buf(),
            source: anyhow::Error::new(err).context("parse 0.4.0 install log"),
        })?;

        let mut state = InstallState::default();
        for entry in doc.mod_list.mods {
            let key = ModKey::new(&entry.key)?;
            let mut record = ModRecord::new(key.clone(), &entry.name, &entry.path);
            record.version = entry.version;
            state.mods.insert(key, record);
        }

        let mut pending: Vec<(InstallableKey, OldStack)> = Vec::new();
        for file in doc.data_files.files {
            pending.push((InstallableKey::file(&file.path)?, file.installing_mods));
        }
        for ini in doc.ini_edits.inis {
            pending.push((
                InstallableKey::ini(&ini.file, &ini.section, &ini.key)?,
                ini.installing_mods,
            ));
        }
        for value in doc.game_values.values {
            pending.push((InstallableKey::parse(&value.name)?, value.installing_mods));
        }
        for (key, stack) in pending {
            let record = stack_to_record(&state, &stack)?;
            state.edits.insert(key, record);
        }

        let rendered = install_log::render_state(&state).map_err(|err| UpgradeError::Rewrite {
            path: path.to_path_buf(),
            source: err,
        })?;
        install_log::write_atomic(path, &rendered).map_err(|err| UpgradeError::Rewrite {
            path: path.to_path_buf(),
            source: err,
        })?;
        Ok(())
    }
}

fn stack_to_record(state: &InstallState, stack: &OldStack) -> Result<EditRecord> {
    // Stack entries hold bare mod keys; the sentinel owners appear as bare
    // tokens too.
    let resolve = |token: &str| -> Result<Owner> {
        match token {
            "pristine" => Ok(Owner::Pristine),
            "manager" => Ok(Owner::Manager),
            other => {
                let key = ModKey::new(other)?;
                if !state.mods.contains_key(&key) {
                    return Err(UpgradeError::MissingMod {
                        key: key.as_str().to_string(),
                    }
                    .into());
                }
                Ok(Owner::Mod(key))
            }
        }
    };

    let mut entries = stack.mods.iter();
    let top = entries.next_back();
    let under = entries.next_back();

    let owner = match top {
        Some(entry) => resolve(&entry.key)?,
        None => Owner::Pristine,
    };
    let previous_owner = match under {
        Some(entry) => resolve(&entry.key)?,
        None => Owner::Pristine,
    };
    // The previous slot never holds the current owner.
    let previous_owner = if previous_owner == owner {
        Owner::Pristine
    } else {
        previous_owner
    };

    Ok(EditRecord {
        owner,
        payload: None,
        previous: previous_owner,
        previous_payload: None,
    })
}
