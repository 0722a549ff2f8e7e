use crate::error::{LedgerError, Result, UpgradeError};
use crate::keys::InstallableKey;
use crate::mods::{ModKey, ModRecord, Owner, Payload};
use crate::transact::{self, Participant, TxContext, TxId};
use anyhow::Context as _;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, warn};

pub const INSTALL_LOG_VERSION: &str = "0.5.0";

pub fn current_version() -> Version {
    Version::new(0, 5, 0)
}

/// Ownership history for one installable: the current owner and the payload
/// it wrote, plus exactly one level of "previous". The previous slot never
/// references the current owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRecord {
    pub owner: Owner,
    pub payload: Option<Payload>,
    pub previous: Owner,
    pub previous_payload: Option<Payload>,
}

/// What an uninstall leaves behind for the caller to apply on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restore {
    /// Owner the installable reverted to. `Pristine` with no payload means
    /// the installable should be deleted outright.
    pub owner: Owner,
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct InstallState {
    pub(crate) mods: BTreeMap<ModKey, ModRecord>,
    pub(crate) edits: BTreeMap<InstallableKey, EditRecord>,
}

struct Shadow {
    state: InstallState,
    staged: Option<String>,
}

struct LogState {
    committed: InstallState,
    shadows: HashMap<TxId, Shadow>,
}

/// The install log: which mod currently owns each installable, which owner
/// came before it, and the payload needed to put things back. Enlists in the
/// ambient transaction; every mutation happens on a per-transaction shadow
/// that becomes the committed state only when the transaction commits.
pub struct InstallLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl InstallLog {
    /// Loads the ledger at `path`, or starts empty when no file exists yet.
    /// The file's schema version must already be current; older files go
    /// through the upgrade registry first.
    pub fn load(path: &Path) -> Result<Arc<Self>> {
        let committed = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|err| LedgerError::Persistence {
                path: path.to_path_buf(),
                source: anyhow::Error::new(err).context("read install log"),
            })?;
            parse_document(&raw, path)?
        } else {
            InstallState::default()
        };

        Ok(Arc::new(InstallLog {
            path: path.to_path_buf(),
            state: Mutex::new(LogState {
                committed,
                shadows: HashMap::new(),
            }),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().expect("install log state poisoned")
    }

    // Working view for the ambient transaction: the transaction's shadow when
    // it has pending changes, otherwise the committed state.
    fn read<R>(&self, ctx: &TxContext, f: impl FnOnce(&InstallState) -> R) -> R {
        let state = self.lock();
        let shadow = ctx
            .current()
            .and_then(|tx| state.shadows.get(&tx.id()))
            .map(|shadow| &shadow.state);
        f(shadow.unwrap_or(&state.committed))
    }

    fn mutate<R>(
        self: &Arc<Self>,
        ctx: &TxContext,
        f: impl FnOnce(&mut InstallState) -> Result<R>,
    ) -> Result<R> {
        transact::with_ambient(ctx, |tx| {
            tx.enlist(Arc::clone(self) as Arc<dyn Participant>)?;
            let mut state = self.lock();
            let LogState { committed, shadows } = &mut *state;
            let shadow = shadows.entry(tx.id()).or_insert_with(|| Shadow {
                state: committed.clone(),
                staged: None,
            });
            shadow.staged = None;
            f(&mut shadow.state)
        })
    }

    /// Registers (or refreshes) a mod's ledger metadata.
    pub fn add_mod(self: &Arc<Self>, ctx: &TxContext, record: ModRecord) -> Result<()> {
        self.mutate(ctx, |state| {
            state.mods.insert(record.key.clone(), record);
            Ok(())
        })
    }

    pub fn mod_record(&self, ctx: &TxContext, key: &ModKey) -> Option<ModRecord> {
        self.read(ctx, |state| state.mods.get(key).cloned())
    }

    pub fn mods(&self, ctx: &TxContext) -> Vec<ModRecord> {
        self.read(ctx, |state| state.mods.values().cloned().collect())
    }

    /// Records `mod_key` writing `payload` to `key`. The first edit of a key
    /// captures the pristine baseline (if one was seeded) as the previous
    /// payload; a mod re-editing its own key replaces the payload in place
    /// without creating a new history level.
    pub fn record_edit(
        self: &Arc<Self>,
        ctx: &TxContext,
        mod_key: &ModKey,
        key: InstallableKey,
        payload: Option<Payload>,
    ) -> Result<()> {
        self.record_owned_edit(ctx, Owner::Mod(mod_key.clone()), key, payload)
    }

    /// Same edit rule, but attributed to the application itself.
    pub fn record_manager_edit(
        self: &Arc<Self>,
        ctx: &TxContext,
        key: InstallableKey,
        payload: Option<Payload>,
    ) -> Result<()> {
        self.record_owned_edit(ctx, Owner::Manager, key, payload)
    }

    fn record_owned_edit(
        self: &Arc<Self>,
        ctx: &TxContext,
        owner: Owner,
        key: InstallableKey,
        payload: Option<Payload>,
    ) -> Result<()> {
        if owner == Owner::Pristine {
            return Err(LedgerError::invariant(
                "pristine is a sentinel, not an editing identity",
            ));
        }
        self.mutate(ctx, |state| {
            if let Owner::Mod(mod_key) = &owner {
                state
                    .mods
                    .entry(mod_key.clone())
                    .or_insert_with(|| ModRecord::new(mod_key.clone(), mod_key.as_str(), ""));
            }
            apply_edit(state, owner, key, payload);
            Ok(())
        })
    }

    /// Seeds the preexisting system value for `key` so that uninstalling the
    /// only installing mod restores the true original. Once a real owner has
    /// claimed the key this is a no-op guard and never overwrites its data.
    pub fn record_pristine(
        self: &Arc<Self>,
        ctx: &TxContext,
        key: InstallableKey,
        payload: Payload,
    ) -> Result<()> {
        self.mutate(ctx, |state| {
            match state.edits.get_mut(&key) {
                None => {
                    state.edits.insert(
                        key,
                        EditRecord {
                            owner: Owner::Pristine,
                            payload: Some(payload),
                            previous: Owner::Pristine,
                            previous_payload: None,
                        },
                    );
                }
                Some(record) if record.owner == Owner::Pristine => {
                    record.payload = Some(payload);
                }
                Some(_) => {}
            }
            Ok(())
        })
    }

    pub fn current_owner(&self, ctx: &TxContext, key: &InstallableKey) -> Option<Owner> {
        self.read(ctx, |state| {
            state.edits.get(key).map(|record| record.owner.clone())
        })
    }

    pub fn previous_owner(&self, ctx: &TxContext, key: &InstallableKey) -> Option<Owner> {
        self.read(ctx, |state| {
            state.edits.get(key).map(|record| record.previous.clone())
        })
    }

    pub fn previous_payload(&self, ctx: &TxContext, key: &InstallableKey) -> Option<Payload> {
        self.read(ctx, |state| {
            state
                .edits
                .get(key)
                .and_then(|record| record.previous_payload.clone())
        })
    }

    pub fn installables(&self, ctx: &TxContext) -> Vec<InstallableKey> {
        self.read(ctx, |state| state.edits.keys().cloned().collect())
    }

    /// Withdraws `mod_key`'s claim on `key`.
    ///
    /// When the mod is the current owner the one history level pops: the
    /// caller gets back the previous owner and payload to restore (a pristine
    /// restore with no payload means "delete the installable"). When the mod
    /// only sits in the previous slot, that slot is cleared and there is
    /// nothing to restore.
    pub fn uninstall_edit(
        self: &Arc<Self>,
        ctx: &TxContext,
        mod_key: &ModKey,
        key: &InstallableKey,
    ) -> Result<Option<Restore>> {
        self.mutate(ctx, |state| {
            let Some(record) = state.edits.get_mut(key) else {
                return Ok(None);
            };

            if record.owner.is_mod(mod_key) {
                let restore = Restore {
                    owner: record.previous.clone(),
                    payload: record.previous_payload.clone(),
                };
                if record.previous == Owner::Pristine {
                    match &record.previous_payload {
                        None => {
                            state.edits.remove(key);
                        }
                        Some(seed) => {
                            // Back to the seeded-pristine record shape.
                            *record = EditRecord {
                                owner: Owner::Pristine,
                                payload: Some(seed.clone()),
                                previous: Owner::Pristine,
                                previous_payload: None,
                            };
                        }
                    }
                } else {
                    *record = EditRecord {
                        owner: record.previous.clone(),
                        payload: record.previous_payload.clone(),
                        previous: Owner::Pristine,
                        previous_payload: None,
                    };
                }
                return Ok(Some(restore));
            }

            if record.previous.is_mod(mod_key) {
                record.previous = Owner::Pristine;
                record.previous_payload = None;
            }
            Ok(None)
        })
    }

    /// Purges `mod_key` entirely: its mod-list entry and every ownership
    /// record currently or previously attributed to it.
    pub fn remove_mod(self: &Arc<Self>, ctx: &TxContext, mod_key: &ModKey) -> Result<()> {
        self.mutate(ctx, |state| {
            state.mods.remove(mod_key);
            state.edits.retain(|_, record| {
                !record.owner.is_mod(mod_key) && !record.previous.is_mod(mod_key)
            });
            Ok(())
        })
    }

    /// Re-tags every attribution of `old` to `new` without changing history
    /// depth. Used when a mod is upgraded in place and keeps its artifacts.
    pub fn replace_owner(
        self: &Arc<Self>,
        ctx: &TxContext,
        old: &ModKey,
        new: &ModKey,
    ) -> Result<()> {
        self.mutate(ctx, |state| {
            if let Some(mut record) = state.mods.remove(old) {
                record.key = new.clone();
                state.mods.insert(new.clone(), record);
            }
            for record in state.edits.values_mut() {
                if record.owner.is_mod(old) {
                    record.owner = Owner::Mod(new.clone());
                }
                if record.previous.is_mod(old) {
                    record.previous = Owner::Mod(new.clone());
                }
                // Re-tagging must not fabricate self-history.
                if record.previous == record.owner {
                    record.previous = Owner::Pristine;
                    record.previous_payload = None;
                }
            }
            Ok(())
        })
    }

    /// Starts an in-place upgrade of `mod_key`. Edits recorded through the
    /// returned run replace the mod's own payloads without new history
    /// levels; keys the mod owned before the upgrade but never re-asserts
    /// are uninstalled when the run finishes.
    pub fn begin_upgrade(self: &Arc<Self>, ctx: &TxContext, mod_key: ModKey) -> UpgradeRun {
        let owned_before = self.read(ctx, |state| {
            state
                .edits
                .iter()
                .filter(|(_, record)| record.owner.is_mod(&mod_key))
                .map(|(key, _)| key.clone())
                .collect()
        });
        UpgradeRun {
            log: Arc::clone(self),
            mod_key,
            owned_before,
            asserted: BTreeSet::new(),
        }
    }
}

/// One in-place mod upgrade. Anything the mod owned before the upgrade and
/// does not re-assert is treated as removed by its new version; whether an
/// installer script can legitimately skip re-declaring an edit it wants to
/// keep is an open product question, so the sweep is kept exactly as the
/// historical behavior.
pub struct UpgradeRun {
    log: Arc<InstallLog>,
    mod_key: ModKey,
    owned_before: BTreeSet<InstallableKey>,
    asserted: BTreeSet<InstallableKey>,
}

impl UpgradeRun {
    pub fn mod_key(&self) -> &ModKey {
        &self.mod_key
    }

    pub fn record_edit(
        &mut self,
        ctx: &TxContext,
        key: InstallableKey,
        payload: Option<Payload>,
    ) -> Result<()> {
        self.asserted.insert(key.clone());
        self.log.record_edit(ctx, &self.mod_key, key, payload)
    }

    pub fn record_pristine(
        &mut self,
        ctx: &TxContext,
        key: InstallableKey,
        payload: Payload,
    ) -> Result<()> {
        self.log.record_pristine(ctx, key, payload)
    }

    /// Uninstalls every key the mod no longer asserts and returns the
    /// restores the caller must apply.
    pub fn finish(self, ctx: &TxContext) -> Result<Vec<(InstallableKey, Restore)>> {
        let mut restores = Vec::new();
        for key in self.owned_before.difference(&self.asserted) {
            if let Some(restore) = self.log.uninstall_edit(ctx, &self.mod_key, key)? {
                restores.push((key.clone(), restore));
            }
        }
        Ok(restores)
    }
}

fn apply_edit(
    state: &mut InstallState,
    owner: Owner,
    key: InstallableKey,
    payload: Option<Payload>,
) {
    match state.edits.get_mut(&key) {
        None => {
            state.edits.insert(
                key,
                EditRecord {
                    owner,
                    payload,
                    previous: Owner::Pristine,
                    previous_payload: None,
                },
            );
        }
        Some(record) if record.owner == Owner::Pristine => {
            // First real owner; the seeded baseline becomes the restore
            // payload.
            *record = EditRecord {
                owner,
                payload,
                previous: Owner::Pristine,
                previous_payload: record.payload.take(),
            };
        }
        Some(record) if record.owner == owner => {
            record.payload = payload;
        }
        Some(record) => {
            *record = EditRecord {
                previous: record.owner.clone(),
                previous_payload: record.payload.take(),
                owner,
                payload,
            };
        }
    }
}

impl Participant for InstallLog {
    fn participant_id(&self) -> &'static str {
        "install-log"
    }

    fn prepare(&self, tx: TxId) -> anyhow::Result<()> {
        let mut state = self.lock();
        if let Some(shadow) = state.shadows.get_mut(&tx) {
            let doc = build_document(&shadow.state);
            shadow.staged = Some(render_xml(&doc)?);
        }
        Ok(())
    }

    fn commit(&self, tx: TxId) -> anyhow::Result<()> {
        let mut state = self.lock();
        let Some(shadow) = state.shadows.get_mut(&tx) else {
            return Ok(());
        };
        let rendered = match shadow.staged.take() {
            Some(staged) => staged,
            None => render_xml(&build_document(&shadow.state))?,
        };
        write_atomic(&self.path, &rendered)
            .with_context(|| format!("persist install log {}", self.path.display()))?;
        let shadow = state.shadows.remove(&tx).expect("shadow present");
        state.committed = shadow.state;
        debug!(tx = %tx, path = %self.path.display(), "install log committed");
        Ok(())
    }

    fn rollback(&self, tx: TxId) -> anyhow::Result<()> {
        self.lock().shadows.remove(&tx);
        Ok(())
    }

    fn in_doubt(&self, tx: TxId) {
        warn!(tx = %tx, "install log discarding in-doubt shadow");
        self.lock().shadows.remove(&tx);
    }
}

// --- XML document ---------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "installLog")]
struct InstallLogDoc {
    #[serde(rename = "@fileVersion")]
    file_version: String,
    #[serde(rename = "modList", default)]
    mod_list: ModListXml,
    #[serde(rename = "dataFiles", default)]
    data_files: EditSection,
    #[serde(rename = "iniEdits", default)]
    ini_edits: EditSection,
    #[serde(rename = "gameValues", default)]
    game_values: EditSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ModListXml {
    #[serde(rename = "mod", default)]
    mods: Vec<ModXml>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EditSection {
    #[serde(rename = "edit", default)]
    edits: Vec<EditXml>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModXml {
    #[serde(rename = "@key")]
    key: String,
    #[serde(rename = "@path")]
    path: String,
    #[serde(rename = "@version")]
    version: String,
    #[serde(rename = "@machineVersion")]
    machine_version: String,
    #[serde(rename = "@installDate")]
    install_date: String,
    #[serde(rename = "name")]
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EditXml {
    #[serde(rename = "@key")]
    key: String,
    #[serde(rename = "@owner")]
    owner: String,
    #[serde(rename = "@previousOwner")]
    previous_owner: String,
    #[serde(rename = "payload", default, skip_serializing_if = "Option::is_none")]
    payload: Option<PayloadXml>,
    #[serde(
        rename = "previousPayload",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    previous_payload: Option<PayloadXml>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PayloadXml {
    #[serde(rename = "@encoding")]
    encoding: String,
    #[serde(rename = "$text", default)]
    value: String,
}

fn payload_to_xml(payload: &Payload) -> PayloadXml {
    match payload {
        Payload::Text(value) => PayloadXml {
            encoding: "text".to_string(),
            value: value.clone(),
        },
        Payload::Bytes(bytes) => PayloadXml {
            encoding: "hex".to_string(),
            value: hex::encode(bytes),
        },
    }
}

fn payload_from_xml(xml: &PayloadXml) -> anyhow::Result<Payload> {
    match xml.encoding.as_str() {
        "text" => Ok(Payload::Text(xml.value.clone())),
        "hex" => Ok(Payload::Bytes(
            hex::decode(xml.value.trim()).context("decode hex payload")?,
        )),
        other => anyhow::bail!("unknown payload encoding '{other}'"),
    }
}

fn build_document(state: &InstallState) -> InstallLogDoc {
    let mut doc = InstallLogDoc {
        file_version: INSTALL_LOG_VERSION.to_string(),
        mod_list: ModListXml::default(),
        data_files: EditSection::default(),
        ini_edits: EditSection::default(),
        game_values: EditSection::default(),
    };

    for record in state.mods.values() {
        doc.mod_list.mods.push(ModXml {
            key: record.key.as_str().to_string(),
            path: record.install_path.clone(),
            version: record.version.clone(),
            machine_version: record.machine_version.to_string(),
            install_date: record.install_date_rfc3339(),
            name: record.name.clone(),
        });
    }

    for (key, record) in &state.edits {
        let edit = EditXml {
            key: key.to_string(),
            owner: record.owner.ledger_token(),
            previous_owner: record.previous.ledger_token(),
            payload: record.payload.as_ref().map(payload_to_xml),
            previous_payload: record.previous_payload.as_ref().map(payload_to_xml),
        };
        let section = match key {
            InstallableKey::File(_) => &mut doc.data_files,
            InstallableKey::Ini { .. } => &mut doc.ini_edits,
            InstallableKey::Resource { .. } => &mut doc.game_values,
        };
        section.edits.push(edit);
    }

    doc
}

fn parse_document(raw: &str, path: &Path) -> Result<InstallState> {
    let doc: InstallLogDoc =
        quick_xml::de::from_str(raw).map_err(|err| LedgerError::Persistence {
            path: path.to_path_buf(),
            source: anyhow::Error::new(err).context("parse install log"),
        })?;

    let version = Version::parse(&doc.file_version)
        .map_err(|_| UpgradeError::MissingVersion {
            path: path.to_path_buf(),
        })?;
    if version != current_version() {
        return Err(UpgradeError::UnsupportedVersion(version).into());
    }

    let mut state = InstallState::default();
    for entry in doc.mod_list.mods {
        let key = ModKey::new(&entry.key)?;
        state.mods.insert(
            key.clone(),
            ModRecord {
                key,
                name: entry.name,
                install_path: entry.path,
                version: entry.version,
                machine_version: Version::parse(&entry.machine_version)
                    .unwrap_or_else(|_| Version::new(0, 0, 0)),
                installed_at: OffsetDateTime::parse(&entry.install_date, &Rfc3339)
                    .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            },
        );
    }

    let sections = [doc.data_files, doc.ini_edits, doc.game_values];
    for section in sections {
        for entry in section.edits {
            let key = InstallableKey::parse(&entry.key)?;
            let to_payload = |xml: &Option<PayloadXml>| -> Result<Option<Payload>> {
                xml.as_ref()
                    .map(|payload| {
                        payload_from_xml(payload).map_err(|err| LedgerError::Persistence {
                            path: path.to_path_buf(),
                            source: err,
                        })
                    })
                    .transpose()
            };
            let record = EditRecord {
                owner: Owner::parse_ledger_token(&entry.owner)?,
                previous: Owner::parse_ledger_token(&entry.previous_owner)?,
                payload: to_payload(&entry.payload)?,
                previous_payload: to_payload(&entry.previous_payload)?,
            };
            state.edits.insert(key, record);
        }
    }

    Ok(state)
}

// Migrations assemble an InstallState and render it through the same
// serializer the live log uses.
pub(crate) fn render_state(state: &InstallState) -> anyhow::Result<String> {
    render_xml(&build_document(state))
}

pub(crate) fn render_xml<T: serde::Serialize>(doc: &T) -> anyhow::Result<String> {
    let mut xml = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n".to_string();
    let mut ser = quick_xml::se::Serializer::new(&mut xml);
    ser.indent(' ', 4);
    doc.serialize(ser).context("serialize install log")?;
    xml.push('\n');
    Ok(xml)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    let parent = path.parent().context("ledger file has no parent")?;
    fs::create_dir_all(parent).context("create ledger dir")?;
    let file_name = path.file_name().context("ledger file has no name")?;
    let mut temp_name = std::ffi::OsString::from(file_name);
    temp_name.push(".tmp");
    let temp_path = parent.join(temp_name);
    fs::write(&temp_path, contents).context("write ledger temp file")?;
    fs::rename(&temp_path, path).context("finalize ledger file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log() -> (tempfile::TempDir, Arc<InstallLog>) {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let log = InstallLog::load(&dir.path().join("install.xml")).expect("must load");
        (dir, log)
    }

    fn mod_key(name: &str) -> ModKey {
        ModKey::new(name).unwrap()
    }

    fn file_key(path: &str) -> InstallableKey {
        InstallableKey::file(path).unwrap()
    }

    #[test]
    fn ownership_round_trip_pops_one_level() {
        let (_dir, log) = temp_log();
        let ctx = TxContext::new();
        let (a, b) = (mod_key("mod-a"), mod_key("mod-b"));
        let key = file_key("meshes/door.nif");

        log.record_edit(&ctx, &a, key.clone(), Some(Payload::text("v1")))
            .unwrap();
        log.record_edit(&ctx, &b, key.clone(), Some(Payload::text("v2")))
            .unwrap();
        assert_eq!(log.current_owner(&ctx, &key), Some(Owner::Mod(b.clone())));
        assert_eq!(log.previous_owner(&ctx, &key), Some(Owner::Mod(a.clone())));

        let restore = log.uninstall_edit(&ctx, &b, &key).unwrap().unwrap();
        assert_eq!(restore.owner, Owner::Mod(a.clone()));
        assert_eq!(restore.payload, Some(Payload::text("v1")));
        assert_eq!(log.current_owner(&ctx, &key), Some(Owner::Mod(a.clone())));

        let restore = log.uninstall_edit(&ctx, &a, &key).unwrap().unwrap();
        assert_eq!(restore.owner, Owner::Pristine);
        assert_eq!(restore.payload, None);
        assert_eq!(log.current_owner(&ctx, &key), None);
    }

    #[test]
    fn pristine_seed_survives_the_last_uninstall() {
        let (_dir, log) = temp_log();
        let ctx = TxContext::new();
        let a = mod_key("mod-a");
        let key = InstallableKey::parse("ini:game.ini/Display/iSize").unwrap();

        log.record_pristine(&ctx, key.clone(), Payload::text("1024"))
            .unwrap();
        log.record_edit(&ctx, &a, key.clone(), Some(Payload::text("2048")))
            .unwrap();

        let restore = log.uninstall_edit(&ctx, &a, &key).unwrap().unwrap();
        assert_eq!(restore.owner, Owner::Pristine);
        assert_eq!(restore.payload, Some(Payload::text("1024")));
        // The seed stays available for the next install.
        assert_eq!(log.current_owner(&ctx, &key), Some(Owner::Pristine));
    }

    #[test]
    fn record_pristine_never_overwrites_a_real_owner() {
        let (_dir, log) = temp_log();
        let ctx = TxContext::new();
        let a = mod_key("mod-a");
        let key = file_key("textures/a.dds");

        log.record_edit(&ctx, &a, key.clone(), Some(Payload::text("owned")))
            .unwrap();
        log.record_pristine(&ctx, key.clone(), Payload::text("late seed"))
            .unwrap();
        assert_eq!(log.current_owner(&ctx, &key), Some(Owner::Mod(a)));
        assert_eq!(log.previous_payload(&ctx, &key), None);
    }

    #[test]
    fn same_mod_re_edit_creates_no_self_history() {
        let (_dir, log) = temp_log();
        let ctx = TxContext::new();
        let a = mod_key("mod-a");
        let key = file_key("scripts/quest.pex");

        for value in ["v1", "v2", "v3"] {
            log.record_edit(&ctx, &a, key.clone(), Some(Payload::text(value)))
                .unwrap();
            assert_ne!(log.previous_owner(&ctx, &key), Some(Owner::Mod(a.clone())));
        }
        assert_eq!(log.previous_owner(&ctx, &key), Some(Owner::Pristine));
    }

    #[test]
    fn uninstall_by_previous_owner_clears_its_slot_only() {
        let (_dir, log) = temp_log();
        let ctx = TxContext::new();
        let (a, b) = (mod_key("mod-a"), mod_key("mod-b"));
        let key = file_key("sound/fx.wav");

        log.record_edit(&ctx, &a, key.clone(), Some(Payload::text("v1")))
            .unwrap();
        log.record_edit(&ctx, &b, key.clone(), Some(Payload::text("v2")))
            .unwrap();

        assert!(log.uninstall_edit(&ctx, &a, &key).unwrap().is_none());
        assert_eq!(log.current_owner(&ctx, &key), Some(Owner::Mod(b)));
        assert_eq!(log.previous_owner(&ctx, &key), Some(Owner::Pristine));
    }

    #[test]
    fn remove_mod_purges_every_attribution() {
        let (_dir, log) = temp_log();
        let ctx = TxContext::new();
        let (a, b) = (mod_key("mod-a"), mod_key("mod-b"));
        let mine = file_key("only/mine.dds");
        let shared = file_key("shared/file.dds");

        log.record_edit(&ctx, &a, mine.clone(), Some(Payload::text("x")))
            .unwrap();
        log.record_edit(&ctx, &a, shared.clone(), Some(Payload::text("a")))
            .unwrap();
        log.record_edit(&ctx, &b, shared.clone(), Some(Payload::text("b")))
            .unwrap();

        log.remove_mod(&ctx, &a).unwrap();
        assert_eq!(log.current_owner(&ctx, &mine), None);
        assert_eq!(log.current_owner(&ctx, &shared), None);
        assert!(log.mod_record(&ctx, &a).is_none());
    }

    #[test]
    fn replace_owner_keeps_history_depth() {
        let (_dir, log) = temp_log();
        let ctx = TxContext::new();
        let (old, new, other) = (mod_key("old"), mod_key("new"), mod_key("other"));
        let key = file_key("textures/b.dds");

        log.record_edit(&ctx, &other, key.clone(), Some(Payload::text("v1")))
            .unwrap();
        log.record_edit(&ctx, &old, key.clone(), Some(Payload::text("v2")))
            .unwrap();
        log.replace_owner(&ctx, &old, &new).unwrap();

        assert_eq!(log.current_owner(&ctx, &key), Some(Owner::Mod(new)));
        assert_eq!(log.previous_owner(&ctx, &key), Some(Owner::Mod(other)));
    }

    #[test]
    fn upgrade_run_sweeps_unasserted_keys() {
        let (_dir, log) = temp_log();
        let ctx = TxContext::new();
        let a = mod_key("mod-a");
        let kept = file_key("kept.dds");
        let dropped = file_key("dropped.dds");

        log.record_edit(&ctx, &a, kept.clone(), Some(Payload::text("old")))
            .unwrap();
        log.record_edit(&ctx, &a, dropped.clone(), Some(Payload::text("old")))
            .unwrap();

        let mut run = log.begin_upgrade(&ctx, a.clone());
        run.record_edit(&ctx, kept.clone(), Some(Payload::text("new")))
            .unwrap();
        let restores = run.finish(&ctx).unwrap();

        assert_eq!(restores.len(), 1);
        assert_eq!(restores[0].0, dropped);
        assert_eq!(log.current_owner(&ctx, &dropped), None);
        assert_eq!(log.current_owner(&ctx, &kept), Some(Owner::Mod(a)));
        // In-place re-assert replaced the payload without a history level.
        assert_eq!(log.previous_owner(&ctx, &kept), Some(Owner::Pristine));
    }

    #[test]
    fn document_round_trips_through_xml() {
        let (_dir, log) = temp_log();
        let ctx = TxContext::new();
        let a = mod_key("mod-a");
        log.add_mod(&ctx, ModRecord::new(a.clone(), "Mod A", "/mods/a.7z"))
            .unwrap();
        log.record_edit(&ctx, &a, file_key("textures/a.dds"), Some(Payload::bytes([0u8, 255])))
            .unwrap();
        log.record_edit(
            &ctx,
            &a,
            InstallableKey::parse("sdp:shaderpackage019/grass").unwrap(),
            Some(Payload::text("blob")),
        )
        .unwrap();

        let reloaded = InstallLog::load(log.path()).expect("must reload");
        let fresh = TxContext::new();
        assert_eq!(
            reloaded.current_owner(&fresh, &file_key("textures/a.dds")),
            Some(Owner::Mod(a.clone()))
        );
        assert!(reloaded.mod_record(&fresh, &a).is_some());
    }

    #[test]
    fn uncommitted_scope_leaves_the_ledger_untouched() {
        let (_dir, log) = temp_log();
        let ctx = TxContext::new();
        let a = mod_key("mod-a");
        let key = file_key("meshes/wall.nif");

        {
            let _scope = crate::transact::TransactionScope::begin(&ctx);
            log.record_edit(&ctx, &a, key.clone(), Some(Payload::text("v1")))
                .unwrap();
            assert_eq!(log.current_owner(&ctx, &key), Some(Owner::Mod(a.clone())));
        }

        assert_eq!(log.current_owner(&ctx, &key), None);
        assert!(!log.path().exists());
    }
}
