use crate::error::{LedgerError, Result};
use crate::install_log::write_atomic;
use crate::plugins::PluginName;
use crate::transact::{self, Participant, TxContext, TxId};
use anyhow::Context as _;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Where a plugin list lives and how it is written is game-mode-specific;
/// the logs only ever ask for the whole list.
pub trait PluginListSerializer: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<String>>;
    fn save(&self, plugins: &[String]) -> anyhow::Result<()>;
    fn describe(&self) -> String;
}

/// Newline-separated plugin filenames, the shape most game modes use for
/// their plugins.txt.
pub struct TextPluginList {
    path: PathBuf,
}

impl TextPluginList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TextPluginList { path: path.into() }
    }
}

impl PluginListSerializer for TextPluginList {
    fn load(&self) -> anyhow::Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read plugin list {}", self.path.display()))?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect())
    }

    fn save(&self, plugins: &[String]) -> anyhow::Result<()> {
        let mut contents = plugins.join("\n");
        contents.push('\n');
        write_atomic(&self.path, &contents)
            .with_context(|| format!("write plugin list {}", self.path.display()))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

struct Shadow {
    active: BTreeSet<PluginName>,
    staged: Option<Vec<String>>,
}

struct ActiveLogState {
    committed: BTreeSet<PluginName>,
    shadows: HashMap<TxId, Shadow>,
}

/// The set of plugins currently enabled. Readers inside a transaction see
/// the committed set plus their own pending changes; everyone else sees only
/// the committed set, never a partial one.
pub struct ActivePluginLog {
    serializer: Box<dyn PluginListSerializer>,
    state: Mutex<ActiveLogState>,
}

impl ActivePluginLog {
    pub fn load(serializer: Box<dyn PluginListSerializer>) -> Result<Arc<Self>> {
        let committed = serializer
            .load()
            .map_err(|err| LedgerError::PluginList {
                location: serializer.describe(),
                source: err,
            })?
            .iter()
            .map(|name| PluginName::new(name))
            .collect();
        Ok(Arc::new(ActivePluginLog {
            serializer,
            state: Mutex::new(ActiveLogState {
                committed,
                shadows: HashMap::new(),
            }),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, ActiveLogState> {
        self.state.lock().expect("active plugin log state poisoned")
    }

    fn read<R>(&self, ctx: &TxContext, f: impl FnOnce(&BTreeSet<PluginName>) -> R) -> R {
        let state = self.lock();
        let shadow = ctx
            .current()
            .and_then(|tx| state.shadows.get(&tx.id()))
            .map(|shadow| &shadow.active);
        f(shadow.unwrap_or(&state.committed))
    }

    // Every mutation runs inside a transaction: the ambient one when a scope
    // is open, otherwise a single-operation wrapper so the change still
    // persists atomically.
    fn mutate<R>(
        self: &Arc<Self>,
        ctx: &TxContext,
        f: impl FnOnce(&mut BTreeSet<PluginName>) -> Result<R>,
    ) -> Result<R> {
        transact::with_ambient(ctx, |tx| {
            tx.enlist(Arc::clone(self) as Arc<dyn Participant>)?;
            let mut state = self.lock();
            let ActiveLogState { committed, shadows } = &mut *state;
            let shadow = shadows.entry(tx.id()).or_insert_with(|| Shadow {
                active: committed.clone(),
                staged: None,
            });
            shadow.staged = None;
            f(&mut shadow.active)
        })
    }

    pub fn activate(self: &Arc<Self>, ctx: &TxContext, plugin: PluginName) -> Result<()> {
        self.mutate(ctx, |active| {
            active.insert(plugin);
            Ok(())
        })
    }

    pub fn deactivate(self: &Arc<Self>, ctx: &TxContext, plugin: &PluginName) -> Result<()> {
        self.mutate(ctx, |active| {
            active.remove(plugin);
            Ok(())
        })
    }

    pub fn activate_many(self: &Arc<Self>, ctx: &TxContext, plugins: &[PluginName]) -> Result<()> {
        self.mutate(ctx, |active| {
            active.extend(plugins.iter().cloned());
            Ok(())
        })
    }

    pub fn deactivate_many(
        self: &Arc<Self>,
        ctx: &TxContext,
        plugins: &[PluginName],
    ) -> Result<()> {
        self.mutate(ctx, |active| {
            for plugin in plugins {
                active.remove(plugin);
            }
            Ok(())
        })
    }

    pub fn is_active(&self, ctx: &TxContext, plugin: &PluginName) -> bool {
        self.read(ctx, |active| active.contains(plugin))
    }

    pub fn active_plugins(&self, ctx: &TxContext) -> Vec<PluginName> {
        self.read(ctx, |active| active.iter().cloned().collect())
    }
}

// Add everything the shadow gained, drop everything it lost. With a single
// writer this equals the shadow itself, but the reconcile step keeps commit
// independent of how the shadow was produced.
fn reconcile(
    committed: &BTreeSet<PluginName>,
    shadow: &BTreeSet<PluginName>,
) -> BTreeSet<PluginName> {
    let mut next = committed.clone();
    for removed in committed.difference(shadow) {
        next.remove(removed);
    }
    for added in shadow.difference(committed) {
        next.insert(added.clone());
    }
    next
}

impl Participant for ActivePluginLog {
    fn participant_id(&self) -> &'static str {
        "active-plugin-log"
    }

    fn prepare(&self, tx: TxId) -> anyhow::Result<()> {
        let mut state = self.lock();
        let ActiveLogState { committed, shadows } = &mut *state;
        if let Some(shadow) = shadows.get_mut(&tx) {
            let next = reconcile(committed, &shadow.active);
            shadow.staged = Some(next.iter().map(|name| name.as_str().to_string()).collect());
        }
        Ok(())
    }

    fn commit(&self, tx: TxId) -> anyhow::Result<()> {
        let mut state = self.lock();
        let ActiveLogState { committed, shadows } = &mut *state;
        let Some(shadow) = shadows.get_mut(&tx) else {
            return Ok(());
        };
        let lines = match shadow.staged.take() {
            Some(staged) => staged,
            None => reconcile(committed, &shadow.active)
                .iter()
                .map(|name| name.as_str().to_string())
                .collect(),
        };
        self.serializer
            .save(&lines)
            .with_context(|| format!("persist active plugins to {}", self.serializer.describe()))?;
        let shadow = shadows.remove(&tx).expect("shadow present");
        *committed = shadow.active;
        debug!(tx = %tx, count = committed.len(), "active plugin log committed");
        Ok(())
    }

    fn rollback(&self, tx: TxId) -> anyhow::Result<()> {
        self.lock().shadows.remove(&tx);
        Ok(())
    }

    fn in_doubt(&self, tx: TxId) {
        warn!(tx = %tx, "active plugin log discarding in-doubt shadow");
        self.lock().shadows.remove(&tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transact::TransactionScope;

    fn temp_log() -> (tempfile::TempDir, Arc<ActivePluginLog>) {
        let dir = tempfile::tempdir().expect("must create temp dir");
        let serializer = TextPluginList::new(dir.path().join("plugins.txt"));
        let log = ActivePluginLog::load(Box::new(serializer)).expect("must load");
        (dir, log)
    }

    #[test]
    fn single_operations_persist_without_an_explicit_scope() {
        let (dir, log) = temp_log();
        let ctx = TxContext::new();
        log.activate(&ctx, PluginName::new("quest.esp")).unwrap();
        assert!(log.is_active(&ctx, &PluginName::new("Quest.ESP")));
        let raw = fs::read_to_string(dir.path().join("plugins.txt")).unwrap();
        assert_eq!(raw, "quest.esp\n");
    }

    #[test]
    fn readers_outside_the_transaction_see_committed_state_only() {
        let (_dir, log) = temp_log();
        let ctx = TxContext::new();
        let outside = TxContext::new();
        let scope = TransactionScope::begin(&ctx);
        log.activate(&ctx, PluginName::new("a.esp")).unwrap();
        assert!(log.is_active(&ctx, &PluginName::new("a.esp")));
        assert!(!log.is_active(&outside, &PluginName::new("a.esp")));
        scope.complete().unwrap();
        assert!(log.is_active(&outside, &PluginName::new("a.esp")));
    }

    #[test]
    fn dropped_scope_discards_pending_activations() {
        let (dir, log) = temp_log();
        let ctx = TxContext::new();
        {
            let _scope = TransactionScope::begin(&ctx);
            log.activate_many(
                &ctx,
                &[PluginName::new("a.esp"), PluginName::new("b.esp")],
            )
            .unwrap();
        }
        assert!(log.active_plugins(&ctx).is_empty());
        assert!(!dir.path().join("plugins.txt").exists());
    }

    #[test]
    fn text_serializer_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.txt");
        fs::write(&path, "# header\n\na.esp\n  b.esp  \n").unwrap();
        let list = TextPluginList::new(path);
        assert_eq!(list.load().unwrap(), vec!["a.esp", "b.esp"]);
    }

    #[test]
    fn reconcile_applies_adds_and_removes() {
        let committed: BTreeSet<PluginName> =
            [PluginName::new("a.esp"), PluginName::new("b.esp")].into();
        let mut shadow = committed.clone();
        shadow.remove(&PluginName::new("a.esp"));
        shadow.insert(PluginName::new("c.esp"));
        let next = reconcile(&committed, &shadow);
        assert_eq!(next, shadow);
    }
}
