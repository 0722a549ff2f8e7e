use crate::active_log::PluginListSerializer;
use crate::error::{LedgerError, Result};
use crate::order_rules::OrderRules;
use crate::plugins::{Plugin, PluginName};
use crate::transact::{self, Participant, TxContext, TxId};
use anyhow::Context as _;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

struct Shadow {
    order: Vec<Plugin>,
    staged: Option<Vec<String>>,
}

struct OrderLogState {
    committed: Vec<Plugin>,
    shadows: HashMap<TxId, Shadow>,
}

/// Total load order of every known plugin. Transaction-aware like the other
/// ledgers; every reorder is run through the order corrector before it is
/// considered final, so the committed order always satisfies the game's
/// structural constraints.
pub struct PluginOrderLog {
    serializer: Box<dyn PluginListSerializer>,
    rules: OrderRules,
    state: Mutex<OrderLogState>,
}

impl PluginOrderLog {
    pub fn load(serializer: Box<dyn PluginListSerializer>, rules: OrderRules) -> Result<Arc<Self>> {
        let names = serializer.load().map_err(|err| LedgerError::PluginList {
            location: serializer.describe(),
            source: err,
        })?;
        let plugins = names
            .iter()
            .map(|name| Plugin::new(name.as_str()))
            .collect();
        let committed = rules.correct(plugins);
        Ok(Arc::new(PluginOrderLog {
            serializer,
            rules,
            state: Mutex::new(OrderLogState {
                committed,
                shadows: HashMap::new(),
            }),
        }))
    }

    pub fn rules(&self) -> &OrderRules {
        &self.rules
    }

    fn lock(&self) -> MutexGuard<'_, OrderLogState> {
        self.state.lock().expect("plugin order log state poisoned")
    }

    fn read<R>(&self, ctx: &TxContext, f: impl FnOnce(&[Plugin]) -> R) -> R {
        let state = self.lock();
        let shadow = ctx
            .current()
            .and_then(|tx| state.shadows.get(&tx.id()))
            .map(|shadow| shadow.order.as_slice());
        f(shadow.unwrap_or(&state.committed))
    }

    fn mutate<R>(
        self: &Arc<Self>,
        ctx: &TxContext,
        f: impl FnOnce(&OrderRules, &mut Vec<Plugin>) -> Result<R>,
    ) -> Result<R> {
        transact::with_ambient(ctx, |tx| {
            tx.enlist(Arc::clone(self) as Arc<dyn Participant>)?;
            let mut state = self.lock();
            let OrderLogState { committed, shadows } = &mut *state;
            let shadow = shadows.entry(tx.id()).or_insert_with(|| Shadow {
                order: committed.clone(),
                staged: None,
            });
            shadow.staged = None;
            f(&self.rules, &mut shadow.order)
        })
    }

    /// Adds a plugin to the order, or refreshes the stored flags and master
    /// list when it is already known. New plugins join at the end and the
    /// corrector settles their real position.
    pub fn register(self: &Arc<Self>, ctx: &TxContext, plugin: Plugin) -> Result<()> {
        self.mutate(ctx, |rules, order| {
            match order.iter_mut().find(|known| known.name == plugin.name) {
                Some(known) => *known = plugin,
                None => order.push(plugin),
            }
            *order = rules.correct(std::mem::take(order));
            Ok(())
        })
    }

    pub fn remove(self: &Arc<Self>, ctx: &TxContext, plugin: &PluginName) -> Result<()> {
        self.mutate(ctx, |_, order| {
            order.retain(|known| &known.name != plugin);
            Ok(())
        })
    }

    /// Reorders only the plugins named. A plugin not named keeps its place
    /// relative to its old neighborhood: it is re-inserted immediately after
    /// whatever plugin preceded it before the call.
    pub fn set_order(self: &Arc<Self>, ctx: &TxContext, names: &[PluginName]) -> Result<()> {
        self.mutate(ctx, |rules, order| {
            let next = reorder(order, names);
            *order = rules.correct(next);
            Ok(())
        })
    }

    /// Moves one plugin to `index`, expressed as a full reorder.
    pub fn set_index(
        self: &Arc<Self>,
        ctx: &TxContext,
        plugin: &PluginName,
        index: usize,
    ) -> Result<()> {
        self.mutate(ctx, |rules, order| {
            let Some(current) = order.iter().position(|known| &known.name == plugin) else {
                return Err(LedgerError::UnknownPlugin(plugin.to_string()));
            };
            let moved = order.remove(current);
            let index = index.min(order.len());
            order.insert(index, moved);
            *order = rules.correct(std::mem::take(order));
            Ok(())
        })
    }

    pub fn ordered_plugins(&self, ctx: &TxContext) -> Vec<Plugin> {
        self.read(ctx, |order| order.to_vec())
    }

    pub fn plugin_names(&self, ctx: &TxContext) -> Vec<PluginName> {
        self.read(ctx, |order| {
            order.iter().map(|plugin| plugin.name.clone()).collect()
        })
    }

    pub fn contains(&self, ctx: &TxContext, plugin: &PluginName) -> bool {
        self.read(ctx, |order| {
            order.iter().any(|known| &known.name == plugin)
        })
    }

    pub fn index_of(&self, ctx: &TxContext, plugin: &PluginName) -> Option<usize> {
        self.read(ctx, |order| {
            order.iter().position(|known| &known.name == plugin)
        })
    }
}

fn reorder(current: &[Plugin], names: &[PluginName]) -> Vec<Plugin> {
    let by_name: HashMap<&PluginName, &Plugin> = current
        .iter()
        .map(|plugin| (&plugin.name, plugin))
        .collect();
    let named: HashSet<&PluginName> = names
        .iter()
        .filter(|name| by_name.contains_key(name))
        .collect();

    let mut next: Vec<Plugin> = names
        .iter()
        .filter_map(|name| by_name.get(name).map(|plugin| (*plugin).clone()))
        .collect();

    for (index, plugin) in current.iter().enumerate() {
        if named.contains(&plugin.name) {
            continue;
        }
        if index == 0 {
            next.insert(0, plugin.clone());
            continue;
        }
        let anchor = &current[index - 1].name;
        match next.iter().position(|placed| &placed.name == anchor) {
            Some(at) => next.insert(at + 1, plugin.clone()),
            None => next.push(plugin.clone()),
        }
    }

    next
}

impl Participant for PluginOrderLog {
    fn participant_id(&self) -> &'static str {
        "plugin-order-log"
    }

    fn prepare(&self, tx: TxId) -> anyhow::Result<()> {
        let mut state = self.lock();
        if let Some(shadow) = state.shadows.get_mut(&tx) {
            shadow.staged = Some(
                shadow
                    .order
                    .iter()
                    .map(|plugin| plugin.name.as_str().to_string())
                    .collect(),
            );
        }
        Ok(())
    }

    fn commit(&self, tx: TxId) -> anyhow::Result<()> {
        let mut state = self.lock();
        let Some(shadow) = state.shadows.get_mut(&tx) else {
            return Ok(());
        };
        let lines = match shadow.staged.take() {
            Some(staged) => staged,
            None => shadow
                .order
                .iter()
                .map(|plugin| plugin.name.as_str().to_string())
                .collect(),
        };
        self.serializer
            .save(&lines)
            .with_context(|| format!("persist load order to {}", self.serializer.describe()))?;
        let shadow = state.shadows.remove(&tx).expect("shadow present");
        state.committed = shadow.order;
        debug!(tx = %tx, count = state.committed.len(), "plugin order log committed");
        Ok(())
    }

    fn rollback(&self, tx: TxId) -> anyhow::Result<()> {
        self.lock().shadows.remove(&tx);
        Ok(())
    }

    fn in_doubt(&self, tx: TxId) {
        warn!(tx = %tx, "plugin order log discarding in-doubt shadow");
        self.lock().shadows.remove(&tx);
    }
}
