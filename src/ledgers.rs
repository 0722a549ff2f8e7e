use crate::active_log::{ActivePluginLog, TextPluginList};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::install_log::InstallLog;
use crate::order_log::PluginOrderLog;
use crate::order_rules::OrderRules;
use crate::plugins::{Plugin, PluginName};
use crate::transact::{TransactionScope, TxContext};
use crate::upgrade::UpgradeRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Single entry point to the three ledgers. Holds the process-wide
/// transaction context, so operations spanning several ledgers commit or
/// roll back together. Only one instance may exist at a time; `initialize`
/// refuses a second until the first is released.
pub struct Ledgers {
    config: LedgerConfig,
    ctx: TxContext,
    install: Arc<InstallLog>,
    active: Arc<ActivePluginLog>,
    order: Arc<PluginOrderLog>,
}

impl Ledgers {
    /// Opens the ledgers described by `config`, migrating the install log
    /// file first when it was written by an older release.
    pub fn initialize(config: LedgerConfig) -> Result<Self> {
        if INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(LedgerError::invariant(
                "ledgers are already initialized in this process",
            ));
        }
        match Self::open(config) {
            Ok(ledgers) => Ok(ledgers),
            Err(err) => {
                INITIALIZED.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn open(config: LedgerConfig) -> Result<Self> {
        let install_path = config.install_log_path();
        UpgradeRegistry::standard().upgrade(&install_path)?;

        let install = InstallLog::load(&install_path)?;
        let active = ActivePluginLog::load(Box::new(TextPluginList::new(
            config.active_list_path(),
        )))?;
        let rules = OrderRules::new(
            config
                .critical_plugins
                .iter()
                .map(|name| PluginName::new(name))
                .collect(),
        );
        let order = PluginOrderLog::load(
            Box::new(TextPluginList::new(config.order_list_path())),
            rules,
        )?;

        info!(data_dir = %config.data_dir.display(), "ledgers initialized");
        Ok(Ledgers {
            config,
            ctx: TxContext::new(),
            install,
            active,
            order,
        })
    }

    /// Explicit shutdown. Dropping has the same effect; this form reads
    /// better at call sites that hand the ledgers back deliberately.
    pub fn release(self) {}

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn ctx(&self) -> &TxContext {
        &self.ctx
    }

    /// Opens a transaction scope on the shared context. Ledger calls made
    /// while the scope lives join one transaction.
    pub fn begin(&self) -> TransactionScope<'_> {
        TransactionScope::begin(&self.ctx)
    }

    pub fn install_log(&self) -> &Arc<InstallLog> {
        &self.install
    }

    pub fn active_log(&self) -> &Arc<ActivePluginLog> {
        &self.active
    }

    pub fn order_log(&self) -> &Arc<PluginOrderLog> {
        &self.order
    }

    /// Adds a plugin to the load order and optionally activates it, as one
    /// transaction.
    pub fn add_plugin(&self, plugin: Plugin, activate: bool) -> Result<()> {
        let scope = self.begin();
        let name = plugin.name.clone();
        self.order.register(&self.ctx, plugin)?;
        if activate {
            self.active.activate(&self.ctx, name)?;
        }
        scope.complete()
    }

    /// Activates a plugin that is already in the load order. Activation of a
    /// plugin the order log does not know is refused.
    pub fn activate_plugin(&self, plugin: PluginName) -> Result<()> {
        if !self.order.contains(&self.ctx, &plugin) {
            return Err(LedgerError::UnknownPlugin(plugin.to_string()));
        }
        self.active.activate(&self.ctx, plugin)
    }

    /// Drops a plugin from both plugin ledgers in one transaction.
    pub fn remove_plugin(&self, plugin: &PluginName) -> Result<()> {
        let scope = self.begin();
        self.active.deactivate(&self.ctx, plugin)?;
        self.order.remove(&self.ctx, plugin)?;
        scope.complete()
    }
}

impl Drop for Ledgers {
    fn drop(&mut self) {
        INITIALIZED.store(false, Ordering::SeqCst);
    }
}
