//! Transactional ownership ledger for a game mod manager.
//!
//! Three ledgers back the manager's bookkeeping: the install log records
//! which mod owns each installed file, INI edit, and game value; the active
//! plugin log records which plugins are enabled; the plugin order log records
//! the full load order. All three enlist in a shared in-process transaction
//! so a multi-step operation either lands in every ledger or in none.

pub mod active_log;
pub mod config;
pub mod error;
pub mod install_log;
pub mod keys;
pub mod ledgers;
pub mod mods;
pub mod order_log;
pub mod order_rules;
pub mod plugins;
pub mod transact;
pub mod upgrade;

pub use active_log::{ActivePluginLog, PluginListSerializer, TextPluginList};
pub use config::LedgerConfig;
pub use error::{LedgerError, Result, UpgradeError};
pub use install_log::{EditRecord, InstallLog, Restore, UpgradeRun, INSTALL_LOG_VERSION};
pub use keys::InstallableKey;
pub use ledgers::Ledgers;
pub use mods::{ModKey, ModRecord, Owner, Payload};
pub use order_log::PluginOrderLog;
pub use order_rules::OrderRules;
pub use plugins::{Plugin, PluginName};
pub use transact::{Participant, Transaction, TransactionScope, TxContext, TxId, TxStatus};
pub use upgrade::{UpgradeRegistry, UpgradeTask};
