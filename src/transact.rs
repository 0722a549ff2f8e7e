use crate::error::{LedgerError, Result};
use anyhow::Context as _;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(u64);

impl TxId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Committed,
    Aborted,
    InDoubt,
}

impl TxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::Active => "active",
            TxStatus::Committed => "committed",
            TxStatus::Aborted => "aborted",
            TxStatus::InDoubt => "in-doubt",
        }
    }
}

/// A unit of work enlisted in a transaction. Once enlisted, a participant
/// receives exactly one of commit/rollback/in-doubt before the transaction is
/// discarded.
///
/// `prepare` is the participant's vote; there is no explicit "vote no", a
/// participant that cannot proceed fails its vote instead. `in_doubt`
/// is fire-and-forget: the transaction cannot recover once in doubt, so
/// errors there are not escalated.
pub trait Participant: Send + Sync {
    fn participant_id(&self) -> &'static str;
    fn prepare(&self, tx: TxId) -> anyhow::Result<()>;
    fn commit(&self, tx: TxId) -> anyhow::Result<()>;
    fn rollback(&self, tx: TxId) -> anyhow::Result<()>;
    fn in_doubt(&self, tx: TxId);
}

struct TxInner {
    status: TxStatus,
    participants: Vec<Arc<dyn Participant>>,
}

/// In-process two-phase transaction: prepare asks every enlisted participant
/// to vote, commit applies, rollback discards. There is no durable
/// write-ahead log, so a participant failing mid-commit leaves the
/// transaction in the terminal `InDoubt` state rather than retrying.
pub struct Transaction {
    id: TxId,
    inner: Mutex<TxInner>,
}

impl Transaction {
    fn new(id: TxId) -> Self {
        Transaction {
            id,
            inner: Mutex::new(TxInner {
                status: TxStatus::Active,
                participants: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn status(&self) -> TxStatus {
        self.lock().status
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TxInner> {
        // A poisoned transaction lock means a participant panicked while the
        // coordinator held it; carrying on would commit half a transaction.
        self.inner.lock().expect("transaction state poisoned")
    }

    /// Registers a participant, idempotently per participant id.
    pub fn enlist(&self, participant: Arc<dyn Participant>) -> Result<()> {
        let mut inner = self.lock();
        if inner.status != TxStatus::Active {
            return Err(LedgerError::NotActive {
                txid: self.id.raw(),
                status: inner.status.as_str(),
            });
        }
        let id = participant.participant_id();
        if inner
            .participants
            .iter()
            .any(|enlisted| enlisted.participant_id() == id)
        {
            return Ok(());
        }
        debug!(tx = %self.id, participant = id, "enlisted");
        inner.participants.push(participant);
        Ok(())
    }

    fn active_participants(&self) -> Result<Vec<Arc<dyn Participant>>> {
        let inner = self.lock();
        if inner.status != TxStatus::Active {
            return Err(LedgerError::NotActive {
                txid: self.id.raw(),
                status: inner.status.as_str(),
            });
        }
        Ok(inner.participants.clone())
    }

    fn set_status(&self, status: TxStatus) {
        self.lock().status = status;
    }

    /// First phase: every participant votes. A participant that fails to
    /// vote moves the transaction to `InDoubt`; the remaining participants
    /// are notified and the transaction is unusable afterwards.
    pub fn prepare(&self) -> Result<()> {
        let participants = self.active_participants()?;
        for participant in &participants {
            if let Err(err) = participant.prepare(self.id) {
                self.set_status(TxStatus::InDoubt);
                error!(
                    tx = %self.id,
                    participant = participant.participant_id(),
                    "prepare vote failed: {err:#}"
                );
                for notified in participants.iter().rev() {
                    notified.in_doubt(self.id);
                }
                return Err(LedgerError::InDoubt {
                    txid: self.id.raw(),
                    reason: format!(
                        "participant '{}' failed to vote: {err:#}",
                        participant.participant_id()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Second phase. Participants observe commit in reverse-enlistment order;
    /// that order is not observable externally and participants must not
    /// depend on it.
    pub fn commit(&self) -> Result<()> {
        let participants = self.active_participants()?;
        for (done, participant) in participants.iter().rev().enumerate() {
            if let Err(err) = participant.commit(self.id) {
                self.set_status(TxStatus::InDoubt);
                error!(
                    tx = %self.id,
                    participant = participant.participant_id(),
                    "commit failed, transaction is in doubt: {err:#}"
                );
                // Participants not reached yet still get their one terminal
                // signal; the ones already committed cannot be walked back.
                for notified in participants.iter().rev().skip(done) {
                    notified.in_doubt(self.id);
                }
                return Err(LedgerError::InDoubt {
                    txid: self.id.raw(),
                    reason: format!(
                        "participant '{}' failed to commit: {err:#}",
                        participant.participant_id()
                    ),
                });
            }
        }
        self.set_status(TxStatus::Committed);
        debug!(tx = %self.id, "committed");
        Ok(())
    }

    /// Rolls every participant back. One participant failing must not stop
    /// the others; failures are collected and reported as an aggregate.
    pub fn rollback(&self) -> Result<()> {
        let participants = {
            let mut inner = self.lock();
            if inner.status == TxStatus::Aborted {
                return Err(LedgerError::invariant(format!(
                    "{} is already aborted",
                    self.id
                )));
            }
            inner.status = TxStatus::Aborted;
            inner.participants.clone()
        };

        let mut failures = Vec::new();
        for participant in participants.iter().rev() {
            if let Err(err) = participant
                .rollback(self.id)
                .with_context(|| format!("participant '{}'", participant.participant_id()))
            {
                warn!(tx = %self.id, "rollback failure: {err:#}");
                failures.push(err);
            }
        }

        if failures.is_empty() {
            debug!(tx = %self.id, "rolled back");
            Ok(())
        } else {
            Err(LedgerError::RollbackFailed { failures })
        }
    }
}

struct AmbientTx {
    tx: Arc<Transaction>,
    depth: usize,
}

/// The explicit stand-in for an ambient transaction: a handle passed into
/// every ledger call. One active transaction may span multiple calls; nested
/// scopes opened on the same context share it.
pub struct TxContext {
    next_id: AtomicU64,
    current: Mutex<Option<AmbientTx>>,
}

impl TxContext {
    pub fn new() -> Self {
        TxContext {
            next_id: AtomicU64::new(1),
            current: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<Arc<Transaction>> {
        self.current
            .lock()
            .expect("transaction context poisoned")
            .as_ref()
            .map(|ambient| Arc::clone(&ambient.tx))
    }
}

impl Default for TxContext {
    fn default() -> Self {
        TxContext::new()
    }
}

/// Ergonomic wrapper over one transaction. Opening a scope adopts the
/// context's current transaction when one exists, otherwise creates a new
/// one. `complete` on the outermost scope triggers prepare+commit; dropping
/// an incomplete scope rolls the transaction back.
pub struct TransactionScope<'a> {
    ctx: &'a TxContext,
    tx: Arc<Transaction>,
    outermost: bool,
    completed: bool,
}

impl<'a> TransactionScope<'a> {
    pub fn begin(ctx: &'a TxContext) -> Self {
        let mut current = ctx.current.lock().expect("transaction context poisoned");
        match current.as_mut() {
            Some(ambient) => {
                ambient.depth += 1;
                TransactionScope {
                    ctx,
                    tx: Arc::clone(&ambient.tx),
                    outermost: false,
                    completed: false,
                }
            }
            None => {
                let id = TxId(ctx.next_id.fetch_add(1, Ordering::Relaxed));
                let tx = Arc::new(Transaction::new(id));
                *current = Some(AmbientTx {
                    tx: Arc::clone(&tx),
                    depth: 1,
                });
                debug!(tx = %id, "transaction opened");
                TransactionScope {
                    ctx,
                    tx,
                    outermost: true,
                    completed: false,
                }
            }
        }
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.tx
    }

    /// Marks the scope as done. Only the outermost scope actually drives the
    /// two-phase protocol; inner completes are coordination no-ops.
    pub fn complete(mut self) -> Result<()> {
        self.completed = true;
        if !self.outermost {
            return Ok(());
        }
        self.tx.prepare()?;
        self.tx.commit()
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        {
            let mut current = self
                .ctx
                .current
                .lock()
                .expect("transaction context poisoned");
            if let Some(ambient) = current.as_mut() {
                ambient.depth -= 1;
                if ambient.depth == 0 {
                    *current = None;
                }
            }
        }
        if !self.completed && self.tx.status() == TxStatus::Active {
            if let Err(err) = self.tx.rollback() {
                error!(tx = %self.tx.id(), "rollback on scope drop failed: {err}");
            }
        }
    }
}

/// Runs `f` inside the ambient transaction, opening a single-operation scope
/// when none is active. Ledger mutations call through here so callers outside
/// an explicit scope still get atomic persistence.
pub(crate) fn with_ambient<R>(
    ctx: &TxContext,
    f: impl FnOnce(&Arc<Transaction>) -> Result<R>,
) -> Result<R> {
    let scope = TransactionScope::begin(ctx);
    let out = f(scope.transaction())?;
    scope.complete()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Probe {
        prepares: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
        doubts: AtomicUsize,
        fail_prepare: bool,
        fail_commit: bool,
        fail_rollback: bool,
    }

    impl Participant for Probe {
        fn participant_id(&self) -> &'static str {
            "probe"
        }

        fn prepare(&self, _tx: TxId) -> anyhow::Result<()> {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            if self.fail_prepare {
                anyhow::bail!("refusing to vote");
            }
            Ok(())
        }

        fn commit(&self, _tx: TxId) -> anyhow::Result<()> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            if self.fail_commit {
                anyhow::bail!("disk full");
            }
            Ok(())
        }

        fn rollback(&self, _tx: TxId) -> anyhow::Result<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            if self.fail_rollback {
                anyhow::bail!("shadow table corrupt");
            }
            Ok(())
        }

        fn in_doubt(&self, _tx: TxId) {
            self.doubts.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Named(&'static str, Arc<Probe>);

    impl Participant for Named {
        fn participant_id(&self) -> &'static str {
            self.0
        }
        fn prepare(&self, tx: TxId) -> anyhow::Result<()> {
            self.1.prepare(tx)
        }
        fn commit(&self, tx: TxId) -> anyhow::Result<()> {
            self.1.commit(tx)
        }
        fn rollback(&self, tx: TxId) -> anyhow::Result<()> {
            self.1.rollback(tx)
        }
        fn in_doubt(&self, tx: TxId) {
            self.1.in_doubt(tx)
        }
    }

    #[test]
    fn scope_completes_through_two_phases() {
        let ctx = TxContext::new();
        let probe = Arc::new(Probe::default());
        let scope = TransactionScope::begin(&ctx);
        let tx = Arc::clone(scope.transaction());
        tx.enlist(probe.clone()).expect("must enlist");
        scope.complete().expect("must commit");
        assert_eq!(tx.status(), TxStatus::Committed);
        assert_eq!(probe.prepares.load(Ordering::SeqCst), 1);
        assert_eq!(probe.commits.load(Ordering::SeqCst), 1);
        assert_eq!(probe.rollbacks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn enlist_is_idempotent_per_participant() {
        let ctx = TxContext::new();
        let probe = Arc::new(Probe::default());
        let scope = TransactionScope::begin(&ctx);
        let tx = Arc::clone(scope.transaction());
        tx.enlist(probe.clone()).unwrap();
        tx.enlist(probe.clone()).unwrap();
        scope.complete().expect("must commit");
        assert_eq!(probe.commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn enlist_fails_once_not_active() {
        let ctx = TxContext::new();
        let scope = TransactionScope::begin(&ctx);
        let tx = Arc::clone(scope.transaction());
        scope.complete().expect("must commit");
        let err = tx.enlist(Arc::new(Probe::default())).unwrap_err();
        assert!(matches!(err, LedgerError::NotActive { .. }));
    }

    #[test]
    fn dropping_an_incomplete_scope_rolls_back() {
        let ctx = TxContext::new();
        let probe = Arc::new(Probe::default());
        let tx = {
            let scope = TransactionScope::begin(&ctx);
            let tx = Arc::clone(scope.transaction());
            tx.enlist(probe.clone()).unwrap();
            tx
        };
        assert_eq!(tx.status(), TxStatus::Aborted);
        assert_eq!(probe.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(probe.commits.load(Ordering::SeqCst), 0);
        assert!(ctx.current().is_none());
    }

    #[test]
    fn nested_scopes_share_the_outermost_transaction() {
        let ctx = TxContext::new();
        let probe = Arc::new(Probe::default());
        let outer = TransactionScope::begin(&ctx);
        let outer_tx = Arc::clone(outer.transaction());
        {
            let inner = TransactionScope::begin(&ctx);
            assert_eq!(inner.transaction().id(), outer_tx.id());
            inner.transaction().enlist(probe.clone()).unwrap();
            inner.complete().expect("inner complete is a no-op");
        }
        // Inner completion must not have driven prepare/commit.
        assert_eq!(probe.prepares.load(Ordering::SeqCst), 0);
        outer.complete().expect("must commit");
        assert_eq!(probe.commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_inner_scope_dooms_the_transaction() {
        let ctx = TxContext::new();
        let outer = TransactionScope::begin(&ctx);
        {
            let _inner = TransactionScope::begin(&ctx);
        }
        assert!(matches!(
            outer.complete().unwrap_err(),
            LedgerError::NotActive { .. }
        ));
    }

    #[test]
    fn failed_prepare_moves_to_in_doubt_and_notifies() {
        let ctx = TxContext::new();
        let probe = Arc::new(Probe {
            fail_prepare: true,
            ..Probe::default()
        });
        let scope = TransactionScope::begin(&ctx);
        let tx = Arc::clone(scope.transaction());
        tx.enlist(probe.clone()).unwrap();
        let err = scope.complete().unwrap_err();
        assert!(matches!(err, LedgerError::InDoubt { .. }));
        assert_eq!(tx.status(), TxStatus::InDoubt);
        assert_eq!(probe.doubts.load(Ordering::SeqCst), 1);
        assert_eq!(probe.rollbacks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_commit_is_terminal_in_doubt() {
        let ctx = TxContext::new();
        let probe = Arc::new(Probe {
            fail_commit: true,
            ..Probe::default()
        });
        let scope = TransactionScope::begin(&ctx);
        let tx = Arc::clone(scope.transaction());
        tx.enlist(probe.clone()).unwrap();
        let err = scope.complete().unwrap_err();
        assert!(matches!(err, LedgerError::InDoubt { .. }));
        assert_eq!(tx.status(), TxStatus::InDoubt);
    }

    #[test]
    fn failed_commit_notifies_unreached_participants() {
        let ctx = TxContext::new();
        let stranded = Arc::new(Probe::default());
        let failing = Arc::new(Probe {
            fail_commit: true,
            ..Probe::default()
        });
        let scope = TransactionScope::begin(&ctx);
        let tx = Arc::clone(scope.transaction());
        // Reverse-enlistment commit order reaches `failing` first.
        tx.enlist(Arc::new(Named("stranded", stranded.clone())))
            .unwrap();
        tx.enlist(Arc::new(Named("failing", failing.clone()))).unwrap();

        assert!(matches!(
            scope.complete().unwrap_err(),
            LedgerError::InDoubt { .. }
        ));
        // Every enlisted participant got exactly one terminal signal.
        assert_eq!(failing.doubts.load(Ordering::SeqCst), 1);
        assert_eq!(stranded.doubts.load(Ordering::SeqCst), 1);
        assert_eq!(stranded.commits.load(Ordering::SeqCst), 0);
        assert_eq!(stranded.rollbacks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rollback_failures_are_aggregated_not_short_circuited() {
        let ctx = TxContext::new();
        let bad = Arc::new(Probe {
            fail_rollback: true,
            ..Probe::default()
        });
        let good = Arc::new(Probe::default());
        let scope = TransactionScope::begin(&ctx);
        let tx = Arc::clone(scope.transaction());
        tx.enlist(Arc::new(Named("bad", bad.clone()))).unwrap();
        tx.enlist(Arc::new(Named("good", good.clone()))).unwrap();
        drop(scope);
        // Both participants got their chance despite the first failure.
        assert_eq!(bad.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(good.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(tx.status(), TxStatus::Aborted);
    }

    #[test]
    fn explicit_rollback_of_aborted_transaction_is_an_error() {
        let ctx = TxContext::new();
        let tx = {
            let scope = TransactionScope::begin(&ctx);
            Arc::clone(scope.transaction())
        };
        assert_eq!(tx.status(), TxStatus::Aborted);
        assert!(tx.rollback().is_err());
    }
}
