//! The single context object
//!
//! `LedgerContext` owns every piece of mutable state: the ledger store, the
//! token guard's consumed set and the key manager's active key. Nothing is
//! global. Mutating commands run one at a time under `write_gate`; read-only
//! commands work on a store snapshot and never wait for it.

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::fs;
use std::sync::Arc;
use tracing::{info, warn};
use vigil_core::{Clock, Result, VigilConfig};
use vigil_governance::GovernanceKernel;
use vigil_guards::TokenGuard;
use vigil_ledger::{LedgerStore, StoreOptions};
use vigil_signature::KeyManager;

/// Everything a command needs
pub struct LedgerContext {
    config: VigilConfig,
    clock: Arc<dyn Clock>,
    store: RwLock<Arc<LedgerStore>>,
    keys: KeyManager,
    guard: TokenGuard,
    write_gate: Mutex<()>,
}

impl LedgerContext {
    /// Open every component under `config.data_dir`
    pub fn open(config: VigilConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let paths = config.paths();
        fs::create_dir_all(&paths.root)?;
        let keys = KeyManager::open(
            &paths.keys,
            config.hash_algorithm,
            config.keys.min_rotation_interval_secs,
            clock.now(),
        )?;
        Self::with_keys(config, clock, keys)
    }

    /// Open with an already constructed key manager
    pub fn with_keys(config: VigilConfig, clock: Arc<dyn Clock>, keys: KeyManager) -> Result<Self> {
        config.validate()?;
        let paths = config.paths();
        fs::create_dir_all(&paths.root)?;
        let store = LedgerStore::open(StoreOptions::from_config(&config), Arc::clone(&clock))?;
        let guard = TokenGuard::open(
            &paths.token_state,
            config.hash_algorithm,
            config.token.max_consumed_nonces,
        )?;

        let context = Self {
            config,
            clock,
            store: RwLock::new(Arc::new(store)),
            keys,
            guard,
            write_gate: Mutex::new(()),
        };
        context.reconcile_keys();
        info!(
            data_dir = %context.config.data_dir.display(),
            entries = context.store().len(),
            key_id = %context.keys.active_key_id(),
            "ledger context opened"
        );
        Ok(context)
    }

    /// Bring the key lineage up to date with rotations in the ledger
    ///
    /// A failure leaves the lineage as loaded; the divergence scan reports
    /// the entries that no longer verify.
    fn reconcile_keys(&self) {
        let store = self.store();
        match self.keys.reconcile(&store.snapshot().entries) {
            Ok(0) => {}
            Ok(applied) => info!(applied, "key lineage reconciled with ledger"),
            Err(e) => warn!(error = %e, "key lineage could not be reconciled with ledger"),
        }
    }

    /// Current store
    pub fn store(&self) -> Arc<LedgerStore> {
        Arc::clone(&self.store.read())
    }

    /// Key manager
    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    /// Token guard
    pub fn guard(&self) -> &TokenGuard {
        &self.guard
    }

    /// Clock
    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    /// Shared handle on the clock
    pub fn shared_clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Effective configuration
    pub fn config(&self) -> &VigilConfig {
        &self.config
    }

    /// Governance kernel over `store`
    pub fn kernel<'a>(&'a self, store: &'a LedgerStore) -> GovernanceKernel<'a> {
        GovernanceKernel::new(
            store,
            &self.keys,
            &self.guard,
            &*self.clock,
            self.config.token.required_policy_approvals,
        )
    }

    /// Serialize a mutating command
    pub(crate) fn write_gate(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock()
    }

    /// Reopen the store after its files were replaced
    ///
    /// Callers must hold the write gate.
    pub(crate) fn reopen_store(&self) -> Result<()> {
        let reopened = LedgerStore::open(
            StoreOptions::from_config(&self.config),
            Arc::clone(&self.clock),
        )?;
        *self.store.write() = Arc::new(reopened);
        self.reconcile_keys();
        Ok(())
    }
}

impl std::fmt::Debug for LedgerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerContext")
            .field("data_dir", &self.config.data_dir)
            .field("store", &*self.store.read())
            .finish_non_exhaustive()
    }
}
