// src/guard.rs
//! Pre-broadcast checks protecting in-flight mixing workflows.
//!
//! Both checks run before the delegated broadcast call and neither
//! mutates state. When both reservation locks are needed they are
//! acquired in the fixed order denom-then-collateral.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{MixingError, MixingResult};
use crate::store::WalletStore;
use crate::types::Transaction;

pub struct DoubleSpendGuard {
    store: Arc<dyn WalletStore>,
    denoms_lock: Mutex<()>,
    collateral_lock: Mutex<()>,
}

impl DoubleSpendGuard {
    pub fn new(store: Arc<dyn WalletStore>) -> Self {
        DoubleSpendGuard { store, denoms_lock: Mutex::new(()), collateral_lock: Mutex::new(()) }
    }

    /// Vet a transaction before broadcast.
    ///
    /// Always rejects spends to addresses reserved for mixing. When
    /// `dspend_warn` carries the active warning text, also rejects
    /// transactions consuming outpoints reserved by active workflows.
    pub async fn check_before_broadcast(
        &self,
        tx: &Transaction,
        dspend_warn: Option<&str>,
    ) -> MixingResult<()> {
        let ps_addresses = self.store.get_ps_addresses();
        for output in &tx.outputs {
            if ps_addresses.contains(&output.address) {
                return Err(MixingError::SpendToReservedAddress);
            }
        }

        let warn = match dspend_warn {
            Some(warn) if !warn.is_empty() => warn,
            _ => return Ok(()),
        };
        let _denoms = self.denoms_lock.lock().await;
        let _collateral = self.collateral_lock.lock().await;
        for input in &tx.inputs {
            if self.store.get_ps_spending_collateral(&input.prevout).is_some()
                || self.store.get_ps_spending_denom(&input.prevout).is_some()
            {
                return Err(MixingError::PossibleDoubleSpend(warn.to_string()));
            }
        }
        Ok(())
    }
}
