// src/store.rs
//! Persistence collaborator. The wallet store is the single source of
//! truth for all workflow and classification data; in-memory caches
//! must be rebuildable from it at any time.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde_json::Value;

use crate::classify::MixTxType;
use crate::types::{Address, Duffs, OutPoint, Transaction, Txid};

/// Recognized mixing denomination output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsDenom {
    pub address: Address,
    pub value: Duffs,
    pub rounds: u32,
}

/// Recognized collateral or foreign-deposit ("other") output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsCoinData {
    pub address: Address,
    pub value: Duffs,
}

/// Wallet persistence surface consumed by the mixing engine.
///
/// Implementations are synchronous; long passes over the store are
/// off-loaded to the blocking pool by the manager.
pub trait WalletStore: Send + Sync {
    // settings
    fn get_setting(&self, key: &str) -> Option<Value>;
    fn set_setting(&self, key: &str, value: Value);

    // per-tx classification, with completion flag for crash recovery
    fn get_ps_tx(&self, txid: &Txid) -> Option<(MixTxType, bool)>;
    fn set_ps_tx(&self, txid: &Txid, tx_type: MixTxType, completed: bool);
    fn remove_ps_tx(&self, txid: &Txid);
    fn ps_txs(&self) -> Vec<(Txid, MixTxType, bool)>;
    fn get_ps_tx_removed(&self, txid: &Txid) -> Option<(MixTxType, bool)>;
    fn set_ps_tx_removed(&self, txid: &Txid, tx_type: MixTxType, completed: bool);
    fn ps_txs_removed(&self) -> Vec<(Txid, MixTxType, bool)>;

    // wallet history
    fn get_transaction(&self, txid: &Txid) -> Option<Transaction>;
    fn list_transaction_ids(&self) -> Vec<Txid>;
    fn tx_position(&self, txid: &Txid) -> i64;
    fn is_confirmed(&self, txid: &Txid) -> bool;
    fn has_islock(&self, txid: &Txid) -> bool;
    fn is_local_tx(&self, txid: &Txid) -> bool;

    // ownership
    fn is_mine(&self, address: &str) -> bool;

    // recognized mixing coins
    fn add_ps_denom(&self, outpoint: OutPoint, denom: PsDenom);
    fn get_ps_denom(&self, outpoint: &OutPoint) -> Option<PsDenom>;
    fn pop_ps_denom(&self, outpoint: &OutPoint) -> Option<PsDenom>;
    fn ps_denoms(&self) -> Vec<(OutPoint, PsDenom)>;

    fn add_ps_collateral(&self, outpoint: OutPoint, data: PsCoinData);
    fn get_ps_collateral(&self, outpoint: &OutPoint) -> Option<PsCoinData>;
    fn pop_ps_collateral(&self, outpoint: &OutPoint) -> Option<PsCoinData>;

    fn add_ps_other(&self, outpoint: OutPoint, data: PsCoinData);
    fn get_ps_other(&self, outpoint: &OutPoint) -> Option<PsCoinData>;
    fn pop_ps_other(&self, outpoint: &OutPoint) -> Option<PsCoinData>;

    // addresses reserved for mixing
    fn add_ps_address(&self, address: &str);
    fn get_ps_addresses(&self) -> HashSet<Address>;

    // outpoints reserved by active workflows
    fn add_ps_spending_denom(&self, outpoint: OutPoint, uuid: &str);
    fn get_ps_spending_denom(&self, outpoint: &OutPoint) -> Option<String>;
    fn pop_ps_spending_denom(&self, outpoint: &OutPoint) -> Option<String>;
    fn add_ps_spending_collateral(&self, outpoint: OutPoint, uuid: &str);
    fn get_ps_spending_collateral(&self, outpoint: &OutPoint) -> Option<String>;
    fn pop_ps_spending_collateral(&self, outpoint: &OutPoint) -> Option<String>;

    // denominated balance having at least min_rounds mixed, for progress
    fn balance_with_min_rounds(&self, min_rounds: u32) -> Duffs {
        self.ps_denoms()
            .iter()
            .filter(|(_, d)| d.rounds >= min_rounds)
            .map(|(_, d)| d.value)
            .sum()
    }

    // full wipe of mixing data (settings survive)
    fn clear_mixing_data(&self);
}

#[derive(Default)]
struct MemoryStoreInner {
    settings: HashMap<String, Value>,
    ps_txs: HashMap<Txid, (MixTxType, bool)>,
    ps_txs_removed: HashMap<Txid, (MixTxType, bool)>,
    transactions: HashMap<Txid, Transaction>,
    positions: HashMap<Txid, i64>,
    confirmed: HashSet<Txid>,
    islocks: HashSet<Txid>,
    local_txs: HashSet<Txid>,
    own_addresses: HashSet<Address>,
    ps_denoms: HashMap<OutPoint, PsDenom>,
    ps_collateral: HashMap<OutPoint, PsCoinData>,
    ps_other: HashMap<OutPoint, PsCoinData>,
    ps_addresses: HashSet<Address>,
    spending_denoms: HashMap<OutPoint, String>,
    spending_collateral: HashMap<OutPoint, String>,
}

/// In-memory wallet store, used by tests and light embeddings.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a wallet transaction at the given history position.
    pub fn insert_transaction(&self, tx: &Transaction, position: i64) -> Txid {
        let txid = tx.txid();
        let mut inner = self.lock();
        inner.transactions.insert(txid, tx.clone());
        inner.positions.insert(txid, position);
        inner.confirmed.insert(txid);
        txid
    }

    /// Record a local (not yet broadcast) transaction.
    pub fn insert_local_transaction(&self, tx: &Transaction, position: i64) -> Txid {
        let txid = self.insert_transaction(tx, position);
        let mut inner = self.lock();
        inner.confirmed.remove(&txid);
        inner.local_txs.insert(txid);
        txid
    }

    pub fn set_islock(&self, txid: &Txid) {
        self.lock().islocks.insert(*txid);
    }

    pub fn set_unconfirmed(&self, txid: &Txid) {
        self.lock().confirmed.remove(txid);
    }

    pub fn add_own_address(&self, address: &str) {
        self.lock().own_addresses.insert(address.to_string());
    }

    /// Serialize the whole store for inspection or test persistence.
    pub fn dump_settings(&self) -> Value {
        let inner = self.lock();
        Value::Object(inner.settings.clone().into_iter().collect())
    }
}

impl WalletStore for MemoryStore {
    fn get_setting(&self, key: &str) -> Option<Value> {
        self.lock().settings.get(key).cloned()
    }

    fn set_setting(&self, key: &str, value: Value) {
        self.lock().settings.insert(key.to_string(), value);
    }

    fn get_ps_tx(&self, txid: &Txid) -> Option<(MixTxType, bool)> {
        self.lock().ps_txs.get(txid).copied()
    }

    fn set_ps_tx(&self, txid: &Txid, tx_type: MixTxType, completed: bool) {
        self.lock().ps_txs.insert(*txid, (tx_type, completed));
    }

    fn remove_ps_tx(&self, txid: &Txid) {
        self.lock().ps_txs.remove(txid);
    }

    fn ps_txs(&self) -> Vec<(Txid, MixTxType, bool)> {
        self.lock()
            .ps_txs
            .iter()
            .map(|(txid, (t, c))| (*txid, *t, *c))
            .collect()
    }

    fn get_ps_tx_removed(&self, txid: &Txid) -> Option<(MixTxType, bool)> {
        self.lock().ps_txs_removed.get(txid).copied()
    }

    fn set_ps_tx_removed(&self, txid: &Txid, tx_type: MixTxType, completed: bool) {
        self.lock().ps_txs_removed.insert(*txid, (tx_type, completed));
    }

    fn ps_txs_removed(&self) -> Vec<(Txid, MixTxType, bool)> {
        self.lock()
            .ps_txs_removed
            .iter()
            .map(|(txid, (t, c))| (*txid, *t, *c))
            .collect()
    }

    fn get_transaction(&self, txid: &Txid) -> Option<Transaction> {
        self.lock().transactions.get(txid).cloned()
    }

    fn list_transaction_ids(&self) -> Vec<Txid> {
        self.lock().transactions.keys().copied().collect()
    }

    fn tx_position(&self, txid: &Txid) -> i64 {
        self.lock().positions.get(txid).copied().unwrap_or(i64::MAX)
    }

    fn is_confirmed(&self, txid: &Txid) -> bool {
        self.lock().confirmed.contains(txid)
    }

    fn has_islock(&self, txid: &Txid) -> bool {
        self.lock().islocks.contains(txid)
    }

    fn is_local_tx(&self, txid: &Txid) -> bool {
        self.lock().local_txs.contains(txid)
    }

    fn is_mine(&self, address: &str) -> bool {
        self.lock().own_addresses.contains(address)
    }

    fn add_ps_denom(&self, outpoint: OutPoint, denom: PsDenom) {
        self.lock().ps_denoms.insert(outpoint, denom);
    }

    fn get_ps_denom(&self, outpoint: &OutPoint) -> Option<PsDenom> {
        self.lock().ps_denoms.get(outpoint).cloned()
    }

    fn pop_ps_denom(&self, outpoint: &OutPoint) -> Option<PsDenom> {
        self.lock().ps_denoms.remove(outpoint)
    }

    fn ps_denoms(&self) -> Vec<(OutPoint, PsDenom)> {
        self.lock()
            .ps_denoms
            .iter()
            .map(|(op, d)| (*op, d.clone()))
            .collect()
    }

    fn add_ps_collateral(&self, outpoint: OutPoint, data: PsCoinData) {
        self.lock().ps_collateral.insert(outpoint, data);
    }

    fn get_ps_collateral(&self, outpoint: &OutPoint) -> Option<PsCoinData> {
        self.lock().ps_collateral.get(outpoint).cloned()
    }

    fn pop_ps_collateral(&self, outpoint: &OutPoint) -> Option<PsCoinData> {
        self.lock().ps_collateral.remove(outpoint)
    }

    fn add_ps_other(&self, outpoint: OutPoint, data: PsCoinData) {
        self.lock().ps_other.insert(outpoint, data);
    }

    fn get_ps_other(&self, outpoint: &OutPoint) -> Option<PsCoinData> {
        self.lock().ps_other.get(outpoint).cloned()
    }

    fn pop_ps_other(&self, outpoint: &OutPoint) -> Option<PsCoinData> {
        self.lock().ps_other.remove(outpoint)
    }

    fn add_ps_address(&self, address: &str) {
        self.lock().ps_addresses.insert(address.to_string());
    }

    fn get_ps_addresses(&self) -> HashSet<Address> {
        self.lock().ps_addresses.clone()
    }

    fn add_ps_spending_denom(&self, outpoint: OutPoint, uuid: &str) {
        self.lock().spending_denoms.insert(outpoint, uuid.to_string());
    }

    fn get_ps_spending_denom(&self, outpoint: &OutPoint) -> Option<String> {
        self.lock().spending_denoms.get(outpoint).cloned()
    }

    fn pop_ps_spending_denom(&self, outpoint: &OutPoint) -> Option<String> {
        self.lock().spending_denoms.remove(outpoint)
    }

    fn add_ps_spending_collateral(&self, outpoint: OutPoint, uuid: &str) {
        self.lock().spending_collateral.insert(outpoint, uuid.to_string());
    }

    fn get_ps_spending_collateral(&self, outpoint: &OutPoint) -> Option<String> {
        self.lock().spending_collateral.get(outpoint).cloned()
    }

    fn pop_ps_spending_collateral(&self, outpoint: &OutPoint) -> Option<String> {
        self.lock().spending_collateral.remove(outpoint)
    }

    fn clear_mixing_data(&self) {
        let mut inner = self.lock();
        inner.ps_txs.clear();
        inner.ps_txs_removed.clear();
        inner.ps_denoms.clear();
        inner.ps_collateral.clear();
        inner.ps_other.clear();
        inner.ps_addresses.clear();
        inner.spending_denoms.clear();
        inner.spending_collateral.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TxOutput, Transaction};

    #[test]
    fn test_settings_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get_setting("mix_rounds"), None);
        store.set_setting("mix_rounds", serde_json::json!(8));
        assert_eq!(store.get_setting("mix_rounds"), Some(serde_json::json!(8)));
    }

    #[test]
    fn test_ps_tx_and_coin_tracking() {
        let store = MemoryStore::new();
        let tx = Transaction::new(
            vec![],
            vec![TxOutput { address: "Xa".into(), value: 100_001 }],
        );
        let txid = store.insert_transaction(&tx, 0);
        let op = OutPoint::new(txid, 0);

        store.set_ps_tx(&txid, MixTxType::NewDenoms, false);
        assert_eq!(store.get_ps_tx(&txid), Some((MixTxType::NewDenoms, false)));

        store.add_ps_denom(op, PsDenom { address: "Xa".into(), value: 100_001, rounds: 0 });
        assert_eq!(store.balance_with_min_rounds(0), 100_001);
        assert_eq!(store.balance_with_min_rounds(1), 0);

        store.clear_mixing_data();
        assert_eq!(store.get_ps_tx(&txid), None);
        assert_eq!(store.get_ps_denom(&op), None);
        // wallet history survives a mixing data wipe
        assert!(store.get_transaction(&txid).is_some());
    }

    #[test]
    fn test_settings_dump_survives_file_round_trip() {
        let store = MemoryStore::new();
        store.set_setting("keep_amount", serde_json::json!(5));
        store.set_setting("mix_rounds", serde_json::json!(8));
        let dump = store.dump_settings();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ps_settings.json");
        std::fs::write(&path, serde_json::to_vec(&dump).unwrap()).unwrap();
        let reloaded: Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(dump, reloaded);
    }

    #[test]
    fn test_reservations() {
        let store = MemoryStore::new();
        let op = OutPoint::new(Txid::new([1; 32]), 0);
        store.add_ps_spending_denom(op, "uuid-1");
        assert_eq!(store.get_ps_spending_denom(&op), Some("uuid-1".into()));
        assert_eq!(store.pop_ps_spending_denom(&op), Some("uuid-1".into()));
        assert_eq!(store.get_ps_spending_denom(&op), None);
    }
}
