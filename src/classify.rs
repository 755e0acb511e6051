// src/classify.rs
//! Assigns a mixing transaction type to wallet transactions.
//!
//! Classification is a pure function of the transaction and the current
//! recognized-coin state; recording results is the caller's responsibility.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::denoms;
use crate::store::WalletStore;
use crate::types::{Duffs, Transaction};

/// Mixing-related transaction types. Assigned at most once per txid and
/// persisted together with a completion flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MixTxType {
    NewDenoms,
    NewCollateral,
    PayCollateral,
    Denominate,
    PrivateSend,
    SpendPsCoins,
    OtherPsCoins,
}

impl MixTxType {
    /// Types produced by the mixing workflows themselves.
    pub fn is_mixing_type(&self) -> bool {
        matches!(
            self,
            MixTxType::NewDenoms
                | MixTxType::NewCollateral
                | MixTxType::PayCollateral
                | MixTxType::Denominate
        )
    }
}

impl fmt::Display for MixTxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MixTxType::NewDenoms => "New denoms",
            MixTxType::NewCollateral => "New collateral",
            MixTxType::PayCollateral => "Pay collateral",
            MixTxType::Denominate => "Denominate",
            MixTxType::PrivateSend => "PrivateSend",
            MixTxType::SpendPsCoins => "Spend PS coins",
            MixTxType::OtherPsCoins => "Other PS coins",
        };
        f.write_str(name)
    }
}

/// Classify a transaction against the recognized-coin state in `store`.
///
/// Rules are evaluated in priority order; `final_pass` additionally enables
/// the relaxed foreign-deposit rule used by the last reconciliation pass.
pub fn classify(
    store: &dyn WalletStore,
    tx: &Transaction,
    allow_others: bool,
    final_pass: bool,
) -> Option<MixTxType> {
    if check_new_denoms(store, tx) {
        return Some(MixTxType::NewDenoms);
    }
    if check_new_collateral(store, tx) {
        return Some(MixTxType::NewCollateral);
    }
    if check_pay_collateral(store, tx) {
        return Some(MixTxType::PayCollateral);
    }
    if check_denominate(store, tx) {
        return Some(MixTxType::Denominate);
    }
    if check_privatesend(store, tx) {
        return Some(MixTxType::PrivateSend);
    }
    if allow_others && check_spend_ps_coins(store, tx) {
        return Some(MixTxType::SpendPsCoins);
    }
    if final_pass && check_other_ps_coins(store, tx) {
        return Some(MixTxType::OtherPsCoins);
    }
    None
}

fn input_is_ps_coin(store: &dyn WalletStore, tx: &Transaction, idx: usize) -> bool {
    let op = &tx.inputs[idx].prevout;
    store.get_ps_denom(op).is_some()
        || store.get_ps_collateral(op).is_some()
        || store.get_ps_other(op).is_some()
}

/// All wallet-owned outputs are denominations (plus at most one change
/// output) and the inputs are not themselves all recognized denoms.
fn check_new_denoms(store: &dyn WalletStore, tx: &Transaction) -> bool {
    if tx.outputs.is_empty() {
        return false;
    }
    let denom_cnt = tx
        .outputs
        .iter()
        .filter(|o| denoms::is_denomination(o.value))
        .count();
    if denom_cnt == 0 || tx.outputs.len() - denom_cnt > 1 {
        return false;
    }
    // denoms are created for the wallet itself
    if !tx.outputs.iter().all(|o| store.is_mine(&o.address)) {
        return false;
    }
    let all_denom_inputs = !tx.inputs.is_empty()
        && (0..tx.inputs.len()).all(|i| store.get_ps_denom(&tx.inputs[i].prevout).is_some());
    !all_denom_inputs
}

/// Exactly one collateral-ladder output plus an optional change output.
/// A single-input spend of an already recognized collateral is the
/// pay-collateral shape and is left to the next rule.
fn check_new_collateral(store: &dyn WalletStore, tx: &Transaction) -> bool {
    if tx.inputs.len() == 1 && store.get_ps_collateral(&tx.inputs[0].prevout).is_some() {
        return false;
    }
    let coll_cnt = tx
        .outputs
        .iter()
        .filter(|o| denoms::is_collateral_amount(o.value))
        .count();
    coll_cnt == 1
        && tx.outputs.len() <= 2
        && tx.outputs.iter().all(|o| store.is_mine(&o.address))
}

/// A single input consumes a recognized collateral output and the
/// transaction burns part of it as a fee (no payout besides the remainder).
fn check_pay_collateral(store: &dyn WalletStore, tx: &Transaction) -> bool {
    if tx.inputs.len() != 1 || tx.outputs.len() > 1 {
        return false;
    }
    let consumed = match store.get_ps_collateral(&tx.inputs[0].prevout) {
        Some(data) => data,
        None => return false,
    };
    match tx.outputs.first() {
        None => true,
        Some(o) => store.is_mine(&o.address) && o.value < consumed.value,
    }
}

/// Input count equals output count, everything shares one denomination
/// value and third-party counterparties are present among the outputs.
fn check_denominate(store: &dyn WalletStore, tx: &Transaction) -> bool {
    if tx.inputs.is_empty() || tx.inputs.len() != tx.outputs.len() {
        return false;
    }
    let value = tx.outputs[0].value;
    if !denoms::is_denomination(value) {
        return false;
    }
    if !tx.outputs.iter().all(|o| o.value == value) {
        return false;
    }
    // own contribution must be recognized denoms of the same value
    let mut own_inputs = 0;
    for input in &tx.inputs {
        if let Some(denom) = store.get_ps_denom(&input.prevout) {
            if denom.value != value {
                return false;
            }
            own_inputs += 1;
        }
    }
    if own_inputs == 0 {
        return false;
    }
    // third parties are what make it a denominate round
    !tx.outputs.iter().all(|o| store.is_mine(&o.address))
}

/// All inputs are recognized mixed denoms spent to a non-mixing destination.
fn check_privatesend(store: &dyn WalletStore, tx: &Transaction) -> bool {
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return false;
    }
    tx.inputs
        .iter()
        .all(|i| store.get_ps_denom(&i.prevout).is_some())
}

/// Recognized PS coins spent together with ordinary coins.
fn check_spend_ps_coins(store: &dyn WalletStore, tx: &Transaction) -> bool {
    if tx.inputs.is_empty() {
        return false;
    }
    let ps_inputs = (0..tx.inputs.len())
        .filter(|&i| input_is_ps_coin(store, tx, i))
        .count();
    ps_inputs > 0
}

/// Funds arriving at a mixing-reserved address from a transaction that is
/// not itself a mixing type. Known heuristic: a third-party payment to a
/// reused mixing address also lands here.
fn check_other_ps_coins(store: &dyn WalletStore, tx: &Transaction) -> bool {
    let ps_addresses = store.get_ps_addresses();
    if ps_addresses.is_empty() {
        return false;
    }
    tx.outputs.iter().any(|o| ps_addresses.contains(&o.address))
}

/// Try to detect a probable denominate output without mixing metadata,
/// by inspecting the shape of the transaction that created the coin.
pub fn prob_denominate_output(store: &dyn WalletStore, coin: &crate::types::OutPoint, value: Duffs) -> bool {
    if !denoms::is_denomination(value) {
        return false;
    }
    let prev_tx = match store.get_transaction(&coin.txid) {
        Some(tx) => tx,
        None => return false,
    };
    if prev_tx.inputs.len() != prev_tx.outputs.len() {
        return false;
    }
    if !prev_tx.outputs.iter().all(|o| o.value == value) {
        return false;
    }
    let mine = prev_tx
        .outputs
        .iter()
        .filter(|o| store.is_mine(&o.address))
        .count();
    // all outputs owned means it was not a multi-party round
    mine != prev_tx.outputs.len()
}
