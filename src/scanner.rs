// src/scanner.rs
//! Reconciliation pass replaying full wallet history through the
//! classifier, so mixing state can always be rebuilt from the ledger
//! alone. Classification effects are applied in two phases (record
//! first, coin mutations second) so a crash mid-apply is repairable.

use std::collections::HashSet;

use log::info;

use crate::classify::{MixTxType, classify};
use crate::error::{MixingError, MixingResult};
use crate::journal::redact_line;
use crate::store::{PsCoinData, PsDenom, WalletStore};
use crate::types::{NetworkParams, OutPoint, Transaction, Txid};

struct HistoryItem {
    txid: Txid,
    tx: Transaction,
    tx_type: Option<MixTxType>,
    islock_sort: String,
}

/// Ordered snapshot of full wallet history. Ordering key is the
/// wallet-assigned tx position, tie-broken by an instant-lock marker for
/// unconfirmed transactions with a confirmed instant lock.
fn simplified_history(store: &dyn WalletStore) -> Vec<HistoryItem> {
    let mut history = Vec::new();
    for txid in store.list_transaction_ids() {
        let tx = match store.get_transaction(&txid) {
            Some(tx) => tx,
            None => continue,
        };
        let tx_type = store.get_ps_tx(&txid).map(|(t, _)| t);
        let islock_sort = if store.has_islock(&txid) && !store.is_confirmed(&txid) {
            txid.to_string()
        } else {
            String::new()
        };
        history.push(HistoryItem { txid, tx, tx_type, islock_sort });
    }
    history.sort_by(|a, b| {
        store
            .tx_position(&a.txid)
            .cmp(&store.tx_position(&b.txid))
            .then_with(|| a.islock_sort.cmp(&b.islock_sort))
    });
    history
}

/// Record a classification and apply its effects to the recognized-coin
/// sets. The completion flag flips only after every effect is applied.
pub fn add_ps_data(
    store: &dyn WalletStore,
    txid: &Txid,
    tx: &Transaction,
    tx_type: MixTxType,
) -> MixingResult<()> {
    store.set_ps_tx(txid, tx_type, false);
    match tx_type {
        MixTxType::NewDenoms => {
            for (vout, output) in tx.outputs.iter().enumerate() {
                if crate::denoms::is_denomination(output.value) && store.is_mine(&output.address) {
                    store.add_ps_denom(
                        OutPoint::new(*txid, vout as u32),
                        PsDenom { address: output.address.clone(), value: output.value, rounds: 0 },
                    );
                    store.add_ps_address(&output.address);
                }
            }
        }
        MixTxType::NewCollateral => {
            for (vout, output) in tx.outputs.iter().enumerate() {
                if crate::denoms::is_collateral_amount(output.value)
                    && store.is_mine(&output.address)
                {
                    store.add_ps_collateral(
                        OutPoint::new(*txid, vout as u32),
                        PsCoinData { address: output.address.clone(), value: output.value },
                    );
                    store.add_ps_address(&output.address);
                }
            }
        }
        MixTxType::PayCollateral => {
            let input = tx.inputs.first().ok_or_else(|| {
                MixingError::Store("pay collateral tx has no inputs".into())
            })?;
            store.pop_ps_collateral(&input.prevout);
            store.pop_ps_spending_collateral(&input.prevout);
            if let Some(output) = tx.outputs.first() {
                if store.is_mine(&output.address) {
                    store.add_ps_collateral(
                        OutPoint::new(*txid, 0),
                        PsCoinData { address: output.address.clone(), value: output.value },
                    );
                    store.add_ps_address(&output.address);
                }
            }
        }
        MixTxType::Denominate => {
            if tx.outputs.is_empty() {
                return Err(MixingError::Store("denominate tx has no outputs".into()));
            }
            let mut min_input_rounds = None;
            for input in &tx.inputs {
                if let Some(denom) = store.pop_ps_denom(&input.prevout) {
                    min_input_rounds = Some(match min_input_rounds {
                        Some(r) if r < denom.rounds => r,
                        _ => denom.rounds,
                    });
                }
                store.pop_ps_spending_denom(&input.prevout);
            }
            // on repair the inputs may already be popped; reuse the rounds
            // of an output registered by the interrupted apply
            let min_input_rounds = min_input_rounds.or_else(|| {
                tx.outputs.iter().enumerate().find_map(|(vout, _)| {
                    store
                        .get_ps_denom(&OutPoint::new(*txid, vout as u32))
                        .map(|d| d.rounds.saturating_sub(1))
                })
            });
            let new_rounds = min_input_rounds.unwrap_or(0) + 1;
            for (vout, output) in tx.outputs.iter().enumerate() {
                if store.is_mine(&output.address) {
                    store.add_ps_denom(
                        OutPoint::new(*txid, vout as u32),
                        PsDenom {
                            address: output.address.clone(),
                            value: output.value,
                            rounds: new_rounds,
                        },
                    );
                    store.add_ps_address(&output.address);
                }
            }
        }
        MixTxType::PrivateSend => {
            for input in &tx.inputs {
                store.pop_ps_denom(&input.prevout);
                store.pop_ps_spending_denom(&input.prevout);
            }
        }
        MixTxType::SpendPsCoins => {
            for input in &tx.inputs {
                store.pop_ps_denom(&input.prevout);
                store.pop_ps_collateral(&input.prevout);
                store.pop_ps_other(&input.prevout);
            }
        }
        MixTxType::OtherPsCoins => {
            let ps_addresses = store.get_ps_addresses();
            for (vout, output) in tx.outputs.iter().enumerate() {
                if ps_addresses.contains(&output.address) {
                    store.add_ps_other(
                        OutPoint::new(*txid, vout as u32),
                        PsCoinData { address: output.address.clone(), value: output.value },
                    );
                }
            }
        }
    }
    store.set_ps_tx(txid, tx_type, true);
    Ok(())
}

/// Drop the coin registrations a removed transaction contributed. The
/// spent inputs are not resurrected; a follow-up scan rebuilds them.
pub fn rm_ps_data(
    store: &dyn WalletStore,
    txid: &Txid,
    tx: &Transaction,
    tx_type: MixTxType,
) -> MixingResult<()> {
    store.set_ps_tx_removed(txid, tx_type, false);
    for vout in 0..tx.outputs.len() {
        let op = OutPoint::new(*txid, vout as u32);
        store.pop_ps_denom(&op);
        store.pop_ps_collateral(&op);
        store.pop_ps_other(&op);
    }
    store.remove_ps_tx(txid);
    store.set_ps_tx_removed(txid, tx_type, true);
    Ok(())
}

/// Replay wallet history and backfill classification data. Iterates to a
/// fixed point: a parent must be classified before certain child patterns
/// become decidable. One extra final pass applies the relaxed
/// foreign-deposit rule. Returns the number of detected transactions.
pub fn find_untracked_txs(
    store: &dyn WalletStore,
    allow_others: bool,
    params: &NetworkParams,
) -> MixingResult<usize> {
    info!("Finding untracked mixing transactions");
    let history = simplified_history(store);
    let mut all_detected: HashSet<Txid> = HashSet::new();
    let mut found = 0;

    loop {
        let mut detected: HashSet<Txid> = HashSet::new();
        let mut undetected_parents: HashSet<Txid> = HashSet::new();
        for item in &history {
            if item.tx_type.is_some() || all_detected.contains(&item.txid) {
                continue;
            }
            match classify(store, &item.tx, allow_others, false) {
                Some(tx_type) => {
                    add_ps_data(store, &item.txid, &item.tx, tx_type)?;
                    found += 1;
                    detected.insert(item.txid);
                    info!(
                        "{}",
                        redact_line(&format!("Found {} {}", tx_type, item.txid), params)
                    );
                }
                None => {
                    undetected_parents.extend(item.tx.inputs.iter().map(|i| i.prevout.txid));
                }
            }
        }
        let progressed = detected.iter().any(|txid| undetected_parents.contains(txid));
        all_detected.extend(detected);
        if !progressed {
            break;
        }
    }

    // last iteration detects foreign deposits not found before other
    // mixing txs populated the address set
    for item in &history {
        if item.tx_type.is_some() || all_detected.contains(&item.txid) {
            continue;
        }
        if let Some(tx_type) = classify(store, &item.tx, allow_others, true) {
            add_ps_data(store, &item.txid, &item.tx, tx_type)?;
            found += 1;
            info!(
                "{}",
                redact_line(&format!("Found {} {}", tx_type, item.txid), params)
            );
        }
    }

    if found == 0 {
        info!("No untracked mixing transactions found");
    }
    Ok(found)
}

/// Retry partially-applied records for any workflow transaction flagged
/// incomplete, independently for the add and remove directions.
pub fn fix_uncompleted(store: &dyn WalletStore, params: &NetworkParams) -> MixingResult<usize> {
    let mut found = 0;
    let mut failed = 0;

    for (txid, tx_type, completed) in store.ps_txs() {
        if completed {
            continue;
        }
        if let Some(tx) = store.get_transaction(&txid) {
            info!("{}", redact_line(&format!("fix_uncompleted: add {} data", txid), params));
            match add_ps_data(store, &txid, &tx, tx_type) {
                Ok(()) => found += 1,
                Err(e) => {
                    failed += 1;
                    info!(
                        "{}",
                        redact_line(&format!("add_ps_data {} failed: {}", txid, e), params)
                    );
                }
            }
        }
    }

    for (txid, tx_type, completed) in store.ps_txs_removed() {
        if completed {
            continue;
        }
        if let Some(tx) = store.get_transaction(&txid) {
            info!("{}", redact_line(&format!("fix_uncompleted: rm {} data", txid), params));
            match rm_ps_data(store, &txid, &tx, tx_type) {
                Ok(()) => found += 1,
                Err(e) => {
                    failed += 1;
                    info!(
                        "{}",
                        redact_line(&format!("rm_ps_data {} failed: {}", txid, e), params)
                    );
                }
            }
        }
    }

    if failed > 0 {
        return Err(MixingError::Store(format!(
            "{} uncompleted records could not be repaired",
            failed
        )));
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denoms::{COIN, CREATE_COLLATERAL_VAL, DENOM_VALS};
    use crate::store::MemoryStore;
    use crate::types::{TxInput, TxOutput};

    fn out(addr: &str, value: u64) -> TxOutput {
        TxOutput { address: addr.into(), value }
    }

    fn foreign_input(seed: u8) -> TxInput {
        TxInput { prevout: OutPoint::new(Txid::new([seed; 32]), 0) }
    }

    /// History: funding -> new denoms -> denominate, with the denominate
    /// tx sitting before its parent in history order (as after an import)
    /// so only the fixed-point iteration can resolve it.
    fn build_history(store: &MemoryStore) -> (Txid, Txid) {
        for addr in ["Xfund", "Xd0", "Xd1", "Xchg", "Xmix0"] {
            store.add_own_address(addr);
        }

        let funding = Transaction::new(
            vec![foreign_input(1)],
            vec![out("Xfund", 3 * COIN)],
        );
        let funding_id = store.insert_transaction(&funding, 0);

        let new_denoms = Transaction::new(
            vec![TxInput { prevout: OutPoint::new(funding_id, 0) }],
            vec![
                out("Xd0", DENOM_VALS[0]),
                out("Xd1", DENOM_VALS[0]),
                out("Xchg", 55_555),
            ],
        );
        let denoms_id = store.insert_transaction(&new_denoms, 2);

        let denominate = Transaction::new(
            vec![
                TxInput { prevout: OutPoint::new(denoms_id, 0) },
                foreign_input(2),
            ],
            vec![out("Xmix0", DENOM_VALS[0]), out("Xtheirs", DENOM_VALS[0])],
        );
        let denominate_id = store.insert_transaction(&denominate, 1);

        (denoms_id, denominate_id)
    }

    #[test]
    fn test_fixed_point_detects_parent_dependent_txs() {
        let store = MemoryStore::new();
        let (denoms_id, denominate_id) = build_history(&store);
        let params = NetworkParams::mainnet();

        let found = find_untracked_txs(&store, false, &params).unwrap();
        assert_eq!(found, 2);
        assert_eq!(store.get_ps_tx(&denoms_id), Some((MixTxType::NewDenoms, true)));
        assert_eq!(store.get_ps_tx(&denominate_id), Some((MixTxType::Denominate, true)));
        // denominate output gained a round over its parent denom
        let mixed = store.get_ps_denom(&OutPoint::new(denominate_id, 0)).unwrap();
        assert_eq!(mixed.rounds, 1);
        // consumed parent denom is gone
        assert!(store.get_ps_denom(&OutPoint::new(denoms_id, 0)).is_none());
    }

    #[test]
    fn test_scan_is_idempotent() {
        let store = MemoryStore::new();
        build_history(&store);
        let params = NetworkParams::mainnet();

        let first = find_untracked_txs(&store, false, &params).unwrap();
        assert!(first > 0);
        let second = find_untracked_txs(&store, false, &params).unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn test_final_pass_detects_foreign_deposit() {
        let store = MemoryStore::new();
        build_history(&store);
        let params = NetworkParams::mainnet();
        find_untracked_txs(&store, false, &params).unwrap();

        // a third party pays to a reused mixing address
        let deposit = Transaction::new(
            vec![foreign_input(3)],
            vec![out("Xmix0", 123_456)],
        );
        let deposit_id = store.insert_transaction(&deposit, 3);

        let found = find_untracked_txs(&store, false, &params).unwrap();
        assert_eq!(found, 1);
        assert_eq!(store.get_ps_tx(&deposit_id), Some((MixTxType::OtherPsCoins, true)));
        assert!(store.get_ps_other(&OutPoint::new(deposit_id, 0)).is_some());
    }

    #[test]
    fn test_new_collateral_effects() {
        let store = MemoryStore::new();
        store.add_own_address("Xcoll");
        store.add_own_address("Xchg");
        let tx = Transaction::new(
            vec![foreign_input(4)],
            vec![out("Xcoll", CREATE_COLLATERAL_VAL), out("Xchg", COIN)],
        );
        let txid = store.insert_transaction(&tx, 0);
        let params = NetworkParams::mainnet();

        find_untracked_txs(&store, false, &params).unwrap();
        assert_eq!(store.get_ps_tx(&txid), Some((MixTxType::NewCollateral, true)));
        assert!(store.get_ps_collateral(&OutPoint::new(txid, 0)).is_some());
        // the change output is not a collateral coin
        assert!(store.get_ps_collateral(&OutPoint::new(txid, 1)).is_none());
    }

    #[test]
    fn test_fix_uncompleted_repairs_add_direction() {
        let store = MemoryStore::new();
        store.add_own_address("Xd0");
        let tx = Transaction::new(
            vec![foreign_input(5)],
            vec![out("Xd0", DENOM_VALS[0])],
        );
        let txid = store.insert_transaction(&tx, 0);
        // simulate a crash between the record write and the coin mutations
        store.set_ps_tx(&txid, MixTxType::NewDenoms, false);

        let params = NetworkParams::mainnet();
        let repaired = fix_uncompleted(&store, &params).unwrap();
        assert_eq!(repaired, 1);
        assert_eq!(store.get_ps_tx(&txid), Some((MixTxType::NewDenoms, true)));
        assert!(store.get_ps_denom(&OutPoint::new(txid, 0)).is_some());
    }

    #[test]
    fn test_fix_uncompleted_reports_failures() {
        let store = MemoryStore::new();
        // a denominate record whose tx shape cannot be applied
        let bad = Transaction::new(vec![foreign_input(6)], vec![]);
        let txid = store.insert_transaction(&bad, 0);
        store.set_ps_tx(&txid, MixTxType::Denominate, false);

        let params = NetworkParams::mainnet();
        assert!(matches!(
            fix_uncompleted(&store, &params),
            Err(MixingError::Store(_))
        ));
    }

    #[test]
    fn test_rm_ps_data_drops_registrations() {
        let store = MemoryStore::new();
        store.add_own_address("Xd0");
        let tx = Transaction::new(
            vec![foreign_input(7)],
            vec![out("Xd0", DENOM_VALS[0])],
        );
        let txid = store.insert_transaction(&tx, 0);
        add_ps_data(&store, &txid, &tx, MixTxType::NewDenoms).unwrap();
        assert!(store.get_ps_denom(&OutPoint::new(txid, 0)).is_some());

        rm_ps_data(&store, &txid, &tx, MixTxType::NewDenoms).unwrap();
        assert!(store.get_ps_denom(&OutPoint::new(txid, 0)).is_none());
        assert_eq!(store.get_ps_tx(&txid), None);
        assert_eq!(store.get_ps_tx_removed(&txid), Some((MixTxType::NewDenoms, true)));
    }
}
