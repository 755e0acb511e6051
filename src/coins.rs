// src/coins.rs
//! Mixing-related coin metadata and selection helpers.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::denoms::{COIN, DENOM_VALS, min_denomination};
use crate::error::{MixingError, MixingResult};
use crate::store::WalletStore;
use crate::types::{Address, Duffs, OutPoint};

/// Sort key placeholder for coins with no mixing relation.
pub const ROUNDS_MINUSINF: i64 = -1_000_000_000;
/// Non-mixing coins arrived on an address used by mixing txs.
pub const ROUNDS_OTHER: i64 = -3;
/// Coins left as change from new denoms/collateral txs.
pub const ROUNDS_MIX_ORIGIN: i64 = -2;
/// Collateral amount coins.
pub const ROUNDS_COLLATERAL: i64 = -1;

/// String repr of coin rounds or coin type for mixing related coins.
pub fn rounds_label(rounds: i64) -> String {
    match rounds {
        ROUNDS_MINUSINF => "Unknown".to_string(),
        ROUNDS_OTHER => "Other".to_string(),
        ROUNDS_MIX_ORIGIN => "Mix Origin".to_string(),
        ROUNDS_COLLATERAL => "Collateral".to_string(),
        n => n.to_string(),
    }
}

/// A spendable coin together with its mixing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsCoin {
    pub outpoint: OutPoint,
    pub address: Address,
    pub value: Duffs,
    /// Mixing rounds passed, or one of the negative coin-type markers;
    /// `None` for coins with no mixing relation.
    pub rounds: Option<i64>,
}

/// Key fn for sorting coins by mixing rounds/related coin type.
pub fn sort_by_rounds_key(coin: &PsCoin) -> i64 {
    coin.rounds.unwrap_or(ROUNDS_MINUSINF)
}

/// Check all coins have the required minimum of mixing rounds.
pub fn check_min_rounds(coins: &[PsCoin], min_rounds: u32) -> MixingResult<()> {
    for coin in coins {
        match coin.rounds {
            Some(rounds) if rounds >= min_rounds as i64 => {}
            _ => return Err(MixingError::MinRoundsNotMet { required: min_rounds }),
        }
    }
    Ok(())
}

/// Count denominated coins per denomination value.
pub fn denoms_by_values(coins: &[PsCoin]) -> HashMap<Duffs, u64> {
    let mut counts: HashMap<Duffs, u64> = DENOM_VALS.iter().map(|v| (*v, 0)).collect();
    for coin in coins {
        if let Some(count) = counts.get_mut(&coin.value) {
            *count += 1;
        }
    }
    counts
}

/// Check there are enough small denoms among the denominated coins:
/// each tier must be at least as populated as the next bigger one.
pub fn check_enough_sm_denoms(counts: &HashMap<Duffs, u64>) -> bool {
    if counts.is_empty() {
        return false;
    }
    for value in &DENOM_VALS[..DENOM_VALS.len() - 1] {
        let small = counts.get(value).copied().unwrap_or(0);
        let big = counts.get(&(value * 10)).copied().unwrap_or(0);
        if small < big {
            return false;
        }
    }
    true
}

/// Check non-minimal denoms are presented.
pub fn check_big_denoms_presented(counts: &HashMap<Duffs, u64>) -> bool {
    DENOM_VALS[1..]
        .iter()
        .any(|v| counts.get(v).copied().unwrap_or(0) > 0)
}

/// Select non-minimal denoms ordered by minimum rounds then maximum value.
pub fn biggest_denoms_by_min_round(coins: &[PsCoin]) -> Vec<PsCoin> {
    let mut selected: Vec<PsCoin> = coins
        .iter()
        .filter(|c| c.rounds.is_some_and(|r| r >= 0) && c.value > min_denomination())
        .cloned()
        .collect();
    selected.sort_by(|a, b| {
        sort_by_rounds_key(a)
            .cmp(&sort_by_rounds_key(b))
            .then(b.value.cmp(&a.value))
    });
    selected
}

/// Plan denomination outputs for a new-denoms transaction: greedy
/// largest-first over the ladder, bounded by both the available value and
/// the keep amount target. The remainder (if any) becomes change.
pub fn calc_denoms_plan(available: Duffs, keep_amount_coins: u64) -> Vec<Duffs> {
    let target = available.min(keep_amount_coins.saturating_mul(COIN));
    let mut remaining = target;
    let mut plan = Vec::new();
    for &denom in DENOM_VALS.iter().rev() {
        let count = remaining / denom;
        for _ in 0..count {
            plan.push(denom);
        }
        remaining -= count * denom;
    }
    plan
}

/// Try to find a common ancestor transaction of two coins within the
/// given search depth, walking only transactions the wallet knows.
/// Returns the depth at which the ancestries first meet.
pub fn find_common_ancestor(
    store: &dyn WalletStore,
    utxo_a: OutPoint,
    utxo_b: OutPoint,
    search_depth: usize,
) -> Option<usize> {
    let mut frontier_a = vec![(utxo_a, 0usize)];
    let mut frontier_b = vec![(utxo_b, 0usize)];
    let mut seen_a: HashMap<crate::types::Txid, usize> = HashMap::new();
    let mut seen_b: HashMap<crate::types::Txid, usize> = HashMap::new();

    for _ in 0..=search_depth {
        let mut next_a = Vec::new();
        for (utxo, depth) in frontier_a.drain(..) {
            seen_a.entry(utxo.txid).or_insert(depth);
            if let Some(tx) = store.get_transaction(&utxo.txid) {
                for input in &tx.inputs {
                    next_a.push((input.prevout, depth + 1));
                }
            }
        }
        frontier_a = next_a;

        let mut next_b = Vec::new();
        for (utxo, depth) in frontier_b.drain(..) {
            seen_b.entry(utxo.txid).or_insert(depth);
            if let Some(tx) = store.get_transaction(&utxo.txid) {
                for input in &tx.inputs {
                    next_b.push((input.prevout, depth + 1));
                }
            }
        }
        frontier_b = next_b;

        let common: HashSet<_> = seen_a
            .keys()
            .filter(|txid| seen_b.contains_key(*txid))
            .collect();
        if !common.is_empty() {
            let min_depth = common
                .iter()
                .map(|txid| seen_a[*txid].max(seen_b[*txid]))
                .min()
                .unwrap_or(0);
            return Some(min_depth);
        }
    }
    None
}
