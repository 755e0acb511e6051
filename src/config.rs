// src/config.rs
//! Typed user options backed by the wallet store's key-value settings.
//! Defaults live here as named constants; values are clamped on write.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};

use crate::denoms::{COIN, DENOM_VALS};
use crate::store::WalletStore;
use crate::types::{Duffs, NetworkParams, now_secs};

pub const DEFAULT_KEEP_AMOUNT: u64 = 2;
pub const MIN_KEEP_AMOUNT: u64 = 2;
pub const MAX_KEEP_AMOUNT: u64 = 21_000_000;

pub const DEFAULT_MIX_ROUNDS: u32 = 4;
pub const MIN_MIX_ROUNDS: u32 = 2;
pub const MAX_MIX_ROUNDS: u32 = 16;
pub const MAX_MIX_ROUNDS_TESTNET: u32 = 256;

/// Number of concurrent mixing sessions.
pub const DEFAULT_MIX_SESSIONS: u32 = 4;
pub const MIN_MIX_SESSIONS: u32 = 1;
pub const MAX_MIX_SESSIONS: u32 = 10;

/// Group mixing txs in history views.
pub const DEFAULT_GROUP_HISTORY: bool = true;
/// Notify a presentation layer on mixing txs arrival.
pub const DEFAULT_NOTIFY_PS_TXS: bool = false;
/// Subscribe to spent mixing addresses on the indexing server.
pub const DEFAULT_SUBSCRIBE_SPENT: bool = false;
/// Allow spending other PS coins as regular coins.
pub const DEFAULT_ALLOW_OTHERS: bool = false;
/// Warn on inputs reserved by an active workflow before broadcast.
pub const DEFAULT_WARN_POSSIBLE_DSPEND: bool = true;

/// Mixing pool participants.
pub const POOL_MIN_PARTICIPANTS: u32 = 3;
pub const POOL_MIN_PARTICIPANTS_TESTNET: u32 = 2;
pub const POOL_MAX_PARTICIPANTS: u32 = 20;

/// Keypairs cleanup timeout (minutes) once mixing is stopped.
pub const DEFAULT_KP_TIMEOUT: u32 = 0;
pub const MIN_KP_TIMEOUT: u32 = 0;
pub const MAX_KP_TIMEOUT: u32 = 5;

/// Await late collateral/denominate txs from masternodes for this long.
pub const WAIT_FOR_MN_TXS_TIME_SEC: i64 = 120;

/// Delay bounds between consecutive new denoms txs.
pub const MIN_NEW_DENOMS_DELAY_SEC: u64 = 30;
pub const MAX_NEW_DENOMS_DELAY_SEC: u64 = 300;

/// Method of needed denoms count calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalcDenomsMethod {
    /// Use keep amount to calc needed denoms.
    Default,
    /// Use an absolute per-denom count table.
    Absolute,
}

/// Typed configuration interface over the persistent settings store.
#[derive(Clone)]
pub struct MixOptions {
    store: Arc<dyn WalletStore>,
    params: NetworkParams,
    allow_others: Arc<AtomicBool>,
}

impl MixOptions {
    pub fn new(store: Arc<dyn WalletStore>, params: NetworkParams) -> Self {
        MixOptions {
            store,
            params,
            allow_others: Arc::new(AtomicBool::new(DEFAULT_ALLOW_OTHERS)),
        }
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.store
            .get_setting(key)
            .and_then(|v| v.as_u64())
            .unwrap_or(default)
    }

    fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.store
            .get_setting(key)
            .and_then(|v| v.as_i64())
            .unwrap_or(default)
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.store
            .get_setting(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    /// Amount of coins to keep anonymized; reaching it stops mixing.
    pub fn keep_amount(&self) -> u64 {
        if self.calc_denoms_method() == CalcDenomsMethod::Absolute {
            let counts = self.abs_denoms_cnt();
            let total: Duffs = DENOM_VALS
                .iter()
                .map(|v| v * counts.get(v).copied().unwrap_or(0))
                .sum();
            return total / COIN;
        }
        self.get_u64("keep_amount", DEFAULT_KEEP_AMOUNT)
    }

    pub fn set_keep_amount(&self, amount: u64) {
        if self.calc_denoms_method() == CalcDenomsMethod::Absolute {
            return;
        }
        let amount = amount.clamp(MIN_KEEP_AMOUNT, MAX_KEEP_AMOUNT);
        self.store.set_setting("keep_amount", json!(amount));
    }

    /// Mix rounds each denom should pass through.
    pub fn mix_rounds(&self) -> u32 {
        self.get_u64("mix_rounds", DEFAULT_MIX_ROUNDS as u64) as u32
    }

    pub fn set_mix_rounds(&self, rounds: u32) {
        let rounds = rounds.clamp(MIN_MIX_ROUNDS, self.max_mix_rounds());
        self.store.set_setting("mix_rounds", json!(rounds));
    }

    pub fn max_mix_rounds(&self) -> u32 {
        if self.params.testnet { MAX_MIX_ROUNDS_TESTNET } else { MAX_MIX_ROUNDS }
    }

    /// Maximal concurrent mixing sessions.
    pub fn max_sessions(&self) -> u32 {
        self.get_u64("max_sessions", DEFAULT_MIX_SESSIONS as u64) as u32
    }

    pub fn set_max_sessions(&self, max_sessions: u32) {
        let max_sessions = max_sessions.clamp(MIN_MIX_SESSIONS, MAX_MIX_SESSIONS);
        self.store.set_setting("max_sessions", json!(max_sessions));
    }

    pub fn kp_timeout(&self) -> u32 {
        self.get_u64("kp_timeout", DEFAULT_KP_TIMEOUT as u64) as u32
    }

    pub fn set_kp_timeout(&self, kp_timeout: u32) {
        let kp_timeout = kp_timeout.clamp(MIN_KP_TIMEOUT, MAX_KP_TIMEOUT);
        self.store.set_setting("kp_timeout", json!(kp_timeout));
    }

    pub fn pool_min_participants(&self) -> u32 {
        if self.params.testnet { POOL_MIN_PARTICIPANTS_TESTNET } else { POOL_MIN_PARTICIPANTS }
    }

    pub fn pool_max_participants(&self) -> u32 {
        POOL_MAX_PARTICIPANTS
    }

    pub fn group_history(&self) -> bool {
        self.get_bool("group_history", DEFAULT_GROUP_HISTORY)
    }

    pub fn set_group_history(&self, group: bool) {
        self.store.set_setting("group_history", json!(group));
    }

    pub fn notify_ps_txs(&self) -> bool {
        self.get_bool("notify_ps_txs", DEFAULT_NOTIFY_PS_TXS)
    }

    pub fn set_notify_ps_txs(&self, notify: bool) {
        self.store.set_setting("notify_ps_txs", json!(notify));
    }

    pub fn subscribe_spent(&self) -> bool {
        self.get_bool("subscribe_spent", DEFAULT_SUBSCRIBE_SPENT)
    }

    pub fn set_subscribe_spent(&self, subscribe: bool) {
        self.store.set_setting("subscribe_spent", json!(subscribe));
    }

    /// Allow spending other PS coins in regular transactions.
    /// Deliberately not persisted.
    pub fn allow_others(&self) -> bool {
        self.allow_others.load(Ordering::Relaxed)
    }

    pub fn set_allow_others(&self, allow: bool) {
        self.allow_others.store(allow, Ordering::Relaxed);
    }

    pub fn group_origin_coins_by_addr(&self) -> bool {
        self.get_bool("group_origin_coins_by_addr", false)
    }

    pub fn set_group_origin_coins_by_addr(&self, group: bool) {
        self.store.set_setting("group_origin_coins_by_addr", json!(group));
    }

    pub fn gather_mix_stat(&self) -> bool {
        self.get_bool("gather_mix_stat", false)
    }

    pub fn set_gather_mix_stat(&self, gather: bool) {
        self.store.set_setting("gather_mix_stat", json!(gather));
    }

    /// Warn before broadcasting txs spending workflow-reserved outpoints.
    pub fn warn_possible_dspend(&self) -> bool {
        self.get_bool("warn_possible_dspend", DEFAULT_WARN_POSSIBLE_DSPEND)
    }

    pub fn set_warn_possible_dspend(&self, warn: bool) {
        self.store.set_setting("warn_possible_dspend", json!(warn));
    }

    pub fn calc_denoms_method(&self) -> CalcDenomsMethod {
        match self.get_u64("calc_denoms_method", 0) {
            1 => CalcDenomsMethod::Absolute,
            _ => CalcDenomsMethod::Default,
        }
    }

    pub fn set_calc_denoms_method(&self, method: CalcDenomsMethod) {
        let value = match method {
            CalcDenomsMethod::Default => 0,
            CalcDenomsMethod::Absolute => 1,
        };
        self.store.set_setting("calc_denoms_method", json!(value));
    }

    /// Absolute denoms count table: denom value -> count.
    pub fn abs_denoms_cnt(&self) -> HashMap<Duffs, u64> {
        let stored = self
            .store
            .get_setting("abs_denoms_cnt")
            .unwrap_or(Value::Null);
        DENOM_VALS
            .iter()
            .map(|v| {
                let count = stored
                    .get(v.to_string().as_str())
                    .and_then(|c| c.as_u64())
                    .unwrap_or(0);
                (*v, count)
            })
            .collect()
    }

    pub fn set_abs_denoms_cnt(&self, counts: &HashMap<Duffs, u64>) {
        let obj: serde_json::Map<String, Value> = DENOM_VALS
            .iter()
            .map(|v| (v.to_string(), json!(counts.get(v).copied().unwrap_or(0))))
            .collect();
        self.store.set_setting("abs_denoms_cnt", Value::Object(obj));
    }

    pub fn last_mix_start_time(&self) -> i64 {
        self.get_i64("last_mix_start_time", 0)
    }

    pub fn set_last_mix_start_time(&self, time: i64) {
        self.store.set_setting("last_mix_start_time", json!(time));
    }

    pub fn last_mix_stop_time(&self) -> i64 {
        self.get_i64("last_mix_stop_time", 0)
    }

    pub fn set_last_mix_stop_time(&self, time: i64) {
        self.store.set_setting("last_mix_stop_time", json!(time));
    }

    pub fn last_denoms_tx_time(&self) -> i64 {
        self.get_i64("last_denoms_tx_time", 0)
    }

    pub fn set_last_denoms_tx_time(&self, time: i64) {
        self.store.set_setting("last_denoms_tx_time", json!(time));
    }

    pub fn last_mixed_tx_time(&self) -> i64 {
        self.get_i64("last_mixed_tx_time", 0)
    }

    pub fn set_last_mixed_tx_time(&self, time: i64) {
        self.store.set_setting("last_mixed_tx_time", json!(time));
    }

    /// Seconds since mixing was last stopped.
    pub fn mix_stop_secs_ago(&self) -> i64 {
        now_secs() - self.last_mix_stop_time()
    }

    /// Mixing ran recently enough that denominate/pay-collateral txs from
    /// masternodes can still arrive.
    pub fn mix_recently_run(&self) -> bool {
        self.mix_stop_secs_ago() < WAIT_FOR_MN_TXS_TIME_SEC
    }

    /// Warning text on possible double spend, empty when no wait is needed.
    pub fn double_spend_warn(&self, mixing_running: bool) -> String {
        if mixing_running {
            return format!(
                "Mixing is currently running. To prevent double spending it is \
                 recommended to stop mixing and wait {} seconds before spending \
                 mixed coins.",
                WAIT_FOR_MN_TXS_TIME_SEC
            );
        }
        if self.mix_recently_run() {
            let wait_secs = WAIT_FOR_MN_TXS_TIME_SEC - self.mix_stop_secs_ago();
            if wait_secs > 0 {
                return format!(
                    "Mixing recently ran. To prevent double spending it is \
                     recommended to wait {} seconds before spending mixed coins.",
                    wait_secs
                );
            }
        }
        String::new()
    }

    /// Mixing progress in percents over the denominated balance.
    pub fn mixing_progress(&self, count_on_rounds: Option<u32>) -> u32 {
        let dn_balance = self.store.balance_with_min_rounds(0);
        if dn_balance == 0 {
            return 0;
        }
        let rounds = count_on_rounds.unwrap_or_else(|| self.mix_rounds());
        let ps_balance = self.store.balance_with_min_rounds(rounds);
        if dn_balance == ps_balance {
            return 100;
        }
        let mut res = 0.0;
        for i in 1..=rounds {
            let ri_balance = self.store.balance_with_min_rounds(i);
            res += ri_balance as f64 / dn_balance as f64 / rounds as f64;
        }
        let res = (res * 100.0).round() as u32;
        // on small amount differences 100 percents shows too early
        res.min(99)
    }
}
