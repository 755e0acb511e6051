// src/lib.rs
pub mod classify;
pub mod coins;
pub mod config;
pub mod denoms;
pub mod error;
pub mod guard;
pub mod journal;
pub mod net;
pub mod notify;
pub mod scanner;
pub mod state;
pub mod stats;
pub mod store;
pub mod types;
pub mod workflow;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{info, warn};
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::classify::{MixTxType, classify};
use crate::coins::{PsCoin, calc_denoms_plan};
use crate::config::{MAX_NEW_DENOMS_DELAY_SEC, MIN_NEW_DENOMS_DELAY_SEC, MixOptions};
use crate::error::{MixingError, MixingResult};
use crate::guard::DoubleSpendGuard;
use crate::journal::{LogCategory, LogEntry, LogRing, redact_line};
use crate::net::MixingNetwork;
use crate::notify::{DATA_CHANGED, LOG_CHANGED, Notification, Notifier};
use crate::state::{MixingState, StateMachine};
use crate::stats::{MixingStats, MsgKind};
use crate::store::WalletStore;
use crate::types::{
    Address, Duffs, NetworkParams, Transaction, TxInput, TxOutput, Txid, now_secs,
};
use crate::workflow::{CreationWorkflow, CreationWorkflowRecord, DenominateWorkflow, WorkflowStore};

/// Top-level mixing coordination engine for one wallet instance.
///
/// Owns the lifecycle state machine, the workflow store, the
/// double-spend guard and the reconciliation scanner; collaborates with
/// the wallet store and the network through trait objects.
#[derive(Clone)]
pub struct MixingManager {
    params: NetworkParams,
    store: Arc<dyn WalletStore>,
    network: Arc<dyn MixingNetwork>,
    pub options: MixOptions,
    state: Arc<StateMachine>,
    workflows: Arc<RwLock<WorkflowStore>>,
    guard: Arc<DoubleSpendGuard>,
    stats: Arc<RwLock<MixingStats>>,
    journal: Arc<StdMutex<LogRing>>,
    notifier: Notifier,
    session_slots: Arc<Mutex<Option<Arc<Semaphore>>>>,
    session_permits: Arc<Mutex<HashMap<Uuid, OwnedSemaphorePermit>>>,
    flusher: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl MixingManager {
    /// Create a new mixing manager. Returns the manager together with
    /// the notification stream a presentation layer consumes.
    pub fn new(
        params: NetworkParams,
        store: Arc<dyn WalletStore>,
        network: Arc<dyn MixingNetwork>,
        supported: bool,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<Notification>) {
        let (notifier, rx) = Notifier::new();
        let initial = if supported { MixingState::Disabled } else { MixingState::Unsupported };
        let manager = MixingManager {
            params,
            options: MixOptions::new(store.clone(), params),
            guard: Arc::new(DoubleSpendGuard::new(store.clone())),
            state: Arc::new(StateMachine::new(initial, notifier.clone())),
            workflows: Arc::new(RwLock::new(WorkflowStore::new())),
            stats: Arc::new(RwLock::new(MixingStats::new())),
            journal: Arc::new(StdMutex::new(LogRing::new())),
            session_slots: Arc::new(Mutex::new(None)),
            session_permits: Arc::new(Mutex::new(HashMap::new())),
            flusher: Arc::new(StdMutex::new(None)),
            store,
            network,
            notifier,
        };
        (manager, rx)
    }

    pub async fn state(&self) -> MixingState {
        self.state.state().await
    }

    fn log_wfl(&self, category: LogCategory, message: String) {
        let redacted = redact_line(&message, &self.params);
        info!("{}", redacted);
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(category, redacted);
        }
        self.notifier.postpone(LOG_CHANGED, None);
    }

    pub fn journal_snapshot(&self) -> Vec<LogEntry> {
        self.journal.lock().map(|j| j.snapshot()).unwrap_or_default()
    }

    pub fn clear_journal(&self) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.clear(0);
        }
        self.notifier.postpone(LOG_CHANGED, None);
    }

    fn ensure_flusher(&self) {
        if let Ok(mut flusher) = self.flusher.lock() {
            if flusher.is_none() {
                *flusher = Some(self.notifier.spawn_flusher());
            }
        }
    }

    /// Enable mixing: check data and find untracked txs, then go Ready.
    pub async fn enable(&self) -> MixingResult<usize> {
        self.state.begin_enable().await?;
        self.ensure_flusher();
        self.find_untracked().await
    }

    /// Replay wallet history to backfill classification and workflow
    /// data. Runs on the blocking pool; a failure marks the state
    /// Errored (sticky) after the repair pass had its chance.
    pub async fn find_untracked(&self) -> MixingResult<usize> {
        if !self.state.begin_find_untracked().await {
            return Err(MixingError::WrongState(format!(
                "untracked tx search requires Ready or Initializing, state is {:?}",
                self.state.state().await
            )));
        }

        let mut found = 0;
        let store = self.store.clone();
        let allow_others = self.options.allow_others();
        let params = self.params;
        let scan =
            tokio::task::spawn_blocking(move || {
                scanner::find_untracked_txs(store.as_ref(), allow_others, &params)
            })
            .await;
        match scan {
            Ok(Ok(n)) => {
                found = n;
                if n > 0 {
                    self.notifier.postpone(DATA_CHANGED, None);
                }
            }
            Ok(Err(e)) => {
                self.state
                    .mark_errored("error during loading of untracked mixing transactions")
                    .await;
                warn!("untracked tx scan failed: {}", redact_line(&e.to_string(), &self.params));
            }
            Err(e) => {
                self.state.mark_errored("untracked tx scan worker died").await;
                warn!("untracked tx scan worker died: {}", e);
            }
        }

        // repair pass runs regardless of how the scan went
        let store = self.store.clone();
        let params = self.params;
        let repair =
            tokio::task::spawn_blocking(move || scanner::fix_uncompleted(store.as_ref(), &params))
                .await;
        match repair {
            Ok(Ok(n)) => {
                if n > 0 {
                    self.notifier.postpone(DATA_CHANGED, None);
                }
            }
            Ok(Err(e)) => {
                self.state.mark_errored("mixing data repair failed").await;
                warn!("fix_uncompleted failed: {}", redact_line(&e.to_string(), &self.params));
            }
            Err(e) => {
                self.state.mark_errored("mixing data repair worker died").await;
                warn!("fix_uncompleted worker died: {}", e);
            }
        }

        self.state.finish_find_untracked().await;
        Ok(found)
    }

    /// Start the mixing cycle once the masternode network is ready.
    pub async fn start_mixing(&self) -> MixingResult<()> {
        if !net::protx_info_complete(self.network.as_ref()) {
            return Err(MixingError::WrongState(
                "masternode information is not complete yet".into(),
            ));
        }
        if !self.network.llmq_ready() {
            return Err(MixingError::WrongState("LLMQ data is not ready yet".into()));
        }
        self.state.begin_start_mixing().await?;
        self.options.set_last_mix_start_time(now_secs());
        let slots = Arc::new(Semaphore::new(self.options.max_sessions() as usize));
        *self.session_slots.lock().await = Some(slots);
        self.state.confirm_mixing().await;
        info!("mixing started");

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                if manager.state.state().await != MixingState::Mixing {
                    break;
                }
                if let Err(e) = manager.broadcast_workflow_txs().await {
                    warn!("workflow broadcast pass failed: {}", e);
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        Ok(())
    }

    /// Stop the mixing cycle. In-flight peer sessions are not forcibly
    /// cancelled; late masternode txs are awaited within the fixed
    /// wait window tracked by `last_mix_stop_time`.
    pub async fn stop_mixing(&self) -> MixingResult<()> {
        self.state.begin_stop_mixing().await?;
        self.options.set_last_mix_stop_time(now_secs());
        *self.session_slots.lock().await = None;
        self.state.confirm_stopped().await;
        info!("mixing stopped");
        Ok(())
    }

    /// Wipe all workflow and classification data. Refused with a guard
    /// message while mixing or reconciliation is running.
    pub async fn clear_data(&self) -> MixingResult<()> {
        if !self.state.begin_cleaning().await? {
            return Ok(());
        }
        info!("Clearing mixing wallet data");
        let store = self.store.clone();
        let wiped = tokio::task::spawn_blocking(move || store.clear_mixing_data()).await;
        self.workflows.write().await.clear();
        self.state.finish_cleaning().await;
        wiped.map_err(|e| MixingError::Store(format!("data wipe worker died: {}", e)))?;
        self.notifier.postpone(DATA_CHANGED, None);
        info!("All mixing wallet data cleared");
        Ok(())
    }

    /// Broadcast any outgoing transaction after double-spend vetting.
    /// This path is used for mixing and non-mixing transactions alike.
    pub async fn broadcast_transaction(&self, tx: &Transaction) -> MixingResult<()> {
        let warn_text = if self.options.warn_possible_dspend() {
            let mixing_running = self.state.state().await.is_mixing_running();
            Some(self.options.double_spend_warn(mixing_running))
        } else {
            None
        };
        self.guard
            .check_before_broadcast(tx, warn_text.as_deref())
            .await?;
        self.network.broadcast_transaction(&tx.to_raw(), None).await
    }

    /// Drain workflow transactions that need sending, in creation order,
    /// honoring each record's retry backoff.
    pub async fn broadcast_workflow_txs(&self) -> MixingResult<()> {
        let mut workflows = self.workflows.write().await;
        for uuid in workflows.creation_ids() {
            let Some(wfl) = workflows.get_creation_mut(&uuid) else { continue };
            while let Some(txid) = wfl.next_to_send(self.store.as_ref()) {
                let lid = wfl.lid();
                let Some(record) = wfl.tx_record_mut(&txid) else { break };
                let tx_type = record.tx_type;
                let (sent, err) = record.send(self.network.as_ref(), false).await;
                if sent {
                    self.log_wfl(
                        LogCategory::WflOk,
                        format!("workflow {}: sent {} tx {}", lid, tx_type, txid),
                    );
                } else {
                    if !err.is_empty() {
                        self.log_wfl(
                            LogCategory::WflErr,
                            format!("workflow {}: send of {} failed: {}", lid, txid, err),
                        );
                    }
                    break;
                }
            }
            if let Some(wfl) = workflows.get_creation(&uuid) {
                self.persist_creation(wfl);
            }
        }
        Ok(())
    }

    fn persist_creation(&self, workflow: &CreationWorkflow) {
        let key = format!("creation_wfl:{}", workflow.uuid);
        if let Ok(value) = serde_json::to_value(workflow.to_record()) {
            self.store.set_setting(&key, value);
        }
    }

    /// Restore a persisted creation workflow, e.g. after a restart.
    pub async fn restore_creation_workflow(
        &self,
        record: &CreationWorkflowRecord,
    ) -> MixingResult<Uuid> {
        let workflow = CreationWorkflow::from_record(record)?;
        let uuid = workflow.uuid;
        self.workflows.write().await.insert_creation(workflow);
        Ok(uuid)
    }

    /// Randomized delay before the next new-denoms transaction.
    pub fn next_denoms_tx_delay(&self) -> Duration {
        Duration::from_secs(fastrand::u64(MIN_NEW_DENOMS_DELAY_SEC..=MAX_NEW_DENOMS_DELAY_SEC))
    }

    /// Build a denoms-creation transaction from the given coins and
    /// register it in a new creation workflow. Output addresses must be
    /// freshly reserved wallet addresses, one per planned denom.
    pub async fn create_new_denoms_workflow(
        &self,
        inputs: &[PsCoin],
        denom_addresses: &[Address],
        change_address: Option<&str>,
    ) -> MixingResult<Uuid> {
        let total: Duffs = inputs.iter().map(|c| c.value).sum();
        let mut plan = calc_denoms_plan(total, self.options.keep_amount());
        if plan.is_empty() {
            return Err(MixingError::InvalidWorkflowArgument(
                "input value too small to create any denomination",
            ));
        }
        if denom_addresses.len() < plan.len() {
            return Err(MixingError::InvalidWorkflowArgument(
                "not enough reserved addresses for planned denom outputs",
            ));
        }
        plan.shuffle(&mut rand::thread_rng());

        let planned: Duffs = plan.iter().sum();
        let mut outputs: Vec<TxOutput> = plan
            .iter()
            .zip(denom_addresses)
            .map(|(value, address)| TxOutput { address: address.clone(), value: *value })
            .collect();
        let change = total - planned;
        if change > 0 {
            if let Some(address) = change_address {
                outputs.push(TxOutput { address: address.into(), value: change });
            }
        }
        let tx = Transaction::new(
            inputs.iter().map(|c| TxInput { prevout: c.outpoint }).collect(),
            outputs,
        );
        self.register_creation_tx(tx, MixTxType::NewDenoms).await
    }

    /// Build a collateral-creation transaction and register it in a new
    /// creation workflow.
    pub async fn create_new_collateral_workflow(
        &self,
        inputs: &[PsCoin],
        collateral_address: &str,
        change_address: Option<&str>,
    ) -> MixingResult<Uuid> {
        let total: Duffs = inputs.iter().map(|c| c.value).sum();
        let value = denoms::CREATE_COLLATERAL_VAL;
        if total < value {
            return Err(MixingError::InvalidWorkflowArgument(
                "input value below the collateral amount",
            ));
        }
        let mut outputs = vec![TxOutput { address: collateral_address.into(), value }];
        let change = total - value;
        if change > 0 {
            if let Some(address) = change_address {
                outputs.push(TxOutput { address: address.into(), value: change });
            }
        }
        let tx = Transaction::new(
            inputs.iter().map(|c| TxInput { prevout: c.outpoint }).collect(),
            outputs,
        );
        self.register_creation_tx(tx, MixTxType::NewCollateral).await
    }

    async fn register_creation_tx(
        &self,
        tx: Transaction,
        expected: MixTxType,
    ) -> MixingResult<Uuid> {
        let detected = classify(self.store.as_ref(), &tx, self.options.allow_others(), false);
        if detected != Some(expected) {
            return Err(MixingError::Store(format!(
                "constructed tx classified as {:?}, expected {}",
                detected, expected
            )));
        }

        let uuid = Uuid::new_v4();
        let txid = tx.txid();
        let mut workflows = self.workflows.write().await;
        let workflow = workflows.create_workflow(uuid);
        workflow.add_tx(txid, tx.to_raw(), expected);
        workflow.completed = true;
        let lid = workflow.lid();
        if let Some(workflow) = workflows.get_creation(&uuid) {
            self.persist_creation(workflow);
        }
        drop(workflows);

        if expected == MixTxType::NewDenoms {
            self.options.set_last_denoms_tx_time(now_secs());
        }
        self.log_wfl(
            LogCategory::WflDone,
            format!("workflow {}: {} tx {} created", lid, expected, txid),
        );
        self.notifier.postpone(DATA_CHANGED, None);
        Ok(uuid)
    }

    /// Pop a completed creation workflow whose transactions all exist in
    /// the wallet; no-op while any tx is still missing.
    pub async fn cleanup_creation_workflow(&self, uuid: &Uuid) -> MixingResult<bool> {
        let mut workflows = self.workflows.write().await;
        let confirmed = match workflows.get_creation(uuid) {
            Some(wfl) => {
                wfl.completed
                    && wfl
                        .tx_order()
                        .iter()
                        .all(|txid| self.store.is_confirmed(txid))
            }
            None => return Ok(false),
        };
        if !confirmed {
            return Ok(false);
        }
        workflows.pop_creation(uuid);
        self.store
            .set_setting(&format!("creation_wfl:{}", uuid), serde_json::Value::Null);
        Ok(true)
    }

    /// Reserve inputs/outputs for a denominate session and register its
    /// workflow. Fails when no session slot is free or a reservation
    /// overlaps another active session.
    pub async fn start_denominate_session(
        &self,
        denom_value: Duffs,
        inputs: Vec<crate::types::OutPoint>,
        outputs: Vec<Address>,
    ) -> MixingResult<Uuid> {
        if !denoms::is_denomination(denom_value) {
            return Err(MixingError::InvalidWorkflowArgument(
                "value is not a mixing denomination",
            ));
        }
        if self.state.state().await != MixingState::Mixing {
            return Err(MixingError::WrongState("mixing is not running".into()));
        }
        let slots = self
            .session_slots
            .lock()
            .await
            .clone()
            .ok_or_else(|| MixingError::WrongState("mixing is not running".into()))?;
        let permit = slots
            .try_acquire_owned()
            .map_err(|_| MixingError::WrongState("all mixing session slots are busy".into()))?;

        let uuid = Uuid::new_v4();
        let mut workflow = DenominateWorkflow::new(uuid, denom_value);
        workflow.inputs = inputs;
        workflow.outputs = outputs;
        let lid = workflow.lid();
        let reserved = workflow.inputs.clone();
        self.workflows.write().await.add_denominate(workflow)?;
        for outpoint in &reserved {
            self.store.add_ps_spending_denom(*outpoint, &uuid.to_string());
        }
        self.session_permits.lock().await.insert(uuid, permit);
        self.log_wfl(
            LogCategory::WflOk,
            format!("denominate workflow {}: reserved {} inputs", lid, reserved.len()),
        );
        Ok(uuid)
    }

    /// Record the peer-coordinated mix-complete signal for a session and
    /// release its reservations and slot.
    pub async fn complete_denominate_session(&self, uuid: &Uuid) -> MixingResult<()> {
        let mut workflows = self.workflows.write().await;
        let workflow = workflows
            .get_denominate_mut(uuid)
            .ok_or(MixingError::InvalidWorkflowArgument("unknown denominate workflow"))?;
        workflow.completed = now_secs();
        let lid = workflow.lid();
        let reserved = workflow.inputs.clone();
        drop(workflows);

        for outpoint in &reserved {
            self.store.pop_ps_spending_denom(outpoint);
        }
        self.session_permits.lock().await.remove(uuid);
        self.options.set_last_mixed_tx_time(now_secs());
        self.log_wfl(LogCategory::WflDone, format!("denominate workflow {}: completed", lid));
        self.notifier.postpone(DATA_CHANGED, None);
        Ok(())
    }

    /// Tear down a denominate session, releasing every reservation.
    pub async fn teardown_denominate_session(&self, uuid: &Uuid) -> MixingResult<()> {
        let workflow = self
            .workflows
            .write()
            .await
            .pop_denominate(uuid)
            .ok_or(MixingError::InvalidWorkflowArgument("unknown denominate workflow"))?;
        for outpoint in &workflow.inputs {
            self.store.pop_ps_spending_denom(outpoint);
        }
        self.session_permits.lock().await.remove(uuid);
        self.log_wfl(
            LogCategory::WflErr,
            format!("denominate workflow {}: torn down", workflow.lid()),
        );
        Ok(())
    }

    /// Check coins satisfy the configured minimum of mixing rounds.
    pub fn verify_spend_rounds(&self, coins: &[PsCoin]) -> MixingResult<()> {
        coins::check_min_rounds(coins, self.options.mix_rounds())
    }

    pub async fn mixing_stats(&self) -> MixingStats {
        self.stats.read().await.clone()
    }

    /// Reset gathered statistics; ignored while mixing runs.
    pub async fn clear_mixing_stats(&self) {
        if self.state.state().await.is_mixing_running() {
            return;
        }
        self.stats.write().await.reset();
    }

    pub async fn record_msg_sent(&self, kind: MsgKind) {
        if self.options.gather_mix_stat() {
            self.stats.write().await.stat_mut(kind).on_send();
        }
    }

    pub async fn record_msg_response(&self, kind: MsgKind) {
        if self.options.gather_mix_stat() {
            self.stats.write().await.stat_mut(kind).on_response();
        }
    }

    pub async fn record_queue_update(&self, kind: MsgKind) {
        if self.options.gather_mix_stat() {
            self.stats.write().await.stat_mut(kind).on_queue_update();
        }
    }

    pub async fn record_session_timeout(&self) {
        if self.options.gather_mix_stat() {
            self.stats.write().await.on_timeout();
        }
    }

    pub async fn record_session_peer_closed(&self) {
        if self.options.gather_mix_stat() {
            self.stats.write().await.on_peer_closed();
        }
    }

    pub async fn record_session_error(&self) {
        if self.options.gather_mix_stat() {
            self.stats.write().await.on_error();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denoms::{COIN, DENOM_VALS};
    use crate::net::testing::TestNetwork;
    use crate::store::{MemoryStore, PsDenom};
    use crate::types::OutPoint;
    use std::sync::atomic::Ordering;

    fn setup(supported: bool) -> (Arc<MemoryStore>, Arc<TestNetwork>, MixingManager) {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(TestNetwork::new());
        let (manager, _rx) = MixingManager::new(
            NetworkParams::mainnet(),
            store.clone(),
            network.clone(),
            supported,
        );
        (store, network, manager)
    }

    fn coin_of(store: &MemoryStore, value: Duffs, position: i64, addr: &str) -> PsCoin {
        store.add_own_address(addr);
        let tx = Transaction::new(
            vec![],
            vec![TxOutput { address: addr.into(), value }],
        );
        let txid = store.insert_transaction(&tx, position);
        PsCoin {
            outpoint: OutPoint::new(txid, 0),
            address: addr.into(),
            value,
            rounds: None,
        }
    }

    async fn make_ready(manager: &MixingManager) {
        manager.enable().await.unwrap();
        assert_eq!(manager.state().await, MixingState::Ready);
    }

    #[tokio::test]
    async fn test_enable_scans_history() {
        let (store, _net, manager) = setup(true);
        store.add_own_address("Xd0");
        let tx = Transaction::new(
            vec![TxInput { prevout: OutPoint::new(Txid::new([1; 32]), 0) }],
            vec![TxOutput { address: "Xd0".into(), value: DENOM_VALS[0] }],
        );
        let txid = store.insert_transaction(&tx, 0);

        let found = manager.enable().await.unwrap();
        assert_eq!(found, 1);
        assert_eq!(manager.state().await, MixingState::Ready);
        assert_eq!(store.get_ps_tx(&txid), Some((MixTxType::NewDenoms, true)));
    }

    #[tokio::test]
    async fn test_enable_unsupported_wallet() {
        let (_store, _net, manager) = setup(false);
        assert_eq!(manager.enable().await.unwrap_err(), MixingError::Unsupported);
        assert_eq!(manager.state().await, MixingState::Unsupported);
    }

    #[tokio::test]
    async fn test_start_mixing_gated_on_network_readiness() {
        let (_store, network, manager) = setup(true);
        make_ready(&manager).await;
        network.not_ready.store(true, Ordering::SeqCst);
        assert!(matches!(
            manager.start_mixing().await.unwrap_err(),
            MixingError::WrongState(_)
        ));
        network.not_ready.store(false, Ordering::SeqCst);
        manager.start_mixing().await.unwrap();
        assert_eq!(manager.state().await, MixingState::Mixing);
    }

    #[tokio::test]
    async fn test_clear_data_guard_and_wipe() {
        let (store, _net, manager) = setup(true);
        make_ready(&manager).await;
        manager.start_mixing().await.unwrap();

        // refused while mixing, state unchanged
        let err = manager.clear_data().await.unwrap_err();
        assert!(matches!(err, MixingError::WrongState(_)));
        assert_eq!(manager.state().await, MixingState::Mixing);

        manager.stop_mixing().await.unwrap();
        let txid = Txid::new([5; 32]);
        store.set_ps_tx(&txid, MixTxType::PrivateSend, true);

        // succeeds from Ready and lands back in Ready with data wiped
        manager.clear_data().await.unwrap();
        assert_eq!(manager.state().await, MixingState::Ready);
        assert_eq!(store.get_ps_tx(&txid), None);
    }

    #[tokio::test]
    async fn test_new_denoms_workflow_scenario() {
        let (store, _net, manager) = setup(true);
        make_ready(&manager).await;
        manager.options.set_keep_amount(2);
        manager.options.set_mix_rounds(4);

        let funding = coin_of(&store, 12 * COIN, 0, "Xfund");
        let denom_addresses: Vec<Address> = (0..32)
            .map(|i| {
                let addr = format!("Xdenom{}", i);
                store.add_own_address(&addr);
                addr
            })
            .collect();
        store.add_own_address("Xchange");

        let uuid = manager
            .create_new_denoms_workflow(&[funding], &denom_addresses, Some("Xchange"))
            .await
            .unwrap();

        let workflows = manager.workflows.read().await;
        let wfl = workflows.get_creation(&uuid).unwrap();
        assert!(wfl.completed);
        let txid = wfl.tx_order()[0];
        let record = wfl.tx_record(&txid).unwrap();
        assert_eq!(record.tx_type, MixTxType::NewDenoms);

        // outputs are drawn from the ladder plus at most one change output
        let tx = Transaction::from_raw(&record.raw_tx).unwrap();
        let non_denom = tx
            .outputs
            .iter()
            .filter(|o| !crate::denoms::is_denomination(o.value))
            .count();
        assert!(non_denom <= 1);
        assert!(tx.outputs.len() > 1);
    }

    #[tokio::test]
    async fn test_broadcast_respects_guard() {
        let (store, network, manager) = setup(true);
        make_ready(&manager).await;
        store.add_ps_address("Xmix");

        let to_reserved = Transaction::new(
            vec![TxInput { prevout: OutPoint::new(Txid::new([6; 32]), 0) }],
            vec![TxOutput { address: "Xmix".into(), value: 1_000 }],
        );
        assert_eq!(
            manager.broadcast_transaction(&to_reserved).await.unwrap_err(),
            MixingError::SpendToReservedAddress
        );
        assert_eq!(network.broadcast_count(), 0);

        let clean = Transaction::new(
            vec![TxInput { prevout: OutPoint::new(Txid::new([7; 32]), 0) }],
            vec![TxOutput { address: "Xpayee".into(), value: 1_000 }],
        );
        manager.broadcast_transaction(&clean).await.unwrap();
        assert_eq!(network.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_workflow_broadcast_drain() {
        let (store, network, manager) = setup(true);
        make_ready(&manager).await;

        let funding = coin_of(&store, 2 * COIN, 0, "Xfund");
        store.add_own_address("Xcoll");
        let uuid = manager
            .create_new_collateral_workflow(&[funding], "Xcoll", None)
            .await
            .unwrap();

        // the workflow tx is local until broadcast succeeds
        {
            let workflows = manager.workflows.read().await;
            let wfl = workflows.get_creation(&uuid).unwrap();
            let txid = wfl.tx_order()[0];
            let raw = wfl.tx_record(&txid).unwrap().raw_tx.clone();
            let tx = Transaction::from_raw(&raw).unwrap();
            store.insert_local_transaction(&tx, 1);
        }

        manager.broadcast_workflow_txs().await.unwrap();
        assert_eq!(network.broadcast_count(), 1);
        let workflows = manager.workflows.read().await;
        let wfl = workflows.get_creation(&uuid).unwrap();
        let txid = wfl.tx_order()[0];
        assert!(wfl.tx_record(&txid).unwrap().sent.is_some());
    }

    #[tokio::test]
    async fn test_denominate_session_slots_and_reservations() {
        let (store, _net, manager) = setup(true);
        make_ready(&manager).await;
        manager.options.set_max_sessions(1);
        manager.start_mixing().await.unwrap();

        let d = DENOM_VALS[0];
        let op = OutPoint::new(Txid::new([8; 32]), 0);
        store.add_ps_denom(op, PsDenom { address: "Xd".into(), value: d, rounds: 0 });

        let uuid = manager
            .start_denominate_session(d, vec![op], vec!["Xout".into()])
            .await
            .unwrap();
        assert!(store.get_ps_spending_denom(&op).is_some());

        // single slot: a second session is refused
        let other = OutPoint::new(Txid::new([9; 32]), 0);
        assert!(matches!(
            manager
                .start_denominate_session(d, vec![other], vec!["Xout2".into()])
                .await
                .unwrap_err(),
            MixingError::WrongState(_)
        ));

        manager.complete_denominate_session(&uuid).await.unwrap();
        assert!(store.get_ps_spending_denom(&op).is_none());

        // slot freed: a new session can start
        manager
            .start_denominate_session(d, vec![other], vec!["Xout2".into()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_verify_spend_rounds() {
        let (_store, _net, manager) = setup(true);
        let good = PsCoin {
            outpoint: OutPoint::new(Txid::new([10; 32]), 0),
            address: "Xd".into(),
            value: DENOM_VALS[0],
            rounds: Some(4),
        };
        assert!(manager.verify_spend_rounds(&[good.clone()]).is_ok());
        let shallow = PsCoin { rounds: Some(1), ..good };
        assert_eq!(
            manager.verify_spend_rounds(&[shallow]).unwrap_err(),
            MixingError::MinRoundsNotMet { required: 4 }
        );
    }

    #[tokio::test]
    async fn test_stats_gated_by_option() {
        let (_store, _net, manager) = setup(true);
        manager.record_msg_sent(MsgKind::Dsa).await;
        assert_eq!(manager.mixing_stats().await.dsa.sent_cnt, 0);

        manager.options.set_gather_mix_stat(true);
        manager.record_msg_sent(MsgKind::Dsa).await;
        manager.record_session_timeout().await;
        let stats = manager.mixing_stats().await;
        assert_eq!(stats.dsa.sent_cnt, 1);
        assert_eq!(stats.dsa.timeout_cnt, 1);
    }
}
