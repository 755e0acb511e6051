// src/workflow.rs
//! In-flight mixing workflows and their persisted record forms.
//!
//! A creation workflow is completed once all its planned transactions
//! exist, independent of whether they have been sent. A denominate
//! workflow keeps exclusive ownership of its reserved inputs/outputs
//! until completion or explicit teardown.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::MixTxType;
use crate::error::{MixingError, MixingResult};
use crate::net::MixingNetwork;
use crate::types::{Address, Duffs, OutPoint, Txid, now_secs};

/// Fixed delay before the next broadcast retry of a workflow tx.
pub const SEND_RETRY_DELAY_SECS: i64 = 10;

/// Transaction data placed to workflows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    /// Workflow id the record belongs to.
    pub uuid: Uuid,
    pub tx_type: MixTxType,
    pub txid: Txid,
    pub raw_tx: Vec<u8>,
    /// Time the tx was sent to the network; permanent once set.
    pub sent: Option<i64>,
    /// Minimal time when the next send attempt should occur.
    pub next_send: Option<i64>,
}

impl TxRecord {
    /// Try to broadcast, honoring the retry backoff unless
    /// `ignore_next_send` is set. Returns `(sent, error)`.
    pub async fn send(
        &mut self,
        net: &dyn MixingNetwork,
        ignore_next_send: bool,
    ) -> (bool, String) {
        if self.sent.is_some() {
            return (false, String::new());
        }
        let now = now_secs();
        if !ignore_next_send {
            if let Some(next_send) = self.next_send {
                if next_send > now {
                    return (false, String::new());
                }
            }
        }
        match net.broadcast_transaction(&self.raw_tx, None).await {
            Ok(()) => {
                self.sent = Some(now_secs());
                (true, String::new())
            }
            Err(e) => {
                self.next_send = Some(now + SEND_RETRY_DELAY_SECS);
                (false, e.to_string())
            }
        }
    }
}

/// Flat persisted form of a [`TxRecord`], keyed by txid in the parent map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecordEntry {
    pub uuid: String,
    pub sent: Option<i64>,
    pub next_send: Option<i64>,
    pub tx_type: MixTxType,
    pub raw_tx: String,
}

/// Denoms/collateral production workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationWorkflow {
    pub uuid: Uuid,
    /// Set once all planned transactions exist.
    pub completed: bool,
    tx_data: HashMap<Txid, TxRecord>,
    tx_order: Vec<Txid>,
}

impl CreationWorkflow {
    pub fn new(uuid: Uuid) -> Self {
        CreationWorkflow { uuid, completed: false, tx_data: HashMap::new(), tx_order: Vec::new() }
    }

    /// Light uuid used for logging, to lighten output for reading.
    pub fn lid(&self) -> String {
        self.uuid.to_string().chars().take(8).collect()
    }

    /// Add tx to workflow.
    pub fn add_tx(&mut self, txid: Txid, raw_tx: Vec<u8>, tx_type: MixTxType) -> &TxRecord {
        let record = TxRecord {
            uuid: self.uuid,
            tx_type,
            txid,
            raw_tx,
            sent: None,
            next_send: None,
        };
        self.tx_data.insert(txid, record);
        self.tx_order.push(txid);
        &self.tx_data[&txid]
    }

    /// Pop tx from workflow, keeping order list and map in sync.
    pub fn pop_tx(&mut self, txid: &Txid) -> Option<TxRecord> {
        let res = self.tx_data.remove(txid);
        self.tx_order.retain(|tid| tid != txid);
        res
    }

    pub fn tx_order(&self) -> &[Txid] {
        &self.tx_order
    }

    pub fn tx_record(&self, txid: &Txid) -> Option<&TxRecord> {
        self.tx_data.get(txid)
    }

    pub fn tx_record_mut(&mut self, txid: &Txid) -> Option<&mut TxRecord> {
        self.tx_data.get_mut(txid)
    }

    pub fn is_empty(&self) -> bool {
        self.tx_order.is_empty()
    }

    /// Earliest (by creation order) not-yet-sent tx known to the wallet
    /// as local, or none.
    pub fn next_to_send(&self, store: &dyn crate::store::WalletStore) -> Option<Txid> {
        self.tx_order
            .iter()
            .find(|txid| {
                self.tx_data
                    .get(txid)
                    .is_some_and(|rec| rec.sent.is_none() && store.is_local_tx(txid))
            })
            .copied()
    }

    pub fn to_record(&self) -> CreationWorkflowRecord {
        let mut tx_data = BTreeMap::new();
        for (txid, rec) in &self.tx_data {
            tx_data.insert(
                txid.to_string(),
                TxRecordEntry {
                    uuid: rec.uuid.to_string(),
                    sent: rec.sent,
                    next_send: rec.next_send,
                    tx_type: rec.tx_type,
                    raw_tx: hex::encode(&rec.raw_tx),
                },
            );
        }
        CreationWorkflowRecord {
            uuid: self.uuid.to_string(),
            completed: self.completed,
            tx_order: self.tx_order.iter().map(|t| t.to_string()).collect(),
            tx_data,
        }
    }

    pub fn from_record(record: &CreationWorkflowRecord) -> MixingResult<Self> {
        if record.uuid.is_empty() {
            return Err(MixingError::InvalidWorkflowArgument("missing required uuid argument"));
        }
        let uuid = Uuid::parse_str(&record.uuid)
            .map_err(|_| MixingError::InvalidWorkflowArgument("malformed workflow uuid"))?;
        let mut tx_data = HashMap::new();
        for (txid_str, entry) in &record.tx_data {
            let txid = Txid::from_str(txid_str)?;
            let rec_uuid = Uuid::parse_str(&entry.uuid)
                .map_err(|_| MixingError::InvalidWorkflowArgument("malformed tx record uuid"))?;
            let raw_tx =
                hex::decode(&entry.raw_tx).map_err(|e| MixingError::Parse(e.to_string()))?;
            tx_data.insert(
                txid,
                TxRecord {
                    uuid: rec_uuid,
                    tx_type: entry.tx_type,
                    txid,
                    raw_tx,
                    sent: entry.sent,
                    next_send: entry.next_send,
                },
            );
        }
        let mut tx_order = Vec::with_capacity(record.tx_order.len());
        for txid_str in &record.tx_order {
            tx_order.push(Txid::from_str(txid_str)?);
        }
        Ok(CreationWorkflow { uuid, completed: record.completed, tx_data, tx_order })
    }
}

/// Flat persisted form of a [`CreationWorkflow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationWorkflowRecord {
    pub uuid: String,
    pub completed: bool,
    pub tx_order: Vec<String>,
    pub tx_data: BTreeMap<String, TxRecordEntry>,
}

/// Denominate-session workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenominateWorkflow {
    pub uuid: Uuid,
    /// Denomination value being mixed.
    pub denom: Duffs,
    /// Legacy field kept in the persisted form.
    pub rounds: u32,
    /// Spending denom outpoints reserved for the session.
    pub inputs: Vec<OutPoint>,
    /// Output addresses reserved for the session.
    pub outputs: Vec<Address>,
    /// Time the mix-complete signal was received; 0 while in flight.
    pub completed: i64,
}

impl DenominateWorkflow {
    pub fn new(uuid: Uuid, denom: Duffs) -> Self {
        DenominateWorkflow { uuid, denom, rounds: 0, inputs: Vec::new(), outputs: Vec::new(), completed: 0 }
    }

    /// Light uuid used for logging, to lighten output for reading.
    pub fn lid(&self) -> String {
        self.uuid.to_string().chars().take(8).collect()
    }

    pub fn is_completed(&self) -> bool {
        self.completed != 0
    }

    pub fn to_record(&self) -> DenominateWorkflowRecord {
        DenominateWorkflowRecord {
            uuid: self.uuid.to_string(),
            denom: self.denom,
            rounds: self.rounds,
            inputs: self.inputs.iter().map(|op| op.to_string()).collect(),
            outputs: self.outputs.clone(),
            completed: self.completed,
        }
    }

    pub fn from_record(record: &DenominateWorkflowRecord) -> MixingResult<Self> {
        if record.uuid.is_empty() {
            return Err(MixingError::InvalidWorkflowArgument("missing required uuid argument"));
        }
        let uuid = Uuid::parse_str(&record.uuid)
            .map_err(|_| MixingError::InvalidWorkflowArgument("malformed workflow uuid"))?;
        let mut inputs = Vec::with_capacity(record.inputs.len());
        for op in &record.inputs {
            inputs.push(OutPoint::from_str(op)?);
        }
        Ok(DenominateWorkflow {
            uuid,
            denom: record.denom,
            rounds: record.rounds,
            inputs,
            outputs: record.outputs.clone(),
            completed: record.completed,
        })
    }
}

/// Flat persisted form of a [`DenominateWorkflow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenominateWorkflowRecord {
    pub uuid: String,
    pub denom: Duffs,
    pub rounds: u32,
    pub inputs: Vec<String>,
    pub outputs: Vec<Address>,
    pub completed: i64,
}

/// Owns the in-flight workflow records, keyed by session id.
#[derive(Debug, Default)]
pub struct WorkflowStore {
    creation: HashMap<Uuid, CreationWorkflow>,
    denominate: HashMap<Uuid, DenominateWorkflow>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_workflow(&mut self, uuid: Uuid) -> &mut CreationWorkflow {
        self.creation.entry(uuid).or_insert_with(|| CreationWorkflow::new(uuid))
    }

    pub fn insert_creation(&mut self, workflow: CreationWorkflow) {
        self.creation.insert(workflow.uuid, workflow);
    }

    pub fn get_creation(&self, uuid: &Uuid) -> Option<&CreationWorkflow> {
        self.creation.get(uuid)
    }

    pub fn get_creation_mut(&mut self, uuid: &Uuid) -> Option<&mut CreationWorkflow> {
        self.creation.get_mut(uuid)
    }

    pub fn pop_creation(&mut self, uuid: &Uuid) -> Option<CreationWorkflow> {
        self.creation.remove(uuid)
    }

    pub fn creation_workflows(&self) -> impl Iterator<Item = &CreationWorkflow> {
        self.creation.values()
    }

    pub fn creation_ids(&self) -> Vec<Uuid> {
        self.creation.keys().copied().collect()
    }

    /// Register a denominate workflow, refusing any overlap with the
    /// reservations of other still-active sessions.
    pub fn add_denominate(&mut self, workflow: DenominateWorkflow) -> MixingResult<()> {
        let mut reserved_inputs: HashSet<OutPoint> = HashSet::new();
        let mut reserved_outputs: HashSet<&str> = HashSet::new();
        for wfl in self.denominate.values().filter(|w| !w.is_completed()) {
            reserved_inputs.extend(wfl.inputs.iter().copied());
            reserved_outputs.extend(wfl.outputs.iter().map(|a| a.as_str()));
        }
        for op in &workflow.inputs {
            if reserved_inputs.contains(op) {
                return Err(MixingError::ReservationConflict(format!(
                    "outpoint {} already reserved",
                    op
                )));
            }
        }
        for addr in &workflow.outputs {
            if reserved_outputs.contains(addr.as_str()) {
                return Err(MixingError::ReservationConflict(
                    "address already reserved by another session".into(),
                ));
            }
        }
        self.denominate.insert(workflow.uuid, workflow);
        Ok(())
    }

    pub fn get_denominate(&self, uuid: &Uuid) -> Option<&DenominateWorkflow> {
        self.denominate.get(uuid)
    }

    pub fn get_denominate_mut(&mut self, uuid: &Uuid) -> Option<&mut DenominateWorkflow> {
        self.denominate.get_mut(uuid)
    }

    pub fn pop_denominate(&mut self, uuid: &Uuid) -> Option<DenominateWorkflow> {
        self.denominate.remove(uuid)
    }

    pub fn active_denominate_count(&self) -> usize {
        self.denominate.values().filter(|w| !w.is_completed()).count()
    }

    pub fn clear(&mut self) {
        self.creation.clear();
        self.denominate.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::TestNetwork;
    use crate::store::MemoryStore;
    use crate::types::{TxOutput, Transaction};
    use std::sync::atomic::Ordering;

    fn sample_tx(tag: u64) -> Transaction {
        Transaction::new(
            vec![],
            vec![TxOutput { address: format!("X{}", tag), value: 100_001 + tag }],
        )
    }

    #[test]
    fn test_creation_workflow_round_trip() {
        let mut wfl = CreationWorkflow::new(Uuid::new_v4());
        for tag in 0..3 {
            let tx = sample_tx(tag);
            wfl.add_tx(tx.txid(), tx.to_raw(), MixTxType::NewDenoms);
        }
        wfl.completed = true;
        if let Some(first) = wfl.tx_order().first().copied() {
            if let Some(rec) = wfl.tx_record_mut(&first) {
                rec.sent = Some(1_700_000_000);
                rec.next_send = Some(1_700_000_010);
            }
        }

        let record = wfl.to_record();
        let restored = CreationWorkflow::from_record(&record).unwrap();
        assert_eq!(wfl, restored);
        // record itself survives a json round trip
        let json = serde_json::to_string(&record).unwrap();
        let record2: CreationWorkflowRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, record2);
    }

    #[test]
    fn test_from_record_requires_uuid() {
        let record = CreationWorkflowRecord {
            uuid: String::new(),
            completed: false,
            tx_order: vec![],
            tx_data: BTreeMap::new(),
        };
        assert_eq!(
            CreationWorkflow::from_record(&record),
            Err(MixingError::InvalidWorkflowArgument("missing required uuid argument"))
        );
    }

    #[test]
    fn test_add_pop_keeps_order_and_map_in_sync() {
        let mut wfl = CreationWorkflow::new(Uuid::new_v4());
        let txids: Vec<Txid> = (0..3)
            .map(|tag| {
                let tx = sample_tx(tag);
                wfl.add_tx(tx.txid(), tx.to_raw(), MixTxType::NewCollateral).txid
            })
            .collect();
        assert_eq!(wfl.tx_order(), &txids[..]);

        let popped = wfl.pop_tx(&txids[1]).unwrap();
        assert_eq!(popped.txid, txids[1]);
        assert_eq!(wfl.tx_order(), &[txids[0], txids[2]]);
        assert!(wfl.tx_record(&txids[1]).is_none());
        assert!(wfl.pop_tx(&txids[1]).is_none());
    }

    #[test]
    fn test_next_to_send_order_and_locality() {
        let store = MemoryStore::new();
        let mut wfl = CreationWorkflow::new(Uuid::new_v4());
        let tx0 = sample_tx(0);
        let tx1 = sample_tx(1);
        store.insert_local_transaction(&tx0, 0);
        store.insert_local_transaction(&tx1, 1);
        wfl.add_tx(tx0.txid(), tx0.to_raw(), MixTxType::NewDenoms);
        wfl.add_tx(tx1.txid(), tx1.to_raw(), MixTxType::NewDenoms);

        assert_eq!(wfl.next_to_send(&store), Some(tx0.txid()));
        if let Some(rec) = wfl.tx_record_mut(&tx0.txid()) {
            rec.sent = Some(now_secs());
        }
        assert_eq!(wfl.next_to_send(&store), Some(tx1.txid()));
    }

    #[tokio::test]
    async fn test_send_backoff_and_permanent_sent() {
        let net = TestNetwork::new();
        let tx = sample_tx(7);
        let mut rec = TxRecord {
            uuid: Uuid::new_v4(),
            tx_type: MixTxType::NewDenoms,
            txid: tx.txid(),
            raw_tx: tx.to_raw(),
            sent: None,
            next_send: None,
        };

        net.fail_broadcast.store(true, Ordering::SeqCst);
        let (sent, err) = rec.send(&net, false).await;
        assert!(!sent);
        assert!(!err.is_empty());
        assert!(rec.next_send.is_some());

        // backoff window refuses another attempt
        let (sent, err) = rec.send(&net, false).await;
        assert!(!sent);
        assert!(err.is_empty());

        // manual retry bypasses the backoff
        net.fail_broadcast.store(false, Ordering::SeqCst);
        let (sent, _) = rec.send(&net, true).await;
        assert!(sent);
        assert!(rec.sent.is_some());
        assert_eq!(net.broadcast_count(), 1);

        // once sent, further calls are no-ops
        let (sent, err) = rec.send(&net, true).await;
        assert!(!sent);
        assert!(err.is_empty());
        assert_eq!(net.broadcast_count(), 1);
    }

    #[test]
    fn test_denominate_round_trip_and_exclusive_reservation() {
        let mut store = WorkflowStore::new();
        let op = OutPoint::new(Txid::new([9; 32]), 0);

        let mut wfl = DenominateWorkflow::new(Uuid::new_v4(), 100_001);
        wfl.inputs.push(op);
        wfl.outputs.push("Xout1".into());
        let record = wfl.to_record();
        assert_eq!(DenominateWorkflow::from_record(&record).unwrap(), wfl);

        store.add_denominate(wfl.clone()).unwrap();
        assert_eq!(store.active_denominate_count(), 1);

        let mut rival = DenominateWorkflow::new(Uuid::new_v4(), 100_001);
        rival.inputs.push(op);
        assert!(matches!(
            store.add_denominate(rival),
            Err(MixingError::ReservationConflict(_))
        ));

        // completion releases the claim for new sessions
        if let Some(active) = store.get_denominate_mut(&wfl.uuid) {
            active.completed = now_secs();
        }
        let mut successor = DenominateWorkflow::new(Uuid::new_v4(), 100_001);
        successor.inputs.push(op);
        assert!(store.add_denominate(successor).is_ok());
    }
}
