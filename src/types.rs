// src/types.rs
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MixingError;

/// Monetary amount in duffs (1 coin = 100_000_000 duffs).
pub type Duffs = u64;

/// Wallet address in its string form.
pub type Address = String;

/// Transaction id: double SHA-256 of the raw transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Txid([u8; 32]);

impl Txid {
    pub fn new(bytes: [u8; 32]) -> Self {
        Txid(bytes)
    }

    /// Derive the txid from raw transaction bytes.
    pub fn from_raw_tx(raw: &[u8]) -> Self {
        let first = Sha256::digest(raw);
        let second = Sha256::digest(first);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&second);
        Txid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txid({})", self)
    }
}

impl FromStr for Txid {
    type Err = MixingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| MixingError::Parse(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(MixingError::Parse(format!(
                "txid must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Txid(arr))
    }
}

impl Serialize for Txid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Txid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Txid::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Reference to a transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Txid,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Txid, vout: u32) -> Self {
        OutPoint { txid, vout }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl FromStr for OutPoint {
    type Err = MixingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, vout) = s
            .rsplit_once(':')
            .ok_or_else(|| MixingError::Parse(format!("bad outpoint: {}", s)))?;
        Ok(OutPoint {
            txid: Txid::from_str(txid)?,
            vout: vout
                .parse()
                .map_err(|_| MixingError::Parse(format!("bad vout: {}", vout)))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prevout: OutPoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: Address,
    pub value: Duffs,
}

/// Wallet-side view of a transaction. The canonical serialized form
/// produced by `to_raw` is what the txid is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Transaction { inputs, outputs }
    }

    pub fn to_raw(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_raw(raw: &[u8]) -> Result<Self, MixingError> {
        serde_json::from_slice(raw).map_err(|e| MixingError::Parse(e.to_string()))
    }

    pub fn txid(&self) -> Txid {
        Txid::from_raw_tx(&self.to_raw())
    }
}

/// Network parameters passed into every component at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkParams {
    pub testnet: bool,
}

impl NetworkParams {
    pub fn mainnet() -> Self {
        NetworkParams { testnet: false }
    }

    pub fn testnet() -> Self {
        NetworkParams { testnet: true }
    }
}

/// Current time as whole epoch seconds.
pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current time as fractional epoch seconds, for wait measurements.
pub(crate) fn now_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Bitcoin-style VarInt size in bytes.
pub fn varint_size(val: u64) -> usize {
    if val < 253 {
        1
    } else if val < (1 << 16) {
        3
    } else if val < (1 << 32) {
        5
    } else {
        9
    }
}

/// P2PKH tx size from inputs/outputs count (signature size can vary).
pub fn calc_tx_size(in_cnt: usize, out_cnt: usize, max_size: bool) -> usize {
    // base size is 4 bytes version + 4 bytes lock_time
    let mut tx_size = 4 + 4;
    // in size is 36 bytes outpoint + 1b len + iscript + 4 bytes sequence_no
    // iscript is 1b varint + sig (71-73 bytes) + 1b varint + 33 bytes pubk
    // max in size is 36 + 1 + (1 + 73 + 1 + 33) + 4 = 149
    tx_size += varint_size(in_cnt as u64) + in_cnt * (if max_size { 149 } else { 148 });
    // out size is 8 byte value + 1b varint + 25 bytes p2pkh script
    tx_size += varint_size(out_cnt as u64) + out_cnt * 34;
    tx_size
}

/// P2PKH tx fee from inputs/outputs count and fee rate per 1000 bytes.
pub fn calc_tx_fee(in_cnt: usize, out_cnt: usize, fee_per_kb: u64, max_size: bool) -> Duffs {
    let size = calc_tx_size(in_cnt, out_cnt, max_size) as u64;
    (size * fee_per_kb).div_ceil(1000)
}
