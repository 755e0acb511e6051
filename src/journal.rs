// src/journal.rs
//! Bounded in-memory log ring with category tagging, plus redaction of
//! txids and addresses from messages leaving the component boundary.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::types::NetworkParams;

pub const LOG_RING_CAPACITY: usize = 1000;
pub const LOG_RING_EVICT: usize = 100;

pub const FILTERED_TXID: &str = "<filtered txid>";
pub const FILTERED_ADDR: &str = "<filtered address>";

/// Log subcategories used to colorize workflow logs downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    NoCategory,
    WflOk,
    WflErr,
    WflDone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub seq: u64,
    pub when: DateTime<Utc>,
    pub category: LogCategory,
    pub message: String,
}

/// Fixed-capacity ring of structured log entries; evicts the oldest
/// chunk on overflow.
#[derive(Debug)]
pub struct LogRing {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRing {
    pub fn new() -> Self {
        LogRing { entries: VecDeque::with_capacity(LOG_RING_CAPACITY), next_seq: 0 }
    }

    pub fn push(&mut self, category: LogCategory, message: impl Into<String>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(LogEntry {
            seq,
            when: Utc::now(),
            category,
            message: message.into(),
        });
        if self.entries.len() > LOG_RING_CAPACITY {
            self.clear(LOG_RING_EVICT);
        }
        seq
    }

    /// Drop the `count` oldest entries; 0 clears everything.
    pub fn clear(&mut self, count: usize) {
        if count == 0 {
            self.entries.clear();
            return;
        }
        for _ in 0..count.min(self.entries.len()) {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }
}

fn is_base58_char(c: char) -> bool {
    c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l')
}

/// Shallow address check: base58 body of plausible length starting with
/// a known version prefix for the network.
pub fn looks_like_address(s: &str, params: &NetworkParams) -> bool {
    if !(26..=35).contains(&s.len()) || !s.chars().all(is_base58_char) {
        return false;
    }
    let first = match s.chars().next() {
        Some(c) => c,
        None => return false,
    };
    if params.testnet {
        matches!(first, 'y' | '8' | '9')
    } else {
        matches!(first, 'X' | '7')
    }
}

/// Filter txids and addresses out of a log line.
pub fn redact_line(line: &str, params: &NetworkParams) -> String {
    let mut output = String::with_capacity(line.len());
    let mut run = String::new();

    let flush = |run: &mut String, output: &mut String| {
        if run.is_empty() {
            return;
        }
        let is_txid = run.len() == 64 && run.chars().all(|c| c.is_ascii_hexdigit());
        if is_txid {
            output.push_str(FILTERED_TXID);
        } else if looks_like_address(run, params) {
            output.push_str(FILTERED_ADDR);
        } else {
            output.push_str(run);
        }
        run.clear();
    };

    for c in line.chars() {
        if c.is_ascii_alphanumeric() {
            run.push(c);
        } else {
            flush(&mut run, &mut output);
            output.push(c);
        }
    }
    flush(&mut run, &mut output);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Transaction, TxOutput};

    #[test]
    fn test_ring_eviction() {
        let mut ring = LogRing::new();
        for i in 0..(LOG_RING_CAPACITY + 1) {
            ring.push(LogCategory::NoCategory, format!("entry {}", i));
        }
        // overflow dropped the oldest chunk
        assert_eq!(ring.len(), LOG_RING_CAPACITY + 1 - LOG_RING_EVICT);
        let snapshot = ring.snapshot();
        assert_eq!(snapshot[0].seq, LOG_RING_EVICT as u64);
        assert_eq!(snapshot.last().map(|e| e.seq), Some(LOG_RING_CAPACITY as u64));
    }

    #[test]
    fn test_ring_clear() {
        let mut ring = LogRing::new();
        for i in 0..10 {
            ring.push(LogCategory::WflOk, format!("{}", i));
        }
        ring.clear(4);
        assert_eq!(ring.len(), 6);
        assert_eq!(ring.snapshot()[0].seq, 4);
        ring.clear(0);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_redact_txid() {
        let params = NetworkParams::mainnet();
        let tx = Transaction::new(
            vec![],
            vec![TxOutput { address: "Xwhatever".into(), value: 1 }],
        );
        let txid = tx.txid().to_string();
        let line = format!("Found New denoms {}", txid);
        assert_eq!(
            redact_line(&line, &params),
            format!("Found New denoms {}", FILTERED_TXID)
        );
    }

    #[test]
    fn test_redact_address() {
        let params = NetworkParams::mainnet();
        let addr = "XpAy7o5e8mWUVGbX9DcfqaAb45zFJ2dLUx";
        let line = format!("reserved {} for mixing", addr);
        assert_eq!(
            redact_line(&line, &params),
            format!("reserved {} for mixing", FILTERED_ADDR)
        );
        // testnet prefix does not match on mainnet
        let line = "yTestnetAddr1234567890123456789";
        assert_eq!(redact_line(line, &params), line);
    }

    #[test]
    fn test_redact_keeps_ordinary_words() {
        let params = NetworkParams::mainnet();
        let line = "workflow 12ab34cd completed with 3 txs";
        assert_eq!(redact_line(line, &params), line);
    }
}
