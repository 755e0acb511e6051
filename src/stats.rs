// src/stats.rs
//! Per-message-kind timing/outcome counters for mixing sessions.

use std::fmt;

use crate::types::now_secs_f64;

const MIN_WAIT_UNSET: f64 = 1e9;

/// Outgoing mixing session message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// Session allocation request.
    Dsa,
    /// Inputs/outputs submission.
    Dsi,
    /// Signed final tx submission.
    Dss,
}

/// Outgoing message statistics for one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgStat {
    pub msg_sent: f64,
    pub sent_cnt: u64,
    pub dssu_cnt: u64,
    pub success_cnt: u64,
    pub timeout_cnt: u64,
    pub peer_closed_cnt: u64,
    pub error_cnt: u64,
    pub total_wait_sec: f64,
    pub min_wait_sec: f64,
    pub max_wait_sec: f64,
}

impl Default for MsgStat {
    fn default() -> Self {
        MsgStat {
            msg_sent: 0.0,
            sent_cnt: 0,
            dssu_cnt: 0,
            success_cnt: 0,
            timeout_cnt: 0,
            peer_closed_cnt: 0,
            error_cnt: 0,
            total_wait_sec: 0.0,
            min_wait_sec: MIN_WAIT_UNSET,
            max_wait_sec: 0.0,
        }
    }
}

impl MsgStat {
    /// Called before sending an outgoing message.
    pub fn on_send(&mut self) {
        self.sent_cnt += 1;
        self.msg_sent = now_secs_f64();
    }

    /// Called on status-update arrival before the next workflow message.
    pub fn on_queue_update(&mut self) {
        self.dssu_cnt += 1;
    }

    /// Called on arrival of the next mixing workflow message.
    pub fn on_response(&mut self) {
        let wait_sec = now_secs_f64() - self.msg_sent;
        self.min_wait_sec = self.min_wait_sec.min(wait_sec);
        self.total_wait_sec += wait_sec;
        self.max_wait_sec = self.max_wait_sec.max(wait_sec);
        self.success_cnt += 1;
    }

    pub fn on_timeout(&mut self) {
        self.timeout_cnt += 1;
    }

    pub fn on_peer_closed(&mut self) {
        self.peer_closed_cnt += 1;
    }

    pub fn on_error(&mut self) {
        self.error_cnt += 1;
    }
}

impl fmt::Display for MsgStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_wait = if self.min_wait_sec == MIN_WAIT_UNSET { 0.0 } else { self.min_wait_sec };
        let avg_wait = if self.success_cnt > 0 {
            self.total_wait_sec / self.success_cnt as f64
        } else {
            0.0
        };
        write!(
            f,
            "all={}, ok={}, err={}, timeout={}, closed={}, dssu={}, min/avg/max={:.1}/{:.1}/{:.1}sec",
            self.sent_cnt,
            self.success_cnt,
            self.error_cnt,
            self.timeout_cnt,
            self.peer_closed_cnt,
            self.dssu_cnt,
            min_wait,
            avg_wait,
            self.max_wait_sec,
        )
    }
}

/// Outgoing message statistics grouped together per wallet.
///
/// Responses are not always tagged with the provoking message, so
/// timeout/peer-closed/error events are attributed to whichever kind was
/// most recently sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MixingStats {
    pub dsa: MsgStat,
    pub dsi: MsgStat,
    pub dss: MsgStat,
}

impl MixingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stat(&self, kind: MsgKind) -> &MsgStat {
        match kind {
            MsgKind::Dsa => &self.dsa,
            MsgKind::Dsi => &self.dsi,
            MsgKind::Dss => &self.dss,
        }
    }

    pub fn stat_mut(&mut self, kind: MsgKind) -> &mut MsgStat {
        match kind {
            MsgKind::Dsa => &mut self.dsa,
            MsgKind::Dsi => &mut self.dsi,
            MsgKind::Dss => &mut self.dss,
        }
    }

    /// The stat of the most recently sent message kind, if any was sent.
    fn last_sent_mut(&mut self) -> Option<&mut MsgStat> {
        let mut last_sent = 0.0;
        let mut last_kind = None;
        for kind in [MsgKind::Dsa, MsgKind::Dsi, MsgKind::Dss] {
            let sent = self.stat(kind).msg_sent;
            if sent > last_sent {
                last_sent = sent;
                last_kind = Some(kind);
            }
        }
        last_kind.map(|kind| self.stat_mut(kind))
    }

    pub fn on_timeout(&mut self) {
        if let Some(stat) = self.last_sent_mut() {
            stat.on_timeout();
        }
    }

    pub fn on_peer_closed(&mut self) {
        if let Some(stat) = self.last_sent_mut() {
            stat.on_peer_closed();
        }
    }

    pub fn on_error(&mut self) {
        if let Some(stat) = self.last_sent_mut() {
            stat.on_error();
        }
    }

    pub fn reset(&mut self) {
        *self = MixingStats::default();
    }
}

impl fmt::Display for MixingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mixing sessions statistics:\ndsa: {}\ndsi: {}\ndss: {}",
            self.dsa, self.dsi, self.dss
        )
    }
}
