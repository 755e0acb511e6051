// src/net.rs
//! Network collaborator: delegated broadcast plus masternode-network
//! readiness signals gating whether mixing may start.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::MixingResult;

/// Minimal ProTx info completeness required before mixing may start.
pub const MIN_PROTX_INFO_COMPLETENESS: f64 = 0.75;

#[async_trait]
pub trait MixingNetwork: Send + Sync {
    /// Broadcast a raw transaction to the network.
    async fn broadcast_transaction(
        &self,
        raw_tx: &[u8],
        timeout: Option<Duration>,
    ) -> MixingResult<()>;

    /// Fraction of masternode ProTx info available, in [0, 1].
    fn protx_info_completeness(&self) -> f64;

    /// Whether LLMQ quorum data is ready.
    fn llmq_ready(&self) -> bool;
}

/// Check ProTx diffs data is ready and mixing can be run.
pub fn protx_info_complete(net: &dyn MixingNetwork) -> bool {
    net.protx_info_completeness() >= MIN_PROTX_INFO_COMPLETENESS
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Test network: records broadcasts, optionally failing them.
    #[derive(Default)]
    pub struct TestNetwork {
        pub fail_broadcast: AtomicBool,
        pub not_ready: AtomicBool,
        pub broadcasts: Mutex<Vec<Vec<u8>>>,
    }

    impl TestNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn broadcast_count(&self) -> usize {
            self.broadcasts.lock().map(|b| b.len()).unwrap_or(0)
        }
    }

    #[async_trait]
    impl MixingNetwork for TestNetwork {
        async fn broadcast_transaction(
            &self,
            raw_tx: &[u8],
            _timeout: Option<Duration>,
        ) -> MixingResult<()> {
            if self.fail_broadcast.load(Ordering::SeqCst) {
                return Err(crate::error::MixingError::Broadcast("connection reset".into()));
            }
            if let Ok(mut b) = self.broadcasts.lock() {
                b.push(raw_tx.to_vec());
            }
            Ok(())
        }

        fn protx_info_completeness(&self) -> f64 {
            if self.not_ready.load(Ordering::SeqCst) { 0.1 } else { 1.0 }
        }

        fn llmq_ready(&self) -> bool {
            !self.not_ready.load(Ordering::SeqCst)
        }
    }
}
