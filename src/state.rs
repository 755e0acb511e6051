// src/state.rs
//! Mixing lifecycle state and its guarded transitions. All check-then-set
//! sequences run under one mutex; every transition emits a coalesced
//! state-changed notification.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{MixingError, MixingResult};
use crate::notify::{Notifier, STATE_CHANGED};

/// Lifecycle states of the mixing engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MixingState {
    /// Mixing is unsupported on this wallet (terminal).
    Unsupported,
    /// Mixing is disabled yet.
    Disabled,
    /// Check data, find untracked txs.
    Initializing,
    /// Ready to mixing.
    Ready,
    /// Starting mixing process.
    StartMixing,
    /// Mixing is running.
    Mixing,
    /// Stopping mixing process.
    StopMixing,
    /// Finding untracked txs.
    FindingUntracked,
    /// Some error is encountered on mixing data adding/check.
    Errored,
    /// Cleaning mixing data.
    Cleaning,
}

impl MixingState {
    pub fn is_mixing_running(&self) -> bool {
        matches!(
            self,
            MixingState::StartMixing | MixingState::Mixing | MixingState::StopMixing
        )
    }

    /// Short label for a mixing control in a presentation layer.
    pub fn control_label(&self) -> &'static str {
        match self {
            MixingState::Ready => "Start Mixing",
            MixingState::Mixing => "Stop Mixing",
            MixingState::StartMixing => "Starting Mixing ...",
            MixingState::StopMixing => "Stopping Mixing ...",
            MixingState::FindingUntracked => "Finding Mixing Data ...",
            MixingState::Disabled => "Enable Mixing",
            MixingState::Initializing => "Initializing ...",
            MixingState::Cleaning => "Cleaning Mixing Data ...",
            MixingState::Unsupported => "Mixing Unsupported",
            MixingState::Errored => "Check Log For Errors",
        }
    }
}

/// Serializes every transition and emits state-changed notifications.
pub struct StateMachine {
    state: Mutex<MixingState>,
    notifier: Notifier,
}

impl StateMachine {
    pub fn new(initial: MixingState, notifier: Notifier) -> Self {
        StateMachine { state: Mutex::new(initial), notifier }
    }

    pub async fn state(&self) -> MixingState {
        *self.state.lock().await
    }

    fn notify(&self, message: Option<String>) {
        self.notifier.postpone(STATE_CHANGED, message);
    }

    /// Unconditional transition, used where the caller already holds the
    /// logical right to move (worker completions, error marking).
    pub async fn set(&self, new_state: MixingState) {
        let mut state = self.state.lock().await;
        if *state != new_state {
            *state = new_state;
            self.notify(None);
        }
    }

    /// Errored is sticky: only an explicit clear/rebuild leaves it.
    pub async fn mark_errored(&self, message: &str) {
        let mut state = self.state.lock().await;
        *state = MixingState::Errored;
        self.notify(Some(message.to_string()));
    }

    /// Disabled -> Initializing, refused in any other state.
    pub async fn begin_enable(&self) -> MixingResult<()> {
        let mut state = self.state.lock().await;
        match *state {
            MixingState::Disabled => {
                *state = MixingState::Initializing;
                self.notify(None);
                Ok(())
            }
            MixingState::Unsupported => Err(MixingError::Unsupported),
            other => Err(MixingError::WrongState(format!(
                "mixing can only be enabled while disabled, not {:?}",
                other
            ))),
        }
    }

    /// Ready|Initializing -> FindingUntracked; false if not eligible.
    pub async fn begin_find_untracked(&self) -> bool {
        let mut state = self.state.lock().await;
        if matches!(*state, MixingState::Ready | MixingState::Initializing) {
            *state = MixingState::FindingUntracked;
            self.notify(None);
            true
        } else {
            false
        }
    }

    /// Leave FindingUntracked; Errored stays sticky.
    pub async fn finish_find_untracked(&self) {
        let mut state = self.state.lock().await;
        if *state != MixingState::Errored {
            *state = MixingState::Ready;
            self.notify(None);
        }
    }

    /// Ready -> StartMixing.
    pub async fn begin_start_mixing(&self) -> MixingResult<()> {
        let mut state = self.state.lock().await;
        match *state {
            MixingState::Ready => {
                *state = MixingState::StartMixing;
                self.notify(None);
                Ok(())
            }
            MixingState::Unsupported => Err(MixingError::Unsupported),
            other => Err(MixingError::WrongState(format!(
                "mixing can only start from Ready, not {:?}",
                other
            ))),
        }
    }

    /// StartMixing -> Mixing.
    pub async fn confirm_mixing(&self) {
        let mut state = self.state.lock().await;
        if *state == MixingState::StartMixing {
            *state = MixingState::Mixing;
            self.notify(None);
        }
    }

    /// Mixing -> StopMixing.
    pub async fn begin_stop_mixing(&self) -> MixingResult<()> {
        let mut state = self.state.lock().await;
        match *state {
            MixingState::Mixing => {
                *state = MixingState::StopMixing;
                self.notify(None);
                Ok(())
            }
            other => Err(MixingError::WrongState(format!(
                "mixing is not running, state is {:?}",
                other
            ))),
        }
    }

    /// StopMixing -> Ready.
    pub async fn confirm_stopped(&self) {
        let mut state = self.state.lock().await;
        if *state == MixingState::StopMixing {
            *state = MixingState::Ready;
            self.notify(None);
        }
    }

    /// Request the Cleaning state. Refused with a descriptive guard
    /// message while mixing or reconciliation is running; `Ok(false)`
    /// when cleaning is already in progress.
    pub async fn begin_cleaning(&self) -> MixingResult<bool> {
        let mut state = self.state.lock().await;
        match *state {
            s if s.is_mixing_running() => Err(MixingError::WrongState(
                "To clear mixing data stop mixing first".into(),
            )),
            MixingState::FindingUntracked => Err(MixingError::WrongState(
                "Can not clear mixing data while the search for untracked \
                 mixing transactions is running"
                    .into(),
            )),
            MixingState::Cleaning => Ok(false),
            _ => {
                *state = MixingState::Cleaning;
                self.notify(None);
                Ok(true)
            }
        }
    }

    /// Cleaning -> Ready.
    pub async fn finish_cleaning(&self) {
        let mut state = self.state.lock().await;
        if *state == MixingState::Cleaning {
            *state = MixingState::Ready;
            self.notify(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;

    fn machine(initial: MixingState) -> StateMachine {
        let (notifier, _rx) = Notifier::new();
        StateMachine::new(initial, notifier)
    }

    #[tokio::test]
    async fn test_normal_mixing_cycle() {
        let sm = machine(MixingState::Disabled);
        sm.begin_enable().await.unwrap();
        assert_eq!(sm.state().await, MixingState::Initializing);
        assert!(sm.begin_find_untracked().await);
        sm.finish_find_untracked().await;
        assert_eq!(sm.state().await, MixingState::Ready);

        sm.begin_start_mixing().await.unwrap();
        sm.confirm_mixing().await;
        assert_eq!(sm.state().await, MixingState::Mixing);
        sm.begin_stop_mixing().await.unwrap();
        sm.confirm_stopped().await;
        assert_eq!(sm.state().await, MixingState::Ready);
    }

    #[tokio::test]
    async fn test_cleaning_refused_while_running() {
        for state in [
            MixingState::StartMixing,
            MixingState::Mixing,
            MixingState::StopMixing,
            MixingState::FindingUntracked,
        ] {
            let sm = machine(state);
            let err = sm.begin_cleaning().await.unwrap_err();
            assert!(matches!(err, MixingError::WrongState(_)));
            // state unchanged: the request is a no-op
            assert_eq!(sm.state().await, state);
        }
    }

    #[tokio::test]
    async fn test_cleaning_from_ready_returns_to_ready() {
        let sm = machine(MixingState::Ready);
        assert!(sm.begin_cleaning().await.unwrap());
        assert_eq!(sm.state().await, MixingState::Cleaning);
        sm.finish_cleaning().await;
        assert_eq!(sm.state().await, MixingState::Ready);
    }

    #[tokio::test]
    async fn test_errored_is_sticky() {
        let sm = machine(MixingState::FindingUntracked);
        sm.mark_errored("scan failed").await;
        sm.finish_find_untracked().await;
        assert_eq!(sm.state().await, MixingState::Errored);
        // an explicit clean is the way out
        assert!(sm.begin_cleaning().await.unwrap());
        sm.finish_cleaning().await;
        assert_eq!(sm.state().await, MixingState::Ready);
    }

    #[tokio::test]
    async fn test_enable_guards() {
        let sm = machine(MixingState::Unsupported);
        assert_eq!(sm.begin_enable().await.unwrap_err(), MixingError::Unsupported);
        let sm = machine(MixingState::Ready);
        assert!(matches!(
            sm.begin_enable().await.unwrap_err(),
            MixingError::WrongState(_)
        ));
    }
}
