//! Observable connection state plus the cancellation epoch.
//!
//! Only the connection manager mutates the state; everyone else gets a read-only
//! `watch::Receiver`. Every connection attempt captures the epoch it started in, and a
//! caller `disconnect()` bumps it: transitions requested under an old epoch are refused,
//! and every suspension point races [`StateHolder::cancelled`].

use pump_core::ConnectionState;
use tokio::sync::watch;

pub struct StateHolder {
    state: watch::Sender<ConnectionState>,
    epoch: watch::Sender<u64>,
}

impl Default for StateHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHolder {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(ConnectionState::Disconnected),
            epoch: watch::Sender::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Move to `next` if the table allows it and no disconnect happened since `epoch`.
    /// The epoch check and the state change happen under the epoch lock, so a concurrent
    /// `cancel` either sees the new state or prevents it.
    pub fn transition(&self, epoch: u64, next: ConnectionState) -> bool {
        let mut applied = false;
        self.epoch.send_if_modified(|current_epoch| {
            if *current_epoch != epoch {
                tracing::debug!(%next, "transition from a cancelled attempt ignored");
                return false;
            }
            self.state.send_if_modified(|state| {
                if *state == next {
                    applied = true;
                    return false;
                }
                if !state.can_transition_to(next) {
                    tracing::warn!(from = %state, to = %next, "illegal transition refused");
                    return false;
                }
                tracing::info!(from = %state, to = %next, "connection state");
                *state = next;
                applied = true;
                true
            });
            false
        });
        applied
    }

    /// Caller-initiated disconnect: invalidate every in-flight attempt and force
    /// `DISCONNECTED`. Returns the new epoch.
    pub fn cancel(&self) -> u64 {
        let mut new_epoch = 0;
        self.epoch.send_modify(|epoch| {
            *epoch += 1;
            new_epoch = *epoch;
            self.state.send_if_modified(|state| {
                if *state == ConnectionState::Disconnected {
                    return false;
                }
                tracing::info!(from = %state, to = %ConnectionState::Disconnected, "connection state");
                *state = ConnectionState::Disconnected;
                true
            });
        });
        new_epoch
    }

    /// Resolves once the epoch moves past `epoch`.
    pub async fn cancelled(&self, epoch: u64) {
        let mut rx = self.epoch.subscribe();
        // The sender lives as long as `self`, so this only returns on a real bump.
        let _ = rx.wait_for(|current| *current != epoch).await;
    }

    pub fn is_cancelled(&self, epoch: u64) -> bool {
        self.epoch() != epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use ConnectionState::*;

    #[test]
    fn follows_transition_table() {
        let holder = StateHolder::new();
        let epoch = holder.epoch();
        assert!(holder.transition(epoch, Scanning));
        assert!(!holder.transition(epoch, Connected));
        assert_eq!(holder.current(), Scanning);
        assert!(holder.transition(epoch, Connecting));
        assert!(holder.transition(epoch, Authenticating));
        assert!(holder.transition(epoch, Connected));
    }

    #[test]
    fn stale_epoch_refused() {
        let holder = StateHolder::new();
        let epoch = holder.epoch();
        holder.transition(epoch, Scanning);
        let next = holder.cancel();
        assert_eq!(holder.current(), Disconnected);
        assert!(holder.is_cancelled(epoch));
        assert!(!holder.transition(epoch, Scanning));
        assert_eq!(holder.current(), Disconnected);
        assert!(holder.transition(next, Scanning));
    }

    #[test]
    fn subscribers_see_changes() {
        let holder = StateHolder::new();
        let rx = holder.subscribe();
        holder.transition(holder.epoch(), Scanning);
        assert_eq!(*rx.borrow(), Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_resolves_on_bump() {
        let holder = std::sync::Arc::new(StateHolder::new());
        let epoch = holder.epoch();
        let waiter = {
            let holder = holder.clone();
            tokio::spawn(async move { holder.cancelled(epoch).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());
        holder.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
