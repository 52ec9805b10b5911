//! Connected gate.
//!
//! Open while the supervisor holds a live connection, closed otherwise. Every
//! transition to open starts a new epoch, so a waiter that woke up for an
//! epoch which has since been closed (and maybe reopened) can tell that its
//! wake-up is stale by comparing epochs instead of polling.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateState {
    pub connected: bool,
    pub epoch: u64,
}

#[derive(Debug)]
pub struct ConnectionGate {
    tx: watch::Sender<GateState>,
}

impl Default for ConnectionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState::default());
        Self { tx }
    }

    /// Opens the gate for a new epoch and returns it. Opening an already
    /// open gate is a no-op that returns the current epoch.
    pub fn open(&self) -> u64 {
        let mut epoch = 0;
        self.tx.send_modify(|state| {
            if !state.connected {
                state.connected = true;
                state.epoch += 1;
            }
            epoch = state.epoch;
        });
        epoch
    }

    /// Closes the gate. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if state.connected {
                state.connected = false;
                true
            } else {
                false
            }
        })
    }

    pub fn state(&self) -> GateState {
        *self.tx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.tx.borrow().connected
    }

    pub fn subscribe(&self) -> watch::Receiver<GateState> {
        self.tx.subscribe()
    }

    /// Waits until the gate is open and returns the epoch it opened for.
    /// `None` means the gate itself was dropped.
    pub async fn wait_open(rx: &mut watch::Receiver<GateState>) -> Option<u64> {
        rx.wait_for(|state| state.connected)
            .await
            .ok()
            .map(|state| state.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_starts_closed() {
        let gate = ConnectionGate::new();
        assert_eq!(gate.state(), GateState::default());
        assert!(!gate.is_open());
    }

    #[test]
    fn test_each_open_starts_new_epoch() {
        let gate = ConnectionGate::new();
        assert_eq!(gate.open(), 1);
        assert_eq!(gate.open(), 1);
        assert!(gate.close());
        assert!(!gate.close());
        assert_eq!(gate.open(), 2);
    }

    #[test]
    fn test_never_open_while_disconnected() {
        let gate = ConnectionGate::new();
        for _ in 0..5 {
            gate.open();
            assert!(gate.state().connected);
            gate.close();
            let state = gate.state();
            assert!(!state.connected);
            assert!(!gate.is_open());
        }
    }

    #[tokio::test]
    async fn test_waiter_blocks_until_open() {
        let gate = ConnectionGate::new();
        let mut rx = gate.subscribe();

        let blocked =
            tokio::time::timeout(Duration::from_millis(20), ConnectionGate::wait_open(&mut rx))
                .await;
        assert!(blocked.is_err());

        let epoch = gate.open();
        let woke = ConnectionGate::wait_open(&mut rx).await;
        assert_eq!(woke, Some(epoch));
    }

    #[tokio::test]
    async fn test_waiter_sees_dropped_gate() {
        let gate = ConnectionGate::new();
        let mut rx = gate.subscribe();
        drop(gate);
        assert_eq!(ConnectionGate::wait_open(&mut rx).await, None);
    }
}
