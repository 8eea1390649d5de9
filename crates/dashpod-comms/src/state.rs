//! Ownership of the live [`PodState`].
//!
//! Every mutation goes through [`StateKeeper::commit`]: the change is made on
//! a copy, the copy is saved, and only then does it replace the in-memory
//! record and reach the observer. A failed save leaves both memory and disk
//! on the previous record.

use std::sync::Arc;

use dashpod_core::PodState;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::PodStateStore;

/// A pod state transition, delivered after it was persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodStateChanged {
    pub old: PodState,
    pub new: PodState,
}

/// Receives pod state transitions synchronously on the worker.
///
/// Called before the operation that caused the change returns to its caller.
/// Implementations must not block.
pub trait PodStateObserver: Send + Sync {
    fn pod_state_changed(&self, change: &PodStateChanged);
}

/// Observer that forwards every transition into a channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<PodStateChanged>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PodStateChanged>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PodStateObserver for ChannelObserver {
    fn pod_state_changed(&self, change: &PodStateChanged) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(change.clone());
    }
}

pub(crate) struct StateKeeper {
    state: PodState,
    store: Arc<dyn PodStateStore>,
    observer: Option<Arc<dyn PodStateObserver>>,
}

impl StateKeeper {
    pub(crate) fn new(
        state: PodState,
        store: Arc<dyn PodStateStore>,
        observer: Option<Arc<dyn PodStateObserver>>,
    ) -> Self {
        Self {
            state,
            store,
            observer,
        }
    }

    pub(crate) const fn state(&self) -> &PodState {
        &self.state
    }

    /// Apply `mutate`, persist, then publish and notify.
    ///
    /// A mutation that leaves the record unchanged is neither saved nor
    /// reported.
    pub(crate) fn commit(&mut self, mutate: impl FnOnce(&mut PodState)) -> Result<()> {
        let mut next = self.state.clone();
        mutate(&mut next);
        if next == self.state {
            return Ok(());
        }

        self.store.save(&next)?;

        if next.setup_progress != self.state.setup_progress {
            info!(
                from = %self.state.setup_progress,
                to = %next.setup_progress,
                "Pod setup progress changed"
            );
        }
        let old = std::mem::replace(&mut self.state, next);
        if let Some(observer) = &self.observer {
            debug!("Notifying pod state observer");
            observer.pod_state_changed(&PodStateChanged {
                old,
                new: self.state.clone(),
            });
        }
        Ok(())
    }
}
