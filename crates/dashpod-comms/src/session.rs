//! An established encrypted session handed to a session body.

use std::future::Future;
use std::pin::Pin;

use dashpod_core::{BlockType, Message, MessageBlock, MessageTransportState, PodState};
use tracing::warn;

use crate::comms::CommsCore;
use crate::error::{PodCommsError, Result};
use crate::link::PodLink;
use crate::transport::MessageTransport;

/// Future returned by a session body.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Encrypted session with a ready pod.
///
/// Lives only for the duration of one session body on the worker. Every
/// exchange's counter movement is persisted before `send` returns; if that
/// write fails the session is aborted and refuses further sends.
pub struct PodSession<L: PodLink> {
    core: CommsCore<L>,
    transport: MessageTransport,
    aborted: bool,
}

impl<L: PodLink> PodSession<L> {
    pub(crate) const fn new(core: CommsCore<L>, transport: MessageTransport) -> Self {
        Self {
            core,
            transport,
            aborted: false,
        }
    }

    pub(crate) fn into_parts(self) -> (CommsCore<L>, MessageTransport) {
        (self.core, self.transport)
    }

    /// The pod state as of the last persisted exchange.
    pub const fn pod_state(&self) -> &PodState {
        self.core.state()
    }

    pub fn transport_state(&self) -> Option<MessageTransportState> {
        self.transport.transport_state()
    }

    /// Send command blocks and return the pod's decrypted response.
    pub async fn send(&mut self, blocks: Vec<MessageBlock>) -> Result<Message> {
        if self.aborted {
            return Err(PodCommsError::SessionAborted);
        }
        let result = self.transport.send(self.core.link_mut(), blocks).await;
        self.persist_counters()?;
        result
    }

    /// Send and require the response's leading block to be `expected`.
    pub async fn send_expecting(
        &mut self,
        blocks: Vec<MessageBlock>,
        expected: BlockType,
    ) -> Result<Message> {
        let response = self.send(blocks).await?;
        match response.leading_block_type() {
            Some(found) if found == expected => Ok(response),
            found => Err(PodCommsError::UnexpectedResponse { block_type: found }),
        }
    }

    fn persist_counters(&mut self) -> Result<()> {
        let transport_state = self.transport.transport_state();
        let fault = self.transport.fault();
        let committed = self.core.keeper_mut().commit(|s| {
            s.transport_state = transport_state;
            if fault.is_some() {
                s.fault = fault;
            }
        });
        if let Err(e) = &committed {
            warn!(error = %e, "Persisting session counters failed, aborting session");
            self.aborted = true;
        }
        committed
    }
}
