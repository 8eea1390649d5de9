//! The radio link boundary.
//!
//! Discovery, connection management and characteristic I/O live outside
//! this crate. The core only needs one framed round trip at a time.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{PodCommsError, Result};

/// Failures reported by the radio layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("No response before the link timeout")]
    NoResponse,

    #[error("Link disconnected: {0}")]
    Disconnected(String),

    #[error("No pod peripheral connected")]
    NoPeripheral,
}

/// One physical connection to a pod.
///
/// Implementations deliver a complete frame and return the pod's complete
/// reply frame. Only one round trip is ever outstanding; the orchestrator's
/// queue guarantees it.
pub trait PodLink: Send + 'static {
    fn send_and_await_response(
        &mut self,
        frame: &[u8],
    ) -> impl Future<Output = std::result::Result<Vec<u8>, LinkError>> + Send;
}

/// Run one round trip, mapping an elapsed deadline to `NoResponse`.
pub(crate) async fn round_trip<L: PodLink>(
    link: &mut L,
    frame: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    match tokio::time::timeout(timeout, link.send_and_await_response(frame)).await {
        Ok(response) => Ok(response?),
        Err(_) => {
            debug!(timeout_ms = timeout.as_millis(), "Round trip timed out");
            Err(PodCommsError::NoResponse)
        }
    }
}
