//! Dashpod Communications Core
//!
//! Drives a pod from first contact to an encrypted session and keeps its
//! durable state consistent with every exchange:
//!
//! - **Pairing**: X25519 long-term key exchange with an unpaired pod
//! - **Setup**: address assignment and hardware constant validation
//! - **Session keys**: challenge/response over the long-term key, with one
//!   sequence number resynchronization
//! - **Transport**: framed, encrypted request/response with strict nonce
//!   sequencing
//! - **Orchestration**: a single worker that serializes all pod work in
//!   submission order

pub mod comms;
pub mod eap;
pub mod error;
pub mod link;
pub mod ltk;
pub mod session;
pub mod state;
pub mod store;
pub mod transport;

pub use comms::{DEFAULT_QUEUE_DEPTH, PodComms, PodCommsBuilder};
pub use eap::{EapOutcome, Established, SessionKeyEstablisher, SessionKeys};
pub use error::{PodCommsError, Result};
pub use link::{LinkError, PodLink};
pub use ltk::{LtkExchanger, PairingOutcome};
pub use session::{PodSession, SessionFuture};
pub use state::{ChannelObserver, PodStateChanged, PodStateObserver};
pub use store::{JsonFileStore, MemoryStore, PodStateStore, StoreError};
pub use transport::MessageTransport;
