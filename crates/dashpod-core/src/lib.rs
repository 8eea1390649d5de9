//! dashpod Core Library
//!
//! Shared functionality for dashpod components:
//! - Wire codec for pod frames and typed message blocks
//! - Controller/pod addressing
//! - Persisted pod state and hardware constants
//! - Configuration resolution and tracing setup
//! - Common error types

pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod ids;
pub mod pod_state;
pub mod tracing_init;

pub use codec::{BlockType, FaultInfo, Message, MessageBlock};
pub use config::CommsConfig;
pub use constants::{ConstantMismatch, PodConstants};
pub use error::{Error, Result};
pub use ids::Ids;
pub use pod_state::{
    CipherKey, LongTermKey, MessageTransportState, PodState, SetupProgress,
};
