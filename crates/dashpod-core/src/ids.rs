//! Controller and pod addressing.
//!
//! Before a pod has a permanent address it is reached through the broadcast
//! address. The pod's candidate address comes from the discovery hint when
//! the radio layer supplied one, otherwise it is derived from the controller
//! id by stepping the low two bits, so the pair always shares a /30 block.

/// Destination of frames sent before the pod has an address.
pub const BROADCAST_ADDRESS: u32 = 0xFFFF_FFFF;

/// Controller id used when configuration does not name one.
pub const DEFAULT_CONTROLLER_ID: u32 = 4242;

/// Address derivation for one controller/pod pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ids {
    controller: u32,
    pod: u32,
}

impl Ids {
    pub const fn new(controller_id: u32, pod_address_hint: Option<u32>) -> Self {
        let pod = match pod_address_hint {
            Some(hint) => hint,
            None => next_pod_address(controller_id),
        };
        Self {
            controller: controller_id,
            pod,
        }
    }

    /// The controller's own fixed address.
    pub const fn controller(&self) -> u32 {
        self.controller
    }

    /// The address the pod is expected to report during pairing.
    pub const fn pod(&self) -> u32 {
        self.pod
    }
}

/// Pod candidate derived from a controller address.
pub const fn next_pod_address(controller: u32) -> u32 {
    (controller & !3) | (controller.wrapping_add(1) & 3)
}
