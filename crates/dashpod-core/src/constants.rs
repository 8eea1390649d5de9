//! Hardware constants a pod echoes during setup.
//!
//! A pod whose constants differ from what the controller expects cannot be
//! dosed safely; every differing field is reported, not just the first.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::Reader;
use crate::error::Result;

/// Delivery constants, volumes in milliunits of insulin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodConstants {
    pub pulse_volume_mu: u16,
    pub bolus_pulse_interval_secs: u8,
    pub prime_pulse_interval_secs: u8,
    pub prime_bolus_mu: u16,
    pub insertion_bolus_mu: u16,
    pub service_duration_hours: u16,
}

impl Default for PodConstants {
    fn default() -> Self {
        Self {
            pulse_volume_mu: 50,
            bolus_pulse_interval_secs: 2,
            prime_pulse_interval_secs: 1,
            prime_bolus_mu: 2_600,
            insertion_bolus_mu: 500,
            service_duration_hours: 80,
        }
    }
}

/// One field that disagrees with the expected table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantMismatch {
    pub field: &'static str,
    pub expected: u32,
    pub found: u32,
}

impl fmt::Display for ConstantMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, found {}",
            self.field, self.expected, self.found
        )
    }
}

impl PodConstants {
    pub(crate) const WIRE_SIZE: usize = 10;

    /// Every field of `self` (reported) that differs from `expected`.
    pub fn mismatches(&self, expected: &Self) -> Vec<ConstantMismatch> {
        let pairs: [(&'static str, u32, u32); 6] = [
            (
                "pulse_volume_mu",
                u32::from(expected.pulse_volume_mu),
                u32::from(self.pulse_volume_mu),
            ),
            (
                "bolus_pulse_interval_secs",
                u32::from(expected.bolus_pulse_interval_secs),
                u32::from(self.bolus_pulse_interval_secs),
            ),
            (
                "prime_pulse_interval_secs",
                u32::from(expected.prime_pulse_interval_secs),
                u32::from(self.prime_pulse_interval_secs),
            ),
            (
                "prime_bolus_mu",
                u32::from(expected.prime_bolus_mu),
                u32::from(self.prime_bolus_mu),
            ),
            (
                "insertion_bolus_mu",
                u32::from(expected.insertion_bolus_mu),
                u32::from(self.insertion_bolus_mu),
            ),
            (
                "service_duration_hours",
                u32::from(expected.service_duration_hours),
                u32::from(self.service_duration_hours),
            ),
        ];
        pairs
            .into_iter()
            .filter(|(_, expected, found)| expected != found)
            .map(|(field, expected, found)| ConstantMismatch {
                field,
                expected,
                found,
            })
            .collect()
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.pulse_volume_mu.to_be_bytes());
        out.push(self.bolus_pulse_interval_secs);
        out.push(self.prime_pulse_interval_secs);
        out.extend_from_slice(&self.prime_bolus_mu.to_be_bytes());
        out.extend_from_slice(&self.insertion_bolus_mu.to_be_bytes());
        out.extend_from_slice(&self.service_duration_hours.to_be_bytes());
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            pulse_volume_mu: r.u16()?,
            bolus_pulse_interval_secs: r.u8()?,
            prime_pulse_interval_secs: r.u8()?,
            prime_bolus_mu: r.u16()?,
            insertion_bolus_mu: r.u16()?,
            service_duration_hours: r.u16()?,
        })
    }
}
