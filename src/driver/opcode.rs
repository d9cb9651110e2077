//! Opcodes selecting mapping and control operations.

use crate::region::PAGE_SIZE;
use crate::{Error, Result};
use std::convert::TryFrom;

/// Opcode of the counter region mapping.
pub const MAP_OPC_COUNTER: u64 = 1;

/// Resources that can be mapped into a caller's address space.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapOpcode {
    /// The session's whole counter region.
    Counter = MAP_OPC_COUNTER,
}

impl TryFrom<u64> for MapOpcode {
    type Error = Error;

    fn try_from(raw: u64) -> Result<Self> {
        match raw {
            MAP_OPC_COUNTER => Ok(MapOpcode::Counter),
            _ => Err(Error::InvalidOpcode(raw)),
        }
    }
}

impl MapOpcode {
    /// Decode an opcode carried in an mmap file offset as `opcode * page_size`.
    pub fn from_page_offset(offset: u64) -> Result<Self> {
        let page = *PAGE_SIZE as u64;
        if offset % page != 0 {
            return Err(Error::InvalidOpcode(offset));
        }
        MapOpcode::try_from(offset / page)
    }

    /// File offset that encodes this opcode.
    pub fn page_offset(self) -> u64 {
        self as u64 * *PAGE_SIZE as u64
    }

    /// Build the request for a destination range of `len` bytes.
    pub fn request(self, len: usize) -> MapRequest {
        MapRequest { opcode: self, len }
    }
}

/// A decoded mapping request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    /// Resource to map.
    pub opcode: MapOpcode,
    /// Size of the destination range.
    pub len: usize,
}

impl MapRequest {
    /// Decode a raw opcode and destination size.
    pub fn decode(opcode: u64, len: usize) -> Result<Self> {
        Ok(MapOpcode::try_from(opcode)?.request(len))
    }
}

/// Reserved operations of the control channel.
///
/// None of them is implemented; they are accepted by [`DriverState::control`] only to be
/// rejected with [`Error::Unsupported`].
///
/// [`DriverState::control`]: crate::DriverState::control
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOpcode {
    /// Start a monitor task over a caller memory range.
    AllocMonitor = 1,
    /// Stop a monitor task.
    FreeMonitor = 2,
    /// Configure a monitor task.
    SetMonitorInfo = 3,
    /// Configure the simulated counters.
    SetCounterInfo = 4,
}

impl TryFrom<u64> for ControlOpcode {
    type Error = Error;

    fn try_from(raw: u64) -> Result<Self> {
        match raw {
            1 => Ok(ControlOpcode::AllocMonitor),
            2 => Ok(ControlOpcode::FreeMonitor),
            3 => Ok(ControlOpcode::SetMonitorInfo),
            4 => Ok(ControlOpcode::SetCounterInfo),
            _ => Err(Error::InvalidOpcode(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_opcode_decode() {
        assert_eq!(MapOpcode::try_from(1).ok(), Some(MapOpcode::Counter));
        for raw in &[0u64, 2, 3, u64::MAX] {
            match MapOpcode::try_from(*raw) {
                Err(Error::InvalidOpcode(x)) => assert_eq!(x, *raw),
                other => panic!("unexpected result {:?}", other),
            }
        }
    }

    #[test]
    fn test_map_opcode_page_offset() {
        let page = *PAGE_SIZE as u64;
        assert_eq!(MapOpcode::Counter.page_offset(), page);
        assert_eq!(
            MapOpcode::from_page_offset(page).ok(),
            Some(MapOpcode::Counter)
        );
        assert!(MapOpcode::from_page_offset(0).is_err());
        assert!(MapOpcode::from_page_offset(page + 1).is_err());
        assert!(MapOpcode::from_page_offset(2 * page).is_err());
    }

    #[test]
    fn test_control_opcode_decode() {
        assert_eq!(
            ControlOpcode::try_from(4).ok(),
            Some(ControlOpcode::SetCounterInfo)
        );
        assert!(ControlOpcode::try_from(0).is_err());
        assert!(ControlOpcode::try_from(5).is_err());
    }
}
