//! Definitions for the NMT protocol

/// Possible NMT states for a node
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// Bootup
    ///
    /// A node never remains in this state, as all nodes transition
    /// automatically into PreOperational
    Bootup = 0x00,
    /// Node has been stopped
    Stopped = 0x04,
    /// Normal operational state
    Operational = 0x05,
    /// Node is awaiting command to enter operation
    PreOperational = 0x7F,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Bootup => write!(f, "Bootup"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
        }
    }
}

/// An error for [`NmtState::try_from()`]
#[derive(Clone, Copy, Debug)]
pub struct InvalidNmtStateError(pub u8);

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    /// Attempt to convert a u8 to an NmtState enum
    ///
    /// The toggle bit used by the node guard protocol is ignored.
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value & 0x7F {
            x if x == Bootup as u8 => Ok(Bootup),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

/// NMT commands issued by the master on COB-ID 0x000
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    /// Transition the node to Operational
    StartNode = 0x01,
    /// Transition the node to Stopped
    StopNode = 0x02,
    /// Transition the node to PreOperational
    EnterPreOperational = 0x80,
    /// Full application reset
    ResetNode = 0x81,
    /// Reset the communication parameters only
    ResetCommunication = 0x82,
}

impl NmtCommand {
    /// Encode the two-byte NMT command frame payload
    ///
    /// `node` is the target node ID, or 0 to broadcast to all nodes.
    pub fn to_bytes(self, node: u8) -> [u8; 2] {
        [self as u8, node]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            NmtState::Bootup,
            NmtState::Stopped,
            NmtState::Operational,
            NmtState::PreOperational,
        ] {
            assert_eq!(state, NmtState::try_from(state as u8).unwrap());
        }
    }

    #[test]
    fn test_state_ignores_guard_toggle() {
        assert_eq!(NmtState::Operational, NmtState::try_from(0x85).unwrap());
    }

    #[test]
    fn test_invalid_state() {
        assert!(NmtState::try_from(0x11).is_err());
    }

    #[test]
    fn test_command_encoding() {
        assert_eq!([0x01, 0x0A], NmtCommand::StartNode.to_bytes(10));
        assert_eq!([0x81, 0x00], NmtCommand::ResetNode.to_bytes(0));
    }
}
