/// The fixed-layout message exchanged with the guest for every ping.
///
/// On input `metadata` carries the command; on output it carries the result.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingInfo {
    pub phys_addr: u64,
    pub size: u64,
    pub metadata: u64,
}

const _: () = {
    assert!(core::mem::size_of::<PingInfo>() == 24);
    assert!(core::mem::offset_of!(PingInfo, size) == 8);
    assert!(core::mem::offset_of!(PingInfo, metadata) == 16);
};

impl PingInfo {
    pub fn command(metadata: u64) -> Self {
        Self {
            metadata,
            ..Self::default()
        }
    }
}

/// Graphics context ping commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsgCommand {
    /// Report the ring allocation (`metadata` = physical offset, `size` = length).
    GetRing,
    /// Report the buffer allocation.
    GetBuffer,
    /// Negotiate the protocol version (`size` = guest version on input, agreed version on
    /// output) and start the consumer.
    SetVersion,
    /// The guest wrote to the ring; wake the consumer.
    NotifyAvailable,
    /// Restore the ring config the guest saw at context creation.
    GetConfig,
}

impl AsgCommand {
    pub const fn as_raw(self) -> u64 {
        match self {
            AsgCommand::GetRing => 0,
            AsgCommand::GetBuffer => 1,
            AsgCommand::SetVersion => 2,
            AsgCommand::NotifyAvailable => 3,
            AsgCommand::GetConfig => 4,
        }
    }

    pub const fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(AsgCommand::GetRing),
            1 => Some(AsgCommand::GetBuffer),
            2 => Some(AsgCommand::SetVersion),
            3 => Some(AsgCommand::NotifyAvailable),
            4 => Some(AsgCommand::GetConfig),
            _ => None,
        }
    }
}
