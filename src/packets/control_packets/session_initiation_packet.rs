use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, network_endian::U32};

pub const PROTOCOL_VERSION: u32 = 2;

/// Fixed-size body shared by the IN/OK/NO/BY session commands. An optional
/// NUL-terminated session name follows on the wire.
#[derive(Debug, KnownLayout, Unaligned, IntoBytes, Immutable, FromBytes)]
#[repr(C)]
pub struct SessionInitiationPacketBody {
    pub protocol_version: U32,
    pub initiator_token: U32,
    pub sender_ssrc: U32,
}

impl SessionInitiationPacketBody {
    pub fn new(initiator_token: U32, sender_ssrc: U32) -> Self {
        SessionInitiationPacketBody {
            protocol_version: U32::new(PROTOCOL_VERSION),
            initiator_token,
            sender_ssrc,
        }
    }
}
