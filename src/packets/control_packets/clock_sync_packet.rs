use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    network_endian::{U32, U64},
};

use super::control_packet::ControlPacketHeader;

/// CK clock synchronization packet. Count runs 0, 1, 2 over a sync
/// round-trip. Only the low 32 bits of each timestamp are meaningful to this
/// engine; the high words go out as zero.
#[derive(Debug, KnownLayout, Unaligned, IntoBytes, Immutable, FromBytes)]
#[repr(C)]
pub struct ClockSyncPacket {
    pub sender_ssrc: U32,
    pub count: u8,
    reserved: [u8; 3],
    pub timestamps: [U64; 3],
}

impl ClockSyncPacket {
    pub const SIZE: usize = 36;

    pub fn new_as_bytes(count: u8, timestamps: [U64; 3], sender_ssrc: U32) -> Bytes {
        let header = ControlPacketHeader::new(*b"CK");
        let packet = ClockSyncPacket {
            sender_ssrc,
            count,
            reserved: [0; 3],
            timestamps,
        };
        let mut buffer = BytesMut::with_capacity(Self::SIZE);
        buffer.put_slice(header.as_bytes());
        buffer.put_slice(packet.as_bytes());
        buffer.freeze()
    }
}
