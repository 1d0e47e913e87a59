use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    network_endian::{U16, U32},
};

use super::control_packet::ControlPacketHeader;

/// RS receiver feedback packet, acknowledging the highest RTP sequence
/// number received so far. Sent on the control port.
#[derive(Debug, KnownLayout, Unaligned, IntoBytes, Immutable, FromBytes)]
#[repr(C)]
pub struct ReceiverFeedbackPacket {
    pub sender_ssrc: U32,
    pub sequence_number: U16,
    reserved: U16,
}

impl ReceiverFeedbackPacket {
    pub const SIZE: usize = 12;

    pub fn new_as_bytes(sequence_number: U16, sender_ssrc: U32) -> Bytes {
        let header = ControlPacketHeader::new(*b"RS");
        let packet = ReceiverFeedbackPacket {
            sender_ssrc,
            sequence_number,
            reserved: U16::new(0),
        };
        let mut buffer = BytesMut::with_capacity(Self::SIZE);
        buffer.put_slice(header.as_bytes());
        buffer.put_slice(packet.as_bytes());
        buffer.freeze()
    }
}
