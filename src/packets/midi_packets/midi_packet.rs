use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    network_endian::{U16, U32},
};

use super::midi_command_list_header::MidiCommandListHeader;
use super::midi_packet_header::MidiPacketHeader;
use crate::packets::error::PacketError;

/// An RTP-MIDI frame: RTP header followed by the command list section.
/// Parsed in place; the command list is handed out as a raw byte slice for
/// the stream decoder.
#[derive(FromBytes, KnownLayout, Unaligned, Immutable, Debug)]
#[repr(C)]
pub struct MidiPacket {
    header: MidiPacketHeader,
    body: [u8],
}

impl MidiPacket {
    pub fn from_be_bytes(bytes: &[u8]) -> Result<&MidiPacket, PacketError> {
        if !MidiPacketHeader::is_midi_packet(bytes) {
            return Err(PacketError::InvalidData);
        }
        MidiPacket::ref_from_bytes(bytes).map_err(|_| PacketError::NotEnoughData)
    }

    pub fn new_as_bytes(sequence_number: U16, timestamp: U32, ssrc: U32, midi_list: &[u8], z_flag: bool) -> Bytes {
        let packet_header = MidiPacketHeader::new(sequence_number, timestamp, ssrc);
        let list_header = MidiCommandListHeader::new_long(z_flag, midi_list.len());

        let mut buffer = BytesMut::with_capacity(std::mem::size_of::<MidiPacketHeader>() + list_header.size() + midi_list.len());
        buffer.put_slice(packet_header.as_bytes());
        list_header.write(&mut buffer);
        buffer.put_slice(midi_list);
        buffer.freeze()
    }

    /// Returns the Z flag and the MIDI list, truncated to the length the
    /// header declares so decoding never runs past the datagram.
    pub fn midi_list(&self) -> Result<(bool, &[u8]), PacketError> {
        let header = MidiCommandListHeader::from_slice(&self.body)?;
        let list = &self.body[header.size()..];
        let length = header.length().min(list.len());
        Ok((header.flags().z_flag(), &list[..length]))
    }

    pub fn sequence_number(&self) -> U16 {
        self.header.sequence_number
    }

    pub fn timestamp(&self) -> U32 {
        self.header.timestamp
    }

    pub fn ssrc(&self) -> U32 {
        self.header.ssrc
    }
}
