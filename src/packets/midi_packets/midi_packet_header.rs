use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    network_endian::{U16, U32},
};

/// RTP header of every MIDI frame: version 2, no padding/extension/CSRC,
/// marker bit set, payload type 97.
const RTP_MIDI_MARKER: [u8; 2] = [0x80, 0x61];

#[derive(Debug, KnownLayout, Unaligned, IntoBytes, Immutable, FromBytes)]
#[repr(C)]
pub struct MidiPacketHeader {
    marker: [u8; 2],
    pub sequence_number: U16,
    pub timestamp: U32,
    pub ssrc: U32,
}

impl MidiPacketHeader {
    pub fn new(sequence_number: U16, timestamp: U32, ssrc: U32) -> Self {
        MidiPacketHeader {
            marker: RTP_MIDI_MARKER,
            sequence_number,
            timestamp,
            ssrc,
        }
    }

    pub fn is_midi_packet(buffer: &[u8]) -> bool {
        buffer.starts_with(&RTP_MIDI_MARKER)
    }
}
