use super::control_packets::control_packet::ControlPacket;
use super::midi_packets::midi_packet::MidiPacket;
use super::midi_packets::midi_packet_header::MidiPacketHeader;
use crate::packets::error::PacketError;

#[derive(Debug)]
pub enum RtpMidiPacket<'a> {
    Midi(&'a MidiPacket),
    Control(ControlPacket<'a>),
}

impl RtpMidiPacket<'_> {
    pub fn parse(bytes: &[u8]) -> Result<RtpMidiPacket<'_>, PacketError> {
        if ControlPacket::is_control_packet(bytes) {
            ControlPacket::from_be_bytes(bytes).map(RtpMidiPacket::Control)
        } else if MidiPacketHeader::is_midi_packet(bytes) {
            MidiPacket::from_be_bytes(bytes).map(RtpMidiPacket::Midi)
        } else {
            Err(PacketError::InvalidData)
        }
    }
}
