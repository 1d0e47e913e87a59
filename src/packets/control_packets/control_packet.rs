use bytes::{BufMut, Bytes, BytesMut};
use std::ffi::CStr;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, network_endian::U32};

use super::clock_sync_packet::ClockSyncPacket;
use super::receiver_feedback_packet::ReceiverFeedbackPacket;
use super::session_initiation_packet::SessionInitiationPacketBody;
use crate::packets::error::PacketError;

const CONTROL_PACKET_MARKER: [u8; 2] = [255, 255];

#[derive(Debug, KnownLayout, Unaligned, IntoBytes, Immutable, FromBytes)]
#[repr(C)]
pub struct ControlPacketHeader {
    marker: [u8; 2],
    pub command: [u8; 2],
}

impl ControlPacketHeader {
    pub fn new(command: [u8; 2]) -> ControlPacketHeader {
        ControlPacketHeader {
            marker: CONTROL_PACKET_MARKER,
            command,
        }
    }
}

#[derive(Debug)]
pub enum ControlPacket<'a> {
    ClockSync(&'a ClockSyncPacket),
    ReceiverFeedback(&'a ReceiverFeedbackPacket),
    Invitation {
        body: &'a SessionInitiationPacketBody,
        name: Option<&'a CStr>,
    },
    Acceptance {
        body: &'a SessionInitiationPacketBody,
        name: Option<&'a CStr>,
    },
    Rejection(&'a SessionInitiationPacketBody),
    Termination(&'a SessionInitiationPacketBody),
}

impl ControlPacket<'_> {
    pub fn from_be_bytes(buffer: &[u8]) -> Result<ControlPacket<'_>, PacketError> {
        let (header, remainder) = ControlPacketHeader::ref_from_prefix(buffer).map_err(|_| PacketError::NotEnoughData)?;

        match &header.command {
            b"CK" => {
                let clock_sync_packet = ClockSyncPacket::ref_from_bytes(remainder).map_err(|_| PacketError::InvalidData)?;
                Ok(ControlPacket::ClockSync(clock_sync_packet))
            }
            b"RS" => {
                // Lenient on trailing bytes: some senders pad the feedback frame.
                let (feedback, _) = ReceiverFeedbackPacket::ref_from_prefix(remainder).map_err(|_| PacketError::InvalidData)?;
                Ok(ControlPacket::ReceiverFeedback(feedback))
            }
            b"IN" | b"OK" => {
                let (body, payload) = SessionInitiationPacketBody::ref_from_prefix(remainder).map_err(|_| PacketError::InvalidData)?;
                let name = Self::parse_name(payload)?;
                if header.command == *b"OK" {
                    Ok(ControlPacket::Acceptance { body, name })
                } else {
                    Ok(ControlPacket::Invitation { body, name })
                }
            }
            b"NO" | b"BY" => {
                let (body, _) = SessionInitiationPacketBody::ref_from_prefix(remainder).map_err(|_| PacketError::InvalidData)?;
                if header.command == *b"NO" {
                    Ok(ControlPacket::Rejection(body))
                } else {
                    Ok(ControlPacket::Termination(body))
                }
            }
            _ => Err(PacketError::UnknownCommand(header.command)),
        }
    }

    // The name is optional: this engine's own acceptances go out without one.
    fn parse_name(payload: &[u8]) -> Result<Option<&CStr>, PacketError> {
        if payload.is_empty() {
            Ok(None)
        } else {
            CStr::from_bytes_with_nul(payload).map(Some).map_err(|_| PacketError::InvalidData)
        }
    }

    pub fn is_control_packet(buffer: &[u8]) -> bool {
        buffer.starts_with(&CONTROL_PACKET_MARKER)
    }

    fn new_session_command(initiator_token: U32, sender_ssrc: U32, command: [u8; 2], name: Option<&CStr>) -> Bytes {
        let header = ControlPacketHeader::new(command);
        let packet = SessionInitiationPacketBody::new(initiator_token, sender_ssrc);
        let name_length = name.map_or(0, |n| n.count_bytes() + 1); // +1 for null terminator
        let mut buffer = BytesMut::with_capacity(std::mem::size_of::<ControlPacketHeader>() + std::mem::size_of::<SessionInitiationPacketBody>() + name_length);
        buffer.put_slice(header.as_bytes());
        buffer.put_slice(packet.as_bytes());
        if let Some(name) = name {
            buffer.put_slice(name.to_bytes_with_nul());
        }
        buffer.freeze()
    }

    pub fn new_invitation(initiator_token: U32, sender_ssrc: U32, name: Option<&CStr>) -> Bytes {
        ControlPacket::new_session_command(initiator_token, sender_ssrc, *b"IN", name)
    }

    pub fn new_acceptance(initiator_token: U32, sender_ssrc: U32, name: Option<&CStr>) -> Bytes {
        ControlPacket::new_session_command(initiator_token, sender_ssrc, *b"OK", name)
    }

    pub fn new_rejection(initiator_token: U32, sender_ssrc: U32) -> Bytes {
        ControlPacket::new_session_command(initiator_token, sender_ssrc, *b"NO", None)
    }

    pub fn new_termination(initiator_token: U32, sender_ssrc: U32) -> Bytes {
        ControlPacket::new_session_command(initiator_token, sender_ssrc, *b"BY", None)
    }
}
