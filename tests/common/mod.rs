#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, Mutex};

use rtpmidi_engine::packets::control_packets::clock_sync_packet::ClockSyncPacket;
use rtpmidi_engine::packets::control_packets::control_packet::ControlPacket;
use rtpmidi_engine::packets::midi_packets::midi_packet_header::MidiPacketHeader;
use rtpmidi_engine::session::engine::RtpMidiEngine;
use rtpmidi_engine::session::state::SessionStatus;
use rtpmidi_engine::transport::Transport;
use zerocopy::network_endian::{U32, U64};

pub fn find_consecutive_ports() -> (u16, u16) {
    loop {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).unwrap();
        let port = socket.local_addr().unwrap().port();
        let next_port = port + 1;
        if let Ok(socket2) = UdpSocket::bind(("0.0.0.0", next_port)) {
            drop(socket);
            drop(socket2);
            return (port, next_port);
        }
    }
}

#[derive(Default)]
struct Queues {
    inbox: VecDeque<(Vec<u8>, SocketAddrV4)>,
    outbox: VecDeque<(Vec<u8>, SocketAddrV4)>,
}

/// In-memory transport for deterministic state-machine tests: the test
/// injects datagrams through the [`PortHook`] and collects everything the
/// engine sends.
pub struct ChannelTransport {
    port: u16,
    queues: Arc<Mutex<Queues>>,
}

#[derive(Clone)]
pub struct PortHook {
    queues: Arc<Mutex<Queues>>,
}

impl ChannelTransport {
    pub fn new(port: u16) -> (Self, PortHook) {
        let queues = Arc::new(Mutex::new(Queues::default()));
        let hook = PortHook {
            queues: Arc::clone(&queues),
        };
        (ChannelTransport { port, queues }, hook)
    }
}

impl Transport for ChannelTransport {
    fn send_to(&self, payload: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        self.queues.lock().unwrap().outbox.push_back((payload.to_vec(), dest));
        Ok(payload.len())
    }

    fn poll_recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>> {
        match self.queues.lock().unwrap().inbox.pop_front() {
            Some((datagram, src)) => {
                let amount = datagram.len().min(buf.len());
                buf[..amount].copy_from_slice(&datagram[..amount]);
                Ok(Some((amount, src)))
            }
            None => Ok(None),
        }
    }

    fn local_port(&self) -> io::Result<u16> {
        Ok(self.port)
    }
}

impl PortHook {
    pub fn inject(&self, datagram: &[u8], from: SocketAddrV4) {
        self.queues.lock().unwrap().inbox.push_back((datagram.to_vec(), from));
    }

    pub fn take_sent(&self) -> Vec<(Vec<u8>, SocketAddrV4)> {
        self.queues.lock().unwrap().outbox.drain(..).collect()
    }
}

pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
pub const PEER_CTRL_PORT: u16 = 5004;
pub const PEER_DATA_PORT: u16 = 5005;
pub const PEER_SSRC: u32 = 0x22222222;
pub const LOCAL_CTRL_PORT: u16 = 6004;
pub const LOCAL_DATA_PORT: u16 = 6005;

pub fn peer_ctrl_addr() -> SocketAddrV4 {
    SocketAddrV4::new(PEER_IP, PEER_CTRL_PORT)
}

pub fn peer_data_addr() -> SocketAddrV4 {
    SocketAddrV4::new(PEER_IP, PEER_DATA_PORT)
}

/// One engine over channel transports, with hooks for both ports and a
/// record of every host callback `(bytes, event_time)`.
pub struct Harness {
    pub engine: RtpMidiEngine<ChannelTransport>,
    pub ctrl: PortHook,
    pub data: PortHook,
    pub received: Arc<Mutex<Vec<(Vec<u8>, u32)>>>,
    pub ticks: u64,
}

impl Harness {
    pub fn initiator() -> Self {
        Harness::new(PEER_IP, true)
    }

    /// A listener accepting invitations from any source.
    pub fn listener() -> Self {
        Harness::new(Ipv4Addr::UNSPECIFIED, false)
    }

    fn new(remote_ip: Ipv4Addr, is_initiator: bool) -> Self {
        let (ctrl_transport, ctrl) = ChannelTransport::new(LOCAL_CTRL_PORT);
        let (data_transport, data) = ChannelTransport::new(LOCAL_DATA_PORT);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let mut engine = RtpMidiEngine::new(4096, move |bytes: &[u8], event_time| {
            sink.lock().unwrap().push((bytes.to_vec(), event_time));
        });
        engine.set_session_name("Unit Session");
        engine.initiate_session_with(ctrl_transport, data_transport, remote_ip, PEER_CTRL_PORT, PEER_DATA_PORT, is_initiator);
        Harness {
            engine,
            ctrl,
            data,
            received,
            ticks: 0,
        }
    }

    pub fn tick(&mut self, count: u64) {
        for _ in 0..count {
            self.engine.run_session();
            self.ticks += 1;
        }
    }

    /// Ticks until the control hook emits a frame matching `predicate`,
    /// returning it. Panics after `max_ticks`.
    pub fn tick_until_ctrl(&mut self, max_ticks: u64, predicate: impl Fn(&[u8]) -> bool) -> (Vec<u8>, SocketAddrV4) {
        self.tick_until(max_ticks, true, predicate)
    }

    pub fn tick_until_data(&mut self, max_ticks: u64, predicate: impl Fn(&[u8]) -> bool) -> (Vec<u8>, SocketAddrV4) {
        self.tick_until(max_ticks, false, predicate)
    }

    fn tick_until(&mut self, max_ticks: u64, on_control: bool, predicate: impl Fn(&[u8]) -> bool) -> (Vec<u8>, SocketAddrV4) {
        for _ in 0..max_ticks {
            self.tick(1);
            let hook = if on_control { &self.ctrl } else { &self.data };
            for (frame, dest) in hook.take_sent() {
                if predicate(&frame) {
                    return (frame, dest);
                }
            }
        }
        panic!("no matching frame sent within {max_ticks} ticks");
    }

    pub fn received_messages(&self) -> Vec<(Vec<u8>, u32)> {
        self.received.lock().unwrap().clone()
    }
}

pub fn is_invitation(frame: &[u8]) -> bool {
    frame.len() >= 4 && frame[..2] == [0xFF, 0xFF] && &frame[2..4] == b"IN"
}

pub fn is_acceptance(frame: &[u8]) -> bool {
    frame.len() >= 4 && frame[..2] == [0xFF, 0xFF] && &frame[2..4] == b"OK"
}

pub fn is_rejection(frame: &[u8]) -> bool {
    frame.len() >= 4 && frame[..2] == [0xFF, 0xFF] && &frame[2..4] == b"NO"
}

pub fn is_termination(frame: &[u8]) -> bool {
    frame.len() >= 4 && frame[..2] == [0xFF, 0xFF] && &frame[2..4] == b"BY"
}

pub fn is_clock_sync(frame: &[u8]) -> bool {
    frame.len() >= 4 && frame[..2] == [0xFF, 0xFF] && &frame[2..4] == b"CK"
}

pub fn is_clock_sync_count(frame: &[u8], count: u8) -> bool {
    is_clock_sync(frame) && frame.get(8) == Some(&count)
}

pub fn is_receiver_feedback(frame: &[u8]) -> bool {
    frame.len() >= 4 && frame[..2] == [0xFF, 0xFF] && &frame[2..4] == b"RS"
}

pub fn is_midi_frame(frame: &[u8]) -> bool {
    MidiPacketHeader::is_midi_packet(frame)
}

/// Initiator token carried by a session command frame.
pub fn frame_token(frame: &[u8]) -> u32 {
    u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]])
}

pub fn clock_sync_timestamp(frame: &[u8], index: usize) -> u64 {
    let start = 12 + index * 8;
    u64::from_be_bytes(frame[start..start + 8].try_into().unwrap())
}

/// MIDI list of an outbound frame (always behind the 2-byte long header).
pub fn midi_frame_list(frame: &[u8]) -> &[u8] {
    assert!(is_midi_frame(frame));
    let length = (((frame[12] & 0x0F) as usize) << 8) | frame[13] as usize;
    &frame[14..14 + length]
}

pub fn midi_frame_sequence(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[2], frame[3]])
}

pub fn peer_acceptance(token: u32) -> Vec<u8> {
    ControlPacket::new_acceptance(U32::new(token), U32::new(PEER_SSRC), None).to_vec()
}

pub fn peer_invitation(token: u32) -> Vec<u8> {
    let name = std::ffi::CStr::from_bytes_with_nul(b"Peer Session\0").unwrap();
    ControlPacket::new_invitation(U32::new(token), U32::new(PEER_SSRC), Some(name)).to_vec()
}

pub fn peer_termination(token: u32) -> Vec<u8> {
    ControlPacket::new_termination(U32::new(token), U32::new(PEER_SSRC)).to_vec()
}

pub fn peer_clock_sync(count: u8, timestamps: [u64; 3]) -> Vec<u8> {
    ClockSyncPacket::new_as_bytes(
        count,
        [U64::new(timestamps[0]), U64::new(timestamps[1]), U64::new(timestamps[2])],
        U32::new(PEER_SSRC),
    )
    .to_vec()
}

/// Drives an initiator harness through the full handshake with a scripted
/// peer. Returns the TS1 value the engine put into its CK0.
pub fn open_initiator(h: &mut Harness) -> u64 {
    let (invitation, dest) = h.tick_until_ctrl(1100, is_invitation);
    assert_eq!(dest, peer_ctrl_addr());
    let token = frame_token(&invitation);

    h.ctrl.inject(&peer_acceptance(token), peer_ctrl_addr());
    let (_, dest) = h.tick_until_data(1100, is_invitation);
    assert_eq!(dest, peer_data_addr());

    h.data.inject(&peer_acceptance(token), peer_data_addr());
    let (ck0, _) = h.tick_until_data(10, |frame| is_clock_sync_count(frame, 0));
    let ts1 = clock_sync_timestamp(&ck0, 0);

    h.data.inject(&peer_clock_sync(1, [ts1, 777, 0]), peer_data_addr());
    h.tick_until_data(10, |frame| is_clock_sync_count(frame, 2));
    ts1
}

pub const LISTENER_PEER_TOKEN: u32 = 0xCAFE;

pub fn listener_peer_ctrl_addr() -> SocketAddrV4 {
    SocketAddrV4::new(PEER_IP, 40000)
}

pub fn listener_peer_data_addr() -> SocketAddrV4 {
    SocketAddrV4::new(PEER_IP, 40001)
}

/// Drives a listener harness through a peer-initiated handshake.
pub fn open_listener(h: &mut Harness) {
    h.ctrl.inject(&peer_invitation(LISTENER_PEER_TOKEN), listener_peer_ctrl_addr());
    h.tick_until_ctrl(10, is_acceptance);

    h.data.inject(&peer_invitation(LISTENER_PEER_TOKEN), listener_peer_data_addr());
    h.tick_until_data(10, is_acceptance);

    h.data.inject(&peer_clock_sync(0, [555, 0, 0]), listener_peer_data_addr());
    let (ck1, _) = h.tick_until_data(10, |frame| is_clock_sync_count(frame, 1));
    let ts2 = clock_sync_timestamp(&ck1, 1);

    h.data.inject(&peer_clock_sync(2, [555, ts2, 999]), listener_peer_data_addr());
    h.tick(1);
    assert_eq!(h.engine.session_status(), SessionStatus::Opened);
}
