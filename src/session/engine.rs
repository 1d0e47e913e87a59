use bytes::BytesMut;
use std::ffi::CString;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{Level, event, instrument};
use zerocopy::network_endian::{U16, U32, U64};

use crate::packets::control_packets::clock_sync_packet::ClockSyncPacket;
use crate::packets::control_packets::control_packet::ControlPacket;
use crate::packets::control_packets::receiver_feedback_packet::ReceiverFeedbackPacket;
use crate::packets::midi_packets::midi_packet::MidiPacket;
use crate::packets::packet::RtpMidiPacket;
use crate::transport::{Transport, UdpTransport};

use super::MAX_UDP_PACKET_SIZE;
use super::clock::{OneShotTimer, TickClock};
use super::decoder::RtpMidiDecoder;
use super::fifo::{MIDI_STREAM_CAPACITY, MidiSender, MidiStreamFifo, SysexOutSlot};
use super::outbound::{MAX_RTP_LOAD, PayloadBuilder};
use super::state::{SessionState, SessionStatus};

pub const MAX_SESSION_NAME_LEN: usize = 63;
pub const DEFAULT_CONTROL_PORT: u16 = 5004;
pub const DEFAULT_DATA_PORT: u16 = 5005;

const INVITE_RETRY_MS: u32 = 1000;
const INVITE_DATA_ARM_MS: u32 = 100;
const MAX_INVITE_ATTEMPTS: u32 = 12;
const EARLY_SYNC_INTERVAL_MS: u32 = 1500;
const STEADY_SYNC_INTERVAL_MS: u32 = 10_000;
const EARLY_SYNC_ROUNDS: u32 = 5;
/// Keepalive grace: 16 timer firings span roughly two minutes across the
/// 1.5 s / 10 s sync cadence.
const REMOTE_TIMEOUT_RELOAD: u32 = 16;
const REMOTE_TIMEOUT_SYNCED: u32 = 4;
const MAX_OUTBOUND_SYSEX: usize = 16 * 1024;
const CLOSE_FLUSH: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum InitiateError {
    #[error("failed to bind control socket: {0}")]
    ControlBind(#[source] std::io::Error),
    #[error("failed to bind data socket: {0}")]
    DataBind(#[source] std::io::Error),
}

/// Everything received during one tick, decoded into protocol events. The
/// state machine consumes these after both sockets have been polled.
#[derive(Default)]
struct TickInput {
    invitation_on_ctrl: Option<(SocketAddrV4, u32)>,
    invitation_on_data: Option<(SocketAddrV4, u32)>,
    accepted_on_ctrl: bool,
    accepted_on_data: bool,
    bye: bool,
    clock_sync: Option<(u8, [u64; 3])>,
}

/// A single-partner RTP-MIDI session endpoint driven by a 1 ms tick.
///
/// The engine owns two transports bound to adjacent ports (control and
/// data), performs the Apple session handshake and clock synchronization,
/// frames queued MIDI bytes into RTP payloads, and feeds received messages
/// to the host callback. All work happens inside [`run_session`]; the only
/// object another thread may touch is the [`MidiSender`] handle.
///
/// [`run_session`]: RtpMidiEngine::run_session
pub struct RtpMidiEngine<T: Transport = UdpTransport> {
    session_name: CString,
    remote_ip: Ipv4Addr,
    remote_control_port: u16,
    remote_data_port: u16,
    session_partner: Option<Ipv4Addr>,
    control: Option<T>,
    data: Option<T>,
    ssrc: u32,
    token: u32,
    remote_token: u32,
    rtp_sequence: u16,
    last_rtp_sequence: u16,
    last_feedback_sequence: u16,
    state: SessionState,
    is_initiator: bool,
    invite_count: u32,
    sync_sequence_count: u32,
    timeout_remote: u32,
    // TS1/TS2 carried from the received CK1 to the CK2 sent next tick
    pending_sync: Option<(u64, u64)>,
    clock: TickClock,
    timer: OneShotTimer,
    stream_fifo: Arc<MidiStreamFifo>,
    sysex_out: Arc<SysexOutSlot>,
    payload: PayloadBuilder,
    decoder: RtpMidiDecoder,
    measured_latency: Option<u32>,
    connection_lost: bool,
    peer_closed: bool,
}

impl<T: Transport> RtpMidiEngine<T> {
    /// Creates an idle engine. `sysex_in_size` bounds the reassembly buffer
    /// for incoming SysEx; `callback` receives `(bytes, event_time)` once
    /// per complete MIDI message and must return promptly.
    pub fn new<F>(sysex_in_size: usize, callback: F) -> Self
    where
        F: FnMut(&[u8], u32) + Send + 'static,
    {
        RtpMidiEngine {
            session_name: CString::default(),
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_control_port: DEFAULT_CONTROL_PORT,
            remote_data_port: DEFAULT_DATA_PORT,
            session_partner: None,
            control: None,
            data: None,
            ssrc: 0,
            token: 0,
            remote_token: 0,
            rtp_sequence: 0,
            last_rtp_sequence: 0,
            last_feedback_sequence: 0,
            state: SessionState::Closed,
            is_initiator: true,
            invite_count: 0,
            sync_sequence_count: 0,
            timeout_remote: REMOTE_TIMEOUT_SYNCED,
            pending_sync: None,
            clock: TickClock::new(),
            timer: OneShotTimer::new(),
            stream_fifo: Arc::new(MidiStreamFifo::with_capacity(MIDI_STREAM_CAPACITY)),
            sysex_out: Arc::new(SysexOutSlot::with_capacity(MAX_OUTBOUND_SYSEX)),
            payload: PayloadBuilder::new(),
            decoder: RtpMidiDecoder::new(sysex_in_size, Box::new(callback)),
            measured_latency: None,
            connection_lost: false,
            peer_closed: false,
        }
    }

    /// Records the session name sent in invitations. Must be ≤ 63 bytes;
    /// longer names leave the current one unchanged.
    pub fn set_session_name(&mut self, name: &str) {
        if name.len() > MAX_SESSION_NAME_LEN {
            event!(Level::WARN, name, "session name too long, keeping the previous one");
            return;
        }
        if let Ok(name) = CString::new(name) {
            self.session_name = name;
        }
    }

    /// Producer handle for queuing outbound MIDI. May be cloned and used
    /// from one other thread concurrently with the tick.
    pub fn sender(&self) -> MidiSender {
        MidiSender {
            stream: Arc::clone(&self.stream_fifo),
            sysex: Arc::clone(&self.sysex_out),
        }
    }

    /// Starts a session over pre-built transports. `dst_ip` may be
    /// `0.0.0.0` for a listener accepting any remote.
    pub fn initiate_session_with(&mut self, control: T, data: T, dst_ip: Ipv4Addr, dst_ctrl: u16, dst_data: u16, is_initiator: bool) {
        self.control = Some(control);
        self.data = Some(data);
        self.remote_ip = dst_ip;
        self.remote_control_port = dst_ctrl;
        self.remote_data_port = dst_data;

        self.ssrc = rand::random::<u32>();
        self.token = rand::random::<u32>();
        self.remote_token = 0;
        self.rtp_sequence = 0;
        self.last_rtp_sequence = 0;
        self.last_feedback_sequence = 0;
        self.invite_count = 0;
        self.sync_sequence_count = 0;
        self.timeout_remote = REMOTE_TIMEOUT_RELOAD;
        self.is_initiator = is_initiator;
        self.pending_sync = None;
        self.measured_latency = None;
        self.connection_lost = false;
        self.peer_closed = false;
        self.decoder.reset();
        self.payload.reset();

        if is_initiator {
            self.state = SessionState::InviteControl;
            self.session_partner = Some(dst_ip);
        } else {
            // Wait for the remote node to start the session
            self.state = SessionState::WaitInvite;
            self.session_partner = None;
        }
        self.timer.arm(INVITE_RETRY_MS);

        event!(
            Level::INFO,
            ssrc = self.ssrc,
            %dst_ip,
            dst_ctrl,
            dst_data,
            is_initiator,
            "session initiated"
        );
    }

    /// The engine tick. Call every millisecond from exactly one thread;
    /// never blocks.
    pub fn run_session(&mut self) {
        self.clock.advance();

        // Not ready until sockets exist
        if self.control.is_none() || self.data.is_none() {
            return;
        }

        self.timer.tick();

        let mut input = TickInput::default();
        self.poll_control(&mut input);
        self.poll_data(&mut input);

        // Non-state-related answers first
        self.handle_clock_sync(&input);
        if let Some((src, token)) = input.invitation_on_ctrl {
            self.handle_invitation(true, src, token);
        }
        if let Some((src, token)) = input.invitation_on_data {
            self.handle_invitation(false, src, token);
        }
        if input.bye {
            self.handle_termination();
        }

        match self.state {
            SessionState::Closed => {}
            SessionState::Opened => self.run_opened(),
            SessionState::InviteControl => self.run_invite_control(&input),
            SessionState::InviteData => self.run_invite_data(&input),
            SessionState::WaitInvite => {}
            SessionState::ClockSync0 => {
                let now = self.clock.now() as u64;
                self.send_clock_sync(0, [U64::new(now), U64::new(0), U64::new(0)]);
                self.state = SessionState::ClockSync1;
            }
            SessionState::ClockSync1 => {
                if let Some((1, timestamps)) = input.clock_sync {
                    self.pending_sync = Some((timestamps[0], timestamps[1]));
                    self.state = SessionState::ClockSync2;
                }
            }
            SessionState::ClockSync2 => {
                if let Some((ts1, ts2)) = self.pending_sync.take() {
                    let now = self.clock.now() as u64;
                    self.send_clock_sync(2, [U64::new(ts1), U64::new(ts2), U64::new(now)]);
                }
                self.open_session();
                event!(Level::INFO, latency = ?self.measured_latency, "session opened");
            }
        }
    }

    /// Sends BY to the partner and tears the session down. Idempotent: on
    /// an engine that is not opened this only releases the sockets.
    pub fn close_session(&mut self) {
        if self.state == SessionState::Opened {
            self.send_termination();
            // Give the datagram time to leave before the sockets drop
            std::thread::sleep(CLOSE_FLUSH);
            event!(Level::INFO, "session closed");
        }
        self.state = SessionState::Closed;
        self.timer.cancel();
        self.session_partner = None;
        self.control = None;
        self.data = None;
    }

    /// Re-enters the invitation sequence. Initiator only; listeners ignore
    /// the call.
    pub fn restart_session(&mut self) {
        if !self.is_initiator || self.control.is_none() {
            return;
        }
        self.restart_invitations();
    }

    pub fn session_status(&self) -> SessionStatus {
        self.state.into()
    }

    /// One-way latency in 100-µs units measured by the last clock-sync
    /// round-trip, or `None` while the session is not opened. The low-word
    /// arithmetic wraps with the 32-bit session clock.
    pub fn latency(&self) -> Option<u32> {
        if self.state == SessionState::Opened { self.measured_latency } else { None }
    }

    /// Edge-triggered: true once after the keepalive grace ran out.
    pub fn take_connection_lost(&mut self) -> bool {
        std::mem::take(&mut self.connection_lost)
    }

    /// Edge-triggered: true once after the peer sent BY.
    pub fn take_peer_closed(&mut self) -> bool {
        std::mem::take(&mut self.peer_closed)
    }

    fn accepts_source(&self, source: Ipv4Addr) -> bool {
        self.remote_ip.is_unspecified() || source == self.remote_ip
    }

    fn poll_control(&mut self, input: &mut TickInput) {
        let mut buf = [0u8; MAX_UDP_PACKET_SIZE];
        let received = match &self.control {
            Some(control) => control.poll_recv(&mut buf),
            None => return,
        };
        let Ok(Some((amount, src))) = received else {
            return;
        };
        if !self.accepts_source(*src.ip()) {
            event!(Level::TRACE, %src, "dropping control datagram from unexpected source");
            return;
        }

        match ControlPacket::from_be_bytes(&buf[..amount]) {
            Ok(ControlPacket::Invitation { body, .. }) => {
                input.invitation_on_ctrl = Some((src, body.initiator_token.get()));
            }
            Ok(ControlPacket::Acceptance { .. }) => {
                input.accepted_on_ctrl = true;
            }
            Ok(ControlPacket::Rejection(_)) => {
                event!(Level::DEBUG, %src, "invitation rejected by remote");
            }
            Ok(ControlPacket::Termination(_)) => {
                input.bye = true;
            }
            Ok(ControlPacket::ReceiverFeedback(feedback)) => {
                // No journal: the ack needs no action
                event!(Level::TRACE, sequence = feedback.sequence_number.get(), "receiver feedback");
            }
            Ok(ControlPacket::ClockSync(_)) => {
                event!(Level::TRACE, "ignoring clock sync on the control port");
            }
            Err(e) => {
                event!(Level::TRACE, %src, "dropping control datagram: {}", e);
            }
        }
    }

    fn poll_data(&mut self, input: &mut TickInput) {
        let mut buf = [0u8; MAX_UDP_PACKET_SIZE];
        let received = match &self.data {
            Some(data) => data.poll_recv(&mut buf),
            None => return,
        };
        let Ok(Some((amount, src))) = received else {
            return;
        };
        if !self.accepts_source(*src.ip()) {
            event!(Level::TRACE, %src, "dropping data datagram from unexpected source");
            return;
        }

        match RtpMidiPacket::parse(&buf[..amount]) {
            Ok(RtpMidiPacket::Midi(packet)) => {
                if self.state == SessionState::Opened {
                    self.process_midi_packet(packet);
                }
            }
            Ok(RtpMidiPacket::Control(packet)) => match packet {
                ControlPacket::Invitation { body, .. } => {
                    input.invitation_on_data = Some((src, body.initiator_token.get()));
                }
                ControlPacket::Acceptance { .. } => {
                    input.accepted_on_data = true;
                }
                ControlPacket::Termination(_) => {
                    input.bye = true;
                }
                ControlPacket::ClockSync(clock_sync) => {
                    let timestamps = [
                        clock_sync.timestamps[0].get(),
                        clock_sync.timestamps[1].get(),
                        clock_sync.timestamps[2].get(),
                    ];
                    input.clock_sync = Some((clock_sync.count, timestamps));
                }
                ControlPacket::Rejection(_) => {
                    event!(Level::DEBUG, %src, "invitation rejected by remote");
                }
                ControlPacket::ReceiverFeedback(_) => {
                    event!(Level::TRACE, "ignoring receiver feedback on the data port");
                }
            },
            Err(e) => {
                event!(Level::TRACE, %src, "dropping data datagram: {}", e);
            }
        }
    }

    fn process_midi_packet(&mut self, packet: &MidiPacket) {
        self.last_rtp_sequence = packet.sequence_number().get();
        let now = self.clock.now();
        if let Ok((z_flag, list)) = packet.midi_list() {
            self.decoder.process_list(list, z_flag, now);
        }
    }

    #[instrument(skip_all, fields(count))]
    fn handle_clock_sync(&mut self, input: &TickInput) {
        let Some((count, timestamps)) = input.clock_sync else {
            return;
        };
        tracing::Span::current().record("count", count);

        match count {
            0 => {
                // Reply CK1: echo TS1, local clock in TS2
                let now = self.clock.now() as u64;
                self.send_clock_sync(1, [U64::new(timestamps[0]), U64::new(now), U64::new(0)]);
            }
            1 => {
                if self.is_initiator {
                    self.measured_latency = Some(self.clock.now().wrapping_sub(timestamps[0] as u32));
                }
                if self.state == SessionState::Opened {
                    let now = self.clock.now() as u64;
                    self.send_clock_sync(2, [U64::new(timestamps[0]), U64::new(timestamps[1]), U64::new(now)]);
                    self.timeout_remote = REMOTE_TIMEOUT_SYNCED;
                }
                // During the handshake CK1 is consumed by the ClockSync1 state
            }
            2 => {
                self.timeout_remote = REMOTE_TIMEOUT_SYNCED;
                if !self.is_initiator {
                    self.measured_latency = Some(self.clock.now().wrapping_sub(timestamps[1] as u32));
                }
                if self.state != SessionState::Opened {
                    self.open_session();
                    event!(Level::INFO, latency = ?self.measured_latency, "session opened");
                }
            }
            _ => {
                event!(Level::WARN, "unexpected clock sync count");
            }
        }
    }

    fn open_session(&mut self) {
        self.state = SessionState::Opened;
        if self.timer.is_idle() {
            self.timer.arm(EARLY_SYNC_INTERVAL_MS);
        }
    }

    #[instrument(skip_all, fields(%src, on_control))]
    fn handle_invitation(&mut self, on_control: bool, src: SocketAddrV4, token: u32) {
        // Single partner per session: anyone else gets a NO while opened
        let busy = self.state == SessionState::Opened && self.session_partner.is_some_and(|partner| partner != *src.ip());
        if busy {
            event!(Level::INFO, "rejecting invitation, already in a session");
            let frame = ControlPacket::new_rejection(U32::new(token), U32::new(self.ssrc));
            self.send_frame(on_control, &frame, src);
            return;
        }

        // The answer goes back to the actual sender, not the configured
        // remote; remember where it came from
        self.remote_token = token;
        if on_control {
            self.remote_control_port = src.port();
        } else {
            self.remote_data_port = src.port();
        }

        event!(Level::INFO, "accepting invitation");
        let frame = ControlPacket::new_acceptance(U32::new(token), U32::new(self.ssrc), None);
        self.send_frame(on_control, &frame, src);

        if !on_control && !self.is_initiator {
            self.session_partner = Some(*src.ip());
        }
    }

    fn handle_termination(&mut self) {
        event!(Level::INFO, "peer closed the session");
        self.timer.cancel();
        self.peer_closed = true;
        self.session_partner = None;
        if self.is_initiator {
            self.state = SessionState::Closed;
        } else {
            self.state = SessionState::WaitInvite;
        }
    }

    fn run_opened(&mut self) {
        self.payload.tick();

        // Transmit pending MIDI unless the inter-fragment cooldown holds
        if self.payload.ready() && let Some(partner) = self.session_partner {
            let mut list = BytesMut::with_capacity(MAX_RTP_LOAD);
            self.payload.fill(&self.sysex_out, &self.stream_fifo, &mut list);
            if !list.is_empty() {
                let frame = MidiPacket::new_as_bytes(
                    U16::new(self.rtp_sequence),
                    U32::new(self.clock.now()),
                    U32::new(self.ssrc),
                    &list,
                    true,
                );
                self.rtp_sequence = self.rtp_sequence.wrapping_add(1);
                let dest = SocketAddrV4::new(partner, self.remote_data_port);
                if let Some(data) = &self.data {
                    let _ = data.send_to(&frame, dest);
                }
            }
        }

        if self.timer.fired() {
            // Ack received data; an unsolicited RS upsets the Apple driver
            if self.last_rtp_sequence != self.last_feedback_sequence {
                self.send_feedback(self.last_rtp_sequence);
                self.last_feedback_sequence = self.last_rtp_sequence;
            }

            if self.is_initiator {
                // Restart a synchronization round-trip
                let now = self.clock.now() as u64;
                self.send_clock_sync(0, [U64::new(now), U64::new(0), U64::new(0)]);
            }

            // Five sync rounds every 1.5 seconds after opening, then one
            // every 10 seconds
            if self.sync_sequence_count <= EARLY_SYNC_ROUNDS {
                self.timer.arm(EARLY_SYNC_INTERVAL_MS);
                self.sync_sequence_count += 1;
            } else {
                self.timer.arm(STEADY_SYNC_INTERVAL_MS);
            }

            if self.timeout_remote > 0 {
                self.timeout_remote -= 1;
            }
            if self.timeout_remote == 0 {
                event!(Level::WARN, "remote node timed out");
                self.connection_lost = true;
                if self.is_initiator {
                    self.restart_invitations();
                } else {
                    self.state = SessionState::WaitInvite;
                }
            }
        }
    }

    fn run_invite_control(&mut self, input: &TickInput) {
        self.sync_sequence_count = 0;
        if input.accepted_on_ctrl {
            self.state = SessionState::InviteData;
            self.send_invitation(false);
            self.timer.arm(INVITE_DATA_ARM_MS);
            return;
        }
        if self.timer.fired() {
            if self.invite_count > MAX_INVITE_ATTEMPTS {
                event!(Level::WARN, "control invitations unanswered, restarting");
                self.restart_invitations();
                return;
            }
            self.send_invitation(true);
            self.timer.arm(INVITE_RETRY_MS);
            self.invite_count += 1;
        }
    }

    fn run_invite_data(&mut self, input: &TickInput) {
        if input.accepted_on_data {
            self.state = SessionState::ClockSync0;
            return;
        }
        if self.timer.fired() {
            if self.invite_count > MAX_INVITE_ATTEMPTS {
                event!(Level::WARN, "data invitations unanswered, reinviting on control");
                self.state = SessionState::InviteControl;
                self.timer.arm(INVITE_RETRY_MS);
                return;
            }
            self.send_invitation(false);
            self.timer.arm(INVITE_RETRY_MS);
            self.invite_count += 1;
        }
    }

    fn restart_invitations(&mut self) {
        self.invite_count = 0;
        self.sync_sequence_count = 0;
        self.timeout_remote = REMOTE_TIMEOUT_RELOAD;
        self.state = SessionState::InviteControl;
        self.timer.arm(INVITE_RETRY_MS);
    }

    #[instrument(skip_all, fields(on_control))]
    fn send_invitation(&self, on_control: bool) {
        let name = (!self.session_name.is_empty()).then_some(self.session_name.as_c_str());
        let frame = ControlPacket::new_invitation(U32::new(self.token), U32::new(self.ssrc), name);
        let port = if on_control { self.remote_control_port } else { self.remote_data_port };
        let dest = SocketAddrV4::new(self.remote_ip, port);
        event!(Level::DEBUG, %dest, "sending invitation");
        self.send_frame(on_control, &frame, dest);
    }

    fn send_clock_sync(&self, count: u8, timestamps: [U64; 3]) {
        let Some(partner) = self.session_partner else {
            return;
        };
        let frame = ClockSyncPacket::new_as_bytes(count, timestamps, U32::new(self.ssrc));
        let dest = SocketAddrV4::new(partner, self.remote_data_port);
        event!(Level::DEBUG, count, %dest, "sending clock sync");
        if let Some(data) = &self.data {
            let _ = data.send_to(&frame, dest);
        }
    }

    fn send_feedback(&self, sequence: u16) {
        let Some(partner) = self.session_partner else {
            return;
        };
        let frame = ReceiverFeedbackPacket::new_as_bytes(U16::new(sequence), U32::new(self.ssrc));
        let dest = SocketAddrV4::new(partner, self.remote_control_port);
        event!(Level::DEBUG, sequence, %dest, "sending receiver feedback");
        if let Some(control) = &self.control {
            let _ = control.send_to(&frame, dest);
        }
    }

    fn send_termination(&self) {
        let Some(partner) = self.session_partner else {
            return;
        };
        // A listener answers with the token learned from the peer's IN; an
        // initiator uses its own
        let token = if self.is_initiator { self.token } else { self.remote_token };
        let frame = ControlPacket::new_termination(U32::new(token), U32::new(self.ssrc));
        let dest = SocketAddrV4::new(partner, self.remote_control_port);
        event!(Level::INFO, %dest, "sending termination");
        if let Some(control) = &self.control {
            let _ = control.send_to(&frame, dest);
        }
    }

    fn send_frame(&self, on_control: bool, frame: &[u8], dest: SocketAddrV4) {
        let transport = if on_control { &self.control } else { &self.data };
        if let Some(transport) = transport
            && let Err(e) = transport.send_to(frame, dest)
        {
            event!(Level::WARN, %dest, "failed to send frame: {}", e);
        }
    }
}

impl RtpMidiEngine<UdpTransport> {
    /// Binds the two UDP sockets and starts the session. With
    /// `local_ctrl == 0` the OS picks the control port and the data socket
    /// binds to the next port up, per convention.
    pub fn initiate_session(
        &mut self,
        dst_ip: Ipv4Addr,
        dst_ctrl: u16,
        dst_data: u16,
        local_ctrl: u16,
        local_data: u16,
        is_initiator: bool,
    ) -> Result<(), InitiateError> {
        let control = UdpTransport::bind(local_ctrl).map_err(InitiateError::ControlBind)?;
        let data_port = if local_ctrl == 0 {
            control.local_port().map_err(InitiateError::ControlBind)? + 1
        } else {
            local_data
        };
        let data = UdpTransport::bind(data_port).map_err(InitiateError::DataBind)?;
        self.initiate_session_with(control, data, dst_ip, dst_ctrl, dst_data, is_initiator);
        Ok(())
    }
}
