//! Rust implementation of an RTP-MIDI (AppleMidi) session endpoint, built
//! around a tick-driven engine suitable for real-time hosts.
//!
//! The engine pairs with exactly one remote station over two UDP ports
//! (control and data), performs the Apple session handshake and three-way
//! clock synchronization, frames outgoing MIDI into RTP payloads (including
//! paced SysEx fragmentation), and decodes received payloads back into
//! discrete MIDI messages for a host callback.
//!
//! # Features
//! - **Tick core**: all protocol work happens inside
//!   [`RtpMidiEngine::run_session`], called every millisecond from one
//!   thread; sockets are polled, never awaited.
//! - **Lock-free feed**: a cloneable [`MidiSender`] lets one other thread
//!   queue MIDI concurrently with the tick.
//! - **Async driver**: [`SessionDriver`] runs the tick loop on a `tokio`
//!   task for hosts that prefer an async surface.
//! - **SysEx support**: outbound messages are fragmented with pacing;
//!   inbound fragments are reassembled before delivery.
//!
//! ## Unsupported Features
//! - **Recovery Journal**: the journal section of RTP-MIDI is not
//!   implemented; lost packets are not recovered.
//! - **Discovery**: no mDNS/Bonjour advertising; peers are addressed
//!   directly.
//!
//! [`RtpMidiEngine::run_session`]: session::engine::RtpMidiEngine::run_session
//! [`MidiSender`]: session::fifo::MidiSender
//! [`SessionDriver`]: session::driver::SessionDriver
pub mod packets;
pub mod session;
pub mod transport;
