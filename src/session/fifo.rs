use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::packets::midi_packets::delta_time::DeltaTime;

pub(crate) const MIDI_STREAM_CAPACITY: usize = 2048;

/// Single-producer/single-consumer ring of raw MIDI bytes. The producer is
/// the host thread (through [`MidiSender`]), the consumer is the engine
/// tick. Each complete MIDI message in the stream is preceded by its RTP
/// delta-time.
///
/// A block is inserted whole or not at all: the write index is published
/// (release) only after every byte of the block is stored, and each side
/// reads the other's index with acquire ordering.
pub(crate) struct MidiStreamFifo {
    buf: Box<[AtomicU8]>,
    read: AtomicUsize,
    write: AtomicUsize,
}

impl MidiStreamFifo {
    pub fn with_capacity(capacity: usize) -> Self {
        // One slot stays empty so a full ring is distinguishable from an
        // empty one.
        let buf = (0..capacity + 1).map(|_| AtomicU8::new(0)).collect();
        MidiStreamFifo {
            buf,
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
        }
    }

    fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.buf.len()
    }

    /// Producer side. Returns false without writing anything if the block
    /// does not fit.
    pub fn push_block(&self, block: &[u8]) -> bool {
        let read = self.read.load(Ordering::Acquire);
        let mut write = self.write.load(Ordering::Relaxed);
        let free = (read + self.buf.len() - write - 1) % self.buf.len();
        if block.len() > free {
            return false;
        }
        for &byte in block {
            self.buf[write].store(byte, Ordering::Relaxed);
            write = self.next_index(write);
        }
        self.write.store(write, Ordering::Release);
        true
    }

    /// Consumer side: moves up to `max` queued bytes into `out`, in FIFO
    /// order, and returns how many were taken.
    pub fn pop_into(&self, out: &mut BytesMut, max: usize) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let mut read = self.read.load(Ordering::Relaxed);
        let mut taken = 0;
        while read != write && taken < max {
            out.put_u8(self.buf[read].load(Ordering::Relaxed));
            read = self.next_index(read);
            taken += 1;
        }
        self.read.store(read, Ordering::Release);
        taken
    }

    pub fn is_empty(&self) -> bool {
        self.read.load(Ordering::Acquire) == self.write.load(Ordering::Acquire)
    }
}

/// Single-slot staging area for one in-flight outbound SysEx message. The
/// producer publishes by storing a non-zero length; the consumer clears the
/// length to zero once the message is fully on the wire.
pub(crate) struct SysexOutSlot {
    buf: Box<[AtomicU8]>,
    len: AtomicUsize,
}

impl SysexOutSlot {
    pub fn with_capacity(capacity: usize) -> Self {
        let buf = (0..capacity).map(|_| AtomicU8::new(0)).collect();
        SysexOutSlot {
            buf,
            len: AtomicUsize::new(0),
        }
    }

    /// Producer side. Returns false if a message is still in flight or the
    /// message does not fit.
    pub fn submit(&self, message: &[u8]) -> bool {
        if message.is_empty() || message.len() > self.buf.len() {
            return false;
        }
        if self.len.load(Ordering::Acquire) != 0 {
            return false;
        }
        for (slot, &byte) in self.buf.iter().zip(message) {
            slot.store(byte, Ordering::Relaxed);
        }
        self.len.store(message.len(), Ordering::Release);
        true
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Consumer side: copies `count` staged bytes starting at `offset`.
    pub fn copy_to(&self, offset: usize, count: usize, out: &mut BytesMut) {
        for slot in &self.buf[offset..offset + count] {
            out.put_u8(slot.load(Ordering::Relaxed));
        }
    }

    /// Consumer side: releases the slot for the next message.
    pub fn clear(&self) {
        self.len.store(0, Ordering::Release);
    }
}

/// Cloneable producer handle for feeding MIDI to an engine. This is the one
/// object a thread other than the tick thread may touch.
#[derive(Clone)]
pub struct MidiSender {
    pub(crate) stream: Arc<MidiStreamFifo>,
    pub(crate) sysex: Arc<SysexOutSlot>,
}

impl MidiSender {
    /// Queues a pre-formed block of delta-prefixed MIDI bytes. The block is
    /// accepted whole or rejected whole.
    pub fn send_midi_block(&self, block: &[u8]) -> bool {
        self.stream.push_block(block)
    }

    /// Queues one MIDI message with a zero delta-time.
    pub fn send_message(&self, message: &[u8]) -> bool {
        self.send_message_at(0, message)
    }

    /// Queues one MIDI message preceded by `delta_time` (in RTP timestamp
    /// units, variable-length encoded on the wire).
    pub fn send_message_at(&self, delta_time: u32, message: &[u8]) -> bool {
        if message.is_empty() {
            return false;
        }
        let delta = DeltaTime::new(delta_time);
        let mut block = BytesMut::with_capacity(delta.size() + message.len());
        delta.write(&mut block);
        block.put_slice(message);
        self.stream.push_block(&block)
    }

    /// Stages one complete `F0 … F7` SysEx message for transmission,
    /// fragmenting on the wire if needed. Returns false while a previous
    /// SysEx is still being sent.
    pub fn send_sysex(&self, message: &[u8]) -> bool {
        if message.first() != Some(&0xF0) || message.last() != Some(&0xF7) {
            return false;
        }
        self.sysex.submit(message)
    }
}
