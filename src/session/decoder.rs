use tracing::{Level, event};

use crate::packets::midi_packets::delta_time::DeltaTime;

/// Host callback invoked once per complete MIDI message (including each
/// fully reassembled SysEx). Must return promptly; it runs on the tick
/// thread.
pub type MidiReceiver = dyn FnMut(&[u8], u32) + Send;

/// Decodes received MIDI command lists into discrete messages: running
/// status, real-time passthrough, and SysEx reassembly across packets.
/// All decoding state survives packet boundaries.
pub(crate) struct RtpMidiDecoder {
    callback: Box<MidiReceiver>,
    running_status: u8,
    message: [u8; 3],
    awaiting_third_byte: bool,
    sysex_buffer: Vec<u8>,
    sysex_capacity: usize,
    sysex_active: bool,
    sysex_segmented: bool,
    sysex_overflow: bool,
}

impl RtpMidiDecoder {
    pub fn new(sysex_capacity: usize, callback: Box<MidiReceiver>) -> Self {
        RtpMidiDecoder {
            callback,
            running_status: 0,
            message: [0; 3],
            awaiting_third_byte: false,
            sysex_buffer: Vec::with_capacity(sysex_capacity),
            sysex_capacity,
            sysex_active: false,
            sysex_segmented: false,
            sysex_overflow: false,
        }
    }

    pub fn reset(&mut self) {
        self.running_status = 0;
        self.awaiting_third_byte = false;
        self.reset_sysex();
    }

    /// Decodes one received MIDI command list. `local_clock` is the 100-µs
    /// session clock; each message is delivered at the clock plus the deltas
    /// accumulated so far within the list.
    pub fn process_list(&mut self, list: &[u8], z_flag: bool, local_clock: u32) {
        // An empty command list is legal
        if list.is_empty() {
            return;
        }

        let mut cursor = 0;
        let mut accumulated_delta = 0u32;

        if z_flag {
            let Some(delta) = DeltaTime::read(list, &mut cursor) else {
                return;
            };
            accumulated_delta = accumulated_delta.wrapping_add(delta.get());
        }
        if cursor < list.len() {
            self.decode_event(list, &mut cursor, local_clock.wrapping_add(accumulated_delta));
        }

        while cursor < list.len() {
            let Some(delta) = DeltaTime::read(list, &mut cursor) else {
                return;
            };
            accumulated_delta = accumulated_delta.wrapping_add(delta.get());
            // RFC 6295 allows a trailing delta with no event
            if cursor < list.len() {
                self.decode_event(list, &mut cursor, local_clock.wrapping_add(accumulated_delta));
            }
        }
    }

    /// Consumes bytes until one complete message has been delivered or the
    /// list ends mid-message (the remainder arrives in a later packet).
    fn decode_event(&mut self, list: &[u8], cursor: &mut usize, event_time: u32) {
        while *cursor < list.len() {
            let byte = list[*cursor];
            *cursor += 1;

            if byte == 0xF0 && !self.sysex_active {
                self.sysex_active = true;
                self.sysex_segmented = true;
                self.store_sysex_byte(0xF0);
                continue;
            }

            if self.sysex_active {
                if byte == 0xF0 {
                    // Trailing F0: this fragment ends here, the message
                    // continues in a later packet
                    self.sysex_segmented = false;
                    continue;
                }
                if byte == 0xF7 {
                    if self.sysex_segmented {
                        self.store_sysex_byte(0xF7);
                        self.emit_sysex(event_time);
                        self.reset_sysex();
                        return;
                    }
                    // Leading F7 opens a continuation fragment
                    self.sysex_segmented = true;
                    continue;
                }
                if byte == 0xF4 {
                    // SysEx cancellation
                    self.reset_sysex();
                    return;
                }
                if self.sysex_segmented {
                    if byte < 0x80 {
                        self.store_sysex_byte(byte);
                        continue;
                    }
                    if byte >= 0xF8 {
                        // Real-time message interleaved in the SysEx:
                        // deliver it without touching the buffer
                        (self.callback)(&[byte], event_time);
                        continue;
                    }
                    // Any other status byte mid-SysEx: corrupted message.
                    // Drop it and reprocess the byte normally.
                    event!(Level::WARN, byte, "status byte inside SysEx, dropping pending message");
                    self.reset_sysex();
                }
            }

            if byte & 0x80 != 0 {
                if byte >= 0xF8 {
                    (self.callback)(&[byte], event_time);
                    return;
                }

                self.running_status = byte;
                self.message[0] = byte;
                self.awaiting_third_byte = false;

                if byte == 0xF6 {
                    // Tune Request is complete on its own
                    self.emit_message(1, event_time);
                    return;
                }
                continue;
            }

            // Data byte under the current running status
            if self.awaiting_third_byte {
                self.message[0] = self.running_status;
                self.message[2] = byte;
                self.awaiting_third_byte = false;
                self.emit_message(3, event_time);
                if self.running_status >= 0xF0 {
                    // System common does not establish running status
                    self.running_status = 0;
                }
                return;
            }

            if self.running_status == 0 {
                return; // Stray data byte
            }

            match self.running_status {
                0x80..=0xBF | 0xE0..=0xEF | 0xF2 => {
                    self.message[1] = byte;
                    self.awaiting_third_byte = true;
                    continue;
                }
                0xC0..=0xDF => {
                    self.message[0] = self.running_status;
                    self.message[1] = byte;
                    self.emit_message(2, event_time);
                    return;
                }
                0xF1 | 0xF3 => {
                    self.message[0] = self.running_status;
                    self.message[1] = byte;
                    self.emit_message(2, event_time);
                    self.running_status = 0;
                    return;
                }
                _ => {
                    self.running_status = 0;
                    return;
                }
            }
        }
    }

    fn emit_message(&mut self, length: usize, event_time: u32) {
        let message = self.message;
        (self.callback)(&message[..length], event_time);
    }

    fn store_sysex_byte(&mut self, byte: u8) {
        if self.sysex_buffer.len() < self.sysex_capacity {
            self.sysex_buffer.push(byte);
        } else {
            self.sysex_overflow = true;
        }
    }

    fn emit_sysex(&mut self, event_time: u32) {
        if self.sysex_overflow {
            // Never deliver a truncated SysEx
            event!(Level::WARN, size = self.sysex_capacity, "incoming SysEx overflowed the buffer, dropped");
            return;
        }
        let buffer = std::mem::take(&mut self.sysex_buffer);
        (self.callback)(&buffer, event_time);
        self.sysex_buffer = buffer;
    }

    fn reset_sysex(&mut self) {
        self.sysex_buffer.clear();
        self.sysex_active = false;
        self.sysex_segmented = false;
        self.sysex_overflow = false;
    }
}
