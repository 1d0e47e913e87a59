use bytes::{BufMut, BytesMut};

use super::fifo::{MidiStreamFifo, SysexOutSlot};

/// Maximum size of one RTP-MIDI payload.
pub(crate) const MAX_RTP_LOAD: usize = 1024;
/// Data bytes carried per SysEx fragment.
pub(crate) const SYSEX_FRAGMENT_SIZE: usize = 512;
/// A 512-byte fragment takes ~131 ms at the legacy serial MIDI rate; no RTP
/// transmission happens until the cooldown has drained.
pub(crate) const INTER_FRAGMENT_COOLDOWN_MS: u32 = 131;

/// Assembles the MIDI list of one outbound RTP payload per tick: the SysEx
/// staging slot is served with priority, then the stream FIFO is drained,
/// every append bounded so the list never exceeds `MAX_RTP_LOAD - 2`.
pub(crate) struct PayloadBuilder {
    transmitted_in_fragments: usize,
    cooldown_ms: u32,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        PayloadBuilder {
            transmitted_in_fragments: 0,
            cooldown_ms: 0,
        }
    }

    pub fn tick(&mut self) {
        if self.cooldown_ms > 0 {
            self.cooldown_ms -= 1;
        }
    }

    pub fn ready(&self) -> bool {
        self.cooldown_ms == 0
    }

    pub fn reset(&mut self) {
        self.transmitted_in_fragments = 0;
        self.cooldown_ms = 0;
    }

    pub fn fill(&mut self, sysex: &SysexOutSlot, stream: &MidiStreamFifo, list: &mut BytesMut) {
        let sysex_len = sysex.len();
        if sysex_len != 0 {
            // - 1 for the null delta time in front of the message
            if sysex_len > MAX_RTP_LOAD - 1 {
                self.fill_fragment(sysex, sysex_len, list);
                // One SysEx fragment per packet, nothing rides along
                return;
            }
            list.put_u8(0x00); // delta time
            sysex.copy_to(0, sysex_len, list);
            sysex.clear();
        }

        let budget = (MAX_RTP_LOAD - 2).saturating_sub(list.len());
        stream.pop_into(list, budget);
    }

    fn fill_fragment(&mut self, sysex: &SysexOutSlot, total: usize, list: &mut BytesMut) {
        list.put_u8(0x00); // delta time
        if self.transmitted_in_fragments == 0 {
            // First fragment: opening bytes plus a trailing 0xF0
            // continuation marker
            sysex.copy_to(0, SYSEX_FRAGMENT_SIZE, list);
            list.put_u8(0xF0);
            self.transmitted_in_fragments = SYSEX_FRAGMENT_SIZE;
        } else {
            // Continuation fragments open with 0xF7
            list.put_u8(0xF7);
            let remaining = total - self.transmitted_in_fragments;
            let chunk = remaining.min(SYSEX_FRAGMENT_SIZE);
            sysex.copy_to(self.transmitted_in_fragments, chunk, list);
            self.transmitted_in_fragments += chunk;
            if remaining > chunk {
                list.put_u8(0xF0); // more fragments follow
            } else {
                // Final fragment already ends with the message's own 0xF7
                sysex.clear();
                self.transmitted_in_fragments = 0;
            }
        }
        self.cooldown_ms = INTER_FRAGMENT_COOLDOWN_MS;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fifo::MIDI_STREAM_CAPACITY;

    fn make_sysex(total_len: usize) -> Vec<u8> {
        let mut message = vec![0xF0];
        message.extend((0..total_len - 2).map(|i| (i % 0x70) as u8));
        message.push(0xF7);
        message
    }

    fn build(builder: &mut PayloadBuilder, sysex: &SysexOutSlot, stream: &MidiStreamFifo) -> Vec<u8> {
        let mut list = BytesMut::new();
        builder.fill(sysex, stream, &mut list);
        list.to_vec()
    }

    #[test]
    fn test_stream_bytes_pass_through() {
        let mut builder = PayloadBuilder::new();
        let sysex = SysexOutSlot::with_capacity(16);
        let stream = MidiStreamFifo::with_capacity(MIDI_STREAM_CAPACITY);
        assert!(stream.push_block(&[0x00, 0x90, 0x3C, 0x40]));

        let list = build(&mut builder, &sysex, &stream);
        assert_eq!(list, vec![0x00, 0x90, 0x3C, 0x40]);
        assert!(builder.ready());
    }

    #[test]
    fn test_stream_drain_bounded_per_packet() {
        let mut builder = PayloadBuilder::new();
        let sysex = SysexOutSlot::with_capacity(16);
        let stream = MidiStreamFifo::with_capacity(MIDI_STREAM_CAPACITY);
        let block = vec![0x42u8; 1500];
        assert!(stream.push_block(&block));

        let first = build(&mut builder, &sysex, &stream);
        assert_eq!(first.len(), MAX_RTP_LOAD - 2);

        // Remainder is carried to the next packet in order
        let second = build(&mut builder, &sysex, &stream);
        assert_eq!(second.len(), 1500 - (MAX_RTP_LOAD - 2));
        assert!(stream.is_empty());
    }

    #[test]
    fn test_small_sysex_sent_whole_with_stream_data() {
        let mut builder = PayloadBuilder::new();
        let sysex = SysexOutSlot::with_capacity(64);
        let stream = MidiStreamFifo::with_capacity(MIDI_STREAM_CAPACITY);
        let message = make_sysex(10);
        assert!(sysex.submit(&message));
        assert!(stream.push_block(&[0x00, 0xF8]));

        let list = build(&mut builder, &sysex, &stream);
        assert_eq!(&list[0..1], &[0x00]);
        assert_eq!(&list[1..11], &message[..]);
        assert_eq!(&list[11..], &[0x00, 0xF8]);

        // Slot released for the next message
        assert_eq!(sysex.len(), 0);
        assert!(builder.ready());
    }

    #[test]
    fn test_two_fragment_sysex() {
        let mut builder = PayloadBuilder::new();
        let sysex = SysexOutSlot::with_capacity(2048);
        let stream = MidiStreamFifo::with_capacity(MIDI_STREAM_CAPACITY);
        let message = make_sysex(1024);
        assert!(sysex.submit(&message));

        // First fragment: delta, 512 message bytes, trailing F0
        let first = build(&mut builder, &sysex, &stream);
        assert_eq!(first.len(), 514);
        assert_eq!(first[0], 0x00);
        assert_eq!(&first[1..513], &message[0..512]);
        assert_eq!(first[513], 0xF0);
        assert!(!builder.ready());

        // Cooldown blocks transmission for 131 ticks
        for _ in 0..INTER_FRAGMENT_COOLDOWN_MS {
            assert!(!builder.ready());
            builder.tick();
        }
        assert!(builder.ready());

        // Final fragment: delta, leading F7, remaining 512 bytes ending F7
        let second = build(&mut builder, &sysex, &stream);
        assert_eq!(second.len(), 514);
        assert_eq!(second[0], 0x00);
        assert_eq!(second[1], 0xF7);
        assert_eq!(&second[2..], &message[512..]);
        assert_eq!(*second.last().unwrap(), 0xF7);

        // Slot released, fragment counter rewound
        assert_eq!(sysex.len(), 0);
        let empty = {
            builder.reset();
            build(&mut builder, &sysex, &stream)
        };
        assert!(empty.is_empty());
    }

    #[test]
    fn test_three_fragment_sysex_reassembles() {
        let mut builder = PayloadBuilder::new();
        let sysex = SysexOutSlot::with_capacity(2048);
        let stream = MidiStreamFifo::with_capacity(MIDI_STREAM_CAPACITY);
        let message = make_sysex(1500);
        assert!(sysex.submit(&message));

        let mut reassembled = Vec::new();
        let mut fragments = 0;
        while sysex.len() != 0 {
            for _ in 0..INTER_FRAGMENT_COOLDOWN_MS {
                builder.tick();
            }
            assert!(builder.ready());
            let list = build(&mut builder, &sysex, &stream);
            fragments += 1;
            // Strip the delta, the continuation markers, and collect payload
            let mut payload = &list[1..];
            if fragments > 1 {
                assert_eq!(payload[0], 0xF7);
                payload = &payload[1..];
            }
            if sysex.len() != 0 {
                assert_eq!(*payload.last().unwrap(), 0xF0);
                payload = &payload[..payload.len() - 1];
            }
            reassembled.extend_from_slice(payload);
        }

        assert_eq!(fragments, 3);
        assert_eq!(reassembled, message);
    }
}
