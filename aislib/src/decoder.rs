use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use log::debug;

use crate::ais::{armour_char, Nmea};
use crate::crc::{calc_crc16_x25, nmea_checksum};
use crate::stream::{Connection, StreamIn, Tag};

const MAX_BITS: usize = 512;

/// Notifications from the frame decoder back to the source side, e.g. to
/// freeze gain training while a frame is in flight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DecoderSignal {
    StartTraining,
    StopTraining,
    Reset,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    Training,
    StartFlag,
    DataFcs,
    FoundMessage,
}

/// Per-channel HDLC frame decoder, driven one demodulated sample per bit.
///
/// NRZI decoding happens at the input; the state machine then hunts the
/// alternating training sequence, matches the 0x7E start flag, collects and
/// destuffs payload bits and hands completed frames to the CRC check.
pub struct Decoder {
    channel: char,
    bits: Vec<u8>,
    bytes: Vec<u8>,

    state: State,
    last_bit: bool,
    prev: bool,

    message_id: u32,
    n_bits: usize,
    n_bytes: usize,

    position: usize,
    one_seq_count: usize,

    pub out: Connection<Nmea>,
    control: Option<Sender<DecoderSignal>>,

    // shared by the decoders of one sampler group: a found frame resets the
    // siblings so they do not re-emit the same frame from a nearby offset
    group_reset: Option<Arc<AtomicU32>>,
    reset_seen: u32,
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder {
            channel: '?',
            bits: vec![0; MAX_BITS],
            bytes: vec![0; MAX_BITS / 8],
            state: State::Training,
            last_bit: false,
            prev: false,
            message_id: 0,
            n_bits: 0,
            n_bytes: 0,
            position: 0,
            one_seq_count: 0,
            out: Connection::new(),
            control: None,
            group_reset: None,
            reset_seen: 0,
        }
    }

    pub fn set_channel(&mut self, c: char) {
        self.channel = c;
    }

    pub fn set_control(&mut self, tx: Sender<DecoderSignal>) {
        self.control = Some(tx);
    }

    pub fn set_group_reset(&mut self, bus: Arc<AtomicU32>) {
        self.reset_seen = bus.load(Ordering::Relaxed);
        self.group_reset = Some(bus);
    }

    fn next_state(&mut self, s: State, pos: usize) {
        self.state = s;
        self.position = pos;
        self.one_seq_count = 0;

        if let Some(tx) = &self.control {
            let signal = match s {
                State::Training => Some(DecoderSignal::StartTraining),
                State::StartFlag => Some(DecoderSignal::StopTraining),
                State::FoundMessage => Some(DecoderSignal::Reset),
                State::DataFcs => None,
            };
            if let Some(sig) = signal {
                let _ = tx.try_send(sig);
            }
        }
    }

    /// CRC-16/X-25 over the collected octets: the FCS trails the payload
    /// least-significant byte first.
    fn crc16(&mut self, len: usize) -> bool {
        if len < 24 || len % 8 != 0 {
            return false;
        }
        let n = len / 8;
        for b in self.bytes.iter_mut().take(n) {
            *b = 0;
        }
        for b in 0..len {
            self.bytes[b >> 3] |= self.bits[b] << (b & 7);
        }
        let check = calc_crc16_x25(&self.bytes[..n - 2]);
        let received = (self.bytes[n - 2] as u16) | ((self.bytes[n - 1] as u16) << 8);
        check == received
    }

    /// 6-bit armour symbol at position `pos`, read MSB-first across the
    /// packed octets, zero padded at the tail.
    fn get_frame(&self, pos: usize) -> u8 {
        let x = (pos * 6) >> 3;
        let y = (pos * 6) & 7;

        let b0 = if x < self.n_bytes { self.bytes[x] } else { 0 };
        let b1 = if x + 1 < self.n_bytes {
            self.bytes[x + 1]
        } else {
            0
        };
        let w = ((b0 as u16) << 8) | b1 as u16;

        ((w >> (16 - 6 - y)) & 0x3F) as u8
    }

    fn send_nmea(&mut self, tag: &mut Tag) {
        let n_letters = (self.n_bits + 5) / 6;
        let n_sentences = (n_letters + 55) / 56;

        let mut sentences = Vec::with_capacity(n_sentences);

        let mut l = 0;
        for s in 0..n_sentences {
            let mut body = format!("AIVDM,{},{},", n_sentences, s + 1);
            if n_sentences > 1 {
                body += &self.message_id.to_string();
            }
            body.push(',');
            body.push(self.channel);
            body.push(',');

            let mut i = 0;
            while l < n_letters && i < 56 {
                body.push(armour_char(self.get_frame(l)));
                l += 1;
                i += 1;
            }

            let fill = if n_sentences > 1 && s == n_sentences - 1 {
                n_letters * 6 - self.n_bits
            } else {
                0
            };
            body += &format!(",{}", fill);

            sentences.push(format!("!{}*{:02X}", body, nmea_checksum(&body)));
        }

        let nmea = Nmea {
            sentences,
            channel: self.channel,
            msg_type: self.bytes[0] >> 2,
            repeat: self.bytes[0] & 3,
            mmsi: ((self.bytes[1] as u32) << 22)
                | ((self.bytes[2] as u32) << 14)
                | ((self.bytes[3] as u32) << 6)
                | ((self.bytes[4] as u32) >> 2),
        };
        self.out.send(&[nmea], tag);

        self.message_id = (self.message_id + 1) % 10;
    }

    fn process_data(&mut self, len: usize, tag: &mut Tag) -> bool {
        if !self.crc16(len) {
            debug!("decoder: CRC failed on channel {} ({} bits)", self.channel, len);
            return false;
        }
        // exclude the 16 FCS bits
        self.n_bits = len - 16;
        self.n_bytes = (self.n_bits + 7) / 8;
        self.send_nmea(tag);
        true
    }

    pub fn signal(&mut self, s: DecoderSignal) {
        if s == DecoderSignal::Reset {
            self.next_state(State::Training, 0);
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new()
    }
}

impl StreamIn<f32> for Decoder {
    fn receive(&mut self, data: &[f32], tag: &mut Tag) {
        if let Some(bus) = &self.group_reset {
            let epoch = bus.load(Ordering::Relaxed);
            if epoch != self.reset_seen {
                self.reset_seen = epoch;
                self.next_state(State::Training, 0);
            }
        }
        for sample in data {
            // NRZI: a transition is a zero, no transition is a one
            let d = *sample > 0.0;
            let bit = !(d ^ self.prev);
            self.prev = d;

            match self.state {
                State::Training => {
                    if bit != self.last_bit {
                        self.position += 1;
                    } else if self.position > 10 {
                        // we are at * in ..0101|01*111110 or ..010|*01111110
                        self.next_state(State::StartFlag, if bit { 3 } else { 1 });
                    } else {
                        self.next_state(State::Training, 0);
                    }
                }
                State::StartFlag => {
                    if self.position == 7 {
                        if !bit {
                            self.next_state(State::DataFcs, 0);
                        } else {
                            self.next_state(State::Training, 0);
                        }
                    } else if bit {
                        self.position += 1;
                    } else {
                        self.next_state(State::Training, 0);
                    }
                }
                State::DataFcs => {
                    self.bits[self.position] = bit as u8;
                    self.position += 1;

                    if bit {
                        if self.one_seq_count == 5 {
                            // closing flag: strip the trailing 0111111
                            let len = self.position.saturating_sub(7);
                            if self.process_data(len, tag) {
                                self.next_state(State::FoundMessage, 0);
                                if let Some(bus) = &self.group_reset {
                                    self.reset_seen =
                                        bus.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
                                }
                            }
                            self.next_state(State::Training, 0);
                        } else {
                            self.one_seq_count += 1;
                        }
                    } else {
                        if self.one_seq_count == 5 {
                            self.position -= 1; // bit-destuff
                        }
                        self.one_seq_count = 0;
                    }

                    if self.position == MAX_BITS {
                        self.next_state(State::Training, 0);
                    }
                }
                State::FoundMessage => {
                    self.next_state(State::Training, 0);
                }
            }
            self.last_bit = bit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ais::armour_value;
    use std::sync::{Arc, Mutex};

    struct Capture {
        frames: Vec<Nmea>,
    }

    impl StreamIn<Nmea> for Capture {
        fn receive(&mut self, data: &[Nmea], _tag: &mut Tag) {
            self.frames.extend_from_slice(data);
        }
    }

    /// Build the on-air sample stream for an armoured payload: pack to
    /// octets, append the FCS, serialise LSB-first, stuff, frame, NRZI.
    fn encode_frame(payload: &str) -> Vec<f32> {
        let mut bits: Vec<u8> = Vec::new();
        for c in payload.chars() {
            let v = armour_value(c);
            for i in 0..6 {
                bits.push((v >> (5 - i)) & 1);
            }
        }
        assert_eq!(bits.len() % 8, 0, "test payload must be octet aligned");

        let mut bytes = Vec::new();
        for chunk in bits.chunks(8) {
            let mut b = 0u8;
            for (i, bit) in chunk.iter().enumerate() {
                b |= bit << (7 - i);
            }
            bytes.push(b);
        }
        let fcs = calc_crc16_x25(&bytes);
        bytes.push((fcs & 0xFF) as u8);
        bytes.push((fcs >> 8) as u8);

        // HDLC wire order: each octet LSB first
        let mut wire: Vec<u8> = Vec::new();
        for b in &bytes {
            for j in 0..8 {
                wire.push((b >> j) & 1);
            }
        }

        // bit stuffing: a zero after five consecutive ones
        let mut stuffed = Vec::new();
        let mut ones = 0;
        for b in wire {
            stuffed.push(b);
            if b == 1 {
                ones += 1;
                if ones == 5 {
                    stuffed.push(0);
                    ones = 0;
                }
            } else {
                ones = 0;
            }
        }

        let mut framed = Vec::new();
        for i in 0..24 {
            framed.push((i % 2) as u8); // 0101.. training
        }
        framed.extend_from_slice(&[0, 1, 1, 1, 1, 1, 1, 0]); // start flag
        framed.extend_from_slice(&stuffed);
        framed.extend_from_slice(&[0, 1, 1, 1, 1, 1, 1, 0]); // end flag
        framed.extend_from_slice(&[0, 1, 0, 1]);

        // NRZI encode: zero toggles the line, one holds it
        let mut level = false;
        let mut samples = Vec::with_capacity(framed.len());
        for b in framed {
            if b == 0 {
                level = !level;
            }
            samples.push(if level { 1.0 } else { -1.0 });
        }
        samples
    }

    fn run_decoder(payload: &str) -> Vec<Nmea> {
        let cap = Arc::new(Mutex::new(Capture { frames: Vec::new() }));
        let mut dec = Decoder::new();
        dec.set_channel('A');
        dec.out.connect(cap.clone());

        let mut tag = Tag::default();
        dec.receive(&encode_frame(payload), &mut tag);

        let frames = cap.lock().unwrap().frames.clone();
        frames
    }

    #[test]
    fn test_type1_frame_roundtrip() {
        let payload = "15RTgt0PAso;90TKcjM8h6g208CQ";
        let frames = run_decoder(payload);

        assert_eq!(frames.len(), 1);
        let f = &frames[0];
        assert_eq!(f.channel, 'A');
        assert_eq!(f.msg_type, 1);
        assert_eq!(f.repeat, 0);
        assert_eq!(f.mmsi, 371798000);
        assert_eq!(f.sentences.len(), 1);

        let s = &f.sentences[0];
        assert!(s.starts_with("!AIVDM,1,1,,A,"), "{}", s);
        assert!(s.contains(payload), "{}", s);
        assert!(s.contains(",0*"), "{}", s);

        let body = &s[1..s.len() - 3];
        let sum = u8::from_str_radix(&s[s.len() - 2..], 16).unwrap();
        assert_eq!(nmea_checksum(body), sum);
    }

    #[test]
    fn test_bit_unstuffing() {
        // 'w' armour chars are solid ones and force stuffing throughout
        let payload = "1www0www1www0www1www0www1www";
        let frames = run_decoder(payload);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].sentences[0].contains(payload));
    }

    #[test]
    fn test_corrupted_frame_is_dropped() {
        let payload = "15RTgt0PAso;90TKcjM8h6g208CQ";
        let mut samples = encode_frame(payload);
        // flip one sample mid-frame; NRZI makes this a two-bit error
        let mid = samples.len() / 2;
        samples[mid] = -samples[mid];

        let cap = Arc::new(Mutex::new(Capture { frames: Vec::new() }));
        let mut dec = Decoder::new();
        dec.set_channel('B');
        dec.out.connect(cap.clone());
        let mut tag = Tag::default();
        dec.receive(&samples, &mut tag);
        assert!(cap.lock().unwrap().frames.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let p1 = "15RTgt0PAso;90TKcjM8h6g208CQ";
        let p2 = "38Id705000rRVJhE7cl9n;160000";
        let mut samples = encode_frame(p1);
        samples.extend(encode_frame(p2));

        let cap = Arc::new(Mutex::new(Capture { frames: Vec::new() }));
        let mut dec = Decoder::new();
        dec.set_channel('A');
        dec.out.connect(cap.clone());
        let mut tag = Tag::default();
        dec.receive(&samples, &mut tag);

        let frames = cap.lock().unwrap().frames.clone();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].msg_type, 1);
        assert_eq!(frames[1].msg_type, 3);
        assert_eq!(frames[1].mmsi, 563808000);
    }

    #[test]
    fn test_control_signals() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut dec = Decoder::new();
        dec.set_channel('A');
        dec.set_control(tx);

        let mut tag = Tag::default();
        dec.receive(&encode_frame("15RTgt0PAso;90TKcjM8h6g208CQ"), &mut tag);

        let seen: Vec<DecoderSignal> = rx.try_iter().collect();
        assert!(seen.contains(&DecoderSignal::StopTraining));
        assert!(seen.contains(&DecoderSignal::StartTraining));
    }
}
