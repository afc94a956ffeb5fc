use bitvec::prelude::*;
use chrono::{TimeZone, Utc};

use crate::crc::nmea_checksum;

pub const AIS_CHAR_BITS: usize = 6;
pub const MAX_AIVDM_CHARS: usize = 56;

// Minimum payload length in bits per message type 1..27.
const MIN_BITS: [usize; 28] = [
    0, 149, 149, 149, 168, 418, 88, 72, 56, 168, 72, 168, 72, 72, 40, 88, 96, 80, 168, 312, 72,
    272, 168, 160, 160, 40, 60, 96,
];

/// One raw frame as assembled by the HDLC decoder: the regenerated AIVDM
/// sentence set plus the header fields needed for routing.
#[derive(Clone, Debug)]
pub struct Nmea {
    pub sentences: Vec<String>,
    pub channel: char,
    pub msg_type: u8,
    pub repeat: u8,
    pub mmsi: u32,
}

/// Position fix recovered from GGA/RMC/GLL or a TPV envelope.
#[derive(Clone, Copy, Debug, Default)]
pub struct Gps {
    pub lat: f32,
    pub lon: f32,
}

impl Gps {
    pub fn lat(&self) -> f32 {
        self.lat
    }
    pub fn lon(&self) -> f32 {
        self.lon
    }
}

pub fn armour_char(v: u8) -> char {
    if v < 40 {
        (v + 48) as char
    } else {
        (v + 56) as char
    }
}

pub fn armour_value(c: char) -> u8 {
    let mut v = (c as u8).wrapping_sub(48);
    if v > 40 {
        v -= 8;
    }
    v & 0x3F
}

pub fn is_armour_char(c: char) -> bool {
    let c = c as u8;
    (48..88).contains(&c) || (96..120).contains(&c)
}

/// A decoded AIS message: the raw payload bits plus framing metadata. Field
/// access is on demand via the bitfield pickers; the message is not mutated
/// after it has been sent downstream.
#[derive(Clone, Debug, Default)]
pub struct Message {
    bits: BitVec,
    pub nmea: Vec<String>,
    pub channel: char,
    pub rxtime: i64,
    pub station: u16,
}

impl Message {
    pub fn new() -> Message {
        Message {
            bits: BitVec::new(),
            nmea: Vec::new(),
            channel: '?',
            rxtime: 0,
            station: 0,
        }
    }

    pub fn clear(&mut self) {
        self.bits.clear();
        self.nmea.clear();
        self.channel = '?';
        self.rxtime = 0;
    }

    pub fn stamp(&mut self, t: i64) {
        self.rxtime = if t != 0 { t } else { Utc::now().timestamp() };
    }

    pub fn rxtime_string(&self) -> String {
        match Utc.timestamp_opt(self.rxtime, 0) {
            chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
            _ => String::new(),
        }
    }

    /// Append one 6-bit armour character to the payload.
    pub fn append_letter(&mut self, c: char) {
        let v = armour_value(c);
        for i in 0..AIS_CHAR_BITS {
            self.bits.push((v >> (5 - i)) & 1 != 0);
        }
    }

    /// Drop the trailing fill bits of the last fragment.
    pub fn reduce_length(&mut self, fillbits: usize) {
        let len = self.bits.len().saturating_sub(fillbits);
        self.bits.truncate(len);
    }

    pub fn len_bits(&self) -> usize {
        self.bits.len()
    }

    pub fn getu(&self, start: usize, len: usize) -> u64 {
        let mut res = 0u64;
        for pos in start..start + len {
            res = (res << 1) | self.bits.get(pos).map(|b| *b as u64).unwrap_or(0);
        }
        res
    }

    pub fn gets(&self, start: usize, len: usize) -> i64 {
        let raw = self.getu(start, len);
        let sign_bit = 1u64 << (len - 1);
        if raw & sign_bit != 0 {
            ((raw & (sign_bit - 1)) as i64) - (sign_bit as i64)
        } else {
            raw as i64
        }
    }

    pub fn getb(&self, start: usize) -> bool {
        self.getu(start, 1) != 0
    }

    /// Six-bit ASCII text field. Stops at `@`, trims trailing spaces.
    pub fn gett(&self, start: usize, chars: usize) -> String {
        let mut res = String::with_capacity(chars);
        for i in 0..chars {
            match self.getu(start + i * AIS_CHAR_BITS, AIS_CHAR_BITS) as u32 {
                0 => break,
                ch if ch < 32 => res.push(char::from_u32(64 + ch).unwrap()),
                ch => res.push(char::from_u32(ch).unwrap()),
            }
        }
        let trimmed = res.trim_end().len();
        res.truncate(trimmed);
        res
    }

    pub fn msg_type(&self) -> u8 {
        self.getu(0, 6) as u8
    }

    pub fn repeat(&self) -> u8 {
        self.getu(6, 2) as u8
    }

    pub fn mmsi(&self) -> u32 {
        self.getu(8, 30) as u32
    }

    /// Length plausibility for the message type; anything else is dropped by
    /// the assembler.
    pub fn validate(&self) -> bool {
        let t = self.msg_type() as usize;
        if !(1..=27).contains(&t) {
            return false;
        }
        self.bits.len() >= MIN_BITS[t] && self.bits.len() <= 1018
    }

    /// Regenerate normalized AIVDM sentences from the payload bits. Used for
    /// internally decoded frames and when re-broadcasting cleaned-up input.
    pub fn build_nmea(&mut self, channel: char, message_id: u32) {
        self.nmea.clear();

        let letters = (self.bits.len() + AIS_CHAR_BITS - 1) / AIS_CHAR_BITS;
        let sentences = (letters + MAX_AIVDM_CHARS - 1) / MAX_AIVDM_CHARS;

        let mut l = 0;
        for s in 0..sentences {
            let mut body = format!("AIVDM,{},{},", sentences, s + 1);
            if sentences > 1 {
                body += &message_id.to_string();
            }
            body.push(',');
            if channel != '?' {
                body.push(channel);
            }
            body.push(',');

            let mut i = 0;
            while l < letters && i < MAX_AIVDM_CHARS {
                body.push(armour_char(self.getu(l * AIS_CHAR_BITS, AIS_CHAR_BITS) as u8));
                l += 1;
                i += 1;
            }

            let fill = if sentences > 1 && s == sentences - 1 {
                letters * AIS_CHAR_BITS - self.bits.len()
            } else if sentences == 1 {
                letters * AIS_CHAR_BITS - self.bits.len()
            } else {
                0
            };
            body += &format!(",{}", fill);

            let sentence = format!("!{}*{:02X}", body, nmea_checksum(&body));
            self.nmea.push(sentence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg_from_payload(payload: &str, fill: usize) -> Message {
        let mut m = Message::new();
        for c in payload.chars() {
            m.append_letter(c);
        }
        m.reduce_length(fill);
        m
    }

    #[test]
    fn test_armour_roundtrip() {
        for v in 0..64u8 {
            let c = armour_char(v);
            assert!(is_armour_char(c), "{} -> {}", v, c);
            assert_eq!(armour_value(c), v);
        }
        assert!(!is_armour_char('*'));
        assert!(!is_armour_char('x'));
    }

    #[test]
    fn test_type1_fields() {
        // type 1 position report, documented reference sentence
        let m = msg_from_payload("15RTgt0PAso;90TKcjM8h6g208CQ", 0);
        assert_eq!(m.msg_type(), 1);
        assert_eq!(m.repeat(), 0);
        assert_eq!(m.mmsi(), 371798000);
        assert_eq!(m.getu(38, 4), 0); // under way using engine
        assert_eq!(m.getu(50, 10), 123); // 12.3 knots
        let lat = m.gets(89, 27) as f64 / 600000.0;
        let lon = m.gets(61, 28) as f64 / 600000.0;
        assert!((lat - 48.38163).abs() < 1e-4);
        assert!((lon + 123.39538).abs() < 1e-4);
        assert_eq!(m.getu(116, 12), 2240); // cog 224.0
        assert_eq!(m.getu(128, 9), 215); // true heading
        assert!(m.validate());
    }

    #[test]
    fn test_text_field() {
        // type 5 static data, first fragment carries callsign and name
        let mut m = msg_from_payload(
            "55?MbV02;H;s<HtKR20EHE:0@T4@Dn2222222216L961O5Gf0NSQEp6ClRp8",
            0,
        );
        for c in "88888888880".chars() {
            m.append_letter(c);
        }
        m.reduce_length(2);
        assert_eq!(m.msg_type(), 5);
        assert_eq!(m.mmsi(), 351759000);
        assert_eq!(m.getu(40, 30), 9134270); // IMO
        assert_eq!(m.gett(70, 7), "3FOF8");
        assert_eq!(m.gett(112, 20), "EVER DIADEM");
        assert_eq!(m.gett(302, 20), "NEW YORK");
        assert!(m.validate());
    }

    #[test]
    fn test_build_nmea_roundtrip() {
        let payload = "15RTgt0PAso;90TKcjM8h6g208CQ";
        let mut m = msg_from_payload(payload, 0);
        m.build_nmea('A', 0);
        assert_eq!(m.nmea.len(), 1);
        let s = &m.nmea[0];
        assert!(s.starts_with("!AIVDM,1,1,,A,"));
        assert!(s.contains(payload));
        // checksum self-consistency
        let body = &s[1..s.len() - 3];
        let sum = u8::from_str_radix(&s[s.len() - 2..], 16).unwrap();
        assert_eq!(nmea_checksum(body), sum);
    }

    #[test]
    fn test_build_nmea_multipart_fill() {
        // 70 letters -> two fragments, fill only on the last
        let mut m = Message::new();
        for _ in 0..70 {
            m.append_letter('0');
        }
        m.reduce_length(4);
        m.build_nmea('B', 3);
        assert_eq!(m.nmea.len(), 2);
        assert!(m.nmea[0].starts_with("!AIVDM,2,1,3,B,"));
        assert!(m.nmea[0].contains(",0*"));
        assert!(m.nmea[1].starts_with("!AIVDM,2,2,3,B,"));
        assert!(m.nmea[1].contains(",4*"));
    }

    #[test]
    fn test_validate_rejects_short() {
        let m = msg_from_payload("15RTgt0", 0); // 42 bits of a type 1
        assert!(!m.validate());
    }
}
