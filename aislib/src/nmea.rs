use log::{debug, warn};

use crate::ais::{is_armour_char, Gps, Message, Nmea};
use crate::stream::{Connection, StreamIn, Tag};

const MAX_LINE: usize = 1024;

#[derive(Clone, Debug, Default)]
struct Aivdm {
    sentence: String,
    data: String,
    channel: char,
    count: u8,
    number: u8,
    id: u8,
    checksum: u8,
    fillbits: u8,
    talker: u16,
}

#[derive(Clone, Copy, PartialEq)]
enum Scan {
    Idle,
    Json,
    Nmea,
}

fn is_hex(c: char) -> bool {
    c.is_ascii_hexdigit()
}

fn from_hex(c: char) -> u8 {
    c.to_digit(16).unwrap_or(0) as u8
}

/// Checksum of a full sentence: XOR between the leading marker and the `*`,
/// assuming the standard `*HH` trailer.
fn line_checksum(s: &str) -> u8 {
    let b = s.as_bytes();
    if b.len() < 4 {
        return 0;
    }
    let mut c = 0u8;
    for &ch in &b[1..b.len() - 3] {
        c ^= ch;
    }
    c
}

/// Text front-end and reassembler: scans a byte stream for NMEA sentences
/// and JSON envelopes, validates AIVDM/AIVDO fields, reassembles multipart
/// groups strictly in order and emits decoded [`Message`]s. Inline
/// GGA/RMC/GLL sentences and TPV envelopes surface as [`Gps`] fixes.
pub struct NmeaParser {
    queue: Vec<Aivdm>,
    msg: Message,

    line: String,
    prev: char,
    state: Scan,
    brace_count: i32,

    regenerate: bool,
    crc_check: bool,
    accept_vdo: bool,
    station: u16,

    pub out: Connection<Message>,
    pub out_gps: Connection<Gps>,
}

impl NmeaParser {
    pub fn new() -> NmeaParser {
        NmeaParser {
            queue: Vec::new(),
            msg: Message::new(),
            line: String::new(),
            prev: '\n',
            state: Scan::Idle,
            brace_count: 0,
            regenerate: false,
            crc_check: false,
            accept_vdo: true,
            station: 0,
            out: Connection::new(),
            out_gps: Connection::new(),
        }
    }

    pub fn set_regenerate(&mut self, b: bool) {
        self.regenerate = b;
    }

    pub fn set_crc_check(&mut self, b: bool) {
        self.crc_check = b;
    }

    pub fn set_vdo(&mut self, b: bool) {
        self.accept_vdo = b;
    }

    pub fn set_station(&mut self, s: u16) {
        self.station = s;
    }

    fn reset(&mut self, c: char) {
        self.state = Scan::Idle;
        self.line.clear();
        self.prev = c;
    }

    fn clean(&mut self, channel: char, talker: u16) {
        self.queue
            .retain(|a| !(a.channel == channel && a.talker == talker));
    }

    /// Find the fragment number of the previous addition for this key.
    /// 0 = not found, -1 = found but inconsistent with the new fragment.
    fn search(&self, a: &Aivdm) -> i32 {
        for it in self.queue.iter().rev() {
            if it.channel == a.channel && it.talker == a.talker {
                if it.count != a.count || it.id != a.id {
                    return -1;
                }
                return it.number as i32;
            }
        }
        0
    }

    fn addline(msg: &mut Message, a: &Aivdm) {
        for c in a.data.chars() {
            msg.append_letter(c);
        }
        if a.count == a.number {
            msg.reduce_length(a.fillbits as usize);
        }
    }

    fn submit_ais(&mut self, aivdm: Aivdm, tag: &mut Tag, t: i64) {
        if aivdm.checksum != line_checksum(&aivdm.sentence) {
            warn!("NMEA: incorrect checksum [{}]", aivdm.sentence);
            if self.crc_check {
                return;
            }
        }

        if aivdm.count == 1 {
            self.msg.clear();
            self.msg.stamp(t);
            self.msg.channel = aivdm.channel;
            self.msg.station = self.station;

            Self::addline(&mut self.msg, &aivdm);

            if self.msg.validate() {
                if self.regenerate {
                    self.msg.build_nmea(aivdm.channel, aivdm.id as u32);
                } else {
                    self.msg.nmea.push(aivdm.sentence);
                }
                let out = self.msg.clone();
                self.out.send(&[out], tag);
            } else {
                warn!(
                    "NMEA: invalid message of type {} and length {}",
                    self.msg.msg_type(),
                    self.msg.len_bits()
                );
            }
            return;
        }

        let result = self.search(&aivdm);

        if aivdm.number as i32 != result + 1 || result == -1 {
            self.clean(aivdm.channel, aivdm.talker);
            if aivdm.number != 1 {
                warn!("NMEA: missing part of multiline message [{}]", aivdm.sentence);
                return;
            }
        }

        self.queue.push(aivdm.clone());
        if aivdm.number != aivdm.count {
            return;
        }

        // multiline group is complete and in order
        self.msg.clear();
        self.msg.stamp(t);
        self.msg.channel = aivdm.channel;
        self.msg.station = self.station;

        let parts: Vec<Aivdm> = self
            .queue
            .iter()
            .filter(|a| a.channel == aivdm.channel && a.talker == aivdm.talker)
            .cloned()
            .collect();
        for a in &parts {
            Self::addline(&mut self.msg, a);
            if !self.regenerate {
                self.msg.nmea.push(a.sentence.clone());
            }
        }

        if self.msg.validate() {
            if self.regenerate {
                self.msg.build_nmea(aivdm.channel, aivdm.id as u32);
            }
            let out = self.msg.clone();
            self.out.send(&[out], tag);
        } else {
            warn!(
                "NMEA: invalid message of type {} and length {}",
                self.msg.msg_type(),
                self.msg.len_bits()
            );
        }

        self.clean(aivdm.channel, aivdm.talker);
    }

    pub fn process_ais(&mut self, s: &str, tag: &mut Tag, t: i64) -> bool {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 7 {
            return false;
        }
        if parts[0].len() != 6 {
            return false;
        }
        let p0: Vec<char> = parts[0].chars().collect();
        if p0[0] != '$' && p0[0] != '!' {
            return false;
        }
        if !self.accept_vdo && &parts[0][3..6] == "VDO" {
            return true;
        }

        let mut aivdm = Aivdm {
            talker: ((p0[1] as u16) << 8) | p0[2] as u16,
            ..Default::default()
        };

        if parts[1].len() != 1 || !parts[1].chars().next().unwrap().is_ascii_digit() {
            return false;
        }
        aivdm.count = parts[1].as_bytes()[0] - b'0';

        if parts[2].len() != 1 || !parts[2].chars().next().unwrap().is_ascii_digit() {
            return false;
        }
        aivdm.number = parts[2].as_bytes()[0] - b'0';

        if parts[3].len() > 1 {
            return false;
        }
        aivdm.id = if parts[3].is_empty() {
            0
        } else {
            let c = parts[3].as_bytes()[0];
            if !c.is_ascii_digit() {
                return false;
            }
            c - b'0'
        };

        if parts[4].len() > 1 {
            return false;
        }
        aivdm.channel = parts[4].chars().next().unwrap_or('?');
        if aivdm.channel != '?' && !aivdm.channel.is_ascii_alphanumeric() {
            return false;
        }

        for c in parts[5].chars() {
            if !is_armour_char(c) {
                return false;
            }
        }
        aivdm.data = parts[5].to_string();

        if parts[6].len() != 4 {
            return false;
        }
        let p6: Vec<char> = parts[6].chars().collect();
        if !p6[0].is_ascii_digit() || p6[1] != '*' || !is_hex(p6[2]) || !is_hex(p6[3]) {
            return false;
        }
        aivdm.fillbits = p6[0] as u8 - b'0';
        if aivdm.fillbits > 5 {
            return false;
        }
        aivdm.checksum = (from_hex(p6[2]) << 4) | from_hex(p6[3]);
        aivdm.sentence = s.to_string();

        self.submit_ais(aivdm, tag, t);
        true
    }

    // https://stackoverflow.com/questions/36254363 style ddmm.mmm conversion
    fn gps_to_decimal(pos: &str, quadrant: char, error: &mut bool) -> f32 {
        if pos.len() <= 5 {
            return 0.0;
        }
        let digits = if pos.as_bytes().get(4) == Some(&b'.') {
            2
        } else {
            3
        };
        let degrees: i32 = match pos[..digits].parse() {
            Ok(d) => d,
            Err(_) => {
                *error = true;
                return 0.0;
            }
        };
        let minutes: f32 = match pos[digits..].parse() {
            Ok(m) => m,
            Err(_) => {
                *error = true;
                return 0.0;
            }
        };
        let v = degrees as f32 + minutes / 60.0;
        if quadrant == 'W' || quadrant == 'S' {
            -v
        } else {
            v
        }
    }

    fn verify_trailing_checksum(&self, parts: &[&str]) -> bool {
        let crc = parts[parts.len() - 1];
        if crc.len() < 3 {
            return false;
        }
        let c: Vec<char> = crc.chars().collect();
        let n = c.len();
        if !is_hex(c[n - 2]) || !is_hex(c[n - 1]) {
            return false;
        }
        let checksum = (from_hex(c[n - 2]) << 4) | from_hex(c[n - 1]);
        if checksum != line_checksum(&self.line) {
            warn!("NMEA: incorrect checksum [{}]", self.line);
            if self.crc_check {
                return false;
            }
        }
        true
    }

    fn process_gga(&mut self, s: &str, tag: &mut Tag) -> bool {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 15 {
            return false;
        }
        if !self.verify_trailing_checksum(&parts) {
            return false;
        }

        let fix: i32 = parts[6].parse().unwrap_or(0);
        if fix != 1 && fix != 2 {
            debug!("NMEA: no fix in GGA sentence");
            return false;
        }

        let mut error = false;
        let gps = Gps {
            lat: Self::gps_to_decimal(parts[2], parts[3].chars().next().unwrap_or(' '), &mut error),
            lon: Self::gps_to_decimal(parts[4], parts[5].chars().next().unwrap_or(' '), &mut error),
        };
        if error {
            return false;
        }
        self.out_gps.send(&[gps], tag);
        true
    }

    fn process_rmc(&mut self, s: &str, tag: &mut Tag) -> bool {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 13 && parts.len() != 12 {
            return false;
        }
        if !self.verify_trailing_checksum(&parts) {
            return false;
        }

        let mut error = false;
        let gps = Gps {
            lat: Self::gps_to_decimal(parts[3], parts[4].chars().next().unwrap_or(' '), &mut error),
            lon: Self::gps_to_decimal(parts[5], parts[6].chars().next().unwrap_or(' '), &mut error),
        };
        if error {
            return false;
        }
        self.out_gps.send(&[gps], tag);
        true
    }

    fn process_gll(&mut self, s: &str, tag: &mut Tag) -> bool {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 8 {
            return false;
        }
        if !self.verify_trailing_checksum(&parts) {
            return false;
        }

        let mut error = false;
        let gps = Gps {
            lat: Self::gps_to_decimal(parts[1], parts[2].chars().next().unwrap_or(' '), &mut error),
            lon: Self::gps_to_decimal(parts[3], parts[4].chars().next().unwrap_or(' '), &mut error),
        };
        if error {
            return false;
        }
        self.out_gps.send(&[gps], tag);
        true
    }

    /// The station's own re-broadcast envelope (`class=AIS`) and gpsd-style
    /// TPV position objects.
    fn process_json_sentence(&mut self, s: &str, tag: &mut Tag) {
        let v: serde_json::Value = match serde_json::from_str(s) {
            Ok(v) => v,
            Err(e) => {
                debug!("NMEA: bad JSON input: {}", e);
                return;
            }
        };
        let obj = match v.as_object() {
            Some(o) => o,
            None => return,
        };

        let cls = obj.get("class").and_then(|c| c.as_str()).unwrap_or("");
        let dev = obj.get("device").and_then(|c| c.as_str()).unwrap_or("");

        if cls == "AIS" && dev == "AIS-catcher" {
            tag.ppm = obj.get("ppm").and_then(|p| p.as_f64()).unwrap_or(0.0) as f32;
            tag.level = obj
                .get("signalpower")
                .and_then(|p| p.as_f64())
                .unwrap_or(0.0) as f32;
            let t = obj.get("rxuxtime").and_then(|p| p.as_i64()).unwrap_or(0);

            if let Some(arr) = obj.get("nmea").and_then(|n| n.as_array()) {
                let lines: Vec<String> = arr
                    .iter()
                    .filter_map(|x| x.as_str().map(str::to_string))
                    .collect();
                for line in lines {
                    self.process_ais(&line, tag, t);
                }
            }
        } else if cls == "TPV" {
            let lat = obj.get("lat").and_then(|p| p.as_f64()).unwrap_or(0.0) as f32;
            let lon = obj.get("lon").and_then(|p| p.as_f64()).unwrap_or(0.0) as f32;
            if lat != 0.0 || lon != 0.0 {
                self.out_gps.send(&[Gps { lat, lon }], tag);
            }
        }
    }

    fn dispatch_line(&mut self, tag: &mut Tag) {
        if self.line.len() <= 6 {
            return;
        }
        let type3 = self.line[3..6].to_string();
        let ok = match type3.as_str() {
            "VDM" | "VDO" => {
                let line = self.line.clone();
                self.process_ais(&line, tag, 0)
            }
            "GGA" => {
                let line = self.line.clone();
                self.process_gga(&line, tag)
            }
            "RMC" => {
                let line = self.line.clone();
                self.process_rmc(&line, tag)
            }
            "GLL" => {
                let line = self.line.clone();
                self.process_gll(&line, tag)
            }
            _ => true,
        };
        if !ok {
            debug!("NMEA: error processing line [{}]", self.line);
        }
    }
}

impl Default for NmeaParser {
    fn default() -> Self {
        NmeaParser::new()
    }
}

/// Byte-stream input from serial, TCP or UDP text sources.
impl StreamIn<u8> for NmeaParser {
    fn receive(&mut self, data: &[u8], tag: &mut Tag) {
        for &byte in data {
            let c = byte as char;

            // sentences are pure ASCII; stray binary resets the scanner
            if !c.is_ascii() {
                self.reset('\n');
                continue;
            }

            if self.state == Scan::Idle {
                if c == '{' && (self.prev == '\n' || self.prev == '\r') {
                    self.line.clear();
                    self.line.push(c);
                    self.state = Scan::Json;
                    self.brace_count = 1;
                } else if c == '$' || c == '!' {
                    self.line.clear();
                    self.line.push(c);
                    self.state = Scan::Nmea;
                }
                self.prev = c;
                continue;
            }

            let newline = c == '\r' || c == '\n' || c == '\t' || c == '\0';
            if !newline {
                self.line.push(c);
            }
            self.prev = c;

            match self.state {
                Scan::Json => {
                    if c == '{' {
                        self.brace_count += 1;
                    } else if c == '}' {
                        self.brace_count -= 1;
                        if self.brace_count == 0 {
                            tag.clear();
                            let line = self.line.clone();
                            self.process_json_sentence(&line, tag);
                            self.reset(c);
                        }
                    } else if newline {
                        debug!("NMEA: newline inside unterminated JSON input");
                        self.reset(c);
                    }
                }
                Scan::Nmea => {
                    // a VDM line is complete once the checksum trailer shows
                    // up, even without a newline
                    let b = self.line.as_bytes();
                    let is_vdm = b.len() > 10 && (b[3] == b'V' && b[4] == b'D');
                    let has_checksum = is_vdm
                        && b.len() > 4
                        && is_hex(b[b.len() - 1] as char)
                        && is_hex(b[b.len() - 2] as char)
                        && b[b.len() - 3] == b'*'
                        && ((b[b.len() - 5] == b',' && (b[b.len() - 4] as char).is_ascii_digit())
                            || b[b.len() - 4] == b',');

                    if (has_checksum || newline) && self.line.len() > 6 {
                        tag.clear();
                        self.dispatch_line(tag);
                        self.reset(c);
                    }
                }
                Scan::Idle => {}
            }

            if self.line.len() > MAX_LINE {
                self.reset(c);
            }
        }
    }
}

/// Frames regenerated by the internal HDLC decoder.
impl StreamIn<Nmea> for NmeaParser {
    fn receive(&mut self, data: &[Nmea], tag: &mut Tag) {
        for record in data {
            let sentences = record.sentences.clone();
            for s in &sentences {
                self.process_ais(s, tag, 0);
            }
        }
    }
}
