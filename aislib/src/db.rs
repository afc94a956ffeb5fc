use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::Utc;
use log::{info, warn};
use serde_json::{json, Map, Value};

use crate::ais::Gps;
use crate::jsonais::AisJson;
use crate::stream::{
    Connection, StreamIn, Tag, ANGLE_UNDEFINED, DISTANCE_UNDEFINED, LAT_UNDEFINED, LEVEL_UNDEFINED,
    LON_UNDEFINED, PPM_UNDEFINED, SPEED_UNDEFINED,
};

const DB_MAGIC: i32 = 0x41495346;
const DB_VERSION: i32 = 1;

const EARTH_RADIUS_KM: f32 = 6371.0;
const NMI_PER_KM: f32 = 0.5399568;

const MAX_BINARY_MESSAGES: usize = 10;

// message-type bitmaps used for MMSI classification
const CLASS_A_MASK: u32 = (1 << 1) | (1 << 2) | (1 << 3);
const CLASS_B_MASK: u32 = (1 << 18) | (1 << 19);
const CLASS_A_STATIC_MASK: u32 = 1 << 5;
const CLASS_B_STATIC_MASK: u32 = 1 << 24;
const BASESTATION_MASK: u32 = (1 << 4) | (1 << 16) | (1 << 17) | (1 << 20) | (1 << 22) | (1 << 23);
const SAR_MASK: u32 = 1 << 9;
const ATON_MASK: u32 = 1 << 21;

pub const MMSI_OTHER: i32 = 0;
pub const MMSI_CLASS_A: i32 = 1;
pub const MMSI_CLASS_B: i32 = 2;
pub const MMSI_BASESTATION: i32 = 3;
pub const MMSI_SAR: i32 = 4;
pub const MMSI_SARTEPIRB: i32 = 5;
pub const MMSI_ATON: i32 = 6;

pub const CLASS_OTHER: i32 = 0;
pub const CLASS_UNKNOWN: i32 = 1;
pub const CLASS_CARGO: i32 = 2;
pub const CLASS_TANKER: i32 = 3;
pub const CLASS_PASSENGER: i32 = 4;
pub const CLASS_HIGHSPEED: i32 = 5;
pub const CLASS_SPECIAL: i32 = 6;
pub const CLASS_FISHING: i32 = 7;
pub const CLASS_SAILING: i32 = 8;
pub const CLASS_B: i32 = 9;
pub const CLASS_ATON: i32 = 10;
pub const CLASS_STATION: i32 = 11;
pub const CLASS_SAR: i32 = 12;
pub const CLASS_SARTEPIRB: i32 = 13;

/// ISO 3166 country from the MID digits of an MMSI.
pub fn mid_country(mmsi: u32) -> Option<&'static str> {
    match mmsi / 1000000 {
        201 => Some("AL"),
        202 => Some("AD"),
        203 => Some("AT"),
        204 | 255 | 263 => Some("PT"),
        205 => Some("BE"),
        206 => Some("BY"),
        207 => Some("BG"),
        208 => Some("VA"),
        209 | 210 | 212 => Some("CY"),
        211 | 218 => Some("DE"),
        213 => Some("GE"),
        214 => Some("MD"),
        215 | 229 | 248 | 249 | 256 => Some("MT"),
        216 => Some("AM"),
        219 | 220 => Some("DK"),
        224 | 225 => Some("ES"),
        226..=228 => Some("FR"),
        230 => Some("FI"),
        231 => Some("FO"),
        232..=235 => Some("GB"),
        236 => Some("GI"),
        237 | 239..=241 => Some("GR"),
        238 => Some("HR"),
        242 => Some("MA"),
        243 => Some("HU"),
        244..=246 => Some("NL"),
        247 => Some("IT"),
        250 => Some("IE"),
        251 => Some("IS"),
        252 => Some("LI"),
        253 => Some("LU"),
        254 => Some("MC"),
        257..=259 => Some("NO"),
        261 => Some("PL"),
        262 => Some("ME"),
        264 => Some("RO"),
        265 | 266 => Some("SE"),
        267 => Some("SK"),
        268 => Some("SM"),
        269 => Some("CH"),
        270 => Some("CZ"),
        271 => Some("TR"),
        272 => Some("UA"),
        273 => Some("RU"),
        274 => Some("MK"),
        275 => Some("LV"),
        276 => Some("EE"),
        277 => Some("LT"),
        278 => Some("SI"),
        279 => Some("RS"),
        301 => Some("AI"),
        303 | 338 | 366..=369 => Some("US"),
        304 | 305 => Some("AG"),
        306 => Some("BQ"),
        307 => Some("AW"),
        308 | 309 | 311 => Some("BS"),
        310 => Some("BM"),
        312 => Some("BZ"),
        314 => Some("BB"),
        316 => Some("CA"),
        319 => Some("KY"),
        321 => Some("CR"),
        323 => Some("CU"),
        325 => Some("DM"),
        327 => Some("DO"),
        329 => Some("GP"),
        330 => Some("GD"),
        331 => Some("GL"),
        332 => Some("GT"),
        334 => Some("HN"),
        336 => Some("HT"),
        339 => Some("JM"),
        341 => Some("KN"),
        343 => Some("LC"),
        345 => Some("MX"),
        347 => Some("MQ"),
        348 => Some("MS"),
        350 => Some("NI"),
        351..=357 | 370..=374 => Some("PA"),
        358 => Some("PR"),
        359 => Some("SV"),
        361 => Some("PM"),
        362 => Some("TT"),
        364 => Some("TC"),
        375..=377 => Some("VC"),
        378 => Some("VG"),
        379 => Some("VI"),
        401 => Some("AF"),
        403 => Some("SA"),
        405 => Some("BD"),
        408 => Some("BH"),
        410 => Some("BT"),
        412..=414 => Some("CN"),
        416 => Some("TW"),
        417 => Some("LK"),
        419 => Some("IN"),
        422 => Some("IR"),
        423 => Some("AZ"),
        425 => Some("IQ"),
        428 => Some("IL"),
        431 | 432 => Some("JP"),
        434 => Some("TM"),
        436 => Some("KZ"),
        437 => Some("UZ"),
        438 => Some("JO"),
        440 | 441 | 445 => Some("KR"),
        443 => Some("PS"),
        447 => Some("KW"),
        450 => Some("LB"),
        451 => Some("KG"),
        453 => Some("MO"),
        455 => Some("MV"),
        457 => Some("MN"),
        459 => Some("NP"),
        461 => Some("OM"),
        463 => Some("PK"),
        466 => Some("QA"),
        468 => Some("SY"),
        470 | 471 => Some("AE"),
        472 => Some("TJ"),
        473 | 475 => Some("YE"),
        477 => Some("HK"),
        478 => Some("BA"),
        501 | 607 | 618 | 635 | 660 => Some("TF"),
        503 => Some("AU"),
        506 => Some("MM"),
        508 => Some("BN"),
        510 => Some("FM"),
        511 => Some("PW"),
        512 => Some("NZ"),
        514 | 515 => Some("KH"),
        516 => Some("CX"),
        518 => Some("CK"),
        520 => Some("FJ"),
        523 => Some("CC"),
        525 => Some("ID"),
        529 => Some("KI"),
        531 => Some("LA"),
        533 => Some("MY"),
        536 => Some("MP"),
        538 => Some("MH"),
        540 => Some("NC"),
        542 => Some("NU"),
        544 => Some("NR"),
        546 => Some("PF"),
        548 => Some("PH"),
        550 => Some("TL"),
        553 => Some("PG"),
        555 => Some("PN"),
        557 => Some("SB"),
        559 => Some("AS"),
        561 => Some("WS"),
        563..=566 => Some("SG"),
        567 => Some("TH"),
        570 => Some("TO"),
        572 => Some("TV"),
        574 => Some("VN"),
        576 | 577 => Some("VU"),
        578 => Some("WF"),
        601 => Some("ZA"),
        603 => Some("AO"),
        605 => Some("DZ"),
        608 | 665 => Some("SH"),
        609 => Some("BI"),
        610 => Some("BJ"),
        611 => Some("BW"),
        612 => Some("CF"),
        613 => Some("CM"),
        615 | 676 => Some("CG"),
        616 | 620 => Some("KM"),
        617 => Some("CV"),
        619 => Some("CI"),
        621 => Some("DJ"),
        622 => Some("EG"),
        624 => Some("ET"),
        625 => Some("ER"),
        626 => Some("GA"),
        627 => Some("GH"),
        629 => Some("GM"),
        630 => Some("GW"),
        631 => Some("GQ"),
        632 => Some("GN"),
        633 => Some("BF"),
        634 => Some("KE"),
        636 | 637 => Some("LR"),
        638 => Some("SS"),
        642 => Some("LY"),
        644 => Some("LS"),
        645 => Some("MU"),
        647 => Some("MG"),
        649 => Some("ML"),
        650 => Some("MZ"),
        654 => Some("MR"),
        655 => Some("MW"),
        656 => Some("NE"),
        657 => Some("NG"),
        659 => Some("NA"),
        661 => Some("RW"),
        662 => Some("SD"),
        663 => Some("SN"),
        664 => Some("SC"),
        666 => Some("SO"),
        667 => Some("SL"),
        668 => Some("ST"),
        669 => Some("SZ"),
        670 => Some("TD"),
        671 => Some("TG"),
        672 => Some("TN"),
        674 | 677 => Some("TZ"),
        675 => Some("UG"),
        678 => Some("ZM"),
        679 => Some("ZW"),
        701 => Some("AR"),
        710 => Some("BR"),
        720 => Some("BO"),
        725 => Some("CL"),
        730 => Some("CO"),
        735 => Some("EC"),
        740 => Some("FK"),
        745 => Some("GF"),
        750 => Some("GY"),
        755 => Some("PY"),
        760 => Some("PE"),
        765 => Some("SR"),
        770 => Some("UY"),
        775 => Some("VE"),
        _ => None,
    }
}

/// Bit-packed sub-fields; setters mutate only their named range.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PackedInt(u32);

impl PackedInt {
    pub fn get(&self, position: u32, size: u32) -> u32 {
        (self.0 >> position) & ((1 << size) - 1)
    }

    pub fn set(&mut self, position: u32, size: u32, value: u32) {
        let mask = (1u32 << size) - 1;
        self.0 = (self.0 & !(mask << position)) | ((value & mask) << position);
    }

    pub fn or_op(&mut self, position: u32, size: u32, value: u32) {
        self.0 |= (value & ((1 << size) - 1)) << position;
    }

    pub fn packed(&self) -> u32 {
        self.0
    }

    pub fn set_packed(&mut self, v: u32) {
        self.0 = v;
    }
}

// flags sub-field positions
const FLAG_VALIDATED: u32 = 0; // 2 bits
const FLAG_REPEAT: u32 = 2; // 2 bits
const FLAG_VIRTUAL_AID: u32 = 4; // 1 bit
const FLAG_APPROXIMATE: u32 = 5; // 1 bit
const FLAG_CHANNELS: u32 = 6; // 4 bits
const FLAG_CS: u32 = 10;
const FLAG_RAIM: u32 = 12;
const FLAG_DTE: u32 = 14;
const FLAG_ASSIGNED: u32 = 16;
const FLAG_DISPLAY: u32 = 18;
const FLAG_DSC: u32 = 20;
const FLAG_BAND: u32 = 22;
const FLAG_MSG22: u32 = 24;
const FLAG_OFF_POSITION: u32 = 26;
const FLAG_MANEUVER: u32 = 28;

/// One tracked MMSI. Lives in the database arena; `prev`/`next` link the
/// MRU list, `path_ptr` heads the track in the path ring.
#[derive(Clone, Debug)]
pub struct Ship {
    pub prev: i32,
    pub next: i32,
    pub mmsi: u32,
    pub count: i32,
    pub msg_type: u32,
    pub shipclass: i32,
    pub mmsi_type: i32,
    pub shiptype: i32,
    pub heading: i32,
    pub status: i32,
    pub path_ptr: i32,
    pub to_port: i32,
    pub to_bow: i32,
    pub to_starboard: i32,
    pub to_stern: i32,
    pub imo: i32,
    pub angle: i32,
    pub altitude: i32,
    pub month: i8,
    pub day: i8,
    pub hour: i8,
    pub minute: i8,
    pub lat: f32,
    pub lon: f32,
    pub ppm: f32,
    pub level: f32,
    pub speed: f32,
    pub cog: f32,
    pub draught: f32,
    pub distance: f32,
    pub last_signal: i64,
    pub last_direct_signal: i64,
    pub shipname: String,
    pub destination: String,
    pub callsign: String,
    pub country_code: String,
    pub msg: String,
    pub last_group: u64,
    pub group_mask: u64,
    pub flags: PackedInt,
}

impl Default for Ship {
    fn default() -> Ship {
        Ship {
            prev: -1,
            next: -1,
            mmsi: 0,
            count: 0,
            msg_type: 0,
            shipclass: CLASS_UNKNOWN,
            mmsi_type: MMSI_OTHER,
            shiptype: 0,
            heading: 511,
            status: 15,
            path_ptr: -1,
            to_port: 0,
            to_bow: 0,
            to_starboard: 0,
            to_stern: 0,
            imo: 0,
            angle: ANGLE_UNDEFINED,
            altitude: 0,
            month: 0,
            day: 0,
            hour: 0,
            minute: 0,
            lat: LAT_UNDEFINED,
            lon: LON_UNDEFINED,
            ppm: PPM_UNDEFINED,
            level: LEVEL_UNDEFINED,
            speed: SPEED_UNDEFINED,
            cog: 360.0,
            draught: 0.0,
            distance: DISTANCE_UNDEFINED,
            last_signal: 0,
            last_direct_signal: 0,
            shipname: String::new(),
            destination: String::new(),
            callsign: String::new(),
            country_code: String::new(),
            msg: String::new(),
            last_group: 0,
            group_mask: 0,
            flags: PackedInt::default(),
        }
    }
}

impl Ship {
    pub fn reset(&mut self) {
        let prev = self.prev;
        let next = self.next;
        *self = Ship::default();
        self.prev = prev;
        self.next = next;
    }

    pub fn set_validated(&mut self, v: u32) {
        self.flags.set(FLAG_VALIDATED, 2, v);
    }
    pub fn validated(&self) -> u32 {
        self.flags.get(FLAG_VALIDATED, 2)
    }
    pub fn set_repeat(&mut self, v: u32) {
        self.flags.set(FLAG_REPEAT, 2, v);
    }
    pub fn set_virtual_aid(&mut self, v: u32) {
        self.flags.set(FLAG_VIRTUAL_AID, 1, v);
    }
    pub fn virtual_aid(&self) -> bool {
        self.flags.get(FLAG_VIRTUAL_AID, 1) != 0
    }
    pub fn set_approximate(&mut self, v: u32) {
        self.flags.set(FLAG_APPROXIMATE, 1, v);
    }
    pub fn approximate(&self) -> bool {
        self.flags.get(FLAG_APPROXIMATE, 1) != 0
    }
    pub fn or_channels(&mut self, v: u32) {
        self.flags.or_op(FLAG_CHANNELS, 4, v);
    }
    pub fn channels(&self) -> u32 {
        self.flags.get(FLAG_CHANNELS, 4)
    }

    fn channels_string(&self) -> String {
        let mut s = String::new();
        for (i, c) in ['A', 'B', 'C', 'D'].iter().enumerate() {
            if self.channels() & (1 << i) != 0 {
                s.push(*c);
            }
        }
        s
    }

    fn mmsi_type_from_history(&self) -> i32 {
        if self.msg_type & BASESTATION_MASK != 0 {
            return MMSI_BASESTATION;
        }
        if self.msg_type & SAR_MASK != 0 || (111000000..=111999999).contains(&self.mmsi) {
            return MMSI_SAR;
        }
        if (970000000..=974999999).contains(&self.mmsi) {
            return MMSI_SARTEPIRB;
        }
        if self.msg_type & ATON_MASK != 0 || (990000000..=999999999).contains(&self.mmsi) {
            return MMSI_ATON;
        }
        if self.msg_type & (CLASS_A_MASK | CLASS_A_STATIC_MASK) != 0 {
            return MMSI_CLASS_A;
        }
        if self.msg_type & (CLASS_B_MASK | CLASS_B_STATIC_MASK) != 0
            || (980000000..=989999999).contains(&self.mmsi)
        {
            return MMSI_CLASS_B;
        }
        MMSI_OTHER
    }

    // ERI inland type codes (1500..1920, 8000..8510)
    fn ship_type_class_eri(&self) -> i32 {
        match self.shiptype {
            8000..=8070 | 1500..=1590 | 1600..=1800 => CLASS_CARGO,
            8080..=8380 => CLASS_TANKER,
            8400..=8439 => CLASS_SPECIAL,
            1810..=1840 => CLASS_PASSENGER,
            8440..=8510 | 1850..=1920 => CLASS_OTHER,
            _ => CLASS_UNKNOWN,
        }
    }

    fn ship_type_class(&self) -> i32 {
        match self.shiptype {
            30 => CLASS_FISHING,
            31 | 32 | 33 | 34 | 35 | 50..=59 => CLASS_SPECIAL,
            36 => CLASS_SAILING,
            37 => CLASS_B,
            40..=49 => CLASS_HIGHSPEED,
            60..=69 => CLASS_PASSENGER,
            70..=79 => CLASS_CARGO,
            80..=89 => CLASS_TANKER,
            90..=99 => CLASS_OTHER,
            _ => CLASS_UNKNOWN,
        }
    }

    /// Re-derive `mmsi_type` and the UI ship class from the accumulated
    /// message-type bitmap, the MMSI range and the reported ship type.
    /// Idempotent.
    pub fn set_type(&mut self) {
        self.mmsi_type = self.mmsi_type_from_history();

        self.shipclass = match self.mmsi_type {
            MMSI_BASESTATION => CLASS_STATION,
            MMSI_SAR => CLASS_SAR,
            MMSI_SARTEPIRB => CLASS_SARTEPIRB,
            MMSI_ATON => CLASS_ATON,
            _ => {
                let c = if (1500..=1920).contains(&self.shiptype)
                    || (8000..=8510).contains(&self.shiptype)
                {
                    self.ship_type_class_eri()
                } else {
                    self.ship_type_class()
                };
                if c == CLASS_UNKNOWN && self.mmsi_type == MMSI_CLASS_B {
                    CLASS_B
                } else {
                    c
                }
            }
        };
    }

    fn write_string(s: &str, w: &mut impl Write) -> std::io::Result<()> {
        let b = s.as_bytes();
        let n = b.len().min(255);
        w.write_u8(n as u8)?;
        w.write_all(&b[..n])
    }

    fn read_string(r: &mut impl Read) -> std::io::Result<String> {
        let n = r.read_u8()? as usize;
        let mut buf = vec![0u8; n];
        r.read_exact(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_u32::<BigEndian>(self.mmsi)?;
        w.write_f32::<BigEndian>(self.lat)?;
        w.write_f32::<BigEndian>(self.lon)?;
        w.write_f32::<BigEndian>(self.distance)?;
        w.write_i32::<BigEndian>(self.angle)?;
        w.write_f32::<BigEndian>(self.level)?;
        w.write_i32::<BigEndian>(self.count)?;
        w.write_f32::<BigEndian>(self.ppm)?;
        w.write_u64::<BigEndian>(self.group_mask)?;
        w.write_u64::<BigEndian>(self.last_group)?;
        w.write_u32::<BigEndian>(self.msg_type)?;
        w.write_u32::<BigEndian>(self.flags.packed())?;
        w.write_i32::<BigEndian>(self.shiptype)?;
        w.write_i32::<BigEndian>(self.mmsi_type)?;
        w.write_i32::<BigEndian>(self.shipclass)?;
        w.write_i32::<BigEndian>(self.heading)?;
        w.write_i32::<BigEndian>(self.status)?;
        w.write_i32::<BigEndian>(self.imo)?;
        w.write_i32::<BigEndian>(self.to_port)?;
        w.write_i32::<BigEndian>(self.to_bow)?;
        w.write_i32::<BigEndian>(self.to_starboard)?;
        w.write_i32::<BigEndian>(self.to_stern)?;
        w.write_i32::<BigEndian>(self.altitude)?;
        w.write_f32::<BigEndian>(self.speed)?;
        w.write_f32::<BigEndian>(self.cog)?;
        w.write_f32::<BigEndian>(self.draught)?;
        w.write_i8(self.month)?;
        w.write_i8(self.day)?;
        w.write_i8(self.hour)?;
        w.write_i8(self.minute)?;
        w.write_i64::<BigEndian>(self.last_signal)?;
        w.write_i64::<BigEndian>(self.last_direct_signal)?;
        Self::write_string(&self.shipname, w)?;
        Self::write_string(&self.destination, w)?;
        Self::write_string(&self.callsign, w)?;
        Self::write_string(&self.country_code, w)
    }

    pub fn read_from(r: &mut impl Read) -> std::io::Result<Ship> {
        let mut s = Ship::default();
        s.mmsi = r.read_u32::<BigEndian>()?;
        s.lat = r.read_f32::<BigEndian>()?;
        s.lon = r.read_f32::<BigEndian>()?;
        s.distance = r.read_f32::<BigEndian>()?;
        s.angle = r.read_i32::<BigEndian>()?;
        s.level = r.read_f32::<BigEndian>()?;
        s.count = r.read_i32::<BigEndian>()?;
        s.ppm = r.read_f32::<BigEndian>()?;
        s.group_mask = r.read_u64::<BigEndian>()?;
        s.last_group = r.read_u64::<BigEndian>()?;
        s.msg_type = r.read_u32::<BigEndian>()?;
        let flags = r.read_u32::<BigEndian>()?;
        s.flags.set_packed(flags);
        s.shiptype = r.read_i32::<BigEndian>()?;
        s.mmsi_type = r.read_i32::<BigEndian>()?;
        s.shipclass = r.read_i32::<BigEndian>()?;
        s.heading = r.read_i32::<BigEndian>()?;
        s.status = r.read_i32::<BigEndian>()?;
        s.imo = r.read_i32::<BigEndian>()?;
        s.to_port = r.read_i32::<BigEndian>()?;
        s.to_bow = r.read_i32::<BigEndian>()?;
        s.to_starboard = r.read_i32::<BigEndian>()?;
        s.to_stern = r.read_i32::<BigEndian>()?;
        s.altitude = r.read_i32::<BigEndian>()?;
        s.speed = r.read_f32::<BigEndian>()?;
        s.cog = r.read_f32::<BigEndian>()?;
        s.draught = r.read_f32::<BigEndian>()?;
        s.month = r.read_i8()?;
        s.day = r.read_i8()?;
        s.hour = r.read_i8()?;
        s.minute = r.read_i8()?;
        s.last_signal = r.read_i64::<BigEndian>()?;
        s.last_direct_signal = r.read_i64::<BigEndian>()?;
        s.shipname = Self::read_string(r)?;
        s.destination = Self::read_string(r)?;
        s.callsign = Self::read_string(r)?;
        s.country_code = Self::read_string(r)?;
        Ok(s)
    }

    fn to_json(&self, delta_time: i64) -> Value {
        let mut m = Map::new();
        m.insert("mmsi".into(), json!(self.mmsi));
        m.insert("count".into(), json!(self.count));
        m.insert("last_signal".into(), json!(delta_time));
        if self.lat != LAT_UNDEFINED {
            m.insert("lat".into(), json!(self.lat));
        }
        if self.lon != LON_UNDEFINED {
            m.insert("lon".into(), json!(self.lon));
        }
        if self.distance != DISTANCE_UNDEFINED {
            m.insert("distance".into(), json!(self.distance));
        }
        if self.angle != ANGLE_UNDEFINED {
            m.insert("bearing".into(), json!(self.angle));
        }
        if self.level != LEVEL_UNDEFINED {
            m.insert("level".into(), json!(self.level));
        }
        if self.ppm != PPM_UNDEFINED {
            m.insert("ppm".into(), json!(self.ppm));
        }
        if self.speed != SPEED_UNDEFINED {
            m.insert("speed".into(), json!(self.speed));
        }
        m.insert("cog".into(), json!(self.cog));
        m.insert("heading".into(), json!(self.heading));
        m.insert("status".into(), json!(self.status));
        m.insert("mmsi_type".into(), json!(self.mmsi_type));
        m.insert("shipclass".into(), json!(self.shipclass));
        m.insert("shiptype".into(), json!(self.shiptype));
        m.insert("msg_type".into(), json!(self.msg_type));
        m.insert("channels".into(), json!(self.channels_string()));
        m.insert("validated".into(), json!(self.validated()));
        m.insert("repeat".into(), json!(self.flags.get(FLAG_REPEAT, 2)));
        m.insert("approximate".into(), json!(self.approximate()));
        m.insert("country".into(), json!(self.country_code));
        if self.imo != 0 {
            m.insert("imo".into(), json!(self.imo));
        }
        if !self.shipname.is_empty() {
            m.insert("shipname".into(), json!(self.shipname));
        }
        if !self.callsign.is_empty() {
            m.insert("callsign".into(), json!(self.callsign));
        }
        if !self.destination.is_empty() {
            m.insert("destination".into(), json!(self.destination));
        }
        if self.draught != 0.0 {
            m.insert("draught".into(), json!(self.draught));
        }
        m.insert(
            "eta".into(),
            json!(format!(
                "{:02}-{:02}T{:02}:{:02}Z",
                self.month, self.day, self.hour, self.minute
            )),
        );
        m.insert("to_bow".into(), json!(self.to_bow));
        m.insert("to_stern".into(), json!(self.to_stern));
        m.insert("to_port".into(), json!(self.to_port));
        m.insert("to_starboard".into(), json!(self.to_starboard));
        if self.altitude != 0 {
            m.insert("alt".into(), json!(self.altitude));
        }
        Value::Object(m)
    }

    /// Compact array form; the field order is fixed and mirrored by the web
    /// front-end: [mmsi, lat, lon, distance, bearing, level, count, ppm,
    /// approximate, heading, cog, speed, shipclass, mmsi_type, validated,
    /// channels, last_signal].
    fn to_json_array(&self, delta_time: i64) -> Value {
        json!([
            self.mmsi,
            if self.lat != LAT_UNDEFINED {
                json!(self.lat)
            } else {
                Value::Null
            },
            if self.lon != LON_UNDEFINED {
                json!(self.lon)
            } else {
                Value::Null
            },
            if self.distance != DISTANCE_UNDEFINED {
                json!(self.distance)
            } else {
                Value::Null
            },
            if self.angle != ANGLE_UNDEFINED {
                json!(self.angle)
            } else {
                Value::Null
            },
            if self.level != LEVEL_UNDEFINED {
                json!(self.level)
            } else {
                Value::Null
            },
            self.count,
            if self.ppm != PPM_UNDEFINED {
                json!(self.ppm)
            } else {
                Value::Null
            },
            self.approximate(),
            self.heading,
            self.cog,
            if self.speed != SPEED_UNDEFINED {
                json!(self.speed)
            } else {
                Value::Null
            },
            self.shipclass,
            self.mmsi_type,
            self.validated(),
            self.channels_string(),
            delta_time
        ])
    }

    fn to_geojson(&self) -> Value {
        json!({
            "type": "Feature",
            "geometry": {
                "type": "Point",
                "coordinates": [self.lon, self.lat]
            },
            "properties": {
                "mmsi": self.mmsi,
                "shipname": self.shipname,
                "shipclass": self.shipclass,
                "speed": self.speed,
                "cog": self.cog,
                "heading": self.heading
            }
        })
    }

    fn to_kml(&self, out: &mut String) {
        if self.lat == LAT_UNDEFINED || self.lon == LON_UNDEFINED {
            return;
        }
        let name = if self.shipname.is_empty() {
            self.mmsi.to_string()
        } else {
            self.shipname.clone()
        };
        out.push_str("<Placemark><name>");
        out.push_str(&name.replace('&', "&amp;").replace('<', "&lt;"));
        out.push_str("</name><Point><coordinates>");
        out.push_str(&format!("{},{}", self.lon, self.lat));
        out.push_str("</coordinates></Point></Placemark>");
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PathPoint {
    pub lat: f32,
    pub lon: f32,
    pub mmsi: u32,
    pub count: i32,
    pub timestamp_start: i64,
    pub timestamp_end: i64,
    pub next: i32,
}

#[derive(Clone, Debug, Default)]
struct BinaryMessage {
    json: String,
    msg_type: i32,
    dac: i32,
    fi: i32,
    lat: f32,
    lon: f32,
    timestamp: i64,
    used: bool,
}

fn is_valid_coord(lat: f32, lon: f32) -> bool {
    !(lat == 0.0 && lon == 0.0)
        && lat != LAT_UNDEFINED
        && lon != LON_UNDEFINED
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
}

fn deg2rad(deg: f32) -> f32 {
    deg * std::f32::consts::PI / 180.0
}

fn rad2deg(rad: f32) -> i32 {
    ((360.0 + rad * 180.0 / std::f32::consts::PI) as i32) % 360
}

// https://www.movable-type.co.uk/scripts/latlong.html
fn distance_and_bearing(lat1: f32, lon1: f32, lat2: f32, lon2: f32) -> (f32, i32) {
    let (lat1, lon1) = (deg2rad(lat1), deg2rad(lon1));
    let (lat2, lon2) = (deg2rad(lat2), deg2rad(lon2));

    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let distance = 2.0 * EARTH_RADIUS_KM * NMI_PER_KM * a.sqrt().asin();

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    (distance, rad2deg(y.atan2(x)))
}

/// Bounded in-memory vessel database: a fixed arena of ships linked as an
/// MRU list plus a ring of clustered path points. Enriches the tag of every
/// message it forwards.
pub struct Database {
    first: i32,
    last: i32,
    count: i32,
    path_idx: usize,

    lat: f32,
    lon: f32,
    time_history: i64,
    latlon_share: bool,
    msg_save: bool,
    use_gps: bool,
    own_mmsi: u32,

    n_ships: usize,
    n_paths: usize,
    ships: Vec<Ship>,
    paths: Vec<PathPoint>,

    binary: Vec<BinaryMessage>,
    binary_idx: usize,

    pub out: Connection<AisJson>,
}

impl Database {
    pub fn new(server_mode: bool) -> Database {
        let scale = if server_mode { 32 } else { 1 };
        Database::with_capacity(4096 * scale, 4096 * 16 * scale)
    }

    pub fn with_capacity(n_ships: usize, n_paths: usize) -> Database {
        let mut db = Database {
            first: n_ships as i32 - 1,
            last: 0,
            count: 0,
            path_idx: 0,
            lat: LAT_UNDEFINED,
            lon: LON_UNDEFINED,
            time_history: 30 * 60,
            latlon_share: false,
            msg_save: false,
            use_gps: true,
            own_mmsi: 0,
            n_ships,
            n_paths,
            ships: vec![Ship::default(); n_ships],
            paths: vec![PathPoint::default(); n_paths],
            binary: vec![BinaryMessage::default(); MAX_BINARY_MESSAGES],
            binary_idx: 0,
            out: Connection::new(),
        };
        for (i, s) in db.ships.iter_mut().enumerate() {
            s.next = i as i32 - 1;
            s.prev = i as i32 + 1;
        }
        db.ships[n_ships - 1].prev = -1;
        db
    }

    pub fn set_lat_lon(&mut self, lat: f32, lon: f32) {
        self.lat = lat;
        self.lon = lon;
    }
    pub fn lat(&self) -> f32 {
        self.lat
    }
    pub fn lon(&self) -> f32 {
        self.lon
    }
    pub fn set_time_history(&mut self, t: i64) {
        self.time_history = t;
    }
    pub fn set_share_lat_lon(&mut self, b: bool) {
        self.latlon_share = b;
    }
    pub fn set_use_gps(&mut self, b: bool) {
        self.use_gps = b;
    }
    pub fn set_own_mmsi(&mut self, m: u32) {
        self.own_mmsi = m;
    }
    pub fn set_msg_save(&mut self, b: bool) {
        self.msg_save = b;
    }
    pub fn count(&self) -> i32 {
        self.count
    }
    pub fn max_count(&self) -> usize {
        self.n_ships
    }

    fn find_ship(&self, mmsi: u32) -> i32 {
        let mut ptr = self.first;
        let mut cnt = self.count;
        while ptr != -1 {
            cnt -= 1;
            if cnt < 0 {
                break;
            }
            if self.ships[ptr as usize].mmsi == mmsi {
                return ptr;
            }
            ptr = self.ships[ptr as usize].next;
        }
        -1
    }

    fn create_ship(&mut self) -> i32 {
        let ptr = self.last;
        self.count = (self.count + 1).min(self.n_ships as i32);
        self.ships[ptr as usize].reset();
        ptr
    }

    fn move_ship_to_front(&mut self, ptr: i32) {
        if ptr == self.first {
            return;
        }

        let (prev, next) = {
            let s = &self.ships[ptr as usize];
            (s.prev, s.next)
        };

        if next != -1 {
            self.ships[next as usize].prev = prev;
        } else {
            self.last = prev;
        }
        self.ships[prev as usize].next = next;

        self.ships[ptr as usize].next = self.first;
        self.ships[ptr as usize].prev = -1;
        self.ships[self.first as usize].prev = ptr;
        self.first = ptr;
    }

    fn is_next_path_point(&self, idx: i32, mmsi: u32, count: i32) -> bool {
        idx != -1 && self.paths[idx as usize].mmsi == mmsi && self.paths[idx as usize].count < count
    }

    fn add_to_path(&mut self, ptr: i32) {
        let ship = &self.ships[ptr as usize];
        let idx = ship.path_ptr;
        let lat = ship.lat;
        let lon = ship.lon;
        let count = ship.count;
        let mmsi = ship.mmsi;
        let timestamp = ship.last_signal;

        if self.is_next_path_point(idx, mmsi, count) {
            let i = idx as usize;
            // ship did not move: extend the head point in time
            if self.paths[i].lat == lat && self.paths[i].lon == lon {
                self.paths[i].count = count;
                self.paths[i].timestamp_end = timestamp;
                return;
            }
            // if the previous point clusters within ~100 m, update the head
            // in place instead of spending a new slot
            let next = self.paths[i].next;
            if self.is_next_path_point(next, mmsi, self.paths[i].count) {
                let lat_prev = self.paths[next as usize].lat;
                let lon_prev = self.paths[next as usize].lon;
                let d = (lat_prev - lat) * (lat_prev - lat) + (lon_prev - lon) * (lon_prev - lon);
                if d < 0.000001 {
                    self.paths[i].lat = lat;
                    self.paths[i].lon = lon;
                    self.paths[i].count = count;
                    self.paths[i].timestamp_end = timestamp;
                    return;
                }
            }
        }

        let p = self.path_idx;
        self.paths[p] = PathPoint {
            lat,
            lon,
            mmsi,
            count,
            timestamp_start: timestamp,
            timestamp_end: timestamp,
            next: idx,
        };
        self.ships[ptr as usize].path_ptr = p as i32;
        self.path_idx = (p + 1) % self.n_paths;
    }

    /// Apply one decoded field to the ship record, honoring the per-type
    /// update rules. Returns whether the position changed.
    fn update_field(
        key: &str,
        v: &Value,
        msg_type: u8,
        ship: &mut Ship,
        allow_approximate: bool,
    ) -> bool {
        let mut position_updated = false;
        match key {
            "lat" => {
                if msg_type != 8
                    && msg_type != 17
                    && (msg_type != 27 || allow_approximate || ship.approximate())
                {
                    ship.lat = v.as_f64().unwrap_or(LAT_UNDEFINED as f64) as f32;
                    position_updated = true;
                }
            }
            "lon" => {
                if msg_type != 8
                    && msg_type != 17
                    && (msg_type != 27 || allow_approximate || ship.approximate())
                {
                    ship.lon = v.as_f64().unwrap_or(LON_UNDEFINED as f64) as f32;
                    position_updated = true;
                }
            }
            "shiptype" => {
                let t = v.as_i64().unwrap_or(0) as i32;
                if t != 0 {
                    ship.shiptype = t;
                }
            }
            "imo" => ship.imo = v.as_i64().unwrap_or(0) as i32,
            "month" if msg_type == 5 => ship.month = v.as_i64().unwrap_or(0) as i8,
            "day" if msg_type == 5 => ship.day = v.as_i64().unwrap_or(0) as i8,
            "hour" if msg_type == 5 => ship.hour = v.as_i64().unwrap_or(0) as i8,
            "minute" if msg_type == 5 => ship.minute = v.as_i64().unwrap_or(0) as i8,
            "heading" => ship.heading = v.as_i64().unwrap_or(511) as i32,
            "draught" => {
                let d = v.as_f64().unwrap_or(0.0) as f32;
                if d != 0.0 {
                    ship.draught = d;
                }
            }
            "course" => ship.cog = v.as_f64().unwrap_or(360.0) as f32,
            "speed" => {
                if msg_type == 9 {
                    let s = v.as_i64().unwrap_or(1023);
                    if s != 1023 {
                        ship.speed = s as f32;
                    }
                } else {
                    let s = v.as_f64().unwrap_or(102.3) as f32;
                    if (s - 102.3).abs() > 1e-6 {
                        ship.speed = s;
                    }
                }
            }
            "status" => ship.status = v.as_i64().unwrap_or(15) as i32,
            "to_bow" => ship.to_bow = v.as_i64().unwrap_or(0) as i32,
            "to_stern" => ship.to_stern = v.as_i64().unwrap_or(0) as i32,
            "to_port" => ship.to_port = v.as_i64().unwrap_or(0) as i32,
            "to_starboard" => ship.to_starboard = v.as_i64().unwrap_or(0) as i32,
            "alt" => ship.altitude = v.as_i64().unwrap_or(0) as i32,
            "virtual_aid" => ship.set_virtual_aid(v.as_bool().unwrap_or(false) as u32),
            "cs" => ship.flags.set(FLAG_CS, 2, 1 + v.as_bool().unwrap_or(false) as u32),
            "raim" => ship.flags.set(FLAG_RAIM, 2, 1 + v.as_bool().unwrap_or(false) as u32),
            "dte" => ship.flags.set(FLAG_DTE, 2, 1 + v.as_bool().unwrap_or(false) as u32),
            "assigned" => ship
                .flags
                .set(FLAG_ASSIGNED, 2, 1 + v.as_bool().unwrap_or(false) as u32),
            "display" => ship
                .flags
                .set(FLAG_DISPLAY, 2, 1 + v.as_bool().unwrap_or(false) as u32),
            "dsc" => ship.flags.set(FLAG_DSC, 2, 1 + v.as_bool().unwrap_or(false) as u32),
            "band" => ship.flags.set(FLAG_BAND, 2, 1 + v.as_bool().unwrap_or(false) as u32),
            "msg22" => ship
                .flags
                .set(FLAG_MSG22, 2, 1 + v.as_bool().unwrap_or(false) as u32),
            "off_position" => {
                ship.flags
                    .set(FLAG_OFF_POSITION, 2, 1 + v.as_bool().unwrap_or(false) as u32)
            }
            "maneuver" => ship
                .flags
                .set(FLAG_MANEUVER, 2, v.as_i64().unwrap_or(0) as u32),
            "shipname" | "name" => {
                let mut s = v.as_str().unwrap_or("").to_string();
                s.truncate(20);
                if !s.is_empty() {
                    ship.shipname = s;
                }
            }
            "callsign" => {
                let mut s = v.as_str().unwrap_or("").to_string();
                s.truncate(7);
                ship.callsign = s;
            }
            "destination" => {
                let mut s = v.as_str().unwrap_or("").to_string();
                s.truncate(20);
                ship.destination = s;
            }
            _ => {}
        }
        position_updated
    }

    fn update_ship(&mut self, record: &AisJson, tag: &Tag, ptr: i32) -> bool {
        let msg = &record.msg;
        let msg_type = msg.msg_type();
        let own_mmsi = self.own_mmsi;
        let msg_save = self.msg_save;
        let mut own_position = None;
        let ship = &mut self.ships[ptr as usize];

        // a type 27 fix is approximate; accept it only when the last good
        // fix is older than the distance the ship could have covered
        // (~0.25 nmi), capped at 10 minutes
        let mut allow_approx = false;
        if msg_type == 27 {
            let mut timeout: i64 = 10 * 60;
            if ship.speed != SPEED_UNDEFINED && ship.speed != 0.0 {
                timeout = (0.25 / ship.speed * 3600.0) as i64;
                timeout = timeout.clamp(10, 10 * 60);
            }
            if msg.rxtime - ship.last_signal > timeout {
                allow_approx = true;
            }
        }

        ship.mmsi = msg.mmsi();
        ship.count += 1;
        ship.group_mask |= tag.group;
        ship.last_group = tag.group;
        ship.last_signal = msg.rxtime;

        if msg.repeat() == 0 {
            ship.last_direct_signal = ship.last_signal;
            ship.set_repeat(0);
        } else if ship.last_signal - ship.last_direct_signal > 60 {
            ship.set_repeat(1);
        }

        ship.ppm = tag.ppm;
        ship.level = tag.level;
        ship.msg_type |= 1 << msg_type;

        if ('A'..='D').contains(&msg.channel) {
            ship.or_channels(1 << (msg.channel as u8 - b'A'));
        }

        let mut position_updated = false;
        if let Some(obj) = record.value.as_object() {
            for (k, v) in obj {
                position_updated |= Self::update_field(k, v, msg_type, ship, allow_approx);
            }
        }

        ship.country_code = mid_country(ship.mmsi).unwrap_or("").to_string();
        ship.set_type();

        if position_updated {
            ship.set_approximate((msg_type == 27) as u32);

            if ship.mmsi == own_mmsi && own_mmsi != 0 {
                own_position = Some((ship.lat, ship.lon));
            }
        }

        if msg_save {
            ship.msg = record.value.to_string();
        }

        if let Some((lat, lon)) = own_position {
            self.lat = lat;
            self.lon = lon;
        }

        position_updated
    }

    /// Recent type 6 / type 8 application payloads kept for the front-end;
    /// only IMO289 meteo/hydro (dac 1, fi 31) is stored.
    fn process_binary_message(&mut self, record: &AisJson) {
        let msg_type = record.msg.msg_type() as i32;
        if msg_type != 6 && msg_type != 8 {
            return;
        }

        let obj = match record.value.as_object() {
            Some(o) => o,
            None => return,
        };
        let dac = obj.get("dac").and_then(|v| v.as_i64()).unwrap_or(-1) as i32;
        let fi = obj.get("fid").and_then(|v| v.as_i64()).unwrap_or(-1) as i32;

        if dac != 1 || fi != 31 {
            return;
        }

        let lat = obj.get("lat").and_then(|v| v.as_f64()).unwrap_or(LAT_UNDEFINED as f64) as f32;
        let lon = obj.get("lon").and_then(|v| v.as_f64()).unwrap_or(LON_UNDEFINED as f64) as f32;

        let slot = &mut self.binary[self.binary_idx];
        *slot = BinaryMessage {
            json: record.value.to_string(),
            msg_type,
            dac,
            fi,
            lat: if is_valid_coord(lat, lon) { lat } else { LAT_UNDEFINED },
            lon: if is_valid_coord(lat, lon) { lon } else { LON_UNDEFINED },
            timestamp: record.msg.rxtime,
            used: true,
        };
        self.binary_idx = (self.binary_idx + 1) % MAX_BINARY_MESSAGES;
    }

    /// Core update: find-or-create with MRU promotion, apply the message,
    /// maintain the path, enrich the tag and forward.
    pub fn process(&mut self, record: &AisJson, tag: &mut Tag) -> bool {
        let msg_type = record.msg.msg_type();
        if !(1..=27).contains(&msg_type) || record.msg.mmsi() == 0 {
            return false;
        }

        let mut ptr = self.find_ship(record.msg.mmsi());
        let new_vessel = ptr == -1;
        if new_vessel {
            ptr = self.create_ship();
        }
        self.move_ship_to_front(ptr);

        tag.previous_signal = self.ships[ptr as usize].last_signal;
        let lat_old = self.ships[ptr as usize].lat;
        let lon_old = self.ships[ptr as usize].lon;

        let mut position_updated = self.update_ship(record, tag, ptr);
        {
            let ship = &self.ships[ptr as usize];
            position_updated &= is_valid_coord(ship.lat, ship.lon);
        }

        if matches!(msg_type, 1 | 2 | 3 | 9 | 18 | 19) {
            self.add_to_path(ptr);
        }
        if msg_type == 6 || msg_type == 8 {
            self.process_binary_message(record);
        }

        let (station_lat, station_lon) = (self.lat, self.lon);
        let station_valid = is_valid_coord(station_lat, station_lon);
        let ship = &mut self.ships[ptr as usize];

        if position_updated && station_valid {
            let (d, b) = distance_and_bearing(station_lat, station_lon, ship.lat, ship.lon);
            ship.distance = d;
            ship.angle = b;
            tag.distance = d;
            tag.angle = b;
        } else {
            tag.distance = DISTANCE_UNDEFINED;
            tag.angle = ANGLE_UNDEFINED;
        }

        if position_updated {
            tag.lat = ship.lat;
            tag.lon = ship.lon;
        } else if is_valid_coord(lat_old, lon_old) {
            tag.lat = lat_old;
            tag.lon = lon_old;
        } else {
            tag.lat = 0.0;
            tag.lon = 0.0;
        }

        tag.shipclass = ship.shipclass;
        tag.speed = ship.speed;
        tag.shipname = ship.shipname.clone();

        if position_updated && is_valid_coord(lat_old, lon_old) {
            // flat earth approximation, roughly 10 nmi jump bound
            let d = (ship.lat - lat_old) * (ship.lat - lat_old)
                + (ship.lon - lon_old) * (ship.lon - lon_old);
            tag.validated = d < 0.1675;
            ship.set_validated(if tag.validated { 1 } else { 2 });
        } else {
            tag.validated = false;
        }

        new_vessel
    }

    // ---- queries; callers hold the database mutex ----

    pub fn get_ship_json(&self, mmsi: u32) -> String {
        let ptr = self.find_ship(mmsi);
        if ptr == -1 {
            return "{}".to_string();
        }
        let ship = &self.ships[ptr as usize];
        let delta = Utc::now().timestamp() - ship.last_signal;
        ship.to_json(delta).to_string()
    }

    pub fn get_json(&self, full: bool) -> String {
        let now = Utc::now().timestamp();
        let mut ships = Vec::new();

        let mut ptr = self.first;
        while ptr != -1 {
            let ship = &self.ships[ptr as usize];
            if ship.mmsi != 0 {
                let delta = now - ship.last_signal;
                if !full && delta > self.time_history {
                    break;
                }
                ships.push(ship.to_json(delta));
            }
            ptr = self.ships[ptr as usize].next;
        }

        let mut m = Map::new();
        m.insert("count".into(), json!(self.count));
        if self.latlon_share && is_valid_coord(self.lat, self.lon) {
            m.insert(
                "station".into(),
                json!({"lat": self.lat, "lon": self.lon, "mmsi": self.own_mmsi}),
            );
        }
        m.insert("ships".into(), json!(ships));
        m.insert("error".into(), json!(false));
        Value::Object(m).to_string()
    }

    pub fn get_json_compact(&self, full: bool) -> String {
        let now = Utc::now().timestamp();
        let mut values = Vec::new();

        let mut ptr = self.first;
        while ptr != -1 {
            let ship = &self.ships[ptr as usize];
            if ship.mmsi != 0 {
                let delta = now - ship.last_signal;
                if !full && delta > self.time_history {
                    break;
                }
                values.push(ship.to_json_array(delta));
            }
            ptr = self.ships[ptr as usize].next;
        }

        let mut m = Map::new();
        m.insert("count".into(), json!(self.count));
        if self.latlon_share && is_valid_coord(self.lat, self.lon) {
            m.insert(
                "station".into(),
                json!({"lat": self.lat, "lon": self.lon, "mmsi": self.own_mmsi}),
            );
        }
        m.insert("values".into(), json!(values));
        m.insert("error".into(), json!(false));
        Value::Object(m).to_string()
    }

    pub fn get_geojson(&self) -> String {
        let now = Utc::now().timestamp();
        let mut features = Vec::new();

        let mut ptr = self.first;
        while ptr != -1 {
            let ship = &self.ships[ptr as usize];
            if ship.mmsi != 0 {
                if now - ship.last_signal > self.time_history {
                    break;
                }
                if is_valid_coord(ship.lat, ship.lon) {
                    features.push(ship.to_geojson());
                }
            }
            ptr = self.ships[ptr as usize].next;
        }

        json!({
            "type": "FeatureCollection",
            "time_span": self.time_history,
            "features": features
        })
        .to_string()
    }

    pub fn get_kml(&self) -> String {
        let now = Utc::now().timestamp();
        let mut s = String::from(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><kml xmlns=\"http://www.opengis.net/kml/2.2\"><Document>",
        );
        let mut ptr = self.first;
        while ptr != -1 {
            let ship = &self.ships[ptr as usize];
            if ship.mmsi != 0 {
                if now - ship.last_signal > self.time_history {
                    break;
                }
                ship.to_kml(&mut s);
            }
            ptr = self.ships[ptr as usize].next;
        }
        s.push_str("</Document></kml>");
        s
    }

    fn single_path(&self, idx: i32) -> Vec<Value> {
        let mmsi = self.ships[idx as usize].mmsi;
        let mut ptr = self.ships[idx as usize].path_ptr;
        let mut t = self.ships[idx as usize].count + 1;

        let mut points = Vec::new();
        while self.is_next_path_point(ptr, mmsi, t) {
            let p = &self.paths[ptr as usize];
            if is_valid_coord(p.lat, p.lon) {
                points.push(json!([p.lat, p.lon, p.timestamp_start, p.timestamp_end]));
            }
            t = p.count;
            ptr = p.next;
        }
        points
    }

    pub fn get_path_json(&self, mmsi: u32) -> String {
        let idx = self.find_ship(mmsi);
        if idx == -1 {
            return "[]".to_string();
        }
        json!(self.single_path(idx)).to_string()
    }

    pub fn get_all_path_json(&self) -> String {
        let now = Utc::now().timestamp();
        let mut m = Map::new();

        let mut ptr = self.first;
        while ptr != -1 {
            let ship = &self.ships[ptr as usize];
            if ship.mmsi != 0 {
                if now - ship.last_signal > self.time_history {
                    break;
                }
                m.insert(ship.mmsi.to_string(), json!(self.single_path(ptr)));
            }
            ptr = self.ships[ptr as usize].next;
        }
        Value::Object(m).to_string()
    }

    pub fn get_path_geojson(&self, mmsi: u32) -> String {
        let idx = self.find_ship(mmsi);
        if idx == -1 {
            return json!({
                "type": "Feature",
                "geometry": {"type": "LineString", "coordinates": []},
                "properties": {"mmsi": mmsi}
            })
            .to_string();
        }

        let mut coordinates = Vec::new();
        let mut ts_start = Vec::new();
        let mut ts_end = Vec::new();

        let ship = &self.ships[idx as usize];
        let mut ptr = ship.path_ptr;
        let mut t = ship.count + 1;
        while self.is_next_path_point(ptr, mmsi, t) {
            let p = &self.paths[ptr as usize];
            if is_valid_coord(p.lat, p.lon) {
                // GeoJSON wants [longitude, latitude]
                coordinates.push(json!([p.lon, p.lat]));
                ts_start.push(p.timestamp_start);
                ts_end.push(p.timestamp_end);
            }
            t = p.count;
            ptr = p.next;
        }

        json!({
            "type": "Feature",
            "geometry": {"type": "LineString", "coordinates": coordinates},
            "properties": {
                "mmsi": mmsi,
                "timestamps_start": ts_start,
                "timestamps_end": ts_end
            }
        })
        .to_string()
    }

    pub fn get_message(&self, mmsi: u32) -> String {
        let ptr = self.find_ship(mmsi);
        if ptr == -1 {
            return String::new();
        }
        self.ships[ptr as usize].msg.clone()
    }

    pub fn get_binary_messages_json(&self) -> String {
        let now = Utc::now().timestamp();
        let mut out = Vec::new();

        let start = (self.binary_idx + MAX_BINARY_MESSAGES - 1) % MAX_BINARY_MESSAGES;
        for i in 0..MAX_BINARY_MESSAGES {
            let idx = (start + MAX_BINARY_MESSAGES - i) % MAX_BINARY_MESSAGES;
            let msg = &self.binary[idx];
            if !msg.used || now - msg.timestamp > self.time_history {
                continue;
            }
            out.push(json!({
                "type": msg.msg_type,
                "dac": msg.dac,
                "fi": msg.fi,
                "timestamp": msg.timestamp,
                "message": serde_json::from_str::<Value>(&msg.json).unwrap_or(Value::Null)
            }));
        }
        json!(out).to_string()
    }

    /// Binary snapshot for the length-prefixed high-throughput protocol.
    pub fn get_binary(&self, v: &mut Vec<u8>) {
        let _ = v.write_u64::<BigEndian>(Utc::now().timestamp() as u64);
        let _ = v.write_i32::<BigEndian>(self.count);

        if self.latlon_share && is_valid_coord(self.lat, self.lon) {
            let _ = v.write_i8(1);
            let _ = v.write_i32::<BigEndian>((self.lat * 6000000.0) as i32);
            let _ = v.write_i32::<BigEndian>((self.lon * 6000000.0) as i32);
            let _ = v.write_u32::<BigEndian>(self.own_mmsi);
        } else {
            let _ = v.write_i8(0);
        }

        let mut ptr = self.first;
        while ptr != -1 {
            let ship = &self.ships[ptr as usize];
            if ship.mmsi != 0 {
                let _ = ship.write_to(v);
            }
            ptr = self.ships[ptr as usize].next;
        }
    }

    /// Persist the database: magic, version, count, ships oldest first.
    pub fn save(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_i32::<BigEndian>(DB_MAGIC)?;
        w.write_i32::<BigEndian>(DB_VERSION)?;
        w.write_i32::<BigEndian>(self.count)?;

        // find the tail of the active list, then walk back to front
        let mut ptr = self.first;
        for _ in 1..self.count {
            if ptr == -1 {
                break;
            }
            ptr = self.ships[ptr as usize].next;
        }

        let mut written = 0;
        while written < self.count && ptr != -1 {
            self.ships[ptr as usize].write_to(w)?;
            ptr = self.ships[ptr as usize].prev;
            written += 1;
        }

        info!("DB: saved {} ships to backup", written);
        Ok(())
    }

    /// Restore from a backup stream. On a format error the database is left
    /// empty; ships must be stored oldest first.
    pub fn load(&mut self, r: &mut impl Read) -> std::io::Result<bool> {
        let magic = r.read_i32::<BigEndian>()?;
        let version = r.read_i32::<BigEndian>()?;
        if magic != DB_MAGIC || version != DB_VERSION {
            warn!(
                "DB: invalid backup file format, magic {:x} version {}",
                magic, version
            );
            return Ok(false);
        }

        let ship_count = r.read_i32::<BigEndian>()?;
        if ship_count < 0 || ship_count > self.n_ships as i32 {
            warn!("DB: invalid ship count in backup file: {}", ship_count);
            return Ok(false);
        }

        let mut previous_signal = 0i64;
        for i in 0..ship_count {
            let temp = Ship::read_from(r)?;

            if i > 0 && temp.last_signal < previous_signal {
                warn!("DB: ships not in chronological order at index {}", i);
                return Ok(false);
            }
            previous_signal = temp.last_signal;

            let mut ptr = self.find_ship(temp.mmsi);
            if ptr == -1 {
                ptr = self.create_ship();
            }
            self.move_ship_to_front(ptr);

            let next = self.ships[ptr as usize].next;
            let prev = self.ships[ptr as usize].prev;
            self.ships[ptr as usize] = temp;
            self.ships[ptr as usize].next = next;
            self.ships[ptr as usize].prev = prev;
        }

        info!("DB: restored {} ships from backup", ship_count);
        Ok(true)
    }

    #[cfg(test)]
    fn mmsi_list(&self) -> Vec<u32> {
        let mut out = Vec::new();
        let mut ptr = self.first;
        let mut cnt = self.count;
        while ptr != -1 && cnt > 0 {
            out.push(self.ships[ptr as usize].mmsi);
            ptr = self.ships[ptr as usize].next;
            cnt -= 1;
        }
        out
    }
}

impl StreamIn<AisJson> for Database {
    fn receive(&mut self, data: &[AisJson], tag: &mut Tag) {
        for record in data {
            self.process(record, tag);
        }
        self.out.send(data, tag);
    }
}

impl StreamIn<Gps> for Database {
    fn receive(&mut self, data: &[Gps], _tag: &mut Tag) {
        if self.use_gps {
            if let Some(g) = data.first() {
                self.lat = g.lat;
                self.lon = g.lon;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ais::{armour_char, Message};
    use crate::jsonais::jsonify;

    /// Build a message of the given type with a position, by assembling the
    /// payload bits the way an encoder would.
    fn position_report(msg_type: u8, mmsi: u32, lat: f64, lon: f64, rxtime: i64) -> AisJson {
        let mut bits: Vec<u8> = Vec::new();
        let mut push = |v: u64, n: usize, bits: &mut Vec<u8>| {
            for i in (0..n).rev() {
                bits.push(((v >> i) & 1) as u8);
            }
        };
        push(msg_type as u64, 6, &mut bits);
        push(0, 2, &mut bits); // repeat
        push(mmsi as u64, 30, &mut bits); // mmsi
        if msg_type == 27 {
            push(0, 2, &mut bits); // accuracy + raim
            push(0, 4, &mut bits); // status
            push(((lon * 600.0) as i64 & 0x3FFFF) as u64, 18, &mut bits);
            push(((lat * 600.0) as i64 & 0x1FFFF) as u64, 17, &mut bits);
            while bits.len() < 96 {
                bits.push(0);
            }
        } else {
            push(0, 4, &mut bits); // status
            push(128u64, 8, &mut bits); // turn n/a
            push(50, 10, &mut bits); // speed 5.0kn
            push(0, 1, &mut bits); // accuracy
            push(((lon * 600000.0) as i64 & 0xFFFFFFF) as u64, 28, &mut bits);
            push(((lat * 600000.0) as i64 & 0x7FFFFFF) as u64, 27, &mut bits);
            while bits.len() < 168 {
                bits.push(0);
            }
        }
        while bits.len() % 6 != 0 {
            bits.push(0);
        }

        let mut m = Message::new();
        let payload: String = bits
            .chunks(6)
            .map(|c| {
                let mut v = 0u8;
                for (i, b) in c.iter().enumerate() {
                    v |= b << (5 - i);
                }
                armour_char(v)
            })
            .collect();
        for c in payload.chars() {
            m.append_letter(c);
        }
        m.channel = 'A';
        m.rxtime = rxtime;
        let value = jsonify(&m, &Tag::default());
        AisJson { msg: m, value }
    }

    #[test]
    fn test_receive_creates_and_promotes() {
        let mut db = Database::with_capacity(4, 16);
        db.set_lat_lon(52.0, 4.0);
        let mut tag = Tag::default();

        let new1 = db.process(&position_report(1, 244660000, 52.1, 4.1, 1000), &mut tag);
        assert!(new1);
        assert_eq!(db.count(), 1);
        assert_eq!(db.mmsi_list(), vec![244660000]);

        db.process(&position_report(1, 257000000, 59.0, 10.0, 1001), &mut tag);
        assert_eq!(db.mmsi_list(), vec![257000000, 244660000]);

        // repeated message promotes, does not duplicate
        let new2 = db.process(&position_report(1, 244660000, 52.2, 4.2, 1002), &mut tag);
        assert!(!new2);
        assert_eq!(db.count(), 2);
        assert_eq!(db.mmsi_list(), vec![244660000, 257000000]);
        assert_eq!(db.ships[db.first as usize].count, 2);
    }

    #[test]
    fn test_mru_eviction_no_duplicates() {
        let mut db = Database::with_capacity(3, 16);
        let mut tag = Tag::default();

        for (i, mmsi) in [201000001u32, 201000002, 201000003, 201000004]
            .iter()
            .enumerate()
        {
            db.process(
                &position_report(1, *mmsi, 52.0 + i as f64, 4.0, 1000 + i as i64),
                &mut tag,
            );
        }

        assert_eq!(db.count(), 3);
        let list = db.mmsi_list();
        assert_eq!(list, vec![201000004, 201000003, 201000002]);
        // evicted mmsi is gone
        assert_eq!(db.find_ship(201000001), -1);
    }

    #[test]
    fn test_tag_enrichment_distance() {
        let mut db = Database::with_capacity(4, 16);
        db.set_lat_lon(52.0, 4.0);
        let mut tag = Tag::default();

        db.process(&position_report(1, 244660000, 53.0, 4.0, 1000), &mut tag);
        // one degree of latitude is 60 nmi
        assert!((tag.distance - 60.0).abs() < 1.0, "distance {}", tag.distance);
        assert!(tag.angle == 0 || tag.angle == 359 || tag.angle == 1);
        assert_eq!(tag.lat, 53.0);
    }

    #[test]
    fn test_path_clustering() {
        let mut db = Database::with_capacity(4, 16);
        let mut tag = Tag::default();
        let mmsi = 244660000;

        // identical position: timestamp extended, single point
        db.process(&position_report(1, mmsi, 52.0, 4.0, 1000), &mut tag);
        db.process(&position_report(1, mmsi, 52.0, 4.0, 1010), &mut tag);
        let idx = db.find_ship(mmsi);
        let head = db.ships[idx as usize].path_ptr;
        assert_eq!(db.single_path(idx).len(), 1);
        assert_eq!(db.paths[head as usize].timestamp_end, 1010);
        assert_eq!(db.paths[head as usize].timestamp_start, 1000);

        // small move within the cluster radius coalesces into the head
        db.process(&position_report(1, mmsi, 52.0004, 4.0004, 1020), &mut tag);
        assert_eq!(db.single_path(idx).len(), 2);
        db.process(&position_report(1, mmsi, 52.0006, 4.0006, 1030), &mut tag);
        assert_eq!(db.single_path(idx).len(), 2);

        // a 2 km jump creates a fresh point
        db.process(&position_report(1, mmsi, 52.02, 4.0, 1040), &mut tag);
        assert_eq!(db.single_path(idx).len(), 3);
    }

    #[test]
    fn test_type27_position_rules() {
        let mut db = Database::with_capacity(4, 16);
        let mut tag = Tag::default();
        let mmsi = 244660000;

        // fresh accurate fix at t=1000
        db.process(&position_report(1, mmsi, 52.0, 4.0, 1000), &mut tag);

        // type 27 seconds later: fix is fresh, must not overwrite
        db.process(&position_report(27, mmsi, 53.0, 5.0, 1010), &mut tag);
        let idx = db.find_ship(mmsi) as usize;
        assert!((db.ships[idx].lat - 52.0).abs() < 1e-3);

        // type 27 after the timeout: accepted, ship marked approximate
        db.process(&position_report(27, mmsi, 53.0, 5.0, 1010 + 700), &mut tag);
        let idx = db.find_ship(mmsi) as usize;
        assert!((db.ships[idx].lat - 53.0).abs() < 1e-2);
        assert!(db.ships[idx].approximate());

        // an accurate report takes over again and clears the flag
        db.process(&position_report(1, mmsi, 52.5, 4.5, 2000), &mut tag);
        let idx = db.find_ship(mmsi) as usize;
        assert!((db.ships[idx].lat - 52.5).abs() < 1e-3);
        assert!(!db.ships[idx].approximate());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut db = Database::with_capacity(8, 32);
        let mut tag = Tag::default();
        db.process(&position_report(1, 244660000, 52.0, 4.0, 1000), &mut tag);
        db.process(&position_report(1, 257000000, 59.0, 10.0, 2000), &mut tag);
        db.process(&position_report(1, 636015000, 1.0, 104.0, 3000), &mut tag);

        let mut buf = Vec::new();
        db.save(&mut buf).unwrap();

        let mut restored = Database::with_capacity(8, 32);
        let ok = restored
            .load(&mut std::io::Cursor::new(&buf))
            .unwrap();
        assert!(ok);
        assert_eq!(restored.count(), 3);
        assert_eq!(restored.mmsi_list(), db.mmsi_list());

        let idx = restored.find_ship(257000000) as usize;
        assert_eq!(restored.ships[idx].country_code, "NO");
        assert!((restored.ships[idx].lat - 59.0).abs() < 1e-4);
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(0x12345678).unwrap();
        buf.write_i32::<BigEndian>(DB_VERSION).unwrap();
        buf.write_i32::<BigEndian>(0).unwrap();

        let mut db = Database::with_capacity(4, 16);
        assert!(!db.load(&mut std::io::Cursor::new(&buf)).unwrap());
        assert_eq!(db.count(), 0);
    }

    #[test]
    fn test_set_type_idempotent() {
        let mut ship = Ship {
            mmsi: 244660000,
            msg_type: 1 << 18,
            shiptype: 37,
            ..Ship::default()
        };
        ship.set_type();
        let (t1, c1) = (ship.mmsi_type, ship.shipclass);
        ship.set_type();
        assert_eq!((ship.mmsi_type, ship.shipclass), (t1, c1));
        assert_eq!(ship.mmsi_type, MMSI_CLASS_B);
        assert_eq!(ship.shipclass, CLASS_B);
    }

    #[test]
    fn test_distance_bearing() {
        // due east along the equator
        let (d, b) = distance_and_bearing(0.0, 0.0, 0.0, 1.0);
        assert!((d - 60.0).abs() < 0.2, "distance {}", d);
        assert_eq!(b, 90);
    }
}
