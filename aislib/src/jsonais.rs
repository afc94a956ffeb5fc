use serde_json::{json, Map, Value};

use crate::ais::Message;
use crate::stream::{Connection, StreamIn, Tag, TAG_MODE_SIGNAL, TAG_MODE_STATION, TAG_MODE_TIME};

/// A decoded message travelling with its JSON form. Downstream consumers
/// pick whichever side they need; the pair avoids a back-reference from the
/// JSON tree into a message arena.
#[derive(Clone, Debug)]
pub struct AisJson {
    pub msg: Message,
    pub value: Value,
}

pub fn status_text(status: u64) -> &'static str {
    match status {
        0 => "Under way using engine",
        1 => "At anchor",
        2 => "Not under command",
        3 => "Restricted manoeuverability",
        4 => "Constrained by her draught",
        5 => "Moored",
        6 => "Aground",
        7 => "Engaged in Fishing",
        8 => "Under way sailing",
        9 => "Reserved for future amendment of Navigational Status for HSC",
        10 => "Reserved for future amendment of Navigational Status for WIG",
        14 => "AIS-SART is active",
        _ => "Undefined",
    }
}

pub fn shiptype_text(t: u64) -> &'static str {
    match t {
        20..=29 => "Wing in ground",
        30 => "Fishing",
        31 | 32 => "Towing",
        33 => "Dredging or underwater ops",
        34 => "Diving ops",
        35 => "Military ops",
        36 => "Sailing",
        37 => "Pleasure Craft",
        40..=49 => "High speed craft",
        50 => "Pilot Vessel",
        51 => "Search and Rescue vessel",
        52 => "Tug",
        53 => "Port Tender",
        54 => "Anti-pollution equipment",
        55 => "Law Enforcement",
        58 => "Medical Transport",
        59 => "Noncombatant ship",
        60..=69 => "Passenger",
        70..=79 => "Cargo",
        80..=89 => "Tanker",
        90..=99 => "Other Type",
        _ => "Not available",
    }
}

pub fn epfd_text(e: u64) -> &'static str {
    match e {
        1 => "GPS",
        2 => "GLONASS",
        3 => "Combined GPS/GLONASS",
        4 => "Loran-C",
        5 => "Chayka",
        6 => "Integrated navigation system",
        7 => "Surveyed",
        8 => "Galileo",
        _ => "Undefined",
    }
}

pub fn aid_type_text(t: u64) -> &'static str {
    match t {
        1 => "Reference point",
        2 => "RACON",
        3 => "Fixed structure off shore",
        5 => "Light, without sectors",
        6 => "Light, with sectors",
        7 => "Leading Light Front",
        8 => "Leading Light Rear",
        9 => "Beacon, Cardinal N",
        10 => "Beacon, Cardinal E",
        11 => "Beacon, Cardinal S",
        12 => "Beacon, Cardinal W",
        13 => "Beacon, Port hand",
        14 => "Beacon, Starboard hand",
        15 => "Beacon, Preferred Channel port hand",
        16 => "Beacon, Preferred Channel starboard hand",
        17 => "Beacon, Isolated danger",
        18 => "Beacon, Safe water",
        19 => "Beacon, Special mark",
        20 => "Cardinal Mark N",
        21 => "Cardinal Mark E",
        22 => "Cardinal Mark S",
        23 => "Cardinal Mark W",
        24 => "Port hand Mark",
        25 => "Starboard hand Mark",
        26 => "Preferred Channel Port hand",
        27 => "Preferred Channel Starboard hand",
        28 => "Isolated danger",
        29 => "Safe Water",
        30 => "Special Mark",
        31 => "Light Vessel / LANBY / Rigs",
        _ => "Unspecified",
    }
}

// field helpers: unsigned, scaled, signed-scaled, bool, text

fn u(map: &mut Map<String, Value>, key: &str, m: &Message, start: usize, len: usize) {
    map.insert(key.to_string(), json!(m.getu(start, len)));
}

fn ul(map: &mut Map<String, Value>, key: &str, m: &Message, start: usize, len: usize, a: f64) {
    map.insert(key.to_string(), json!(m.getu(start, len) as f64 * a));
}

fn s(map: &mut Map<String, Value>, key: &str, m: &Message, start: usize, len: usize) {
    map.insert(key.to_string(), json!(m.gets(start, len)));
}

fn sl(map: &mut Map<String, Value>, key: &str, m: &Message, start: usize, len: usize, a: f64) {
    map.insert(key.to_string(), json!(m.gets(start, len) as f64 * a));
}

fn b(map: &mut Map<String, Value>, key: &str, m: &Message, start: usize) {
    map.insert(key.to_string(), json!(m.getb(start)));
}

fn t(map: &mut Map<String, Value>, key: &str, m: &Message, start: usize, chars: usize) {
    map.insert(key.to_string(), json!(m.gett(start, chars)));
}

fn position(map: &mut Map<String, Value>, m: &Message, lon_start: usize, lat_start: usize) {
    sl(map, "lon", m, lon_start, 28, 1.0 / 600000.0);
    sl(map, "lat", m, lat_start, 27, 1.0 / 600000.0);
}

fn course_and_heading(map: &mut Map<String, Value>, m: &Message, course: usize, heading: usize) {
    ul(map, "course", m, course, 12, 0.1);
    u(map, "heading", m, heading, 9);
}

fn dimensions(map: &mut Map<String, Value>, m: &Message, start: usize) {
    u(map, "to_bow", m, start, 9);
    u(map, "to_stern", m, start + 9, 9);
    u(map, "to_port", m, start + 18, 6);
    u(map, "to_starboard", m, start + 24, 6);
}

fn eta(map: &mut Map<String, Value>, m: &Message, start: usize) {
    let month = m.getu(start, 4);
    let day = m.getu(start + 4, 5);
    let hour = m.getu(start + 9, 5);
    let minute = m.getu(start + 14, 6);
    map.insert("month".to_string(), json!(month));
    map.insert("day".to_string(), json!(day));
    map.insert("hour".to_string(), json!(hour));
    map.insert("minute".to_string(), json!(minute));
    map.insert(
        "eta".to_string(),
        json!(format!("{:02}-{:02}T{:02}:{:02}Z", month, day, hour, minute)),
    );
}

/// Application payloads the station understands: IMO289 meteo/hydro
/// (dac 1, fi 31) carries a coarse position.
fn binary_payload(map: &mut Map<String, Value>, m: &Message, start: usize) {
    let dac = m.getu(start, 10);
    let fi = m.getu(start + 10, 6);
    map.insert("dac".to_string(), json!(dac));
    map.insert("fid".to_string(), json!(fi));

    if dac == 1 && fi == 31 && m.len_bits() >= start + 16 + 49 {
        let p = start + 16;
        sl(map, "lon", m, p, 25, 1.0 / 60000.0);
        sl(map, "lat", m, p + 25, 24, 1.0 / 60000.0);
        u(map, "wspeed", m, p + 50, 7);
        u(map, "wdir", m, p + 64, 9);
    }
}

/// Build the JSON object for a decoded message: envelope metadata governed
/// by the tag mode bits, then the per-type field schema.
pub fn jsonify(m: &Message, tag: &Tag) -> Value {
    let mut map = Map::new();

    map.insert("class".to_string(), json!("AIS"));
    map.insert("device".to_string(), json!("AIS-catcher"));
    map.insert("scaled".to_string(), json!(true));

    if m.channel != '?' {
        map.insert("channel".to_string(), json!(m.channel.to_string()));
    }
    if tag.mode & TAG_MODE_TIME != 0 {
        map.insert("rxtime".to_string(), json!(m.rxtime_string()));
    }
    map.insert("rxuxtime".to_string(), json!(m.rxtime));
    if tag.mode & TAG_MODE_SIGNAL != 0 {
        map.insert("signalpower".to_string(), json!(tag.level));
        map.insert("ppm".to_string(), json!(tag.ppm));
    }
    if tag.mode & TAG_MODE_STATION != 0 {
        map.insert("station_id".to_string(), json!(m.station));
    }
    map.insert("nmea".to_string(), json!(m.nmea));

    let msg_type = m.msg_type() as u64;
    map.insert("type".to_string(), json!(msg_type));
    map.insert("repeat".to_string(), json!(m.repeat()));
    map.insert("mmsi".to_string(), json!(m.mmsi()));
    if let Some(cc) = crate::db::mid_country(m.mmsi()) {
        map.insert("country_code".to_string(), json!(cc));
    }

    match msg_type {
        1 | 2 | 3 => {
            let status = m.getu(38, 4);
            map.insert("status".to_string(), json!(status));
            map.insert("status_text".to_string(), json!(status_text(status)));
            s(&mut map, "turn", m, 42, 8);
            ul(&mut map, "speed", m, 50, 10, 0.1);
            b(&mut map, "accuracy", m, 60);
            position(&mut map, m, 61, 89);
            course_and_heading(&mut map, m, 116, 128);
            u(&mut map, "second", m, 137, 6);
            u(&mut map, "maneuver", m, 143, 2);
            b(&mut map, "raim", m, 148);
            u(&mut map, "radio", m, 149, 19);
        }
        4 | 11 => {
            u(&mut map, "year", m, 38, 14);
            u(&mut map, "month", m, 52, 4);
            u(&mut map, "day", m, 56, 5);
            u(&mut map, "hour", m, 61, 5);
            u(&mut map, "minute", m, 66, 6);
            u(&mut map, "second", m, 72, 6);
            b(&mut map, "accuracy", m, 78);
            position(&mut map, m, 79, 107);
            let epfd = m.getu(134, 4);
            map.insert("epfd".to_string(), json!(epfd));
            map.insert("epfd_text".to_string(), json!(epfd_text(epfd)));
            b(&mut map, "raim", m, 148);
            u(&mut map, "radio", m, 149, 19);
        }
        5 => {
            u(&mut map, "ais_version", m, 38, 2);
            u(&mut map, "imo", m, 40, 30);
            t(&mut map, "callsign", m, 70, 7);
            t(&mut map, "shipname", m, 112, 20);
            let st = m.getu(232, 8);
            map.insert("shiptype".to_string(), json!(st));
            map.insert("shiptype_text".to_string(), json!(shiptype_text(st)));
            dimensions(&mut map, m, 240);
            let epfd = m.getu(270, 4);
            map.insert("epfd".to_string(), json!(epfd));
            map.insert("epfd_text".to_string(), json!(epfd_text(epfd)));
            eta(&mut map, m, 274);
            ul(&mut map, "draught", m, 294, 8, 0.1);
            t(&mut map, "destination", m, 302, 20);
            b(&mut map, "dte", m, 422);
        }
        6 => {
            u(&mut map, "seqno", m, 38, 2);
            u(&mut map, "dest_mmsi", m, 40, 30);
            b(&mut map, "retransmit", m, 70);
            binary_payload(&mut map, m, 72);
        }
        7 | 13 => {
            u(&mut map, "mmsi1", m, 40, 30);
            if m.len_bits() >= 104 {
                u(&mut map, "mmsi2", m, 72, 30);
            }
            if m.len_bits() >= 136 {
                u(&mut map, "mmsi3", m, 104, 30);
            }
            if m.len_bits() >= 168 {
                u(&mut map, "mmsi4", m, 136, 30);
            }
        }
        8 => {
            binary_payload(&mut map, m, 40);
        }
        9 => {
            u(&mut map, "alt", m, 38, 12);
            u(&mut map, "speed", m, 50, 10);
            b(&mut map, "accuracy", m, 60);
            position(&mut map, m, 61, 89);
            ul(&mut map, "course", m, 116, 12, 0.1);
            u(&mut map, "second", m, 128, 6);
            b(&mut map, "dte", m, 142);
            b(&mut map, "assigned", m, 146);
            b(&mut map, "raim", m, 147);
            u(&mut map, "radio", m, 148, 20);
        }
        10 => {
            u(&mut map, "dest_mmsi", m, 40, 30);
        }
        12 => {
            u(&mut map, "seqno", m, 38, 2);
            u(&mut map, "dest_mmsi", m, 40, 30);
            b(&mut map, "retransmit", m, 70);
            let chars = (m.len_bits().saturating_sub(72)) / 6;
            t(&mut map, "text", m, 72, chars.min(156));
        }
        14 => {
            let chars = (m.len_bits().saturating_sub(40)) / 6;
            t(&mut map, "text", m, 40, chars.min(161));
        }
        15 => {
            u(&mut map, "mmsi1", m, 40, 30);
            u(&mut map, "type1_1", m, 70, 6);
            u(&mut map, "offset1_1", m, 76, 12);
            if m.len_bits() >= 110 {
                u(&mut map, "type1_2", m, 90, 6);
                u(&mut map, "offset1_2", m, 96, 12);
            }
            if m.len_bits() >= 160 {
                u(&mut map, "mmsi2", m, 110, 30);
                u(&mut map, "type2_1", m, 140, 6);
                u(&mut map, "offset2_1", m, 146, 12);
            }
        }
        16 => {
            u(&mut map, "mmsi1", m, 40, 30);
            u(&mut map, "offset1", m, 70, 12);
            u(&mut map, "increment1", m, 82, 10);
            if m.len_bits() >= 144 {
                u(&mut map, "mmsi2", m, 92, 30);
                u(&mut map, "offset2", m, 122, 12);
                u(&mut map, "increment2", m, 134, 10);
            }
        }
        17 => {
            sl(&mut map, "lon", m, 40, 18, 1.0 / 600.0);
            sl(&mut map, "lat", m, 58, 17, 1.0 / 600.0);
        }
        18 => {
            ul(&mut map, "speed", m, 46, 10, 0.1);
            b(&mut map, "accuracy", m, 56);
            position(&mut map, m, 57, 85);
            course_and_heading(&mut map, m, 112, 124);
            u(&mut map, "second", m, 133, 6);
            u(&mut map, "regional", m, 139, 2);
            b(&mut map, "cs", m, 141);
            b(&mut map, "display", m, 142);
            b(&mut map, "dsc", m, 143);
            b(&mut map, "band", m, 144);
            b(&mut map, "msg22", m, 145);
            b(&mut map, "assigned", m, 146);
            b(&mut map, "raim", m, 147);
            u(&mut map, "radio", m, 148, 20);
        }
        19 => {
            ul(&mut map, "speed", m, 46, 10, 0.1);
            b(&mut map, "accuracy", m, 56);
            position(&mut map, m, 57, 85);
            course_and_heading(&mut map, m, 112, 124);
            u(&mut map, "second", m, 133, 6);
            u(&mut map, "regional", m, 139, 4);
            t(&mut map, "shipname", m, 143, 20);
            let st = m.getu(263, 8);
            map.insert("shiptype".to_string(), json!(st));
            map.insert("shiptype_text".to_string(), json!(shiptype_text(st)));
            dimensions(&mut map, m, 271);
            let epfd = m.getu(301, 4);
            map.insert("epfd".to_string(), json!(epfd));
            map.insert("epfd_text".to_string(), json!(epfd_text(epfd)));
            b(&mut map, "raim", m, 305);
            b(&mut map, "dte", m, 306);
            b(&mut map, "assigned", m, 307);
        }
        20 => {
            u(&mut map, "offset1", m, 40, 12);
            u(&mut map, "number1", m, 52, 4);
            u(&mut map, "timeout1", m, 56, 3);
            u(&mut map, "increment1", m, 59, 11);
            if m.len_bits() >= 100 {
                u(&mut map, "offset2", m, 70, 12);
                u(&mut map, "number2", m, 82, 4);
                u(&mut map, "timeout2", m, 86, 3);
                u(&mut map, "increment2", m, 89, 11);
            }
        }
        21 => {
            let aid = m.getu(38, 5);
            map.insert("aid_type".to_string(), json!(aid));
            map.insert("aid_type_text".to_string(), json!(aid_type_text(aid)));
            t(&mut map, "name", m, 43, 20);
            b(&mut map, "accuracy", m, 163);
            position(&mut map, m, 164, 192);
            dimensions(&mut map, m, 219);
            let epfd = m.getu(249, 4);
            map.insert("epfd".to_string(), json!(epfd));
            map.insert("epfd_text".to_string(), json!(epfd_text(epfd)));
            u(&mut map, "second", m, 253, 6);
            b(&mut map, "off_position", m, 259);
            u(&mut map, "regional", m, 260, 8);
            b(&mut map, "raim", m, 268);
            b(&mut map, "virtual_aid", m, 269);
            b(&mut map, "assigned", m, 270);
        }
        22 => {
            u(&mut map, "channel_a", m, 40, 12);
            u(&mut map, "channel_b", m, 52, 12);
            u(&mut map, "txrx", m, 64, 4);
            b(&mut map, "power", m, 68);
            b(&mut map, "addressed", m, 139);
            if m.getb(139) {
                u(&mut map, "dest1", m, 69, 30);
                u(&mut map, "dest2", m, 104, 30);
            } else {
                sl(&mut map, "ne_lon", m, 69, 18, 0.1 / 60.0);
                sl(&mut map, "ne_lat", m, 87, 17, 0.1 / 60.0);
                sl(&mut map, "sw_lon", m, 104, 18, 0.1 / 60.0);
                sl(&mut map, "sw_lat", m, 122, 17, 0.1 / 60.0);
            }
            b(&mut map, "band_a", m, 140);
            b(&mut map, "band_b", m, 141);
            u(&mut map, "zonesize", m, 142, 3);
        }
        23 => {
            sl(&mut map, "ne_lon", m, 40, 18, 0.1 / 60.0);
            sl(&mut map, "ne_lat", m, 58, 17, 0.1 / 60.0);
            sl(&mut map, "sw_lon", m, 75, 18, 0.1 / 60.0);
            sl(&mut map, "sw_lat", m, 93, 17, 0.1 / 60.0);
            u(&mut map, "stationtype", m, 110, 4);
            u(&mut map, "shiptype", m, 114, 8);
            u(&mut map, "txrx", m, 144, 2);
            u(&mut map, "interval", m, 146, 4);
            u(&mut map, "quiet", m, 150, 4);
        }
        24 => {
            let part = m.getu(38, 2);
            map.insert("partno".to_string(), json!(part));
            if part == 0 {
                t(&mut map, "shipname", m, 40, 20);
            } else {
                let st = m.getu(40, 8);
                map.insert("shiptype".to_string(), json!(st));
                map.insert("shiptype_text".to_string(), json!(shiptype_text(st)));
                t(&mut map, "vendorid", m, 48, 3);
                u(&mut map, "model", m, 66, 4);
                u(&mut map, "serial", m, 70, 20);
                t(&mut map, "callsign", m, 90, 7);
                if m.mmsi() / 10000000 == 98 {
                    u(&mut map, "mothership_mmsi", m, 132, 30);
                } else {
                    dimensions(&mut map, m, 132);
                }
            }
        }
        25 | 26 => {
            b(&mut map, "addressed", m, 38);
            b(&mut map, "structured", m, 39);
            if m.getb(38) {
                u(&mut map, "dest_mmsi", m, 40, 30);
            }
        }
        27 => {
            b(&mut map, "accuracy", m, 38);
            b(&mut map, "raim", m, 39);
            let status = m.getu(40, 4);
            map.insert("status".to_string(), json!(status));
            map.insert("status_text".to_string(), json!(status_text(status)));
            sl(&mut map, "lon", m, 44, 18, 1.0 / 600.0);
            sl(&mut map, "lat", m, 62, 17, 1.0 / 600.0);
            u(&mut map, "speed", m, 79, 6);
            u(&mut map, "course", m, 85, 9);
            b(&mut map, "gnss", m, 94);
        }
        _ => {}
    }

    Value::Object(map)
}

/// `Message` → `AisJson` stage; every model has one instance and its output
/// carries the model's group bit.
pub struct JsonAis {
    pub out: Connection<AisJson>,
}

impl JsonAis {
    pub fn new() -> JsonAis {
        JsonAis {
            out: Connection::new(),
        }
    }
}

impl Default for JsonAis {
    fn default() -> Self {
        JsonAis::new()
    }
}

impl StreamIn<Message> for JsonAis {
    fn receive(&mut self, data: &[Message], tag: &mut Tag) {
        for m in data {
            let record = AisJson {
                msg: m.clone(),
                value: jsonify(m, tag),
            };
            self.out.send(&[record], tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(payload: &str, fill: usize) -> Message {
        let mut m = Message::new();
        for c in payload.chars() {
            m.append_letter(c);
        }
        m.reduce_length(fill);
        m.channel = 'A';
        m.stamp(1700000000);
        m
    }

    #[test]
    fn test_jsonify_type1() {
        let m = message("15RTgt0PAso;90TKcjM8h6g208CQ", 0);
        let tag = Tag::default();
        let v = jsonify(&m, &tag);

        assert_eq!(v["class"], "AIS");
        assert_eq!(v["type"], 1);
        assert_eq!(v["mmsi"], 371798000);
        assert_eq!(v["status"], 0);
        assert_eq!(v["status_text"], "Under way using engine");
        assert!((v["speed"].as_f64().unwrap() - 12.3).abs() < 1e-9);
        assert!((v["lat"].as_f64().unwrap() - 48.38163).abs() < 1e-4);
        assert!((v["lon"].as_f64().unwrap() + 123.39538).abs() < 1e-4);
        assert!((v["course"].as_f64().unwrap() - 224.0).abs() < 1e-9);
        assert_eq!(v["heading"], 215);
        assert_eq!(v["country_code"], "PA");
    }

    #[test]
    fn test_jsonify_type5() {
        let mut m = message(
            "55?MbV02;H;s<HtKR20EHE:0@T4@Dn2222222216L961O5Gf0NSQEp6ClRp8",
            0,
        );
        for c in "88888888880".chars() {
            m.append_letter(c);
        }
        m.reduce_length(2);

        let tag = Tag::default();
        let v = jsonify(&m, &tag);
        assert_eq!(v["type"], 5);
        assert_eq!(v["imo"], 9134270);
        assert_eq!(v["callsign"], "3FOF8");
        assert_eq!(v["shipname"], "EVER DIADEM");
        assert_eq!(v["shiptype"], 70);
        assert_eq!(v["shiptype_text"], "Cargo");
        assert_eq!(v["to_bow"], 225);
        assert_eq!(v["to_stern"], 70);
        assert_eq!(v["to_port"], 1);
        assert_eq!(v["to_starboard"], 31);
        assert!((v["draught"].as_f64().unwrap() - 12.2).abs() < 1e-9);
        assert_eq!(v["destination"], "NEW YORK");
    }

    #[test]
    fn test_jsonify_type18_position() {
        // class B position report from the gpsd sample set
        let m = message("B52K>;h00Fc>jpUlNV@ikwpUoP06", 0);
        let tag = Tag::default();
        let v = jsonify(&m, &tag);

        assert_eq!(v["type"], 18);
        assert_eq!(v["mmsi"], 338087471);
        assert!((v["lat"].as_f64().unwrap() - 40.7).abs() < 0.1);
        assert!((v["lon"].as_f64().unwrap() + 74.1).abs() < 0.1);
        assert!((v["speed"].as_f64().unwrap() - 0.1).abs() < 1e-9);
        assert!((v["course"].as_f64().unwrap() - 79.6).abs() < 0.1);
        assert_eq!(v["second"], 49);
        assert_eq!(v["raim"], true);
    }

    #[test]
    fn test_mode_bits_gate_metadata() {
        let m = message("15RTgt0PAso;90TKcjM8h6g208CQ", 0);
        let mut tag = Tag::default();
        tag.level = -20.5;
        tag.ppm = 1.5;

        let v = jsonify(&m, &tag);
        assert!(v.get("signalpower").is_none());
        assert!(v.get("rxtime").is_none());

        tag.mode = TAG_MODE_SIGNAL | TAG_MODE_TIME | TAG_MODE_STATION;
        let v = jsonify(&m, &tag);
        assert!((v["signalpower"].as_f64().unwrap() + 20.5).abs() < 1e-4);
        assert_eq!(v["rxtime"], "2023-11-14T22:13:20");
        assert!(v.get("station_id").is_some());
    }

    #[test]
    fn test_stringify_parse_roundtrip() {
        let m = message("15RTgt0PAso;90TKcjM8h6g208CQ", 0);
        let v = jsonify(&m, &Tag::default());
        let s = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&s).unwrap();
        assert_eq!(v, back);
    }
}
