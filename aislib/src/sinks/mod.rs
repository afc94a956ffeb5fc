use std::io::Write;

use log::error;
use serde_json::{json, Map, Value};

use crate::jsonais::AisJson;
use crate::stream::{StreamIn, Tag, GROUPS_ALL};

pub mod http;
pub mod listener;
pub mod tcp;
pub mod udp;

/// Wire shape a sink writes. `BinaryNmea` is the length-prefixed internal
/// framing used between stations; everything else is line oriented.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MessageFormat {
    Silent,
    Nmea,
    BinaryNmea,
    JsonNmea,
    JsonFull,
    JsonSparse,
    JsonAnnotated,
}

/// Per-sink message filter: allowed types, an MMSI range and an optional
/// geographic box checked against the tag position.
#[derive(Clone, Debug)]
pub struct OutputFilter {
    allowed_types: u32,
    mmsi_range: Option<(u32, u32)>,
    bbox: Option<(f32, f32, f32, f32)>, // lat min/max, lon min/max
}

impl Default for OutputFilter {
    fn default() -> Self {
        OutputFilter {
            allowed_types: !0,
            mmsi_range: None,
            bbox: None,
        }
    }
}

impl OutputFilter {
    pub fn set_allowed_types(&mut self, types: &[u8]) {
        self.allowed_types = 0;
        for t in types {
            if (1..=27).contains(t) {
                self.allowed_types |= 1 << t;
            }
        }
    }

    pub fn set_mmsi_range(&mut self, min: u32, max: u32) {
        self.mmsi_range = Some((min, max));
    }

    pub fn set_bbox(&mut self, lat_min: f32, lat_max: f32, lon_min: f32, lon_max: f32) {
        self.bbox = Some((lat_min, lat_max, lon_min, lon_max));
    }

    pub fn include(&self, record: &AisJson, tag: &Tag) -> bool {
        let t = record.msg.msg_type();
        if !(1..=27).contains(&t) || self.allowed_types & (1 << t) == 0 {
            return false;
        }
        if let Some((min, max)) = self.mmsi_range {
            let m = record.msg.mmsi();
            if m < min || m > max {
                return false;
            }
        }
        if let Some((lat_min, lat_max, lon_min, lon_max)) = self.bbox {
            if tag.lat < lat_min || tag.lat > lat_max || tag.lon < lon_min || tag.lon > lon_max {
                return false;
            }
        }
        true
    }
}

static SPARSE_KEYS: [&str; 21] = [
    "class",
    "device",
    "rxtime",
    "rxuxtime",
    "channel",
    "type",
    "repeat",
    "mmsi",
    "lat",
    "lon",
    "speed",
    "course",
    "heading",
    "status",
    "shipname",
    "callsign",
    "destination",
    "imo",
    "shiptype",
    "draught",
    "signalpower",
];

// key -> (unit, description) for the annotated dictionary
static UNITS: [(&str, &str, &str); 11] = [
    ("speed", "kn", "Speed over ground"),
    ("course", "deg", "Course over ground"),
    ("heading", "deg", "True heading"),
    ("lat", "deg", "Latitude"),
    ("lon", "deg", "Longitude"),
    ("draught", "m", "Draught"),
    ("to_bow", "m", "Dimension to bow"),
    ("to_stern", "m", "Dimension to stern"),
    ("to_port", "m", "Dimension to port"),
    ("to_starboard", "m", "Dimension to starboard"),
    ("alt", "m", "Altitude"),
];

pub(crate) fn sparse(value: &Value) -> Value {
    let mut out = Map::new();
    if let Some(obj) = value.as_object() {
        for k in SPARSE_KEYS.iter() {
            if let Some(v) = obj.get(*k) {
                out.insert((*k).to_string(), v.clone());
            }
        }
    }
    Value::Object(out)
}

fn annotated(value: &Value) -> Value {
    let mut out = Map::new();
    if let Some(obj) = value.as_object() {
        for (k, v) in obj {
            if let Some((_, unit, desc)) = UNITS.iter().find(|(key, _, _)| key == k) {
                out.insert(
                    k.clone(),
                    json!({"value": v, "unit": unit, "description": desc}),
                );
            } else if let Some(text) = obj.get(&format!("{}_text", k)) {
                out.insert(k.clone(), json!({"value": v, "text": text}));
            } else if !k.ends_with("_text") {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}

fn json_nmea(record: &AisJson, tag: &Tag) -> Value {
    json!({
        "class": "AIS",
        "device": "AIS-catcher",
        "channel": record.msg.channel.to_string(),
        "rxtime": record.msg.rxtime_string(),
        "rxuxtime": record.msg.rxtime,
        "signalpower": tag.level,
        "ppm": tag.ppm,
        "nmea": record.msg.nmea,
    })
}

/// Render one message in the sink's wire shape, one line per element.
pub fn format_lines(record: &AisJson, tag: &Tag, fmt: MessageFormat) -> Vec<String> {
    match fmt {
        MessageFormat::Silent => Vec::new(),
        MessageFormat::Nmea => record.msg.nmea.clone(),
        MessageFormat::BinaryNmea => Vec::new(),
        MessageFormat::JsonNmea => vec![json_nmea(record, tag).to_string()],
        MessageFormat::JsonFull => vec![record.value.to_string()],
        MessageFormat::JsonSparse => vec![sparse(&record.value).to_string()],
        MessageFormat::JsonAnnotated => vec![annotated(&record.value).to_string()],
    }
}

/// Length-prefixed record for the high-throughput internal framing: a u16
/// length followed by the JSON-NMEA envelope bytes.
pub fn binary_frame(record: &AisJson, tag: &Tag) -> Vec<u8> {
    let body = json_nmea(record, tag).to_string().into_bytes();
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push((body.len() >> 8) as u8);
    out.push((body.len() & 0xFF) as u8);
    out.extend_from_slice(&body);
    out
}

/// Writes formatted messages to standard output.
pub struct ScreenSink {
    pub format: MessageFormat,
    pub filter: OutputFilter,
    pub groups_in: u64,
}

impl ScreenSink {
    pub fn new(format: MessageFormat) -> ScreenSink {
        ScreenSink {
            format,
            filter: OutputFilter::default(),
            groups_in: GROUPS_ALL,
        }
    }
}

impl StreamIn<AisJson> for ScreenSink {
    fn receive(&mut self, data: &[AisJson], tag: &mut Tag) {
        if tag.group & self.groups_in == 0 {
            return;
        }
        for record in data {
            if !self.filter.include(record, tag) {
                continue;
            }
            for line in format_lines(record, tag, self.format) {
                println!("{}", line);
            }
        }
    }
}

/// Appends formatted messages to a file.
pub struct FileSink {
    file: Option<std::fs::File>,
    pub format: MessageFormat,
    pub filter: OutputFilter,
    pub groups_in: u64,
}

impl FileSink {
    pub fn open(path: &str, format: MessageFormat) -> std::io::Result<FileSink> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(FileSink {
            file: Some(file),
            format,
            filter: OutputFilter::default(),
            groups_in: GROUPS_ALL,
        })
    }
}

impl StreamIn<AisJson> for FileSink {
    fn receive(&mut self, data: &[AisJson], tag: &mut Tag) {
        if tag.group & self.groups_in == 0 {
            return;
        }
        let file = match &mut self.file {
            Some(f) => f,
            None => return,
        };
        for record in data {
            if !self.filter.include(record, tag) {
                continue;
            }
            for line in format_lines(record, tag, self.format) {
                if let Err(e) = writeln!(file, "{}", line) {
                    error!("file output: write failed: {}", e);
                    self.file = None;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ais::Message;
    use crate::jsonais::jsonify;

    fn record() -> AisJson {
        let mut m = Message::new();
        for c in "15RTgt0PAso;90TKcjM8h6g208CQ".chars() {
            m.append_letter(c);
        }
        m.channel = 'A';
        m.nmea
            .push("!AIVDM,1,1,,A,15RTgt0PAso;90TKcjM8h6g208CQ,0*4A".to_string());
        let value = jsonify(&m, &Tag::default());
        AisJson { msg: m, value }
    }

    #[test]
    fn test_format_lines() {
        let r = record();
        let tag = Tag::default();

        let nmea = format_lines(&r, &tag, MessageFormat::Nmea);
        assert_eq!(nmea.len(), 1);
        assert!(nmea[0].starts_with("!AIVDM"));

        let full = format_lines(&r, &tag, MessageFormat::JsonFull);
        let v: Value = serde_json::from_str(&full[0]).unwrap();
        assert_eq!(v["mmsi"], 371798000);

        let sparse = format_lines(&r, &tag, MessageFormat::JsonSparse);
        let v: Value = serde_json::from_str(&sparse[0]).unwrap();
        assert!(v.get("radio").is_none());
        assert_eq!(v["type"], 1);

        assert!(format_lines(&r, &tag, MessageFormat::Silent).is_empty());
    }

    #[test]
    fn test_annotated_wraps_units() {
        let r = record();
        let lines = format_lines(&r, &Tag::default(), MessageFormat::JsonAnnotated);
        let v: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(v["speed"]["unit"], "kn");
        assert!((v["speed"]["value"].as_f64().unwrap() - 12.3).abs() < 1e-9);
        assert_eq!(v["status"]["text"], "Under way using engine");
        assert_eq!(v["mmsi"], 371798000);
    }

    #[test]
    fn test_filter() {
        let r = record();
        let mut tag = Tag::default();
        let mut f = OutputFilter::default();
        assert!(f.include(&r, &tag));

        f.set_allowed_types(&[5, 18]);
        assert!(!f.include(&r, &tag));

        f.set_allowed_types(&[1, 2, 3]);
        assert!(f.include(&r, &tag));

        f.set_mmsi_range(200000000, 300000000);
        assert!(!f.include(&r, &tag));
        f.set_mmsi_range(300000000, 400000000);
        assert!(f.include(&r, &tag));

        tag.lat = 10.0;
        tag.lon = 10.0;
        f.set_bbox(0.0, 5.0, 0.0, 5.0);
        assert!(!f.include(&r, &tag));
        f.set_bbox(0.0, 15.0, 0.0, 15.0);
        assert!(f.include(&r, &tag));
    }

    #[test]
    fn test_binary_frame_prefix() {
        let r = record();
        let frame = binary_frame(&r, &Tag::default());
        let len = ((frame[0] as usize) << 8) | frame[1] as usize;
        assert_eq!(len, frame.len() - 2);
    }
}
