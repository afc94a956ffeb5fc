use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::Utc;
use serde_json::{json, Value};

use crate::jsonais::AisJson;
use crate::stream::{StreamIn, Tag, LEVEL_UNDEFINED, PPM_UNDEFINED};

const STAT_MAGIC: i32 = 0x4f82b;
const STAT_VERSION: i32 = 2;
const RADAR_BUCKETS: usize = 18;

/// Counters for one time slice: message and vessel counts, per-type and
/// per-channel tallies, level range, ppm sum and the radar range buckets
/// for class A and class B position reports.
#[derive(Clone, Debug)]
pub struct MessageStatistics {
    count: i32,
    exclude: i32,
    vessels: i32,
    msg: [i32; 27],
    channel: [i32; 4],
    level_min: f32,
    level_max: f32,
    ppm: f32,
    distance: f32,
    radar_a: [f32; RADAR_BUCKETS],
    radar_b: [f32; RADAR_BUCKETS],
    cutoff: f32,
}

impl Default for MessageStatistics {
    fn default() -> Self {
        MessageStatistics {
            count: 0,
            exclude: 0,
            vessels: 0,
            msg: [0; 27],
            channel: [0; 4],
            level_min: 1e6,
            level_max: -1e6,
            ppm: 0.0,
            distance: 0.0,
            radar_a: [0.0; RADAR_BUCKETS],
            radar_b: [0.0; RADAR_BUCKETS],
            cutoff: 2500.0,
        }
    }
}

impl MessageStatistics {
    pub fn clear(&mut self) {
        let cutoff = self.cutoff;
        *self = MessageStatistics::default();
        self.cutoff = cutoff;
    }

    pub fn set_cutoff(&mut self, nmi: f32) {
        self.cutoff = nmi;
    }

    pub fn count(&self) -> i32 {
        self.count
    }

    pub fn add(&mut self, record: &AisJson, tag: &Tag, new_vessel: bool) {
        let t = record.msg.msg_type();
        if !(1..=27).contains(&t) {
            return;
        }

        self.count += 1;
        if new_vessel {
            self.vessels += 1;
        }
        self.msg[t as usize - 1] += 1;

        let ch = record.msg.channel;
        if ('A'..='D').contains(&ch) {
            self.channel[(ch as u8 - b'A') as usize] += 1;
        }

        if tag.level == LEVEL_UNDEFINED || tag.ppm == PPM_UNDEFINED {
            self.exclude += 1;
        } else {
            self.level_min = self.level_min.min(tag.level);
            self.level_max = self.level_max.max(tag.level);
            self.ppm += tag.ppm;
        }

        // range statistics ignore aids-to-navigation, repeats and
        // unvalidated or out-of-range fixes
        if t == 21 {
            return;
        }
        if !tag.validated || tag.distance > self.cutoff || record.msg.repeat() > 0 {
            return;
        }

        if tag.distance > self.distance {
            self.distance = tag.distance;
        }

        if !(0..360).contains(&tag.angle) {
            return;
        }
        let bucket = tag.angle as usize / (360 / RADAR_BUCKETS);

        if matches!(t, 18 | 19 | 24) {
            if tag.distance > self.radar_b[bucket] {
                self.radar_b[bucket] = tag.distance;
            }
        } else if t <= 3 || t == 5 || t == 27 {
            if tag.distance > self.radar_a[bucket] {
                self.radar_a[bucket] = tag.distance;
            }
        }
    }

    pub fn to_json(&self, empty: bool) -> Value {
        let c = self.count - self.exclude;
        json!({
            "count": if empty { 0 } else { self.count },
            "vessels": if empty { 0 } else { self.vessels },
            "level_min": if empty || c == 0 { Value::Null } else { json!(self.level_min) },
            "level_max": if empty || c == 0 { Value::Null } else { json!(self.level_max) },
            "ppm": if empty || c == 0 { Value::Null } else { json!(self.ppm / c as f32) },
            "dist": if empty { Value::Null } else { json!(self.distance) },
            "channel": if empty { json!(vec![0; 4]) } else { json!(self.channel) },
            "radar_a": if empty { json!(vec![0.0; RADAR_BUCKETS]) } else { json!(self.radar_a) },
            "radar_b": if empty { json!(vec![0.0; RADAR_BUCKETS]) } else { json!(self.radar_b) },
            "msg": if empty { json!(vec![0; 27]) } else { json!(self.msg) },
        })
    }

    pub fn save(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_i32::<BigEndian>(STAT_MAGIC)?;
        w.write_i32::<BigEndian>(STAT_VERSION)?;
        w.write_i32::<BigEndian>(self.count)?;
        w.write_i32::<BigEndian>(self.vessels)?;
        for m in &self.msg {
            w.write_i32::<BigEndian>(*m)?;
        }
        for c in &self.channel {
            w.write_i32::<BigEndian>(*c)?;
        }
        w.write_f32::<BigEndian>(self.level_min)?;
        w.write_f32::<BigEndian>(self.level_max)?;
        w.write_f32::<BigEndian>(self.ppm)?;
        w.write_f32::<BigEndian>(self.distance)?;
        for r in &self.radar_a {
            w.write_f32::<BigEndian>(*r)?;
        }
        for r in &self.radar_b {
            w.write_f32::<BigEndian>(*r)?;
        }
        Ok(())
    }

    pub fn load(&mut self, r: &mut impl Read) -> std::io::Result<bool> {
        let magic = r.read_i32::<BigEndian>()?;
        let version = r.read_i32::<BigEndian>()?;
        if magic != STAT_MAGIC || version != STAT_VERSION {
            return Ok(false);
        }
        self.count = r.read_i32::<BigEndian>()?;
        self.vessels = r.read_i32::<BigEndian>()?;
        for m in &mut self.msg {
            *m = r.read_i32::<BigEndian>()?;
        }
        for c in &mut self.channel {
            *c = r.read_i32::<BigEndian>()?;
        }
        self.level_min = r.read_f32::<BigEndian>()?;
        self.level_max = r.read_f32::<BigEndian>()?;
        self.ppm = r.read_f32::<BigEndian>()?;
        self.distance = r.read_f32::<BigEndian>()?;
        for x in &mut self.radar_a {
            *x = r.read_f32::<BigEndian>()?;
        }
        for x in &mut self.radar_b {
            *x = r.read_f32::<BigEndian>()?;
        }
        Ok(true)
    }
}

#[derive(Clone, Default)]
struct Cell {
    bucket_time: i64,
    stat: MessageStatistics,
}

/// Ring of per-interval buckets indexed by `rxtime / interval`; stale cells
/// are cleared lazily when their slot comes around again.
pub struct History {
    interval: i64,
    cells: Vec<Cell>,
}

impl History {
    pub fn new(n: usize, interval: i64) -> History {
        History {
            interval,
            cells: vec![Cell::default(); n],
        }
    }

    fn cell_for(&mut self, time: i64) -> &mut MessageStatistics {
        let bucket_time = time / self.interval;
        let n = self.cells.len();
        let idx = (bucket_time.rem_euclid(n as i64)) as usize;
        let cell = &mut self.cells[idx];
        if cell.bucket_time != bucket_time {
            cell.bucket_time = bucket_time;
            cell.stat.clear();
        }
        &mut cell.stat
    }

    pub fn add(&mut self, record: &AisJson, tag: &Tag, new_vessel: bool) {
        self.cell_for(record.msg.rxtime).add(record, tag, new_vessel);
    }

    /// Newest bucket first; buckets that were never filled render empty.
    pub fn to_json(&self, now: i64) -> Value {
        let n = self.cells.len() as i64;
        let newest = now / self.interval;
        let mut out = Vec::with_capacity(n as usize);
        for i in 0..n {
            let bt = newest - i;
            let idx = bt.rem_euclid(n) as usize;
            let cell = &self.cells[idx];
            out.push(cell.stat.to_json(cell.bucket_time != bt));
        }
        json!(out)
    }
}

/// All statistics of one pipeline: a running total plus the second, minute,
/// hour and day rings.
pub struct StatCounter {
    pub total: MessageStatistics,
    second: History,
    minute: History,
    hour: History,
    day: History,
}

impl StatCounter {
    pub fn new() -> StatCounter {
        StatCounter {
            total: MessageStatistics::default(),
            second: History::new(60, 1),
            minute: History::new(60, 60),
            hour: History::new(24, 3600),
            day: History::new(90, 86400),
        }
    }

    pub fn set_cutoff(&mut self, nmi: f32) {
        self.total.set_cutoff(nmi);
    }

    pub fn add(&mut self, record: &AisJson, tag: &Tag, new_vessel: bool) {
        self.total.add(record, tag, new_vessel);
        self.second.add(record, tag, new_vessel);
        self.minute.add(record, tag, new_vessel);
        self.hour.add(record, tag, new_vessel);
        self.day.add(record, tag, new_vessel);
    }

    pub fn to_json(&self) -> Value {
        let now = Utc::now().timestamp();
        json!({
            "total": self.total.to_json(false),
            "last_minute": self.second.to_json(now),
            "last_hour": self.minute.to_json(now),
            "last_day": self.hour.to_json(now),
            "last_90d": self.day.to_json(now),
        })
    }

    pub fn save(&self, w: &mut impl Write) -> std::io::Result<()> {
        self.total.save(w)
    }

    pub fn load(&mut self, r: &mut impl Read) -> std::io::Result<bool> {
        self.total.load(r)
    }
}

impl Default for StatCounter {
    fn default() -> Self {
        StatCounter::new()
    }
}

impl StreamIn<AisJson> for StatCounter {
    fn receive(&mut self, data: &[AisJson], tag: &mut Tag) {
        for record in data {
            // the database stamps the previous sighting into the tag; a
            // zero previous signal marks a vessel we had not seen before
            let new_vessel = tag.previous_signal == 0;
            self.add(record, tag, new_vessel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ais::Message;
    use crate::jsonais::jsonify;

    fn record(payload: &str, rxtime: i64) -> AisJson {
        let mut m = Message::new();
        for c in payload.chars() {
            m.append_letter(c);
        }
        m.channel = 'A';
        m.rxtime = rxtime;
        let value = jsonify(&m, &Tag::default());
        AisJson { msg: m, value }
    }

    #[test]
    fn test_counters_and_radar() {
        let mut stat = MessageStatistics::default();
        let r = record("15RTgt0PAso;90TKcjM8h6g208CQ", 1000);

        let mut tag = Tag::default();
        tag.level = -20.0;
        tag.ppm = 2.0;
        tag.validated = true;
        tag.distance = 12.5;
        tag.angle = 45;

        stat.add(&r, &tag, true);
        stat.add(&r, &tag, false);

        let v = stat.to_json(false);
        assert_eq!(v["count"], 2);
        assert_eq!(v["vessels"], 1);
        assert_eq!(v["msg"][0], 2);
        assert_eq!(v["channel"][0], 2);
        assert!((v["ppm"].as_f64().unwrap() - 2.0).abs() < 1e-6);
        // 45 degrees lands in bucket 2 of 18
        assert!((v["radar_a"][2].as_f64().unwrap() - 12.5).abs() < 1e-6);
        assert_eq!(v["radar_b"][2], 0.0);
    }

    #[test]
    fn test_cutoff_excludes_range() {
        let mut stat = MessageStatistics::default();
        let r = record("15RTgt0PAso;90TKcjM8h6g208CQ", 1000);

        let mut tag = Tag::default();
        tag.level = -20.0;
        tag.ppm = 0.0;
        tag.validated = true;
        tag.distance = 3000.0;
        tag.angle = 10;

        stat.add(&r, &tag, false);
        let v = stat.to_json(false);
        assert_eq!(v["count"], 1);
        assert_eq!(v["dist"], 0.0);
        assert_eq!(v["radar_a"][0], 0.0);
    }

    #[test]
    fn test_history_bucket_aging() {
        let mut hist = History::new(60, 60);
        let r1 = record("15RTgt0PAso;90TKcjM8h6g208CQ", 60 * 100);
        let r2 = record("15RTgt0PAso;90TKcjM8h6g208CQ", 60 * 101);
        let tag = Tag::default();

        hist.add(&r1, &tag, false);
        hist.add(&r2, &tag, false);
        hist.add(&r2, &tag, false);

        let v = hist.to_json(60 * 101);
        assert_eq!(v[0]["count"], 2); // newest bucket
        assert_eq!(v[1]["count"], 1);
        assert_eq!(v[2]["count"], 0);

        // an hour later both buckets have aged out of the ring
        let v = hist.to_json(60 * 161);
        assert_eq!(v[0]["count"], 0);
        assert_eq!(v[59]["count"], 0);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut stat = MessageStatistics::default();
        let r = record("15RTgt0PAso;90TKcjM8h6g208CQ", 1000);
        let mut tag = Tag::default();
        tag.level = -10.0;
        tag.ppm = 1.0;
        stat.add(&r, &tag, true);

        let mut buf = Vec::new();
        stat.save(&mut buf).unwrap();

        let mut restored = MessageStatistics::default();
        assert!(restored.load(&mut std::io::Cursor::new(&buf)).unwrap());
        assert_eq!(restored.count(), 1);
        assert_eq!(restored.to_json(false), stat.to_json(false));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(0xdead).unwrap();
        buf.write_i32::<BigEndian>(STAT_VERSION).unwrap();

        let mut stat = MessageStatistics::default();
        assert!(!stat.load(&mut std::io::Cursor::new(&buf)).unwrap());
    }
}
