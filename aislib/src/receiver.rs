use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};

use crate::ais::Gps;
use crate::db::Database;
use crate::device::{Device, Format};
use crate::fifo::Fifo;
use crate::jsonais::{AisJson, JsonAis};
use crate::model::{Model, ModelKind};
use crate::stats::StatCounter;
use crate::stream::{
    stopflag, SharedStreamIn, StreamIn, Tag, TAG_MODE_SIGNAL, TAG_MODE_STATION, TAG_MODE_TIME,
};

/// VHF channel pair selection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChannelMode {
    Ab,
    Cd,
}

impl ChannelMode {
    pub fn frequency(&self) -> u32 {
        match self {
            ChannelMode::Ab => 162_000_000,
            ChannelMode::Cd => 156_800_000,
        }
    }

    pub fn designation(&self) -> (char, char) {
        match self {
            ChannelMode::Ab => ('A', 'B'),
            ChannelMode::Cd => ('C', 'D'),
        }
    }
}

/// Owns one source and its decoding pipelines: device, FIFO, models and the
/// per-model JSON stages. Wiring happens in the configuration phase; `play`
/// starts the device thread and the worker that drives the chain.
pub struct Receiver {
    pub device: Device,
    fifo: Arc<Fifo>,
    pending_models: Vec<ModelKind>,
    models: Vec<Model>,
    jsonais: Vec<Arc<Mutex<JsonAis>>>,
    channel_mode: ChannelMode,
    tag: Tag,
    station: u16,
    worker: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl Receiver {
    pub fn new(device: Device) -> Receiver {
        Receiver {
            device,
            fifo: Arc::new(Fifo::default()),
            pending_models: Vec::new(),
            models: Vec::new(),
            jsonais: Vec::new(),
            channel_mode: ChannelMode::Ab,
            tag: Tag::default(),
            station: 0,
            worker: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_channel_mode(&mut self, mode: ChannelMode) {
        self.channel_mode = mode;
    }

    pub fn set_station(&mut self, station: u16) {
        self.station = station;
    }

    /// Metadata tag letters from the command line: D for signal data, T for
    /// timestamps, M for station id.
    pub fn set_tags(&mut self, s: &str) {
        for c in s.chars() {
            match c.to_ascii_uppercase() {
                'D' => self.tag.mode |= TAG_MODE_SIGNAL,
                'T' => self.tag.mode |= TAG_MODE_TIME,
                'M' => self.tag.mode |= TAG_MODE_STATION,
                _ => warn!("unknown tag '{}' defined on command line [D / T / M]", c),
            }
        }
    }

    pub fn add_model(&mut self, kind: ModelKind) {
        self.pending_models.push(kind);
    }

    /// Open the device and build every requested model against its format
    /// and rate; each model output gets its own group bit starting at
    /// `*group`.
    pub fn setup(&mut self, group: &mut u32) -> Result<(), String> {
        self.device.open().map_err(|e| e.to_string())?;
        self.device.set_frequency(self.channel_mode.frequency());

        let format = self.device.format();
        if self.pending_models.is_empty() {
            self.pending_models.push(match format {
                Format::Txt => ModelKind::NmeaText,
                _ => ModelKind::Default,
            });
        }

        self.tag.hardware = self.device.product().to_string();
        self.tag.driver = self.device.driver().to_string();
        self.tag.station = self.station;

        assert!(*group + self.pending_models.len() as u32 <= 64);

        for kind in self.pending_models.clone() {
            let model = Model::build(
                kind,
                format,
                self.device.sample_rate(),
                self.channel_mode.designation(),
                self.station,
            )?;

            let mask = 1u64 << *group;
            model.set_group_out(mask);

            let json = Arc::new(Mutex::new(JsonAis::new()));
            json.lock().unwrap().out.set_group_out(mask);
            model.connect_output(json.clone());

            info!("model [{}] on group {:#x}", kind.name(), mask);

            self.models.push(model);
            self.jsonais.push(json);
            *group += 1;
        }
        Ok(())
    }

    /// Attach a sink to every model's JSON output, honoring group masks.
    pub fn connect_json(&self, sink: Arc<Mutex<dyn StreamIn<AisJson>>>, groups_in: u64) {
        for json in &self.jsonais {
            json.lock().unwrap().out.connect_masked(sink.clone(), groups_in);
        }
    }

    pub fn connect_gps(&self, sink: Arc<Mutex<dyn StreamIn<Gps>>>) {
        for model in &self.models {
            model.assembler.lock().unwrap().out_gps.connect(sink.clone());
        }
    }

    /// Start the device and the worker thread that pops sample blocks and
    /// drives the chains.
    pub fn play(&mut self) -> Result<(), String> {
        self.device
            .play(self.fifo.clone())
            .map_err(|e| e.to_string())?;

        let fronts: Vec<SharedStreamIn<u8>> = self.models.iter().map(|m| m.front()).collect();
        let fifo = self.fifo.clone();
        let base_tag = self.tag.clone();
        let running = self.running.clone();
        running.store(true, Ordering::Relaxed);
        let r2 = running.clone();

        self.worker = Some(std::thread::spawn(move || {
            let mut sample_idx: u64 = 0;
            while !stopflag::requested() {
                if !fifo.wait() {
                    if fifo.finished() || fifo.halted() {
                        info!("receiver: end of input");
                        break;
                    }
                    continue; // timeout, check stall/stop and wait again
                }
                let block = match fifo.front() {
                    Some(b) => b,
                    None => continue,
                };
                fifo.pop(1);

                for front in &fronts {
                    let mut tag = base_tag.clone();
                    tag.sample_idx = sample_idx;
                    front.lock().unwrap().receive(&block, &mut tag);
                }
                sample_idx += block.len() as u64;
            }
            r2.store(false, Ordering::Relaxed);
        }));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.device.stop();
        self.fifo.halt();
        if let Some(t) = self.worker.take() {
            let _ = t.join();
        }
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Periodic persistence of the vessel database and statistics.
pub fn start_backup_thread(
    db: Arc<Mutex<Database>>,
    stats: Arc<Mutex<StatCounter>>,
    db_path: String,
    stats_path: String,
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut last = std::time::Instant::now();
        while !stop.load(Ordering::Relaxed) && !stopflag::requested() {
            std::thread::sleep(Duration::from_millis(250));
            if last.elapsed() < interval {
                continue;
            }
            last = std::time::Instant::now();

            let save_db = || -> std::io::Result<()> {
                let mut f = std::fs::File::create(&db_path)?;
                db.lock().unwrap().save(&mut f)
            };
            if let Err(e) = save_db() {
                warn!("backup: cannot write {}: {}", db_path, e);
                stopflag::request();
                return;
            }

            let save_stats = || -> std::io::Result<()> {
                let mut f = std::fs::File::create(&stats_path)?;
                stats.lock().unwrap().save(&mut f)
            };
            if let Err(e) = save_stats() {
                warn!("backup: cannot write {}: {}", stats_path, e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileRaw;
    use std::io::Write;

    struct Capture {
        records: Vec<AisJson>,
    }

    impl StreamIn<AisJson> for Capture {
        fn receive(&mut self, data: &[AisJson], _tag: &mut Tag) {
            self.records.extend_from_slice(data);
        }
    }

    #[test]
    fn test_txt_receiver_end_to_end() {
        let dir = std::env::temp_dir().join("aislib_test_rx");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feed.nmea");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            writeln!(f, "!AIVDM,1,1,,A,15RTgt0PAso;90TKcjM8h6g208CQ,0*4A").unwrap();
            writeln!(f, "!AIVDM,1,1,,A,38Id705000rRVJhE7cl9n;160000,0*40").unwrap();
        }

        stopflag::reset();
        let mut rx = Receiver::new(Device::RawFile(FileRaw::new(
            path.to_str().unwrap(),
            Format::Txt,
            0,
        )));
        rx.set_tags("DT");
        rx.add_model(ModelKind::NmeaText);

        let mut group = 0;
        rx.setup(&mut group).unwrap();
        assert_eq!(group, 1);

        let cap = Arc::new(Mutex::new(Capture {
            records: Vec::new(),
        }));
        rx.connect_json(cap.clone(), crate::stream::GROUPS_ALL);

        rx.play().unwrap();
        // end of file stops the worker on its own
        for _ in 0..100 {
            if !rx.is_running() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        rx.stop();

        let records = &cap.lock().unwrap().records;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].msg.mmsi(), 371798000);
        assert_eq!(records[1].msg.mmsi(), 563808000);
        assert_eq!(records[0].value["type"], 1);
    }

    #[test]
    fn test_group_mask_blocks_unrelated_sink() {
        let dir = std::env::temp_dir().join("aislib_test_rx2");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feed.nmea");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            writeln!(f, "!AIVDM,1,1,,A,15RTgt0PAso;90TKcjM8h6g208CQ,0*4A").unwrap();
        }

        stopflag::reset();
        let mut rx = Receiver::new(Device::RawFile(FileRaw::new(
            path.to_str().unwrap(),
            Format::Txt,
            0,
        )));
        rx.add_model(ModelKind::NmeaText);
        let mut group = 0;
        rx.setup(&mut group).unwrap();

        let cap = Arc::new(Mutex::new(Capture {
            records: Vec::new(),
        }));
        // model got group bit 0; a sink that only accepts group bit 5 must
        // not be wired up
        rx.connect_json(cap.clone(), 1 << 5);

        rx.play().unwrap();
        for _ in 0..100 {
            if !rx.is_running() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        rx.stop();

        assert!(cap.lock().unwrap().records.is_empty());
    }
}
