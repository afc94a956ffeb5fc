use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aislib::db::Database;
use aislib::device::{Device, FileRaw, FileWav, Format, TcpSource, UdpSource};
use aislib::model::ModelKind;
use aislib::receiver::{start_backup_thread, ChannelMode, Receiver};
use aislib::sinks::http::{HttpPoster, PostDictionary, StationInfo};
use aislib::sinks::listener::TcpServerSink;
use aislib::sinks::tcp::TcpClientSink;
use aislib::sinks::udp::UdpSink;
use aislib::sinks::{MessageFormat, ScreenSink};
use aislib::stats::StatCounter;
use aislib::stream::{stopflag, GROUPS_ALL};
use aislib::webserver::{SseBridge, StationIdentity, WebServer, WebState};
use log::info;

const USAGE: &str = "usage: aisbox [options]
  -r <fmt> <rate> <file>   raw IQ file input (CU8/CS8/CS16/CF32/TXT)
  -w <file>                WAV file input
  -x <port>                UDP NMEA input
  -t <host> <port>         TCP NMEA input
  -m <0..5>                decoding model (may be repeated)
  -c <AB|CD>               channel pair
  -M <DTM>                 meta tags on messages
  -s <id>                  numeric station id
  -G <lat> <lon>           station position
  -o <0..5>                screen output level
  -u <host> <port>         UDP NMEA output
  -p <host> <port>         TCP client output
  -S <port>                TCP listener output
  -N <port>                web server port
  -H <url> <id> <secs>     HTTP aggregator output
  -D <file>                vessel database backup file
  -B <secs>                backup interval";

struct Args(Vec<String>, usize);

impl Args {
    fn next(&mut self, what: &str) -> String {
        self.1 += 1;
        match self.0.get(self.1) {
            Some(s) => s.clone(),
            None => fail(&format!("missing argument: {}", what)),
        }
    }

    fn next_num<T: std::str::FromStr>(&mut self, what: &str) -> T {
        let s = self.next(what);
        match s.parse() {
            Ok(v) => v,
            Err(_) => fail(&format!("invalid {}: {}", what, s)),
        }
    }
}

fn fail(msg: &str) -> ! {
    eprintln!("aisbox: {}", msg);
    eprintln!("{}", USAGE);
    std::process::exit(1);
}

fn screen_format(level: u32) -> MessageFormat {
    match level {
        0 => MessageFormat::Silent,
        1 => MessageFormat::Nmea,
        2 => MessageFormat::JsonFull,
        3 => MessageFormat::JsonNmea,
        4 => MessageFormat::JsonSparse,
        5 => MessageFormat::JsonAnnotated,
        _ => fail("unknown option for screen output"),
    }
}

fn main() {
    let log_buffer = aislib::logger::init(log::LevelFilter::Info, 128);

    let mut device: Option<Device> = None;
    let mut models: Vec<ModelKind> = Vec::new();
    let mut channel_mode = ChannelMode::Ab;
    let mut tags = String::new();
    let mut station_id: u16 = 0;
    let mut station_pos: Option<(f32, f32)> = None;
    let mut screen_level: Option<u32> = None;
    let mut udp_out: Vec<(String, u16)> = Vec::new();
    let mut tcp_out: Vec<(String, u16)> = Vec::new();
    let mut server_port: Option<u16> = None;
    let mut web_port: Option<u16> = None;
    let mut http_out: Option<(String, String, u64)> = None;
    let mut backup_file: Option<String> = None;
    let mut backup_interval = Duration::from_secs(600);

    let argv: Vec<String> = std::env::args().collect();
    let mut args = Args(argv, 0);

    while args.1 + 1 < args.0.len() {
        let opt = args.next("option");
        match opt.as_str() {
            "-r" => {
                let fmt = args.next("sample format");
                let fmt = Format::parse(&fmt)
                    .unwrap_or_else(|| fail(&format!("unknown sample format {}", fmt)));
                let rate: usize = args.next_num("sample rate");
                let path = args.next("file");
                device = Some(Device::RawFile(FileRaw::new(&path, fmt, rate)));
            }
            "-w" => {
                let path = args.next("file");
                device = Some(Device::WavFile(FileWav::new(&path)));
            }
            "-x" => {
                device = Some(Device::Udp(UdpSource::new(args.next_num("port"))));
            }
            "-t" => {
                let host = args.next("host");
                let port = args.next_num("port");
                device = Some(Device::Tcp(TcpSource::new(&host, port)));
            }
            "-m" => {
                let m: u32 = args.next_num("model");
                models.push(
                    ModelKind::from_index(m)
                        .unwrap_or_else(|| fail("model not implemented in this version")),
                );
            }
            "-c" => {
                channel_mode = match args.next("channel pair").to_ascii_uppercase().as_str() {
                    "AB" => ChannelMode::Ab,
                    "CD" => ChannelMode::Cd,
                    _ => fail("channel mode needs to be AB or CD"),
                };
            }
            "-M" => tags = args.next("tags"),
            "-s" => station_id = args.next_num("station id"),
            "-G" => {
                let lat = args.next_num("latitude");
                let lon = args.next_num("longitude");
                station_pos = Some((lat, lon));
            }
            "-o" => screen_level = Some(args.next_num("screen level")),
            "-u" => {
                let host = args.next("host");
                let port = args.next_num("port");
                udp_out.push((host, port));
            }
            "-p" => {
                let host = args.next("host");
                let port = args.next_num("port");
                tcp_out.push((host, port));
            }
            "-S" => server_port = Some(args.next_num("port")),
            "-N" => web_port = Some(args.next_num("port")),
            "-H" => {
                let url = args.next("url");
                let id = args.next("station id");
                let secs = args.next_num("interval");
                http_out = Some((url, id, secs));
            }
            "-D" => backup_file = Some(args.next("file")),
            "-B" => backup_interval = Duration::from_secs(args.next_num("seconds")),
            _ => fail(&format!("unknown option {}", opt)),
        }
    }

    let device = device.unwrap_or_else(|| fail("no input selected"));

    let mut rx = Receiver::new(device);
    rx.set_channel_mode(channel_mode);
    rx.set_station(station_id);
    rx.set_tags(&tags);
    for m in &models {
        rx.add_model(*m);
    }

    let mut group = 0;
    if let Err(e) = rx.setup(&mut group) {
        fail(&e);
    }

    // vessel database and statistics
    let db = Arc::new(Mutex::new(Database::new(false)));
    if let Some((lat, lon)) = station_pos {
        let mut d = db.lock().unwrap();
        d.set_lat_lon(lat, lon);
        d.set_share_lat_lon(true);
    }
    if let Some(path) = &backup_file {
        if let Ok(mut f) = std::fs::File::open(path) {
            match db.lock().unwrap().load(&mut f) {
                Ok(true) => {}
                _ => info!("no usable vessel backup in {}", path),
            }
        }
    }
    let stats = Arc::new(Mutex::new(StatCounter::new()));

    rx.connect_json(db.clone(), GROUPS_ALL);
    rx.connect_gps(db.clone());

    // everything downstream hangs off the database so it sees enriched tags
    {
        let mut d = db.lock().unwrap();
        d.out.connect(stats.clone());

        let level = screen_level.unwrap_or(if udp_out.is_empty()
            && tcp_out.is_empty()
            && server_port.is_none()
            && web_port.is_none()
            && http_out.is_none()
        {
            1
        } else {
            0
        });
        let screen = ScreenSink::new(screen_format(level));
        d.out.connect(Arc::new(Mutex::new(screen)));

        for (host, port) in &udp_out {
            d.out.connect(Arc::new(Mutex::new(UdpSink::new(host, *port))));
        }
        for (host, port) in &tcp_out {
            d.out
                .connect(Arc::new(Mutex::new(TcpClientSink::new(host, *port))));
        }
        if let Some(port) = server_port {
            match TcpServerSink::start(port, MessageFormat::Nmea) {
                Ok(sink) => d.out.connect(Arc::new(Mutex::new(sink))),
                Err(e) => fail(&format!("cannot start TCP server on {}: {}", port, e)),
            }
        }
        if let Some((url, id, secs)) = &http_out {
            let station = StationInfo {
                id: id.clone(),
                lat: station_pos.map(|p| p.0).unwrap_or(0.0),
                lon: station_pos.map(|p| p.1).unwrap_or(0.0),
                hardware: rx.device.product().to_string(),
                driver: rx.device.driver().to_string(),
                model: models
                    .first()
                    .map(|m| m.name().to_string())
                    .unwrap_or_default(),
            };
            let poster = HttpPoster::start(
                url,
                Duration::from_secs(*secs),
                station,
                PostDictionary::Full,
            );
            d.out.connect(Arc::new(Mutex::new(poster)));
        }
    }

    // web front-end
    let _web = web_port.map(|port| {
        let identity = StationIdentity {
            name: format!("station {}", station_id),
            lat: station_pos.map(|p| p.0).unwrap_or(0.0),
            lon: station_pos.map(|p| p.1).unwrap_or(0.0),
            share_loc: station_pos.is_some(),
        };
        let state = WebState::new(db.clone(), stats.clone(), log_buffer.clone(), identity);
        let bridge = SseBridge::new(&state);
        db.lock().unwrap().out.connect(Arc::new(Mutex::new(bridge)));
        WebServer::start(port, state)
    });

    // periodic persistence
    let backup_stop = Arc::new(AtomicBool::new(false));
    let backup = backup_file.clone().map(|path| {
        start_backup_thread(
            db.clone(),
            stats.clone(),
            path.clone(),
            format!("{}.stat", path),
            backup_interval,
            backup_stop.clone(),
        )
    });

    if let Err(e) = rx.play() {
        fail(&e);
    }
    info!("receiving started");

    while rx.is_running() && !stopflag::requested() {
        std::thread::sleep(Duration::from_millis(250));
    }

    rx.stop();
    backup_stop.store(true, std::sync::atomic::Ordering::Relaxed);
    if let Some(t) = backup {
        let _ = t.join();
    }

    if let Some(path) = &backup_file {
        if let Ok(mut f) = std::fs::File::create(path) {
            let _ = db.lock().unwrap().save(&mut f);
        }
    }
    info!("done");
}
