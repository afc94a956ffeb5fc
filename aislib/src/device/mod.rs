use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::net::{TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use log::{error, info, warn};

use crate::fifo::Fifo;
use crate::stream::stopflag;

const READ_CHUNK: usize = 16384;

/// Sample formats accepted from the front-ends.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Format {
    Cu8,
    Cs8,
    Cs16,
    Cf32,
    Txt,
}

impl Format {
    pub fn parse(s: &str) -> Option<Format> {
        match s.to_ascii_uppercase().as_str() {
            "CU8" => Some(Format::Cu8),
            "CS8" => Some(Format::Cs8),
            "CS16" => Some(Format::Cs16),
            "CF32" => Some(Format::Cf32),
            "TXT" => Some(Format::Txt),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum DeviceError {
    Io(std::io::Error),
    Config(String),
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        DeviceError::Io(e)
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeviceError::Io(e) => write!(f, "device I/O error: {}", e),
            DeviceError::Config(s) => write!(f, "device configuration error: {}", s),
        }
    }
}

/// Raw IQ sample file in a fixed format.
pub struct FileRaw {
    pub path: String,
    pub format: Format,
    pub sample_rate: usize,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FileRaw {
    pub fn new(path: &str, format: Format, sample_rate: usize) -> FileRaw {
        FileRaw {
            path: path.to_string(),
            format,
            sample_rate,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

fn stream_reader(
    mut reader: impl Read + Send + 'static,
    fifo: Arc<Fifo>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = vec![0u8; READ_CHUNK];
        while running.load(Ordering::Relaxed) && !stopflag::requested() {
            match reader.read(&mut buf) {
                Ok(0) => {
                    fifo.push_finished();
                    break;
                }
                Ok(n) => {
                    if !fifo.push(&buf[..n], true) {
                        break; // halted
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => {
                    error!("source: read failed: {}", e);
                    fifo.push_finished();
                    break;
                }
            }
        }
        running.store(false, Ordering::Relaxed);
    })
}

/// RIFF/WAVE file carrying stereo IQ; 16-bit PCM maps to CS16, 32-bit float
/// to CF32.
pub struct FileWav {
    pub path: String,
    format: Format,
    sample_rate: usize,
    data_offset: u64,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FileWav {
    pub fn new(path: &str) -> FileWav {
        FileWav {
            path: path.to_string(),
            format: Format::Cs16,
            sample_rate: 0,
            data_offset: 0,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    fn parse_header(&mut self) -> Result<(), DeviceError> {
        let mut f = std::fs::File::open(&self.path)?;

        let mut tag = [0u8; 4];
        f.read_exact(&mut tag)?;
        if &tag != b"RIFF" {
            return Err(DeviceError::Config("not a RIFF file".to_string()));
        }
        let _riff_size = f.read_u32::<LittleEndian>()?;
        f.read_exact(&mut tag)?;
        if &tag != b"WAVE" {
            return Err(DeviceError::Config("not a WAVE file".to_string()));
        }

        loop {
            if f.read_exact(&mut tag).is_err() {
                return Err(DeviceError::Config("no data chunk found".to_string()));
            }
            let size = f.read_u32::<LittleEndian>()?;

            match &tag {
                b"fmt " => {
                    let audio_format = f.read_u16::<LittleEndian>()?;
                    let channels = f.read_u16::<LittleEndian>()?;
                    let sample_rate = f.read_u32::<LittleEndian>()?;
                    let _byte_rate = f.read_u32::<LittleEndian>()?;
                    let _block_align = f.read_u16::<LittleEndian>()?;
                    let bits = f.read_u16::<LittleEndian>()?;

                    if channels != 2 {
                        return Err(DeviceError::Config(format!(
                            "expected 2 channel IQ, found {} channels",
                            channels
                        )));
                    }
                    self.format = match (audio_format, bits) {
                        (1, 16) => Format::Cs16,
                        (3, 32) => Format::Cf32,
                        (1, 8) => Format::Cu8,
                        _ => {
                            return Err(DeviceError::Config(format!(
                                "unsupported WAV encoding: format {} bits {}",
                                audio_format, bits
                            )))
                        }
                    };
                    self.sample_rate = sample_rate as usize;

                    if size > 16 {
                        f.seek(SeekFrom::Current((size - 16) as i64))?;
                    }
                }
                b"data" => {
                    self.data_offset = f.stream_position()?;
                    return Ok(());
                }
                _ => {
                    f.seek(SeekFrom::Current(size as i64))?;
                }
            }
        }
    }
}

/// Text/NMEA datagram listener.
pub struct UdpSource {
    pub port: u16,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl UdpSource {
    pub fn new(port: u16) -> UdpSource {
        UdpSource {
            port,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

/// Text/NMEA TCP client feed.
pub struct TcpSource {
    pub host: String,
    pub port: u16,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TcpSource {
    pub fn new(host: &str, port: u16) -> TcpSource {
        TcpSource {
            host: host.to_string(),
            port,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

/// The sample sources as a tagged variant with one shared capability
/// surface. Hardware front-ends plug in as further variants backed by their
/// driver shims.
pub enum Device {
    RawFile(FileRaw),
    WavFile(FileWav),
    Udp(UdpSource),
    Tcp(TcpSource),
    Null,
}

impl Device {
    pub fn open(&mut self) -> Result<(), DeviceError> {
        match self {
            Device::RawFile(d) => {
                if !std::path::Path::new(&d.path).exists() {
                    return Err(DeviceError::Config(format!("cannot open {}", d.path)));
                }
                Ok(())
            }
            Device::WavFile(d) => d.parse_header(),
            Device::Udp(_) | Device::Tcp(_) | Device::Null => Ok(()),
        }
    }

    pub fn format(&self) -> Format {
        match self {
            Device::RawFile(d) => d.format,
            Device::WavFile(d) => d.format,
            Device::Udp(_) | Device::Tcp(_) => Format::Txt,
            Device::Null => Format::Cf32,
        }
    }

    pub fn sample_rate(&self) -> usize {
        match self {
            Device::RawFile(d) => d.sample_rate,
            Device::WavFile(d) => d.sample_rate,
            _ => 0,
        }
    }

    pub fn set_sample_rate(&mut self, rate: usize) {
        match self {
            Device::RawFile(d) => d.sample_rate = rate,
            Device::WavFile(_) => warn!("sample rate of a WAV file comes from its header"),
            _ => {}
        }
    }

    /// Tuner frequency; meaningful only for hardware front-ends, file and
    /// network sources record it for the logs.
    pub fn set_frequency(&mut self, frequency: u32) {
        info!("source: frequency {:.3} MHz", frequency as f64 / 1e6);
    }

    pub fn product(&self) -> &'static str {
        match self {
            Device::RawFile(_) => "RAW file",
            Device::WavFile(_) => "WAV file",
            Device::Udp(_) => "UDP",
            Device::Tcp(_) => "TCP",
            Device::Null => "none",
        }
    }

    pub fn driver(&self) -> &'static str {
        match self {
            Device::RawFile(_) | Device::WavFile(_) => "file",
            Device::Udp(_) | Device::Tcp(_) => "network",
            Device::Null => "null",
        }
    }

    pub fn play(&mut self, fifo: Arc<Fifo>) -> Result<(), DeviceError> {
        match self {
            Device::RawFile(d) => {
                let file = std::fs::File::open(&d.path)?;
                d.running.store(true, Ordering::Relaxed);
                d.thread = Some(stream_reader(file, fifo, d.running.clone()));
                Ok(())
            }
            Device::WavFile(d) => {
                let mut file = std::fs::File::open(&d.path)?;
                file.seek(SeekFrom::Start(d.data_offset))?;
                d.running.store(true, Ordering::Relaxed);
                d.thread = Some(stream_reader(file, fifo, d.running.clone()));
                Ok(())
            }
            Device::Udp(d) => {
                let socket = UdpSocket::bind(("0.0.0.0", d.port))?;
                socket.set_read_timeout(Some(Duration::from_millis(500)))?;
                info!("source: listening for NMEA on UDP port {}", d.port);

                let running = d.running.clone();
                running.store(true, Ordering::Relaxed);
                let r2 = running.clone();
                d.thread = Some(std::thread::spawn(move || {
                    let mut buf = [0u8; 16384];
                    while r2.load(Ordering::Relaxed) && !stopflag::requested() {
                        match socket.recv_from(&mut buf) {
                            Ok((n, _)) => {
                                if !fifo.push(&buf[..n], false) {
                                    warn!("source: buffer overrun, dropping datagram");
                                }
                            }
                            Err(e)
                                if e.kind() == ErrorKind::WouldBlock
                                    || e.kind() == ErrorKind::TimedOut =>
                            {
                                continue
                            }
                            Err(e) => {
                                error!("source: UDP receive failed: {}", e);
                                break;
                            }
                        }
                    }
                    r2.store(false, Ordering::Relaxed);
                }));
                Ok(())
            }
            Device::Tcp(d) => {
                let stream = TcpStream::connect((d.host.as_str(), d.port))?;
                stream.set_read_timeout(Some(Duration::from_millis(500)))?;
                info!("source: reading NMEA from {}:{}", d.host, d.port);
                d.running.store(true, Ordering::Relaxed);
                d.thread = Some(stream_reader(stream, fifo, d.running.clone()));
                Ok(())
            }
            Device::Null => Ok(()),
        }
    }

    pub fn stop(&mut self) {
        let (running, thread) = match self {
            Device::RawFile(d) => (&d.running, &mut d.thread),
            Device::WavFile(d) => (&d.running, &mut d.thread),
            Device::Udp(d) => (&d.running, &mut d.thread),
            Device::Tcp(d) => (&d.running, &mut d.thread),
            Device::Null => return,
        };
        running.store(false, Ordering::Relaxed);
        if let Some(t) = thread.take() {
            let _ = t.join();
        }
    }

    pub fn is_streaming(&self) -> bool {
        match self {
            Device::RawFile(d) => d.running.load(Ordering::Relaxed),
            Device::WavFile(d) => d.running.load(Ordering::Relaxed),
            Device::Udp(d) => d.running.load(Ordering::Relaxed),
            Device::Tcp(d) => d.running.load(Ordering::Relaxed),
            Device::Null => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_raw_file_streams_into_fifo() {
        let dir = std::env::temp_dir().join("aislib_test_raw");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("samples.bin");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(&[1u8; 64]).unwrap();
        }

        let mut dev = Device::RawFile(FileRaw::new(path.to_str().unwrap(), Format::Cu8, 96000));
        dev.open().unwrap();
        assert_eq!(dev.format(), Format::Cu8);

        let fifo = Arc::new(Fifo::new(64, 4));
        dev.play(fifo.clone()).unwrap();

        assert!(fifo.wait());
        assert_eq!(fifo.front().unwrap(), vec![1u8; 64]);
        fifo.pop(1);
        dev.stop();
        assert!(fifo.finished());
    }

    #[test]
    fn test_wav_header_parse() {
        let dir = std::env::temp_dir().join("aislib_test_wav");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("iq.wav");
        {
            use byteorder::WriteBytesExt;
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(b"RIFF").unwrap();
            f.write_u32::<LittleEndian>(36 + 8).unwrap();
            f.write_all(b"WAVE").unwrap();
            f.write_all(b"fmt ").unwrap();
            f.write_u32::<LittleEndian>(16).unwrap();
            f.write_u16::<LittleEndian>(1).unwrap(); // PCM
            f.write_u16::<LittleEndian>(2).unwrap(); // stereo IQ
            f.write_u32::<LittleEndian>(96000).unwrap();
            f.write_u32::<LittleEndian>(96000 * 4).unwrap();
            f.write_u16::<LittleEndian>(4).unwrap();
            f.write_u16::<LittleEndian>(16).unwrap();
            f.write_all(b"data").unwrap();
            f.write_u32::<LittleEndian>(8).unwrap();
            f.write_all(&[0u8; 8]).unwrap();
        }

        let mut dev = Device::WavFile(FileWav::new(path.to_str().unwrap()));
        dev.open().unwrap();
        assert_eq!(dev.format(), Format::Cs16);
        assert_eq!(dev.sample_rate(), 96000);
    }

    #[test]
    fn test_wav_rejects_mono() {
        let dir = std::env::temp_dir().join("aislib_test_wav2");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mono.wav");
        {
            use byteorder::WriteBytesExt;
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(b"RIFF").unwrap();
            f.write_u32::<LittleEndian>(36).unwrap();
            f.write_all(b"WAVE").unwrap();
            f.write_all(b"fmt ").unwrap();
            f.write_u32::<LittleEndian>(16).unwrap();
            f.write_u16::<LittleEndian>(1).unwrap();
            f.write_u16::<LittleEndian>(1).unwrap(); // mono
            f.write_u32::<LittleEndian>(48000).unwrap();
            f.write_u32::<LittleEndian>(48000 * 2).unwrap();
            f.write_u16::<LittleEndian>(2).unwrap();
            f.write_u16::<LittleEndian>(16).unwrap();
        }

        let mut dev = Device::WavFile(FileWav::new(path.to_str().unwrap()));
        assert!(matches!(dev.open(), Err(DeviceError::Config(_))));
    }
}
