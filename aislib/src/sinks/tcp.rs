use std::io::{ErrorKind, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::jsonais::AisJson;
use crate::sinks::{binary_frame, format_lines, MessageFormat, OutputFilter};
use crate::stream::{stopflag, StreamIn, Tag, GROUPS_ALL};

const MAX_PENDING: usize = 1 << 20;
const MAX_BACKOFF_SECS: u64 = 60;

/// Persistent TCP client with non-blocking writes and reconnect backoff.
/// When not persistent, a lost connection requests pipeline shutdown.
pub struct TcpClientSink {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    pending: Vec<u8>,
    persistent: bool,
    backoff: Duration,
    next_attempt: Instant,
    pub format: MessageFormat,
    pub filter: OutputFilter,
    pub groups_in: u64,
}

impl TcpClientSink {
    pub fn new(host: &str, port: u16) -> TcpClientSink {
        TcpClientSink {
            host: host.to_string(),
            port,
            stream: None,
            pending: Vec::new(),
            persistent: true,
            backoff: Duration::from_secs(2),
            next_attempt: Instant::now(),
            format: MessageFormat::Nmea,
            filter: OutputFilter::default(),
            groups_in: GROUPS_ALL,
        }
    }

    pub fn set_persistent(&mut self, b: bool) {
        self.persistent = b;
    }

    fn disconnect(&mut self) {
        self.stream = None;
        self.pending.clear();
        if self.persistent {
            self.next_attempt = Instant::now() + self.backoff;
            self.backoff = (self.backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
        } else {
            warn!("TCP output: connection lost, requesting stop");
            stopflag::request();
        }
    }

    fn ensure_connected(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        if Instant::now() < self.next_attempt {
            return false;
        }
        match TcpStream::connect((self.host.as_str(), self.port)) {
            Ok(s) => {
                let _ = s.set_nonblocking(true);
                let _ = s.set_nodelay(true);
                self.stream = Some(s);
                self.backoff = Duration::from_secs(2);
                debug!("TCP output: connected to {}:{}", self.host, self.port);
                true
            }
            Err(e) => {
                debug!("TCP output: connect {}:{} failed: {}", self.host, self.port, e);
                self.next_attempt = Instant::now() + self.backoff;
                self.backoff = (self.backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
                false
            }
        }
    }

    /// Push pending bytes out without blocking the pipeline. Unsent bytes
    /// stay buffered up to a bound; beyond that the connection is deemed
    /// dead.
    fn flush_pending(&mut self) {
        let mut lost = false;
        if let Some(stream) = &mut self.stream {
            while !self.pending.is_empty() {
                match stream.write(&self.pending) {
                    Ok(0) => {
                        lost = true;
                        break;
                    }
                    Ok(n) => {
                        self.pending.drain(..n);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("TCP output: write failed: {}", e);
                        lost = true;
                        break;
                    }
                }
            }
        }
        if lost {
            self.disconnect();
        }
    }

    fn queue(&mut self, bytes: &[u8]) {
        if self.pending.len() + bytes.len() > MAX_PENDING {
            warn!("TCP output: send buffer overflow, dropping connection");
            self.disconnect();
            return;
        }
        self.pending.extend_from_slice(bytes);
    }
}

impl StreamIn<AisJson> for TcpClientSink {
    fn receive(&mut self, data: &[AisJson], tag: &mut Tag) {
        if tag.group & self.groups_in == 0 {
            return;
        }
        if !self.ensure_connected() {
            return;
        }
        for record in data {
            if !self.filter.include(record, tag) {
                continue;
            }
            if self.format == MessageFormat::BinaryNmea {
                let frame = binary_frame(record, tag);
                self.queue(&frame);
            } else {
                for line in format_lines(record, tag, self.format) {
                    self.queue(format!("{}\r\n", line).as_bytes());
                }
            }
        }
        self.flush_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ais::Message;
    use crate::jsonais::jsonify;
    use std::io::Read;
    use std::net::TcpListener;

    fn record() -> AisJson {
        let mut m = Message::new();
        for c in "15RTgt0PAso;90TKcjM8h6g208CQ".chars() {
            m.append_letter(c);
        }
        m.nmea
            .push("!AIVDM,1,1,,A,15RTgt0PAso;90TKcjM8h6g208CQ,0*4A".to_string());
        AisJson {
            value: jsonify(&m, &Tag::default()),
            msg: m,
        }
    }

    #[test]
    fn test_sends_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut sink = TcpClientSink::new("127.0.0.1", port);
        let mut tag = Tag::default();
        sink.receive(&[record()], &mut tag);

        let (mut peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

        // connection races the first write; a second receive flushes
        sink.receive(&[record()], &mut tag);

        let mut buf = [0u8; 1024];
        let n = peer.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("!AIVDM"));
    }

    #[test]
    fn test_reconnect_backoff_when_closed() {
        let mut sink = TcpClientSink::new("127.0.0.1", 1);
        assert!(!sink.ensure_connected());
        // within the backoff window the sink does not retry
        assert!(Instant::now() < sink.next_attempt);
        assert!(!sink.ensure_connected());
    }
}
