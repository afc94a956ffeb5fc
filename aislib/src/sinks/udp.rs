use std::net::UdpSocket;
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::jsonais::AisJson;
use crate::sinks::{format_lines, MessageFormat, OutputFilter};
use crate::stream::{StreamIn, Tag, GROUPS_ALL};

/// Fire-and-forget datagram output, one sentence per packet. Some receivers
/// leak state on long-lived UDP flows, so the socket can be recreated on a
/// timer.
pub struct UdpSink {
    host: String,
    port: u16,
    socket: Option<UdpSocket>,
    broadcast: bool,
    reset_interval: Option<Duration>,
    last_reset: Instant,
    pub format: MessageFormat,
    pub filter: OutputFilter,
    pub groups_in: u64,
}

impl UdpSink {
    pub fn new(host: &str, port: u16) -> UdpSink {
        UdpSink {
            host: host.to_string(),
            port,
            socket: None,
            broadcast: false,
            reset_interval: None,
            last_reset: Instant::now(),
            format: MessageFormat::Nmea,
            filter: OutputFilter::default(),
            groups_in: GROUPS_ALL,
        }
    }

    pub fn set_broadcast(&mut self, b: bool) {
        self.broadcast = b;
        self.socket = None;
    }

    pub fn set_reset_interval(&mut self, secs: u64) {
        self.reset_interval = if secs == 0 {
            None
        } else {
            Some(Duration::from_secs(secs))
        };
    }

    fn socket(&mut self) -> Option<&UdpSocket> {
        if let Some(interval) = self.reset_interval {
            if self.last_reset.elapsed() > interval {
                self.socket = None;
                self.last_reset = Instant::now();
            }
        }
        if self.socket.is_none() {
            match UdpSocket::bind("0.0.0.0:0") {
                Ok(s) => {
                    if self.broadcast {
                        if let Err(e) = s.set_broadcast(true) {
                            error!("UDP output: cannot enable broadcast: {}", e);
                        }
                    }
                    self.socket = Some(s);
                }
                Err(e) => {
                    error!("UDP output: cannot create socket: {}", e);
                    return None;
                }
            }
        }
        self.socket.as_ref()
    }
}

impl StreamIn<AisJson> for UdpSink {
    fn receive(&mut self, data: &[AisJson], tag: &mut Tag) {
        if tag.group & self.groups_in == 0 {
            return;
        }
        let dest = format!("{}:{}", self.host, self.port);
        for record in data {
            if !self.filter.include(record, tag) {
                continue;
            }
            let lines = format_lines(record, tag, self.format);
            let socket = match self.socket() {
                Some(s) => s,
                None => return,
            };
            for line in lines {
                // fire and forget; a refused datagram is not an error worth
                // more than a debug line
                if let Err(e) = socket.send_to(format!("{}\r\n", line).as_bytes(), &dest) {
                    debug!("UDP output: send failed: {}", e);
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

    #[test]
    fn test_datagram_per_sentence() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut sink = UdpSink::new("127.0.0.1", port);
        let mut m = Message::new();
        for c in "15RTgt0PAso;90TKcjM8h6g208CQ".chars() {
            m.append_letter(c);
        }
        m.nmea
            .push("!AIVDM,1,1,,A,15RTgt0PAso;90TKcjM8h6g208CQ,0*4A".to_string());
        let record = AisJson {
            value: jsonify(&m, &Tag::default()),
            msg: m,
        };

        let mut tag = Tag::default();
        sink.receive(&[record], &mut tag);

        let mut buf = [0u8; 512];
        let (n, _) = listener.recv_from(&mut buf).unwrap();
        let line = String::from_utf8_lossy(&buf[..n]);
        assert!(line.starts_with("!AIVDM"));
        assert!(line.ends_with("\r\n"));
    }
}
