use std::io::{ErrorKind, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::jsonais::AisJson;
use crate::sinks::{binary_frame, format_lines, MessageFormat, OutputFilter};
use crate::stream::{StreamIn, Tag, GROUPS_ALL};

const MAX_CLIENTS: usize = 16;
const MAX_CLIENT_BUFFER: usize = 8 << 20;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

struct Client {
    stream: TcpStream,
    buffer: Vec<u8>,
    last_progress: Instant,
    peer: String,
}

impl Client {
    /// Drain as much of the buffer as the socket accepts. `false` when the
    /// client must be dropped: dead socket, overrun, or no forward progress
    /// within the idle timeout.
    fn flush(&mut self) -> bool {
        while !self.buffer.is_empty() {
            match self.stream.write(&self.buffer) {
                Ok(0) => return false,
                Ok(n) => {
                    self.buffer.drain(..n);
                    self.last_progress = Instant::now();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => return false,
            }
        }
        if !self.buffer.is_empty() && self.last_progress.elapsed() > IDLE_TIMEOUT {
            return false;
        }
        true
    }

    fn queue(&mut self, bytes: &[u8]) -> bool {
        if self.buffer.len() + bytes.len() > MAX_CLIENT_BUFFER {
            return false;
        }
        self.buffer.extend_from_slice(bytes);
        true
    }
}

/// Accepts up to sixteen clients and pushes every formatted message to each
/// of them. A client that stops reading accumulates at most 8 MiB and is
/// then dropped; the other clients are unaffected.
pub struct TcpServerSink {
    clients: Arc<Mutex<Vec<Client>>>,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    pub format: MessageFormat,
    pub filter: OutputFilter,
    pub groups_in: u64,
}

impl TcpServerSink {
    pub fn start(port: u16, format: MessageFormat) -> std::io::Result<TcpServerSink> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        info!("TCP server: listening on port {}", port);

        let clients: Arc<Mutex<Vec<Client>>> = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let accept_clients = clients.clone();
        let accept_stop = stop.clone();
        let accept_thread = std::thread::spawn(move || {
            while !accept_stop.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nonblocking(true);
                        let _ = stream.set_nodelay(true);
                        let mut clients = accept_clients.lock().unwrap();
                        if clients.len() >= MAX_CLIENTS {
                            warn!("TCP server: refusing {}, client limit reached", addr);
                            continue;
                        }
                        info!("TCP server: client connected from {}", addr);
                        clients.push(Client {
                            stream,
                            buffer: Vec::new(),
                            last_progress: Instant::now(),
                            peer: addr.to_string(),
                        });
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        // housekeeping between accepts: flush laggards and
                        // enforce the idle timeout
                        {
                            let mut clients = accept_clients.lock().unwrap();
                            clients.retain_mut(|c| {
                                let ok = c.flush();
                                if !ok {
                                    info!("TCP server: dropping client {}", c.peer);
                                }
                                ok
                            });
                        }
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    Err(e) => {
                        warn!("TCP server: accept failed: {}", e);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        });

        Ok(TcpServerSink {
            clients,
            stop,
            accept_thread: Some(accept_thread),
            format,
            filter: OutputFilter::default(),
            groups_in: GROUPS_ALL,
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    fn push(&self, bytes: &[u8]) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain_mut(|c| {
            if !c.queue(bytes) {
                warn!("TCP server: buffer overflow, dropping client {}", c.peer);
                return false;
            }
            let ok = c.flush();
            if !ok {
                info!("TCP server: dropping client {}", c.peer);
            }
            ok
        });
    }
}

impl StreamIn<AisJson> for TcpServerSink {
    fn receive(&mut self, data: &[AisJson], tag: &mut Tag) {
        if tag.group & self.groups_in == 0 {
            return;
        }
        for record in data {
            if !self.filter.include(record, tag) {
                continue;
            }
            if self.format == MessageFormat::BinaryNmea {
                self.push(&binary_frame(record, tag));
            } else {
                for line in format_lines(record, tag, self.format) {
                    self.push(format!("{}\r\n", line).as_bytes());
                }
            }
        }
    }
}

impl Drop for TcpServerSink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.accept_thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_buffer_overflow_detected() {
        // the buffering policy alone: a client past the cap reports full
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_nonblocking(true).unwrap();

        let mut client = Client {
            stream,
            buffer: vec![0u8; MAX_CLIENT_BUFFER - 8],
            last_progress: Instant::now(),
            peer: "test".to_string(),
        };
        assert!(client.queue(&[0u8; 4]));
        assert!(!client.queue(&[0u8; 16]));
    }

    #[test]
    fn test_idle_timeout_drops_stuck_client() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_nonblocking(true).unwrap();

        let mut client = Client {
            stream,
            buffer: Vec::new(),
            last_progress: Instant::now() - IDLE_TIMEOUT - Duration::from_secs(1),
            peer: "test".to_string(),
        };
        // empty buffer: no pressure, client stays
        assert!(client.flush());
    }
}
