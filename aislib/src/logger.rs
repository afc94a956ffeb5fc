use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{Level, LevelFilter, Log, Metadata, Record};

/// One buffered log line, kept for the web front-end's `log` topic.
#[derive(Clone, Debug)]
pub struct LogMessage {
    pub level: Level,
    pub message: String,
    pub time: String,
}

impl LogMessage {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "level": self.level.to_string(),
            "message": self.message,
            "time": self.time,
        })
    }
}

type Listener = Box<dyn Fn(&LogMessage) + Send>;

struct Inner {
    ring: VecDeque<LogMessage>,
    capacity: usize,
    listeners: Vec<(usize, Listener)>,
    next_id: usize,
}

/// Shared log buffer behind the `log` facade: stderr output, a bounded ring
/// of recent messages, and listener fan-out for live streaming.
pub struct LogBuffer {
    inner: Mutex<Inner>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Arc<LogBuffer> {
        Arc::new(LogBuffer {
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(capacity),
                capacity,
                listeners: Vec::new(),
                next_id: 1,
            }),
        })
    }

    pub fn add_listener(&self, f: Listener) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, f));
        id
    }

    pub fn remove_listener(&self, id: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.retain(|(i, _)| *i != id);
    }

    pub fn last_messages(&self, n: usize) -> Vec<LogMessage> {
        let inner = self.inner.lock().unwrap();
        inner.ring.iter().rev().take(n).rev().cloned().collect()
    }

    fn store(&self, msg: LogMessage) {
        let mut inner = self.inner.lock().unwrap();
        if inner.ring.len() == inner.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(msg.clone());
        for (_, l) in &inner.listeners {
            l(&msg);
        }
    }
}

struct StationLogger {
    buffer: Arc<LogBuffer>,
}

impl Log for StationLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let msg = LogMessage {
            level: record.level(),
            message: record.args().to_string(),
            time: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        eprintln!("{} [{}] {}", msg.time, msg.level, msg.message);
        self.buffer.store(msg);
    }

    fn flush(&self) {}
}

/// Install the station logger. Returns the shared buffer so the web server
/// can serve recent messages and register a live listener.
pub fn init(level: LevelFilter, capacity: usize) -> Arc<LogBuffer> {
    let buffer = LogBuffer::new(capacity);
    let logger = StationLogger {
        buffer: buffer.clone(),
    };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(level);
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_capacity() {
        let buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.store(LogMessage {
                level: Level::Info,
                message: format!("m{}", i),
                time: String::new(),
            });
        }
        let last = buf.last_messages(10);
        assert_eq!(last.len(), 3);
        assert_eq!(last[0].message, "m2");
        assert_eq!(last[2].message, "m4");
    }

    #[test]
    fn test_listener_fanout() {
        let buf = LogBuffer::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let id = buf.add_listener(Box::new(move |m| {
            seen2.lock().unwrap().push(m.message.clone());
        }));
        buf.store(LogMessage {
            level: Level::Warn,
            message: "hello".into(),
            time: String::new(),
        });
        buf.remove_listener(id);
        buf.store(LogMessage {
            level: Level::Warn,
            message: "gone".into(),
            time: String::new(),
        });
        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
    }
}
