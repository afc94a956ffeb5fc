use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use serde_json::{json, Value};

use crate::jsonais::AisJson;
use crate::sinks::{sparse, OutputFilter};
use crate::stream::{StreamIn, Tag, GROUPS_ALL};

const MAX_QUEUE: usize = 4096;

/// Which dictionary the aggregator receives.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PostDictionary {
    Full,
    Minimal,
}

/// Station identity embedded in every envelope.
#[derive(Clone, Debug, Default)]
pub struct StationInfo {
    pub id: String,
    pub lat: f32,
    pub lon: f32,
    pub hardware: String,
    pub driver: String,
    pub model: String,
}

struct Shared {
    queue: Mutex<Vec<Value>>,
    wakeup: Condvar,
}

/// Batches messages and POSTs them to an HTTP aggregator on a fixed
/// interval from its own thread; a failed or rejected post is logged and
/// retried implicitly with the next batch. Ingest is never blocked.
pub struct HttpPoster {
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    dictionary: PostDictionary,
    pub filter: OutputFilter,
    pub groups_in: u64,
}

fn envelope(station: &StationInfo, msgs: Vec<Value>) -> Value {
    json!({
        "protocol": "jsonaiscatcher",
        "encodetime": Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        "stationid": station.id,
        "station_lat": station.lat,
        "station_lon": station.lon,
        "receiver": {
            "description": "AIS-catcher",
            "version": env!("CARGO_PKG_VERSION"),
            "engine": station.model,
        },
        "device": {
            "product": station.hardware,
            "vendor": station.driver,
        },
        "msgs": msgs,
    })
}

fn post_batch(client: &reqwest::blocking::Client, url: &str, body: &Value) {
    match client.post(url).json(body).send() {
        Ok(resp) => {
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().unwrap_or_default();
                warn!("HTTP output: {} rejected with {}: {}", url, status, text);
            }
        }
        Err(e) => {
            warn!("HTTP output: post to {} failed: {}", url, e);
        }
    }
}

impl HttpPoster {
    pub fn start(
        url: &str,
        interval: Duration,
        station: StationInfo,
        dictionary: PostDictionary,
    ) -> HttpPoster {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Vec::new()),
            wakeup: Condvar::new(),
        });
        let stop = Arc::new(AtomicBool::new(false));

        let url = url.to_string();
        let thread_shared = shared.clone();
        let thread_stop = stop.clone();
        let thread = std::thread::spawn(move || {
            let client = match reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
            {
                Ok(c) => c,
                Err(e) => {
                    warn!("HTTP output: cannot build client: {}", e);
                    return;
                }
            };

            while !thread_stop.load(Ordering::Relaxed) {
                let batch = {
                    let guard = thread_shared.queue.lock().unwrap();
                    let (mut guard, _) = thread_shared
                        .wakeup
                        .wait_timeout_while(guard, interval, |_| {
                            !thread_stop.load(Ordering::Relaxed)
                        })
                        .unwrap();
                    std::mem::take(&mut *guard)
                };

                if batch.is_empty() {
                    continue;
                }
                debug!("HTTP output: posting {} messages to {}", batch.len(), url);
                post_batch(&client, &url, &envelope(&station, batch));
            }
        });

        HttpPoster {
            shared,
            stop,
            thread: Some(thread),
            dictionary,
            filter: OutputFilter::default(),
            groups_in: GROUPS_ALL,
        }
    }
}

impl StreamIn<AisJson> for HttpPoster {
    fn receive(&mut self, data: &[AisJson], tag: &mut Tag) {
        if tag.group & self.groups_in == 0 {
            return;
        }
        let mut queue = self.shared.queue.lock().unwrap();
        for record in data {
            if !self.filter.include(record, tag) {
                continue;
            }
            if queue.len() >= MAX_QUEUE {
                // aggregator is unreachable or slow: shed oldest first
                queue.remove(0);
            }
            queue.push(match self.dictionary {
                PostDictionary::Full => record.value.clone(),
                PostDictionary::Minimal => sparse(&record.value),
            });
        }
    }
}

impl Drop for HttpPoster {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.shared.wakeup.notify_all();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let station = StationInfo {
            id: "station1".into(),
            lat: 52.0,
            lon: 4.0,
            hardware: "RTL2838".into(),
            driver: "rtlsdr".into(),
            model: "AIS engine".into(),
        };
        let v = envelope(&station, vec![json!({"mmsi": 1})]);
        assert_eq!(v["protocol"], "jsonaiscatcher");
        assert_eq!(v["stationid"], "station1");
        assert_eq!(v["station_lat"], 52.0);
        assert_eq!(v["receiver"]["description"], "AIS-catcher");
        assert_eq!(v["device"]["product"], "RTL2838");
        assert_eq!(v["msgs"].as_array().unwrap().len(), 1);
    }
}
