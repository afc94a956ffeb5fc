use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use futures::Stream;
use log::{error, info};
use serde_json::json;
use tokio::sync::broadcast;

use crate::db::Database;
use crate::jsonais::AisJson;
use crate::logger::LogBuffer;
use crate::stats::StatCounter;
use crate::stream::{StreamIn, Tag, GROUPS_ALL};

/// Station identity shown by the front-end endpoints.
#[derive(Clone, Debug, Default)]
pub struct StationIdentity {
    pub name: String,
    pub lat: f32,
    pub lon: f32,
    pub share_loc: bool,
}

#[derive(Clone)]
pub struct WebState {
    pub db: Arc<Mutex<Database>>,
    pub stats: Arc<Mutex<StatCounter>>,
    pub log_buffer: Arc<LogBuffer>,
    pub station: StationIdentity,
    pub ais_tx: broadcast::Sender<String>,
    pub nmea_tx: broadcast::Sender<String>,
    pub log_tx: broadcast::Sender<String>,
}

impl WebState {
    pub fn new(
        db: Arc<Mutex<Database>>,
        stats: Arc<Mutex<StatCounter>>,
        log_buffer: Arc<LogBuffer>,
        station: StationIdentity,
    ) -> WebState {
        let (ais_tx, _) = broadcast::channel(256);
        let (nmea_tx, _) = broadcast::channel(256);
        let (log_tx, _) = broadcast::channel(64);
        WebState {
            db,
            stats,
            log_buffer,
            station,
            ais_tx,
            nmea_tx,
            log_tx,
        }
    }
}

/// Pipeline tap feeding the live SSE topics.
pub struct SseBridge {
    ais_tx: broadcast::Sender<String>,
    nmea_tx: broadcast::Sender<String>,
    pub groups_in: u64,
}

impl SseBridge {
    pub fn new(state: &WebState) -> SseBridge {
        SseBridge {
            ais_tx: state.ais_tx.clone(),
            nmea_tx: state.nmea_tx.clone(),
            groups_in: GROUPS_ALL,
        }
    }
}

impl StreamIn<AisJson> for SseBridge {
    fn receive(&mut self, data: &[AisJson], tag: &mut Tag) {
        if tag.group & self.groups_in == 0 {
            return;
        }
        for record in data {
            // subscriber loss is normal when no browser is attached
            let _ = self.ais_tx.send(record.value.to_string());
            for line in &record.msg.nmea {
                let _ = self.nmea_tx.send(line.clone());
            }
        }
    }
}

fn no_store(content_type: &'static str, body: String) -> impl IntoResponse {
    (
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::CONTENT_TYPE, content_type),
        ],
        body,
    )
}

async fn index() -> Html<&'static str> {
    Html(
        "<!doctype html><title>AIS station</title>\
         <p>Endpoints: /ships.json /ships_array.json /ships.geojson /path.json?mmsi= \
         /allpath.json /kml /stats.json /messages.json /message?mmsi= /ship?mmsi= \
         /about.json /sse/ais /sse/nmea /sse/log</p>",
    )
}

async fn ships_json(State(s): State<WebState>) -> impl IntoResponse {
    no_store("application/json", s.db.lock().unwrap().get_json(false))
}

async fn ships_full_json(State(s): State<WebState>) -> impl IntoResponse {
    no_store("application/json", s.db.lock().unwrap().get_json(true))
}

async fn ships_array_json(State(s): State<WebState>) -> impl IntoResponse {
    no_store("application/json", s.db.lock().unwrap().get_json_compact(false))
}

async fn ships_geojson(State(s): State<WebState>) -> impl IntoResponse {
    no_store("application/geo+json", s.db.lock().unwrap().get_geojson())
}

fn mmsi_param(params: &HashMap<String, String>) -> u32 {
    params
        .get("mmsi")
        .and_then(|m| m.parse().ok())
        .unwrap_or(0)
}

async fn path_json(
    State(s): State<WebState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mmsi = mmsi_param(&params);
    no_store("application/json", s.db.lock().unwrap().get_path_json(mmsi))
}

async fn path_geojson(
    State(s): State<WebState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mmsi = mmsi_param(&params);
    no_store(
        "application/geo+json",
        s.db.lock().unwrap().get_path_geojson(mmsi),
    )
}

async fn allpath_json(State(s): State<WebState>) -> impl IntoResponse {
    no_store("application/json", s.db.lock().unwrap().get_all_path_json())
}

async fn kml(State(s): State<WebState>) -> impl IntoResponse {
    no_store(
        "application/vnd.google-earth.kml+xml",
        s.db.lock().unwrap().get_kml(),
    )
}

async fn stats_json(State(s): State<WebState>) -> impl IntoResponse {
    let mut v = s.stats.lock().unwrap().to_json();
    if let Some(obj) = v.as_object_mut() {
        obj.insert("station".into(), json!(s.station.name));
        if s.station.share_loc {
            obj.insert("station_lat".into(), json!(s.station.lat));
            obj.insert("station_lon".into(), json!(s.station.lon));
        }
        obj.insert("vessel_count".into(), json!(s.db.lock().unwrap().count()));
    }
    no_store("application/json", v.to_string())
}

async fn messages_json(State(s): State<WebState>) -> impl IntoResponse {
    no_store(
        "application/json",
        s.db.lock().unwrap().get_binary_messages_json(),
    )
}

async fn message(
    State(s): State<WebState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mmsi = mmsi_param(&params);
    no_store("application/json", s.db.lock().unwrap().get_message(mmsi))
}

async fn ship(
    State(s): State<WebState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mmsi = mmsi_param(&params);
    no_store("application/json", s.db.lock().unwrap().get_ship_json(mmsi))
}

async fn about_json(State(s): State<WebState>) -> impl IntoResponse {
    let body = json!({
        "station": s.station.name,
        "version": env!("CARGO_PKG_VERSION"),
        "log": s.log_buffer.last_messages(32).iter().map(|m| m.to_json()).collect::<Vec<_>>(),
    });
    no_store("application/json", body.to_string())
}

fn event_stream(
    rx: broadcast::Receiver<String>,
    topic: &'static str,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    futures::stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(s) => return Some((Ok(Event::default().event(topic).data(s)), rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

async fn sse_ais(State(s): State<WebState>) -> impl IntoResponse {
    Sse::new(event_stream(s.ais_tx.subscribe(), "ais")).keep_alive(KeepAlive::default())
}

async fn sse_nmea(State(s): State<WebState>) -> impl IntoResponse {
    Sse::new(event_stream(s.nmea_tx.subscribe(), "nmea")).keep_alive(KeepAlive::default())
}

async fn sse_log(State(s): State<WebState>) -> impl IntoResponse {
    Sse::new(event_stream(s.log_tx.subscribe(), "log")).keep_alive(KeepAlive::default())
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ships.json", get(ships_json))
        .route("/ships_full.json", get(ships_full_json))
        .route("/ships_array.json", get(ships_array_json))
        .route("/ships.geojson", get(ships_geojson))
        .route("/path.json", get(path_json))
        .route("/path.geojson", get(path_geojson))
        .route("/allpath.json", get(allpath_json))
        .route("/kml", get(kml))
        .route("/stats.json", get(stats_json))
        .route("/messages.json", get(messages_json))
        .route("/message", get(message))
        .route("/ship", get(ship))
        .route("/about.json", get(about_json))
        .route("/sse/ais", get(sse_ais))
        .route("/sse/nmea", get(sse_nmea))
        .route("/sse/log", get(sse_log))
        .with_state(state)
}

/// HTTP server on its own thread with a single-threaded runtime. The
/// pipeline never blocks on it; all shared state is behind the same mutexes
/// the pipeline uses per call.
pub struct WebServer {
    thread: Option<JoinHandle<()>>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl WebServer {
    pub fn start(port: u16, state: WebState) -> WebServer {
        // mirror buffered log lines onto the live log topic
        let log_tx = state.log_tx.clone();
        state.log_buffer.add_listener(Box::new(move |m| {
            let _ = log_tx.send(m.to_json().to_string());
        }));

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let thread = std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("web server: cannot start runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async move {
                let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
                    Ok(l) => l,
                    Err(e) => {
                        error!("web server: cannot bind port {}: {}", port, e);
                        return;
                    }
                };
                info!("web server: listening on port {}", port);

                let app = router(state);
                let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                });
                if let Err(e) = serve.await {
                    error!("web server: {}", e);
                }
            });
        });

        WebServer {
            thread: Some(thread),
            shutdown: Some(shutdown_tx),
        }
    }
}

impl Drop for WebServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LogBuffer;

    fn state() -> WebState {
        WebState::new(
            Arc::new(Mutex::new(Database::with_capacity(16, 64))),
            Arc::new(Mutex::new(StatCounter::new())),
            LogBuffer::new(16),
            StationIdentity {
                name: "test".into(),
                lat: 52.0,
                lon: 4.0,
                share_loc: true,
            },
        )
    }

    #[test]
    fn test_router_builds() {
        let _ = router(state());
    }

    #[test]
    fn test_sse_bridge_topics() {
        let s = state();
        let mut ais_rx = s.ais_tx.subscribe();
        let mut nmea_rx = s.nmea_tx.subscribe();

        let mut bridge = SseBridge::new(&s);
        let mut m = crate::ais::Message::new();
        for c in "15RTgt0PAso;90TKcjM8h6g208CQ".chars() {
            m.append_letter(c);
        }
        m.nmea
            .push("!AIVDM,1,1,,A,15RTgt0PAso;90TKcjM8h6g208CQ,0*4A".to_string());
        let record = AisJson {
            value: crate::jsonais::jsonify(&m, &Tag::default()),
            msg: m,
        };

        let mut tag = Tag::default();
        bridge.receive(&[record], &mut tag);

        assert!(ais_rx.try_recv().unwrap().contains("371798000"));
        assert!(nmea_rx.try_recv().unwrap().starts_with("!AIVDM"));
    }
}
