use std::sync::{Arc, Mutex};

/// Accept-everything mask for stream inputs.
pub const GROUPS_ALL: u64 = u64::MAX;

/// Sentinel for "this output does not rewrite the tag group".
pub const GROUP_OUT_UNDEFINED: u64 = 0;

pub const LAT_UNDEFINED: f32 = 91.0;
pub const LON_UNDEFINED: f32 = 181.0;
pub const LEVEL_UNDEFINED: f32 = -128.0;
pub const PPM_UNDEFINED: f32 = -128.0;
pub const DISTANCE_UNDEFINED: f32 = -1.0;
pub const ANGLE_UNDEFINED: i32 = -1;
pub const SPEED_UNDEFINED: f32 = -1.0;

// tag.mode bits, set from the command line tag string [D/T/M]
pub const TAG_MODE_SIGNAL: u8 = 1;
pub const TAG_MODE_TIME: u8 = 2;
pub const TAG_MODE_STATION: u8 = 4;

/// Out-of-band metadata carried along every stream edge. Created at the
/// source, mutated by enrichers (the vessel database fills in distance,
/// bearing and the ship snapshot fields).
#[derive(Clone, Debug)]
pub struct Tag {
    pub group: u64,
    pub mode: u8,
    pub level: f32,
    pub ppm: f32,
    pub station: u16,
    pub ipv4: u32,
    pub sample_idx: u64,
    pub lat: f32,
    pub lon: f32,
    pub distance: f32,
    pub angle: i32,
    pub validated: bool,
    pub previous_signal: i64,
    pub shipclass: i32,
    pub speed: f32,
    pub shipname: String,
    pub hardware: String,
    pub driver: String,
}

impl Default for Tag {
    fn default() -> Tag {
        Tag {
            group: GROUP_OUT_UNDEFINED,
            mode: 0,
            level: LEVEL_UNDEFINED,
            ppm: PPM_UNDEFINED,
            station: 0,
            ipv4: 0,
            sample_idx: 0,
            lat: LAT_UNDEFINED,
            lon: LON_UNDEFINED,
            distance: DISTANCE_UNDEFINED,
            angle: ANGLE_UNDEFINED,
            validated: false,
            previous_signal: 0,
            shipclass: 0,
            speed: SPEED_UNDEFINED,
            shipname: String::new(),
            hardware: String::new(),
            driver: String::new(),
        }
    }
}

impl Tag {
    /// Reset the per-message fields; mode, station and hardware identity are
    /// per-pipeline and survive.
    pub fn clear(&mut self) {
        self.level = LEVEL_UNDEFINED;
        self.ppm = PPM_UNDEFINED;
        self.lat = LAT_UNDEFINED;
        self.lon = LON_UNDEFINED;
        self.distance = DISTANCE_UNDEFINED;
        self.angle = ANGLE_UNDEFINED;
        self.validated = false;
        self.previous_signal = 0;
        self.shipclass = 0;
        self.speed = SPEED_UNDEFINED;
        self.shipname.clear();
    }
}

/// A typed stream input. `receive` is invoked synchronously on the sender's
/// thread; a stage that wants to change threads interposes an explicit queue.
pub trait StreamIn<T>: Send {
    fn receive(&mut self, data: &[T], tag: &mut Tag);
}

/// Shared handle to a downstream input. The mutex is the per-object lock of
/// the concurrency model: it is held for the duration of one `receive` call.
pub type SharedStreamIn<T> = Arc<Mutex<dyn StreamIn<T>>>;

/// A typed output edge fanning out to zero or more inputs.
///
/// Connections are installed during the configuration phase and are
/// read-only once the pipeline runs.
pub struct Connection<T> {
    connections: Vec<SharedStreamIn<T>>,
    group_out: u64,
}

impl<T> Default for Connection<T> {
    fn default() -> Self {
        Connection {
            connections: Vec::new(),
            group_out: GROUP_OUT_UNDEFINED,
        }
    }
}

impl<T> Connection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, s: SharedStreamIn<T>) {
        self.connections.push(s);
    }

    /// Install the edge only when the output and input group masks overlap.
    pub fn connect_masked(&mut self, s: SharedStreamIn<T>, groups_in: u64) -> bool {
        if !self.can_connect(groups_in) {
            return false;
        }
        self.connections.push(s);
        true
    }

    pub fn can_connect(&self, groups_in: u64) -> bool {
        let out = if self.group_out == GROUP_OUT_UNDEFINED {
            GROUPS_ALL
        } else {
            self.group_out
        };
        out & groups_in != 0
    }

    pub fn set_group_out(&mut self, g: u64) {
        self.group_out = g;
    }

    pub fn group_out(&self) -> u64 {
        self.group_out
    }

    pub fn is_connected(&self) -> bool {
        !self.connections.is_empty()
    }

    pub fn clear(&mut self) {
        self.connections.clear();
    }

    /// Synchronous fan-out. Rewrites `tag.group` when this output carries an
    /// explicit group mask.
    pub fn send(&self, data: &[T], tag: &mut Tag) {
        if self.connections.is_empty() {
            return;
        }
        if self.group_out != GROUP_OUT_UNDEFINED {
            tag.group = self.group_out;
        }
        for c in &self.connections {
            c.lock().unwrap().receive(data, tag);
        }
    }
}

/// Forwards unchanged; useful to give a stage an attachable output edge.
pub struct PassThrough<T> {
    pub out: Connection<T>,
}

impl<T> Default for PassThrough<T> {
    fn default() -> Self {
        PassThrough {
            out: Connection::new(),
        }
    }
}

impl<T: Send> StreamIn<T> for PassThrough<T> {
    fn receive(&mut self, data: &[T], tag: &mut Tag) {
        self.out.send(data, tag);
    }
}

/// Process-wide stop request, polled by sources between blocks.
pub mod stopflag {
    use std::sync::atomic::{AtomicBool, Ordering};

    static STOP: AtomicBool = AtomicBool::new(false);

    pub fn request() {
        STOP.store(true, Ordering::Relaxed);
    }

    pub fn requested() -> bool {
        STOP.load(Ordering::Relaxed)
    }

    pub fn reset() {
        STOP.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect {
        seen: Vec<u32>,
        group_seen: u64,
    }

    impl StreamIn<u32> for Collect {
        fn receive(&mut self, data: &[u32], tag: &mut Tag) {
            self.seen.extend_from_slice(data);
            self.group_seen = tag.group;
        }
    }

    #[test]
    fn test_fanout_and_group_rewrite() {
        let a = Arc::new(Mutex::new(Collect {
            seen: Vec::new(),
            group_seen: 0,
        }));
        let b = Arc::new(Mutex::new(Collect {
            seen: Vec::new(),
            group_seen: 0,
        }));

        let mut conn: Connection<u32> = Connection::new();
        conn.set_group_out(0b100);
        assert!(conn.connect_masked(a.clone(), GROUPS_ALL));
        assert!(conn.connect_masked(b.clone(), 0b110));

        let mut tag = Tag::default();
        conn.send(&[1, 2, 3], &mut tag);

        assert_eq!(a.lock().unwrap().seen, vec![1, 2, 3]);
        assert_eq!(b.lock().unwrap().seen, vec![1, 2, 3]);
        assert_eq!(b.lock().unwrap().group_seen, 0b100);
        assert_eq!(tag.group, 0b100);
    }

    #[test]
    fn test_mask_gating() {
        let a = Arc::new(Mutex::new(Collect {
            seen: Vec::new(),
            group_seen: 0,
        }));
        let mut conn: Connection<u32> = Connection::new();
        conn.set_group_out(0b01);
        assert!(!conn.connect_masked(a.clone(), 0b10));
        assert!(!conn.is_connected());

        let mut tag = Tag::default();
        conn.send(&[7], &mut tag);
        assert!(a.lock().unwrap().seen.is_empty());
    }
}
