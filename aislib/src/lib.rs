//! Receive-side AIS stack: sample ingest, demodulation, HDLC framing, NMEA
//! assembly, message decoding, vessel tracking and output fan-out.
//!
//! The crate is organised as a typed stream pipeline. Stages implement
//! [`stream::StreamIn`] and forward through [`stream::Connection`]s that are
//! wired once at configuration time by [`receiver::Receiver`].

pub mod ais;
pub mod crc;
pub mod db;
pub mod decoder;
pub mod device;
pub mod dsp;
pub mod fifo;
pub mod jsonais;
pub mod logger;
pub mod model;
pub mod nmea;
pub mod receiver;
pub mod sinks;
pub mod stats;
pub mod stream;
pub mod webserver;
