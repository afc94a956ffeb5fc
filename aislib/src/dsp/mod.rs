use std::f32::consts::PI;

use crate::device::Format;
use crate::stream::{Connection, StreamIn, Tag};

pub mod demod;
pub mod filters;

/// Complex baseband sample, normalised to [-1, 1].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Cf32 {
    pub re: f32,
    pub im: f32,
}

impl Cf32 {
    pub fn new(re: f32, im: f32) -> Cf32 {
        Cf32 { re, im }
    }

    pub fn conj(self) -> Cf32 {
        Cf32 {
            re: self.re,
            im: -self.im,
        }
    }

    pub fn abs2(self) -> f32 {
        self.re * self.re + self.im * self.im
    }

    pub fn mul(self, other: Cf32) -> Cf32 {
        Cf32 {
            re: self.re * other.re - self.im * other.im,
            im: self.re * other.im + self.im * other.re,
        }
    }

    pub fn scale(self, k: f32) -> Cf32 {
        Cf32 {
            re: self.re * k,
            im: self.im * k,
        }
    }

    pub fn arg(self) -> f32 {
        self.im.atan2(self.re)
    }
}

impl std::ops::Add for Cf32 {
    type Output = Cf32;
    fn add(self, o: Cf32) -> Cf32 {
        Cf32 {
            re: self.re + o.re,
            im: self.im + o.im,
        }
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Converts raw sample bytes in the device format into normalised CF32.
pub struct Converter {
    format: Format,
    pub out: Connection<Cf32>,
    output: Vec<Cf32>,
}

impl Converter {
    pub fn new(format: Format) -> Converter {
        Converter {
            format,
            out: Connection::new(),
            output: Vec::new(),
        }
    }
}

impl StreamIn<u8> for Converter {
    fn receive(&mut self, data: &[u8], tag: &mut Tag) {
        self.output.clear();
        match self.format {
            Format::Cu8 => {
                for p in data.chunks_exact(2) {
                    self.output.push(Cf32::new(
                        (p[0] as f32 - 127.5) / 128.0,
                        (p[1] as f32 - 127.5) / 128.0,
                    ));
                }
            }
            Format::Cs8 => {
                for p in data.chunks_exact(2) {
                    self.output.push(Cf32::new(
                        p[0] as i8 as f32 / 128.0,
                        p[1] as i8 as f32 / 128.0,
                    ));
                }
            }
            Format::Cs16 => {
                for p in data.chunks_exact(4) {
                    let re = i16::from_le_bytes([p[0], p[1]]) as f32 / 32768.0;
                    let im = i16::from_le_bytes([p[2], p[3]]) as f32 / 32768.0;
                    self.output.push(Cf32::new(re, im));
                }
            }
            Format::Cf32 => {
                for p in data.chunks_exact(8) {
                    let re = f32::from_le_bytes([p[0], p[1], p[2], p[3]]);
                    let im = f32::from_le_bytes([p[4], p[5], p[6], p[7]]);
                    self.output.push(Cf32::new(re, im));
                }
            }
            Format::Txt => {
                // text input never enters the DSP chain; the configurator
                // refuses that wiring
                return;
            }
        }
        self.out.send(&self.output, tag);
    }
}

/// Decimating FIR over complex samples. History is carried across blocks so
/// block boundaries are seamless.
pub struct FirDecimate {
    taps: &'static [f32],
    d: usize,
    buf: Vec<Cf32>,
    next: usize,
    pub out: Connection<Cf32>,
    output: Vec<Cf32>,
}

impl FirDecimate {
    pub fn new(taps: &'static [f32], d: usize) -> FirDecimate {
        FirDecimate {
            taps,
            d,
            buf: Vec::new(),
            next: taps.len() - 1,
            out: Connection::new(),
            output: Vec::new(),
        }
    }

    fn run(&mut self, data: &[Cf32]) {
        self.buf.extend_from_slice(data);
        self.output.clear();

        let n = self.taps.len();
        while self.next < self.buf.len() {
            let mut acc = Cf32::default();
            for (j, t) in self.taps.iter().enumerate() {
                acc = acc + self.buf[self.next - j].scale(*t);
            }
            self.output.push(acc);
            self.next += self.d;
        }

        let keep_from = self.next.saturating_sub(n - 1).min(self.buf.len());
        self.buf.drain(..keep_from);
        self.next -= keep_from;
    }
}

impl StreamIn<Cf32> for FirDecimate {
    fn receive(&mut self, data: &[Cf32], tag: &mut Tag) {
        self.run(data);
        self.out.send(&self.output, tag);
    }
}

/// Same shape as `FirDecimate` for the demodulated real stream.
pub struct FirFilter {
    taps: &'static [f32],
    d: usize,
    buf: Vec<f32>,
    next: usize,
    pub out: Connection<f32>,
    output: Vec<f32>,
}

impl FirFilter {
    pub fn new(taps: &'static [f32], d: usize) -> FirFilter {
        FirFilter {
            taps,
            d,
            buf: Vec::new(),
            next: taps.len() - 1,
            out: Connection::new(),
            output: Vec::new(),
        }
    }
}

impl StreamIn<f32> for FirFilter {
    fn receive(&mut self, data: &[f32], tag: &mut Tag) {
        self.buf.extend_from_slice(data);
        self.output.clear();

        let n = self.taps.len();
        while self.next < self.buf.len() {
            let mut acc = 0.0f32;
            for (j, t) in self.taps.iter().enumerate() {
                acc += self.buf[self.next - j] * t;
            }
            self.output.push(acc);
            self.next += self.d;
        }

        let keep_from = self.next.saturating_sub(n - 1).min(self.buf.len());
        self.buf.drain(..keep_from);
        self.next -= keep_from;

        self.out.send(&self.output, tag);
    }
}

/// Dual channel down-conversion: complex multiply against precomputed
/// unit-modulus exponent tables at plus and minus the channel offset from
/// the tuner centre.
pub struct Downconverter {
    table_a: Vec<Cf32>,
    table_b: Vec<Cf32>,
    pos_a: usize,
    pos_b: usize,
    pub out_a: Connection<Cf32>,
    pub out_b: Connection<Cf32>,
    buf_a: Vec<Cf32>,
    buf_b: Vec<Cf32>,
}

fn rotation_table(offset_hz: i32, sample_rate: usize) -> Vec<Cf32> {
    let f = offset_hz.unsigned_abs() as usize;
    let len = if f == 0 {
        1
    } else {
        sample_rate / gcd(sample_rate, f)
    };
    let sign = if offset_hz >= 0 { -1.0f32 } else { 1.0f32 };
    (0..len)
        .map(|k| {
            let phi = sign * 2.0 * PI * offset_hz.abs() as f32 * k as f32 / sample_rate as f32;
            Cf32::new(phi.cos(), phi.sin())
        })
        .collect()
}

impl Downconverter {
    /// Channel offsets in Hz relative to the tuner centre; A/B mode uses
    /// -25 kHz / +25 kHz at 162 MHz centre.
    pub fn new(offset_a: i32, offset_b: i32, sample_rate: usize) -> Downconverter {
        Downconverter {
            table_a: rotation_table(offset_a, sample_rate),
            table_b: rotation_table(offset_b, sample_rate),
            pos_a: 0,
            pos_b: 0,
            out_a: Connection::new(),
            out_b: Connection::new(),
            buf_a: Vec::new(),
            buf_b: Vec::new(),
        }
    }
}

impl StreamIn<Cf32> for Downconverter {
    fn receive(&mut self, data: &[Cf32], tag: &mut Tag) {
        self.buf_a.clear();
        self.buf_b.clear();
        for z in data {
            self.buf_a.push(z.mul(self.table_a[self.pos_a]));
            self.buf_b.push(z.mul(self.table_b[self.pos_b]));
            self.pos_a = (self.pos_a + 1) % self.table_a.len();
            self.pos_b = (self.pos_b + 1) % self.table_b.len();
        }
        self.out_a.send(&self.buf_a, tag);
        self.out_b.send(&self.buf_b, tag);
    }
}

/// Tags each block with the mean channel power in dB before passing it on.
pub struct SignalLevel {
    pub out: Connection<Cf32>,
}

impl SignalLevel {
    pub fn new() -> SignalLevel {
        SignalLevel {
            out: Connection::new(),
        }
    }
}

impl Default for SignalLevel {
    fn default() -> Self {
        SignalLevel::new()
    }
}

impl StreamIn<Cf32> for SignalLevel {
    fn receive(&mut self, data: &[Cf32], tag: &mut Tag) {
        if !data.is_empty() {
            let sum: f32 = data.iter().map(|z| z.abs2()).sum();
            tag.level = 10.0 * (sum / data.len() as f32 + 1e-12).log10();
        }
        self.out.send(data, tag);
    }
}

/// Splits the demodulated stream into K bit-rate streams at staggered sample
/// offsets; each offset drives its own frame decoder so no timing recovery
/// loop is needed.
pub struct SamplerParallel {
    k: usize,
    idx: usize,
    pub outs: Vec<Connection<f32>>,
    bufs: Vec<Vec<f32>>,
}

impl SamplerParallel {
    pub fn new(k: usize) -> SamplerParallel {
        SamplerParallel {
            k,
            idx: 0,
            outs: (0..k).map(|_| Connection::new()).collect(),
            bufs: vec![Vec::new(); k],
        }
    }
}

impl StreamIn<f32> for SamplerParallel {
    fn receive(&mut self, data: &[f32], tag: &mut Tag) {
        for b in &mut self.bufs {
            b.clear();
        }
        for x in data {
            self.bufs[self.idx].push(*x);
            self.idx = (self.idx + 1) % self.k;
        }
        for (out, buf) in self.outs.iter().zip(&self.bufs) {
            out.send(buf, tag);
        }
    }
}

/// Build the /2 and /3 decimation ladder that brings `rate` down to
/// `target`. Returns the stage list, fastest first, or `None` when the rate
/// cannot be expressed as target * 2^a * 3^b.
pub fn decimation_ladder(rate: usize, target: usize) -> Option<Vec<FirDecimate>> {
    let mut stages = Vec::new();
    let mut r = rate;
    while r > target {
        if r % 2 == 0 && r / 2 >= target {
            stages.push(FirDecimate::new(&filters::BLACKMAN_HARRIS_32_5, 2));
            r /= 2;
        } else if r % 3 == 0 && r / 3 >= target {
            stages.push(FirDecimate::new(&filters::BLACKMAN_HARRIS_28_3, 3));
            r /= 3;
        } else {
            return None;
        }
    }
    if r == target {
        Some(stages)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Capture {
        samples: Vec<Cf32>,
    }

    impl StreamIn<Cf32> for Capture {
        fn receive(&mut self, data: &[Cf32], _tag: &mut Tag) {
            self.samples.extend_from_slice(data);
        }
    }

    #[test]
    fn test_converter_cu8() {
        let cap = Arc::new(Mutex::new(Capture {
            samples: Vec::new(),
        }));
        let mut conv = Converter::new(Format::Cu8);
        conv.out.connect(cap.clone());

        let mut tag = Tag::default();
        conv.receive(&[255, 0, 128, 127], &mut tag);

        let s = cap.lock().unwrap();
        assert_eq!(s.samples.len(), 2);
        assert!((s.samples[0].re - 0.99609).abs() < 1e-4);
        assert!((s.samples[0].im + 0.99609).abs() < 1e-4);
        assert!(s.samples[1].re.abs() < 0.01);
    }

    #[test]
    fn test_fir_decimate_counts() {
        let cap = Arc::new(Mutex::new(Capture {
            samples: Vec::new(),
        }));
        let mut fir = FirDecimate::new(&filters::BLACKMAN_HARRIS_32_5, 2);
        fir.out.connect(cap.clone());

        let mut tag = Tag::default();
        let block = vec![Cf32::new(1.0, 0.0); 100];
        fir.receive(&block, &mut tag);
        fir.receive(&block, &mut tag);

        // 200 samples through a /2 decimator with 29 samples of group delay
        let n = cap.lock().unwrap().samples.len();
        assert_eq!(n, (200 - (filters::BLACKMAN_HARRIS_32_5.len() - 1) + 1) / 2);

        // DC through a low-pass with unity-sum taps stays near 1
        let last = *cap.lock().unwrap().samples.last().unwrap();
        assert!((last.re - 1.0).abs() < 0.05, "dc gain {}", last.re);
    }

    #[test]
    fn test_rotation_table_unit_modulus() {
        let t = rotation_table(25000, 96000);
        assert_eq!(t.len(), 96);
        for z in &t {
            assert!((z.abs2() - 1.0).abs() < 1e-5);
        }
        // table wraps exactly
        let wrapped = t[95].mul(t[1]);
        assert!((wrapped.re - t[0].re).abs() < 1e-4);
    }

    #[test]
    fn test_decimation_ladder() {
        assert_eq!(decimation_ladder(1536000, 96000).unwrap().len(), 4);
        assert_eq!(decimation_ladder(288000, 96000).unwrap().len(), 1);
        assert_eq!(decimation_ladder(96000, 96000).unwrap().len(), 0);
        assert!(decimation_ladder(250000, 96000).is_none());
    }

    #[test]
    fn test_downconverter_shifts_tone() {
        // a +25 kHz tone lands at DC on channel A (-25 kHz rotation target)
        let cap = Arc::new(Mutex::new(Capture {
            samples: Vec::new(),
        }));
        let mut dc = Downconverter::new(25000, -25000, 96000);
        dc.out_a.connect(cap.clone());

        let tone: Vec<Cf32> = (0..96)
            .map(|k| {
                let phi = 2.0 * PI * 25000.0 * k as f32 / 96000.0;
                Cf32::new(phi.cos(), phi.sin())
            })
            .collect();
        let mut tag = Tag::default();
        dc.receive(&tone, &mut tag);

        let s = cap.lock().unwrap();
        for z in &s.samples {
            assert!((z.re - 1.0).abs() < 1e-3 && z.im.abs() < 1e-3);
        }
    }
}
