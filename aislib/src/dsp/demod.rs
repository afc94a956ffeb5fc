use std::f32::consts::PI;

use super::Cf32;
use crate::stream::{Connection, StreamIn, Tag};

pub const N_PHASES: usize = 16;
const MAX_HISTORY: usize = 14;

/// FM discriminator: the phase difference between successive samples.
pub struct FmDemod {
    prev: Cf32,
    pub out: Connection<f32>,
    output: Vec<f32>,
}

impl FmDemod {
    pub fn new() -> FmDemod {
        FmDemod {
            prev: Cf32::default(),
            out: Connection::new(),
            output: Vec::new(),
        }
    }
}

impl StreamIn<Cf32> for FmDemod {
    fn receive(&mut self, data: &[Cf32], tag: &mut Tag) {
        self.output.clear();
        for z in data {
            self.output.push(z.mul(self.prev.conj()).arg());
            self.prev = *z;
        }
        self.out.send(&self.output, tag);
    }
}

fn phase_table() -> [Cf32; N_PHASES] {
    let mut t = [Cf32::default(); N_PHASES];
    for (k, z) in t.iter_mut().enumerate() {
        let phi = PI * k as f32 / N_PHASES as f32;
        *z = Cf32::new(phi.cos(), -phi.sin());
    }
    t
}

/// Coherent demodulator, fixed-history variant: the symbol stream is rotated
/// through sixteen trial carrier phases; for each phase a correlator is
/// accumulated over the last `n_history` symbols and the phase with the
/// highest absolute sum wins. Ties break toward the previously selected
/// phase. The emitted decision is the sliced bit `n_delay` symbols back.
pub struct PhaseSearch {
    phases: [Cf32; N_PHASES],
    memory: [[f32; MAX_HISTORY]; N_PHASES],
    n_history: usize,
    n_delay: usize,
    rot: usize,
    max_idx: usize,
    pub out: Connection<f32>,
    output: Vec<f32>,
}

impl PhaseSearch {
    pub fn new() -> PhaseSearch {
        PhaseSearch {
            phases: phase_table(),
            memory: [[0.0; MAX_HISTORY]; N_PHASES],
            n_history: 8,
            n_delay: 4,
            rot: 0,
            max_idx: 0,
            out: Connection::new(),
            output: Vec::new(),
        }
    }

    pub fn set_params(&mut self, history: usize, delay: usize) {
        assert!(history <= MAX_HISTORY);
        assert!(delay <= history);
        self.n_history = history;
        self.n_delay = delay;
    }
}

impl StreamIn<Cf32> for PhaseSearch {
    fn receive(&mut self, data: &[Cf32], tag: &mut Tag) {
        self.output.clear();
        for z in data {
            self.rot = (self.rot + 1) % self.n_history;
            for (p, rotor) in self.phases.iter().enumerate() {
                self.memory[p][self.rot] = z.mul(*rotor).re;
            }

            let mut best = self.max_idx;
            let mut best_sum: f32 = self.memory[best][..self.n_history]
                .iter()
                .map(|m| m.abs())
                .sum();
            for p in 0..N_PHASES {
                if p == self.max_idx {
                    continue;
                }
                let sum: f32 = self.memory[p][..self.n_history].iter().map(|m| m.abs()).sum();
                if sum > best_sum {
                    best_sum = sum;
                    best = p;
                }
            }
            self.max_idx = best;

            let tap = (self.rot + self.n_history - self.n_delay) % self.n_history;
            self.output
                .push(if self.memory[best][tap] > 0.0 { 1.0 } else { -1.0 });
        }
        self.out.send(&self.output, tag);
    }
}

/// Coherent demodulator, exponential-moving-average variant: the per-phase
/// correlator is an EMA with weight ~0.85 instead of a fixed window; the
/// sliced bits are kept in a per-phase shift register to honor the decision
/// delay.
pub struct PhaseSearchEma {
    phases: [Cf32; N_PHASES],
    ma: [f32; N_PHASES],
    bits: [u32; N_PHASES],
    weight: f32,
    n_delay: usize,
    max_idx: usize,
    pub out: Connection<f32>,
    output: Vec<f32>,
}

impl PhaseSearchEma {
    pub fn new() -> PhaseSearchEma {
        PhaseSearchEma {
            phases: phase_table(),
            ma: [0.0; N_PHASES],
            bits: [0; N_PHASES],
            weight: 0.85,
            n_delay: 2,
            max_idx: 0,
            out: Connection::new(),
            output: Vec::new(),
        }
    }

    pub fn set_weight(&mut self, w: f32) {
        self.weight = w;
    }

    pub fn set_delay(&mut self, d: usize) {
        assert!(d < 32);
        self.n_delay = d;
    }
}

impl StreamIn<Cf32> for PhaseSearchEma {
    fn receive(&mut self, data: &[Cf32], tag: &mut Tag) {
        self.output.clear();
        for z in data {
            for (p, rotor) in self.phases.iter().enumerate() {
                let m = z.mul(*rotor).re;
                self.ma[p] = self.weight * self.ma[p] + (1.0 - self.weight) * m.abs();
                self.bits[p] = (self.bits[p] << 1) | (m > 0.0) as u32;
            }

            let mut best = self.max_idx;
            for p in 0..N_PHASES {
                if self.ma[p] > self.ma[best] {
                    best = p;
                }
            }
            self.max_idx = best;

            let bit = (self.bits[best] >> self.n_delay) & 1;
            self.output.push(if bit != 0 { 1.0 } else { -1.0 });
        }
        self.out.send(&self.output, tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Capture {
        samples: Vec<f32>,
    }

    impl StreamIn<f32> for Capture {
        fn receive(&mut self, data: &[f32], _tag: &mut Tag) {
            self.samples.extend_from_slice(data);
        }
    }

    #[test]
    fn test_fm_sign_tracks_frequency() {
        let cap = Arc::new(Mutex::new(Capture {
            samples: Vec::new(),
        }));
        let mut fm = FmDemod::new();
        fm.out.connect(cap.clone());

        // positive frequency -> positive phase increments
        let tone: Vec<Cf32> = (0..32)
            .map(|k| {
                let phi = 0.3 * k as f32;
                Cf32::new(phi.cos(), phi.sin())
            })
            .collect();
        let mut tag = Tag::default();
        fm.receive(&tone, &mut tag);

        let s = cap.lock().unwrap();
        for d in s.samples.iter().skip(1) {
            assert!((*d - 0.3).abs() < 1e-3);
        }
    }

    #[test]
    fn test_phase_search_recovers_bpsk() {
        let cap = Arc::new(Mutex::new(Capture {
            samples: Vec::new(),
        }));
        let mut ps = PhaseSearch::new();
        ps.set_params(8, 0);
        ps.out.connect(cap.clone());

        // BPSK at a constant 40 degree carrier offset
        let bits = [1.0f32, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0, -1.0, 1.0, 1.0];
        let phi = 40.0f32.to_radians();
        let symbols: Vec<Cf32> = bits
            .iter()
            .map(|b| Cf32::new(b * phi.cos(), b * phi.sin()))
            .collect();

        let mut tag = Tag::default();
        // warm up the correlators, then check decisions follow the bits
        ps.receive(&symbols, &mut tag);
        ps.receive(&symbols, &mut tag);

        let s = cap.lock().unwrap();
        let tail = &s.samples[s.samples.len() - bits.len()..];
        let matches = tail
            .iter()
            .zip(bits.iter())
            .filter(|(a, b)| (a.is_sign_positive()) == (b.is_sign_positive()))
            .count();
        // sign ambiguity of the carrier is resolved by NRZI downstream;
        // accept an exact or exactly inverted decision stream
        assert!(matches == bits.len() || matches == 0, "matches {}", matches);
    }

    #[test]
    fn test_phase_search_ema_stable_output_rate() {
        let cap = Arc::new(Mutex::new(Capture {
            samples: Vec::new(),
        }));
        let mut ps = PhaseSearchEma::new();
        ps.out.connect(cap.clone());

        let block = vec![Cf32::new(0.5, 0.1); 64];
        let mut tag = Tag::default();
        ps.receive(&block, &mut tag);
        assert_eq!(cap.lock().unwrap().samples.len(), 64);
    }
}
