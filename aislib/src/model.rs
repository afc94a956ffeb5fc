use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver};

use crate::ais::Message;
use crate::decoder::{Decoder, DecoderSignal};
use crate::device::Format;
use crate::dsp::demod::{FmDemod, PhaseSearch, PhaseSearchEma};
use crate::dsp::filters;
use crate::dsp::{
    decimation_ladder, Cf32, Converter, Downconverter, FirDecimate, FirFilter, SamplerParallel,
    SignalLevel,
};
use crate::nmea::NmeaParser;
use crate::stream::{SharedStreamIn, StreamIn};

const INTERNAL_RATE: usize = 96000;
const CHANNEL_OFFSET_HZ: i32 = 25000;

/// Pre-built DSP + decoder topology.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ModelKind {
    /// FM discriminator, five staggered bit samplers per channel.
    Standard = 0,
    /// FM discriminator, single bit sampler; the cheapest chain.
    Base = 1,
    /// Coherent phase search with exponential averaging.
    Default = 2,
    /// FM discriminator with extra post-demod smoothing.
    Discriminator = 3,
    /// Coherent phase search over a fixed symbol history.
    Challenger = 4,
    /// Text input, DSP bypassed entirely.
    NmeaText = 5,
}

impl ModelKind {
    pub fn from_index(i: u32) -> Option<ModelKind> {
        match i {
            0 => Some(ModelKind::Standard),
            1 => Some(ModelKind::Base),
            2 => Some(ModelKind::Default),
            3 => Some(ModelKind::Discriminator),
            4 => Some(ModelKind::Challenger),
            5 => Some(ModelKind::NmeaText),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Standard => "AIS engine (non-coherent, parallel samplers)",
            ModelKind::Base => "AIS engine (non-coherent, base)",
            ModelKind::Default => "AIS engine (coherent, EMA)",
            ModelKind::Discriminator => "FM discriminator",
            ModelKind::Challenger => "AIS engine (coherent, fixed history)",
            ModelKind::NmeaText => "NMEA text input",
        }
    }

    pub fn is_txt(&self) -> bool {
        *self == ModelKind::NmeaText
    }
}

/// A wired receive chain: the byte entry point fed from the FIFO, plus the
/// shared assembler whose output carries the decoded messages.
pub struct Model {
    pub kind: ModelKind,
    front: SharedStreamIn<u8>,
    pub assembler: Arc<Mutex<NmeaParser>>,
    pub control: Receiver<DecoderSignal>,
}

impl Model {
    /// Validate the model against the input format and wire the stage
    /// graph. Connections are fixed after this point.
    pub fn build(
        kind: ModelKind,
        format: Format,
        sample_rate: usize,
        channels: (char, char),
        station: u16,
    ) -> Result<Model, String> {
        if kind.is_txt() != (format == Format::Txt) {
            return Err("decoding model and input format not consistent.".to_string());
        }

        let assembler = Arc::new(Mutex::new(NmeaParser::new()));
        assembler.lock().unwrap().set_station(station);
        let (ctrl_tx, ctrl_rx) = unbounded();

        if kind.is_txt() {
            return Ok(Model {
                kind,
                front: assembler.clone(),
                assembler,
                control: ctrl_rx,
            });
        }

        if sample_rate < INTERNAL_RATE {
            return Err(format!("sample rate {} is below 96000", sample_rate));
        }
        let ladder = decimation_ladder(sample_rate, INTERNAL_RATE)
            .ok_or_else(|| format!("unsupported sample rate {}", sample_rate))?;

        // per channel, built back to front so every stage can be connected
        // before it is wrapped
        let build_channel = |channel: char| -> SharedStreamIn<Cf32> {
            let reset_bus = Arc::new(AtomicU32::new(0));

            let make_decoder = || {
                let mut dec = Decoder::new();
                dec.set_channel(channel);
                dec.set_control(ctrl_tx.clone());
                dec.set_group_reset(reset_bus.clone());
                dec.out.connect(assembler.clone());
                Arc::new(Mutex::new(dec))
            };

            let demod_in: SharedStreamIn<Cf32> = match kind {
                ModelKind::Default | ModelKind::Challenger => {
                    let demod: SharedStreamIn<Cf32> = if kind == ModelKind::Default {
                        let mut d = PhaseSearchEma::new();
                        d.out.connect(make_decoder());
                        Arc::new(Mutex::new(d))
                    } else {
                        let mut d = PhaseSearch::new();
                        d.out.connect(make_decoder());
                        Arc::new(Mutex::new(d))
                    };
                    // matched filter decimates 48k down to the symbol rate
                    let mut mf = FirDecimate::new(&filters::COHERENT, 5);
                    mf.out.connect(demod);
                    Arc::new(Mutex::new(mf))
                }
                ModelKind::Standard | ModelKind::Base | ModelKind::Discriminator => {
                    let n_samplers = if kind == ModelKind::Base { 1 } else { 5 };
                    let mut sampler = SamplerParallel::new(5);
                    for k in 0..n_samplers {
                        sampler.outs[k].connect(make_decoder());
                    }
                    let sampler = Arc::new(Mutex::new(sampler));

                    let mut fm = FmDemod::new();
                    if kind == ModelKind::Discriminator {
                        let mut smooth = FirFilter::new(&filters::BLACKMAN_HARRIS_28_3, 1);
                        smooth.out.connect(sampler);
                        fm.out.connect(Arc::new(Mutex::new(smooth)));
                    } else {
                        fm.out.connect(sampler);
                    }
                    Arc::new(Mutex::new(fm))
                }
                ModelKind::NmeaText => unreachable!(),
            };

            let mut rx_filter = FirDecimate::new(&filters::RECEIVER, 2);
            rx_filter.out.connect(demod_in);
            let rx_filter = Arc::new(Mutex::new(rx_filter));

            let mut level = SignalLevel::new();
            level.out.connect(rx_filter);
            Arc::new(Mutex::new(level))
        };

        let mut downconv =
            Downconverter::new(-CHANNEL_OFFSET_HZ, CHANNEL_OFFSET_HZ, INTERNAL_RATE);
        downconv.out_a.connect(build_channel(channels.0));
        downconv.out_b.connect(build_channel(channels.1));
        let downconv: SharedStreamIn<Cf32> = Arc::new(Mutex::new(downconv));

        // chain the decimation ladder front to back, then hook the last
        // stage into the downconverter
        let mut head: SharedStreamIn<Cf32> = downconv;
        for mut stage in ladder.into_iter().rev() {
            stage.out.connect(head);
            head = Arc::new(Mutex::new(stage));
        }

        let mut conv = Converter::new(format);
        conv.out.connect(head);

        Ok(Model {
            kind,
            front: Arc::new(Mutex::new(conv)),
            assembler,
            control: ctrl_rx,
        })
    }

    /// Entry point for raw bytes popped off the FIFO.
    pub fn front(&self) -> SharedStreamIn<u8> {
        self.front.clone()
    }

    pub fn set_group_out(&self, mask: u64) {
        self.assembler.lock().unwrap().out.set_group_out(mask);
    }

    pub fn connect_output(&self, s: Arc<Mutex<dyn StreamIn<Message>>>) {
        self.assembler.lock().unwrap().out.connect(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Tag;

    struct Capture {
        msgs: Vec<Message>,
    }

    impl StreamIn<Message> for Capture {
        fn receive(&mut self, data: &[Message], _tag: &mut Tag) {
            self.msgs.extend_from_slice(data);
        }
    }

    #[test]
    fn test_model_format_validation() {
        assert!(Model::build(ModelKind::Default, Format::Txt, 0, ('A', 'B'), 0).is_err());
        assert!(Model::build(ModelKind::NmeaText, Format::Cu8, 96000, ('A', 'B'), 0).is_err());
        assert!(Model::build(ModelKind::Default, Format::Cu8, 250000, ('A', 'B'), 0).is_err());
        assert!(Model::build(ModelKind::Default, Format::Cu8, 1536000, ('A', 'B'), 0).is_ok());
    }

    #[test]
    fn test_txt_model_end_to_end() {
        let model = Model::build(ModelKind::NmeaText, Format::Txt, 0, ('A', 'B'), 7).unwrap();
        let cap = Arc::new(Mutex::new(Capture { msgs: Vec::new() }));
        model.connect_output(cap.clone());

        let mut tag = Tag::default();
        let feed = b"!AIVDM,1,1,,A,15RTgt0PAso;90TKcjM8h6g208CQ,0*4A\r\n";
        model.front().lock().unwrap().receive(&feed[..], &mut tag);

        let msgs = &cap.lock().unwrap().msgs;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].mmsi(), 371798000);
        assert_eq!(msgs[0].station, 7);
    }

    #[test]
    fn test_dsp_model_end_to_end() {
        use crate::ais::armour_value;
        use crate::crc::calc_crc16_x25;
        use std::f32::consts::PI;

        // assemble the on-air bit stream for a type 1 frame
        let payload = "15RTgt0PAso;90TKcjM8h6g208CQ";
        let mut bits: Vec<u8> = Vec::new();
        for c in payload.chars() {
            let v = armour_value(c);
            for i in 0..6 {
                bits.push((v >> (5 - i)) & 1);
            }
        }
        let mut bytes = Vec::new();
        for chunk in bits.chunks(8) {
            let mut b = 0u8;
            for (i, bit) in chunk.iter().enumerate() {
                b |= bit << (7 - i);
            }
            bytes.push(b);
        }
        let fcs = calc_crc16_x25(&bytes);
        bytes.push((fcs & 0xFF) as u8);
        bytes.push((fcs >> 8) as u8);

        let mut wire: Vec<u8> = Vec::new();
        for b in &bytes {
            for j in 0..8 {
                wire.push((b >> j) & 1);
            }
        }
        let mut stuffed = Vec::new();
        let mut ones = 0;
        for b in wire {
            stuffed.push(b);
            if b == 1 {
                ones += 1;
                if ones == 5 {
                    stuffed.push(0);
                    ones = 0;
                }
            } else {
                ones = 0;
            }
        }

        let mut framed = vec![0u8; 0];
        for _ in 0..16 {
            framed.push(0);
        } // silence before training
        for i in 0..32 {
            framed.push((i % 2) as u8);
        }
        framed.extend_from_slice(&[0, 1, 1, 1, 1, 1, 1, 0]);
        framed.extend_from_slice(&stuffed);
        framed.extend_from_slice(&[0, 1, 1, 1, 1, 1, 1, 0]);
        for i in 0..40 {
            framed.push((i % 2) as u8);
        }

        // NRZI to line levels, then FSK at +-2400 Hz, 10 samples per bit at
        // 96 kHz, placed on channel A (-25 kHz from centre)
        let mut level = false;
        let mut phase: f32 = 0.0;
        let mut iq: Vec<(f32, f32)> = Vec::new();
        for bit in framed {
            if bit == 0 {
                level = !level;
            }
            let f = if level { 2400.0 } else { -2400.0 } - 25000.0;
            for _ in 0..10 {
                phase += 2.0 * PI * f / 96000.0;
                iq.push((0.8 * phase.cos(), 0.8 * phase.sin()));
            }
        }

        // CS16 interleaved little endian
        let mut raw = Vec::with_capacity(iq.len() * 4);
        for (re, im) in iq {
            raw.extend_from_slice(&(((re * 32767.0) as i16).to_le_bytes()));
            raw.extend_from_slice(&(((im * 32767.0) as i16).to_le_bytes()));
        }

        let model =
            Model::build(ModelKind::Standard, Format::Cs16, 96000, ('A', 'B'), 0).unwrap();
        let cap = Arc::new(Mutex::new(Capture { msgs: Vec::new() }));
        model.connect_output(cap.clone());

        let mut tag = Tag::default();
        model.front().lock().unwrap().receive(&raw, &mut tag);

        let msgs = &cap.lock().unwrap().msgs;
        assert!(
            msgs.iter()
                .any(|m| m.msg_type() == 1 && m.mmsi() == 371798000 && m.channel == 'A'),
            "no frame decoded from synthetic signal ({} messages seen)",
            msgs.len()
        );
    }
}
