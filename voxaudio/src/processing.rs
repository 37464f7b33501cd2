//! # PCM processing chain
//!
//! Decoded buffers run through an ordered list of processors before they
//! reach the sink. Each processor declares a name and an enabled flag and
//! implements `init` (once per format), `process` (per buffer) and `reset`
//! (on seek). Samples are interleaved 16-bit little-endian throughout.
//!
//! The mandatory processors are loudness normalization, the always-on
//! volume multiplier and an optional biquad equalizer bank.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use biquad::{Biquad, Coefficients, DirectForm1, ToHertz, Type};
use tracing::debug;

use crate::{
    format::{AudioBuffer, AudioFormat},
    normalization::{NormalizationData, DEFAULT_TARGET_LUFS},
};

/// A stage in the processing chain.
pub trait AudioProcessor: Send {
    fn name(&self) -> &'static str;

    /// Disabled processors are bypassed without touching the buffer.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Called once with the decoder-reported format before any buffer.
    fn init(&mut self, format: &AudioFormat);

    fn process(&mut self, buffer: AudioBuffer) -> AudioBuffer;

    /// Called on seek; clears any time-dependent state.
    fn reset(&mut self);
}

/// Ordered processor list.
pub struct ProcessingChain {
    processors: Vec<Box<dyn AudioProcessor>>,
}

impl Default for ProcessingChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingChain {
    pub fn new() -> Self {
        Self {
            processors: Vec::new(),
        }
    }

    pub fn push(&mut self, processor: Box<dyn AudioProcessor>) {
        self.processors.push(processor);
    }

    pub fn init(&mut self, format: &AudioFormat) {
        for p in &mut self.processors {
            p.init(format);
        }
    }

    pub fn reset(&mut self) {
        for p in &mut self.processors {
            p.reset();
        }
    }

    /// Routes a buffer through every enabled processor in order.
    pub fn process(&mut self, mut buffer: AudioBuffer) -> AudioBuffer {
        for p in &mut self.processors {
            if p.is_enabled() {
                buffer = p.process(buffer);
            }
        }
        buffer
    }
}

fn scale_samples(data: &mut [u8], factor: f32) {
    for sample in data.chunks_exact_mut(2) {
        let value = i16::from_le_bytes([sample[0], sample[1]]) as f32 * factor;
        let clamped = value.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        sample.copy_from_slice(&clamped.to_le_bytes());
    }
}

/// Loudness normalization toward a target level.
pub struct NormalizationProcessor {
    data: Option<NormalizationData>,
    target_lufs: f32,
    prevent_clipping: bool,
    factor: f32,
}

impl NormalizationProcessor {
    pub fn new(data: Option<NormalizationData>) -> Self {
        Self {
            data,
            target_lufs: DEFAULT_TARGET_LUFS,
            prevent_clipping: true,
            factor: 1.0,
        }
    }

    pub fn with_target(mut self, target_lufs: f32) -> Self {
        self.target_lufs = target_lufs;
        self
    }

    pub fn factor(&self) -> f32 {
        self.factor
    }
}

impl AudioProcessor for NormalizationProcessor {
    fn name(&self) -> &'static str {
        "normalization"
    }

    fn is_enabled(&self) -> bool {
        self.data.is_some()
    }

    fn init(&mut self, _format: &AudioFormat) {
        self.factor = self
            .data
            .map(|d| d.factor(self.target_lufs, self.prevent_clipping))
            .unwrap_or(1.0);
        debug!(factor = self.factor, "normalization initialized");
    }

    fn process(&mut self, mut buffer: AudioBuffer) -> AudioBuffer {
        if (self.factor - 1.0).abs() > f32::EPSILON {
            scale_samples(&mut buffer.data, self.factor);
        }
        buffer
    }

    fn reset(&mut self) {}
}

/// Shared handle for live volume updates.
#[derive(Clone)]
pub struct VolumeControl {
    bits: Arc<AtomicU32>,
}

impl Default for VolumeControl {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl VolumeControl {
    pub fn new(volume: f32) -> Self {
        let control = Self {
            bits: Arc::new(AtomicU32::new(0)),
        };
        control.set(volume);
        control
    }

    /// Sets the linear multiplier, clamped to `[0, 1]`.
    pub fn set(&self, volume: f32) {
        let clamped = volume.clamp(0.0, 1.0);
        self.bits.store(clamped.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Always-enabled linear volume multiplier.
pub struct VolumeProcessor {
    control: VolumeControl,
}

impl VolumeProcessor {
    pub fn new(control: VolumeControl) -> Self {
        Self { control }
    }
}

impl AudioProcessor for VolumeProcessor {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn init(&mut self, _format: &AudioFormat) {}

    fn process(&mut self, mut buffer: AudioBuffer) -> AudioBuffer {
        let volume = self.control.get();
        if (volume - 1.0).abs() > f32::EPSILON {
            scale_samples(&mut buffer.data, volume);
        }
        buffer
    }

    fn reset(&mut self) {}
}

/// One peaking-EQ band.
#[derive(Debug, Clone, Copy)]
pub struct EqBand {
    pub frequency_hz: f32,
    pub gain_db: f32,
    pub q: f32,
}

/// Optional biquad equalizer; bypassed (no per-buffer work) when disabled.
pub struct EqualizerProcessor {
    bands: Vec<EqBand>,
    enabled: bool,
    sample_rate: f32,
    channels: usize,
    /// One filter per band per channel.
    filters: Vec<Vec<DirectForm1<f32>>>,
}

impl EqualizerProcessor {
    pub fn new(bands: Vec<EqBand>, enabled: bool) -> Self {
        Self {
            bands,
            enabled,
            sample_rate: 0.0,
            channels: 0,
            filters: Vec::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn rebuild_filters(&mut self) {
        self.filters.clear();
        if self.sample_rate <= 0.0 || self.channels == 0 {
            return;
        }
        for band in &self.bands {
            let coefficients = Coefficients::<f32>::from_params(
                Type::PeakingEQ(band.gain_db),
                self.sample_rate.hz(),
                band.frequency_hz.hz(),
                band.q,
            );
            let Ok(coefficients) = coefficients else {
                debug!(?band, "skipping EQ band with invalid parameters");
                continue;
            };
            self.filters
                .push(vec![DirectForm1::<f32>::new(coefficients); self.channels]);
        }
    }
}

impl AudioProcessor for EqualizerProcessor {
    fn name(&self) -> &'static str {
        "equalizer"
    }

    fn is_enabled(&self) -> bool {
        self.enabled && !self.bands.is_empty()
    }

    fn init(&mut self, format: &AudioFormat) {
        self.sample_rate = format.sample_rate as f32;
        self.channels = format.channels as usize;
        self.rebuild_filters();
    }

    fn process(&mut self, mut buffer: AudioBuffer) -> AudioBuffer {
        let channels = self.channels.max(1);
        for (index, sample) in buffer.data.chunks_exact_mut(2).enumerate() {
            let channel = index % channels;
            let mut value = i16::from_le_bytes([sample[0], sample[1]]) as f32 / 32768.0;
            for band in &mut self.filters {
                value = band[channel].run(value);
            }
            let scaled = (value * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            sample.copy_from_slice(&scaled.to_le_bytes());
        }
        buffer
    }

    fn reset(&mut self) {
        // Biquad state is time-dependent; drop it across seeks.
        self.rebuild_filters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> AudioFormat {
        AudioFormat::new(44_100, 2, 16)
    }

    fn buffer_of(samples: &[i16]) -> AudioBuffer {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        AudioBuffer::new(data, 0)
    }

    fn samples_of(buffer: &AudioBuffer) -> Vec<i16> {
        buffer
            .data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn normalization_scales_and_clamps() {
        let data = NormalizationData {
            track_gain_db: -20.0,
            track_peak: 0.0,
            ..NormalizationData::default()
        };
        let mut processor = NormalizationProcessor::new(Some(data));
        processor.init(&format());
        assert!(processor.factor() > 1.9 && processor.factor() < 2.1);

        let out = processor.process(buffer_of(&[1000, -1000, 30000, -30000]));
        let samples = samples_of(&out);
        assert_eq!(samples[0], (1000.0 * processor.factor()) as i16);
        // Saturation clamps instead of wrapping.
        assert_eq!(samples[2], i16::MAX);
        assert_eq!(samples[3], i16::MIN);
    }

    #[test]
    fn normalization_without_data_is_bypassed() {
        let processor = NormalizationProcessor::new(None);
        assert!(!processor.is_enabled());
    }

    #[test]
    fn volume_is_applied_live() {
        let control = VolumeControl::new(1.0);
        let mut processor = VolumeProcessor::new(control.clone());
        processor.init(&format());

        let loud = processor.process(buffer_of(&[10000, -10000]));
        assert_eq!(samples_of(&loud), vec![10000, -10000]);

        control.set(0.5);
        let half = processor.process(buffer_of(&[10000, -10000]));
        assert_eq!(samples_of(&half), vec![5000, -5000]);

        // Out-of-range settings clamp.
        control.set(7.0);
        assert_eq!(control.get(), 1.0);
        control.set(-1.0);
        assert_eq!(control.get(), 0.0);
    }

    #[test]
    fn chain_routes_in_registration_order() {
        let control = VolumeControl::new(0.5);
        let mut chain = ProcessingChain::new();
        chain.push(Box::new(NormalizationProcessor::new(None)));
        chain.push(Box::new(VolumeProcessor::new(control)));
        chain.push(Box::new(EqualizerProcessor::new(Vec::new(), false)));
        chain.init(&format());

        let out = chain.process(buffer_of(&[8000]));
        assert_eq!(samples_of(&out), vec![4000]);
    }

    #[test]
    fn empty_buffers_pass_through() {
        let mut chain = ProcessingChain::new();
        chain.push(Box::new(VolumeProcessor::new(VolumeControl::new(0.3))));
        chain.init(&format());
        let out = chain.process(AudioBuffer::new(Vec::new(), 1234));
        assert!(out.is_empty());
        assert_eq!(out.position_ms, 1234);
    }

    #[test]
    fn equalizer_passes_audio_when_flat() {
        // A 0 dB band should leave a DC-free signal roughly untouched.
        let mut eq = EqualizerProcessor::new(
            vec![EqBand {
                frequency_hz: 1000.0,
                gain_db: 0.0,
                q: 0.7,
            }],
            true,
        );
        eq.init(&format());
        let input: Vec<i16> = (0..64).map(|i| if i % 2 == 0 { 1000 } else { -1000 }).collect();
        let out = eq.process(buffer_of(&input));
        assert_eq!(out.data.len(), input.len() * 2);
    }
}
