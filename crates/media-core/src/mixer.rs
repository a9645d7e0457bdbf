//! Pull audio mixer.
//!
//! The single audio output thread pulls the mixer once per 40 ms frame; the
//! mixer in turn pulls every registered input, scales by the input volume
//! and sums with saturation. Inputs that have nothing ready simply miss the
//! frame. Inputs are addressed by the author SSRC.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

/// Pulls one PCM frame (interleaved little-endian i16) or nothing.
pub type PcmSource = Arc<dyn Fn() -> Option<Bytes> + Send + Sync>;

struct Input {
    ssrc: u32,
    #[allow(dead_code)]
    client_id: i64,
    source: PcmSource,
    volume: i32,
}

/// N-input saturating mixer.
pub struct AudioMixer {
    inputs: Mutex<Vec<Input>>,
    frame_size: AtomicUsize,
    runned: AtomicBool,
}

/// Gain applied for a 0..100 volume: `exp(v/100) / e`, so 100 is unity and
/// 0 is silence.
fn volume_gain(volume: i32) -> f64 {
    if volume != 0 {
        (volume as f64 / 100.0).exp() / std::f64::consts::E
    } else {
        0.0
    }
}

impl AudioMixer {
    pub fn new() -> Self {
        Self {
            inputs: Mutex::new(Vec::new()),
            frame_size: AtomicUsize::new(0),
            runned: AtomicBool::new(false),
        }
    }

    /// `frame_size` becomes `(sample_freq / 100) * 2 * 4` bytes, one 40 ms
    /// mono 16-bit frame.
    pub fn start(&self, sample_freq: u32) {
        if !self.runned.swap(true, Ordering::SeqCst) {
            self.frame_size
                .store(((sample_freq / 100) * 2 * 4) as usize, Ordering::SeqCst);
        }
    }

    pub fn stop(&self) {
        self.runned.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.runned.load(Ordering::SeqCst)
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size.load(Ordering::SeqCst)
    }

    pub fn add_input(&self, ssrc: u32, client_id: i64, source: PcmSource, volume: i32) {
        let mut inputs = self.inputs.lock();
        if inputs.iter().all(|input| input.ssrc != ssrc) {
            inputs.push(Input { ssrc, client_id, source, volume });
        }
    }

    pub fn set_input_volume(&self, ssrc: u32, volume: i32) {
        if let Some(input) = self.inputs.lock().iter_mut().find(|input| input.ssrc == ssrc) {
            input.volume = volume;
        }
    }

    pub fn delete_input(&self, ssrc: u32) {
        self.inputs.lock().retain(|input| input.ssrc != ssrc);
    }

    pub fn input_count(&self) -> usize {
        self.inputs.lock().len()
    }

    /// Mix one output frame into `output` (already zeroed or carrying a
    /// previous layer). `output` must hold `frame_size / 2` samples.
    pub fn get_sound(&self, output: &mut [i16]) {
        if !self.runned.load(Ordering::SeqCst) {
            return;
        }

        let inputs = self.inputs.lock();
        for input in inputs.iter() {
            let Some(pcm) = (input.source)() else { continue };
            if pcm.is_empty() {
                continue;
            }

            let gain = volume_gain(input.volume);
            let samples = pcm.len() / 2;
            for i in 0..output.len().min(samples) {
                let sample = i16::from_le_bytes([pcm[i * 2], pcm[i * 2 + 1]]);
                let scaled = (sample as f64 * gain) as i32 as i16 as i32;
                let sum = output[i] as i32 + scaled;
                output[i] = sum.clamp(-32768, 32767) as i16;
            }
        }
    }
}

impl Default for AudioMixer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_source(value: i16, samples: usize) -> PcmSource {
        Arc::new(move || {
            let mut pcm = Vec::with_capacity(samples * 2);
            for _ in 0..samples {
                pcm.extend_from_slice(&value.to_le_bytes());
            }
            Some(Bytes::from(pcm))
        })
    }

    fn silent_source() -> PcmSource {
        Arc::new(|| None)
    }

    #[test]
    fn frame_size_is_40ms_mono_16bit() {
        let mixer = AudioMixer::new();
        mixer.start(48_000);
        assert_eq!(mixer.frame_size(), 3840);
    }

    #[test]
    fn volume_100_is_unity_and_0_is_silence() {
        assert!((volume_gain(100) - 1.0).abs() < 1e-9);
        assert_eq!(volume_gain(0), 0.0);
        assert!(volume_gain(50) < 1.0);
    }

    #[test]
    fn mixes_scaled_inputs_with_saturation() {
        let mixer = AudioMixer::new();
        mixer.start(48_000);
        mixer.add_input(1, 10, constant_source(30_000, 4), 100);
        mixer.add_input(2, 20, constant_source(30_000, 4), 100);

        let mut output = [0i16; 4];
        mixer.get_sound(&mut output);
        // 30000 + 30000 saturates instead of wrapping.
        assert_eq!(output, [32767; 4]);
    }

    #[test]
    fn mix_formula_matches_gain_scaled_sum() {
        let mixer = AudioMixer::new();
        mixer.start(48_000);
        mixer.add_input(1, 10, constant_source(10_000, 4), 100);
        mixer.add_input(2, 20, constant_source(10_000, 4), 50);

        let mut output = [0i16; 4];
        mixer.get_sound(&mut output);

        let expected = 10_000 + (10_000.0 * volume_gain(50)) as i32 as i16;
        assert_eq!(output, [expected; 4]);
    }

    #[test]
    fn muted_input_contributes_nothing() {
        let mixer = AudioMixer::new();
        mixer.start(48_000);
        mixer.add_input(1, 10, constant_source(12_345, 4), 0);

        let mut output = [0i16; 4];
        mixer.get_sound(&mut output);
        assert_eq!(output, [0; 4]);
    }

    #[test]
    fn slow_input_misses_the_frame() {
        let mixer = AudioMixer::new();
        mixer.start(48_000);
        mixer.add_input(1, 10, silent_source(), 100);
        mixer.add_input(2, 20, constant_source(100, 4), 100);

        let mut output = [0i16; 4];
        mixer.get_sound(&mut output);
        assert_eq!(output, [100; 4]);
    }

    #[test]
    fn inputs_are_unique_by_ssrc_and_removable() {
        let mixer = AudioMixer::new();
        mixer.add_input(1, 10, silent_source(), 100);
        mixer.add_input(1, 10, silent_source(), 100);
        assert_eq!(mixer.input_count(), 1);
        mixer.delete_input(1);
        assert_eq!(mixer.input_count(), 0);
    }
}
