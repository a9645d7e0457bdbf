//! Acoustic echo cancellation.
//!
//! NLMS adaptive filter over band 0 (the 0..8 kHz band carries almost all
//! speech echo energy). The far-end reference is buffered from the speaker
//! path and read back `render_latency_ms` behind the write position. The
//! non-linear processor suppresses what the linear filter leaves behind.

use super::bands::BAND_FRAME;

/// Band sample rate the canceller operates at.
const BAND_RATE: usize = 16_000;

/// Far-end ring capacity, one second of band audio.
const FAREND_CAPACITY: usize = BAND_RATE;

/// Configuration mirroring the deployed tuning: aggressive NLP, extended
/// filter, delay-agnostic alignment.
#[derive(Debug, Clone, Copy)]
pub struct AecConfig {
    /// Adaptive filter length in band samples. The extended filter doubles
    /// the default 128.
    pub extended_filter: bool,
    /// Estimate the render delay from cross-correlation instead of trusting
    /// `render_latency_ms` alone.
    pub delay_agnostic: bool,
    /// Residual suppression strength, 0..1 where 1 removes everything the
    /// linear stage flags.
    pub nlp_aggressiveness: f32,
}

impl Default for AecConfig {
    fn default() -> Self {
        Self {
            extended_filter: true,
            delay_agnostic: true,
            nlp_aggressiveness: 0.9,
        }
    }
}

/// NLMS echo canceller for band 0.
pub struct EchoCanceller {
    config: AecConfig,
    taps: Vec<f32>,
    farend: Vec<f32>,
    write_pos: usize,
    render_latency_ms: u32,
    estimated_offset: usize,
}

impl EchoCanceller {
    pub fn new(config: AecConfig) -> Self {
        let len = if config.extended_filter { 256 } else { 128 };
        Self {
            config,
            taps: vec![0.0; len],
            farend: vec![0.0; FAREND_CAPACITY],
            write_pos: 0,
            render_latency_ms: 100,
            estimated_offset: 0,
        }
    }

    pub fn set_render_latency(&mut self, latency_ms: u32) {
        self.render_latency_ms = latency_ms;
    }

    /// Feed one far-end (speaker) band-0 sub-frame.
    pub fn buffer_farend(&mut self, samples: &[f32; BAND_FRAME]) {
        for &sample in samples {
            self.farend[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % FAREND_CAPACITY;
        }
    }

    fn latency_samples(&self) -> usize {
        (self.render_latency_ms as usize * BAND_RATE / 1000 + self.estimated_offset)
            .min(FAREND_CAPACITY - BAND_FRAME - self.taps.len())
    }

    fn farend_at(&self, delay: usize) -> f32 {
        let at = (self.write_pos + FAREND_CAPACITY - 1 - delay) % FAREND_CAPACITY;
        self.farend[at]
    }

    /// Refine the delay estimate by scanning a small window around the
    /// configured latency for the strongest correlation.
    fn estimate_delay(&mut self, near: &[f32; BAND_FRAME]) {
        let base = self.render_latency_ms as usize * BAND_RATE / 1000;
        let mut best = (0usize, f32::MIN);
        for probe in (0..BAND_FRAME * 2).step_by(16) {
            let mut corr = 0f32;
            for (i, &sample) in near.iter().enumerate() {
                let delay = base + probe + (BAND_FRAME - 1 - i);
                if delay < FAREND_CAPACITY - 1 {
                    corr += sample * self.farend_at(delay);
                }
            }
            if corr.abs() > best.1 {
                best = (probe, corr.abs());
            }
        }
        self.estimated_offset = best.0;
    }

    /// Cancel echo in one near-end (microphone) band-0 sub-frame, in place.
    pub fn process(&mut self, near: &mut [f32; BAND_FRAME]) {
        if self.config.delay_agnostic {
            self.estimate_delay(near);
        }
        let base_delay = self.latency_samples();

        let mut residual_energy = 0f32;
        let mut near_energy = 0f32;

        for i in 0..BAND_FRAME {
            // Far-end window aligned to this sample: the newest reference
            // sample for position i is `base_delay + (BAND_FRAME - 1 - i)`
            // behind the write head.
            let newest = base_delay + (BAND_FRAME - 1 - i);

            let mut estimate = 0f32;
            let mut power = 1e-3f32;
            for (t, tap) in self.taps.iter().enumerate() {
                let x = self.farend_at(newest + t);
                estimate += tap * x;
                power += x * x;
            }

            let sample = near[i];
            let error = sample - estimate;

            // NLMS update.
            let mu = 0.5;
            let step = mu * error / power;
            for t in 0..self.taps.len() {
                let x = self.farend_at(newest + t);
                self.taps[t] += step * x;
            }

            near_energy += sample * sample;
            residual_energy += error * error;
            near[i] = error;
        }

        // Non-linear processor: when the linear stage removed most of the
        // signal, what remains is residual echo; push it further down.
        if near_energy > 1e-6 && residual_energy / near_energy < 0.25 {
            let suppress = 1.0 - self.config.nlp_aggressiveness;
            for sample in near.iter_mut() {
                *sample *= suppress;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(seed: &mut u32) -> [f32; BAND_FRAME] {
        let mut frame = [0f32; BAND_FRAME];
        for sample in frame.iter_mut() {
            *seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            *sample = ((*seed >> 16) as f32 / 32_768.0 - 1.0) * 1000.0;
        }
        frame
    }

    #[test]
    fn pure_echo_is_attenuated_after_adaptation() {
        let mut aec = EchoCanceller::new(AecConfig {
            extended_filter: false,
            delay_agnostic: false,
            nlp_aggressiveness: 0.9,
        });
        aec.set_render_latency(10);

        let mut seed = 99;
        let latency_frames = 1; // 10 ms latency = one band frame
        let mut pending: Vec<[f32; BAND_FRAME]> = Vec::new();

        let mut in_energy = 0f32;
        let mut out_energy = 0f32;
        for frame_no in 0..100 {
            let farend = noise(&mut seed);
            aec.buffer_farend(&farend);
            pending.push(farend);

            // The microphone hears the speaker exactly `latency_frames`
            // later, unity path.
            if frame_no >= latency_frames {
                let mut near = pending[frame_no - latency_frames];
                let frame_in: f32 = near.iter().map(|s| s * s).sum();
                aec.process(&mut near);
                let frame_out: f32 = near.iter().map(|s| s * s).sum();
                if frame_no > 80 {
                    in_energy += frame_in;
                    out_energy += frame_out;
                }
            }
        }

        assert!(out_energy < in_energy * 0.5, "out {out_energy} vs in {in_energy}");
    }

    #[test]
    fn farend_silence_leaves_near_end_untouched_in_energy() {
        let mut aec = EchoCanceller::new(AecConfig::default());
        let mut seed = 5;
        let mut near = noise(&mut seed);
        let before: f32 = near.iter().map(|s| s * s).sum();
        aec.process(&mut near);
        let after: f32 = near.iter().map(|s| s * s).sum();
        // No reference energy: the filter has nothing to subtract.
        assert!(after > before * 0.5);
    }
}
