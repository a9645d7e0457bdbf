//! Automatic gain control.
//!
//! Fixed-digital mode: a compression gain lifts the signal toward the target
//! level below full scale and a limiter stops the result short of clipping.
//! Gain moves with separate attack/release smoothing so speech onsets are
//! caught quickly while pauses release slowly.

use super::bands::BAND_FRAME;

/// Configuration for the gain controller.
#[derive(Debug, Clone, Copy)]
pub struct AgcConfig {
    /// Compression gain in dB applied to the signal.
    pub compression_gain_db: f32,
    /// Target level in dB below full scale.
    pub target_level_dbfs: f32,
    /// Enable the limiter to prevent clipping.
    pub enable_limiter: bool,
    /// Attack coefficient per 10 ms sub-frame (gain increases).
    pub attack: f32,
    /// Release coefficient per 10 ms sub-frame (gain decreases).
    pub release: f32,
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self {
            compression_gain_db: 9.0,
            target_level_dbfs: 3.0,
            enable_limiter: true,
            attack: 0.6,
            release: 0.05,
        }
    }
}

/// Fixed-digital gain controller, one per processing chain.
pub struct AutomaticGainControl {
    config: AgcConfig,
    current_gain: f32,
    mic_level: i32,
}

impl AutomaticGainControl {
    pub fn new(config: AgcConfig) -> Self {
        Self { config, current_gain: 1.0, mic_level: 100 }
    }

    /// Analog mic level hint from the capture device, 0..100.
    pub fn set_mic_level(&mut self, level: i32) {
        self.mic_level = level.clamp(0, 100);
    }

    pub fn mic_level(&self) -> i32 {
        self.mic_level
    }

    fn target_amplitude(&self) -> f32 {
        32_768.0 * 10f32.powf(-self.config.target_level_dbfs / 20.0)
    }

    fn max_gain(&self) -> f32 {
        10f32.powf(self.config.compression_gain_db / 20.0)
    }

    /// Process one 10 ms sub-frame of one band in place.
    pub fn process(&mut self, samples: &mut [f32; BAND_FRAME]) {
        let rms = (samples.iter().map(|s| s * s).sum::<f32>() / BAND_FRAME as f32).sqrt();

        let desired = if rms > 1.0 {
            (self.target_amplitude() / rms).min(self.max_gain())
        } else {
            self.max_gain() // lift very quiet signal at full compression gain
        };

        let coeff = if desired > self.current_gain {
            self.config.attack
        } else {
            self.config.release
        };
        self.current_gain += (desired - self.current_gain) * coeff;

        let gain = self.current_gain * self.mic_level as f32 / 100.0;
        for sample in samples.iter_mut() {
            let mut value = *sample * gain;
            if self.config.enable_limiter {
                value = value.clamp(-32_767.0, 32_767.0);
            }
            *sample = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: f32) -> [f32; BAND_FRAME] {
        let mut frame = [0f32; BAND_FRAME];
        for (i, sample) in frame.iter_mut().enumerate() {
            *sample = amplitude * (2.0 * std::f32::consts::PI * i as f32 / 32.0).sin();
        }
        frame
    }

    #[test]
    fn quiet_signal_is_boosted() {
        let mut agc = AutomaticGainControl::new(AgcConfig::default());
        let mut last_rms = 0f32;
        for _ in 0..50 {
            let mut frame = tone(500.0);
            agc.process(&mut frame);
            last_rms = (frame.iter().map(|s| s * s).sum::<f32>() / BAND_FRAME as f32).sqrt();
        }
        let input_rms = 500.0 / 2f32.sqrt();
        assert!(last_rms > input_rms * 1.5, "rms {last_rms}");
    }

    #[test]
    fn limiter_prevents_clipping() {
        let mut agc = AutomaticGainControl::new(AgcConfig::default());
        for _ in 0..20 {
            let mut frame = tone(30_000.0);
            agc.process(&mut frame);
            assert!(frame.iter().all(|s| s.abs() <= 32_767.0));
        }
    }

    #[test]
    fn mic_level_zero_silences_output() {
        let mut agc = AutomaticGainControl::new(AgcConfig::default());
        agc.set_mic_level(0);
        let mut frame = tone(1_000.0);
        agc.process(&mut frame);
        assert!(frame.iter().all(|&s| s == 0.0));
    }
}
