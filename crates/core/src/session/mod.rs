use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, VizError};

/// Frame rate used when the configured rate is not positive.
pub const FALLBACK_FPS: u32 = 60;

/// Dimensions of the rendered output frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Byte length of one BGRA frame.
    pub fn bgra_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Run-scoped timing and format parameters. Frame rate and sample rate are
/// fixed once the session is built.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    fps: u32,
    sample_rate: u32,
    channels: u16,
    lead_in: Duration,
    lead_out: Duration,
    frame_size: FrameSize,
}

impl SessionConfig {
    /// Builds the session parameters. A non-positive `fps` falls back to
    /// [`FALLBACK_FPS`].
    pub fn new(fps: i32, sample_rate: u32, channels: u16, frame_size: FrameSize) -> Result<Self> {
        if sample_rate == 0 {
            return Err(VizError::config("audio sample rate must be positive"));
        }
        if channels == 0 {
            return Err(VizError::config("audio must have at least one channel"));
        }
        if frame_size.width == 0 || frame_size.height == 0 {
            return Err(VizError::config(format!(
                "invalid output frame size {}x{}",
                frame_size.width, frame_size.height
            )));
        }

        let fps = if fps <= 0 { FALLBACK_FPS } else { fps as u32 };
        if sample_rate < fps {
            return Err(VizError::config(format!(
                "sample rate {sample_rate} is too low for {fps} frames per second"
            )));
        }

        Ok(Self {
            fps,
            sample_rate,
            channels,
            lead_in: Duration::ZERO,
            lead_out: Duration::ZERO,
            frame_size,
        })
    }

    /// Sets the silent padding played before and after the real audio.
    pub fn with_padding(mut self, lead_in: Duration, lead_out: Duration) -> Self {
        self.lead_in = lead_in;
        self.lead_out = lead_out;
        self
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frame_size(&self) -> FrameSize {
        self.frame_size
    }

    pub fn lead_in(&self) -> Duration {
        self.lead_in
    }

    pub fn lead_out(&self) -> Duration {
        self.lead_out
    }

    /// Nominal audio chunk length in sample frames (`sample_rate / fps`).
    pub fn samples_per_tick(&self) -> usize {
        (self.sample_rate / self.fps) as usize
    }

    /// Number of lead-in ticks, `lead_in * fps` rounded to the nearest tick.
    pub fn lead_in_ticks(&self) -> u64 {
        ticks_for(self.lead_in, self.fps)
    }

    /// Number of lead-out ticks, `lead_out * fps` rounded to the nearest tick.
    pub fn lead_out_ticks(&self) -> u64 {
        ticks_for(self.lead_out, self.fps)
    }

    /// Lead-in expressed as the audio offset handed to the encoder. Derived
    /// from the tick count so the audio lines up with the padded video.
    pub fn audio_offset_secs(&self) -> f64 {
        self.lead_in_ticks() as f64 / self.fps as f64
    }
}

fn ticks_for(duration: Duration, fps: u32) -> u64 {
    (duration.as_secs_f64() * fps as f64).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size() -> FrameSize {
        FrameSize::new(64, 32)
    }

    #[test]
    fn non_positive_fps_falls_back() {
        let config = SessionConfig::new(0, 44_100, 2, size()).unwrap();
        assert_eq!(config.fps(), FALLBACK_FPS);

        let config = SessionConfig::new(-5, 44_100, 2, size()).unwrap();
        assert_eq!(config.fps(), FALLBACK_FPS);
    }

    #[test]
    fn derives_chunk_and_padding_ticks() {
        let config = SessionConfig::new(25, 44_100, 2, size())
            .unwrap()
            .with_padding(Duration::from_secs(2), Duration::from_secs(1));

        assert_eq!(config.samples_per_tick(), 1764);
        assert_eq!(config.lead_in_ticks(), 50);
        assert_eq!(config.lead_out_ticks(), 25);
        assert!((config.audio_offset_secs() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fractional_padding_rounds_to_whole_ticks() {
        let config = SessionConfig::new(30, 48_000, 1, size())
            .unwrap()
            .with_padding(Duration::from_millis(1_510), Duration::ZERO);
        assert_eq!(config.lead_in_ticks(), 45);
        assert_eq!(config.lead_out_ticks(), 0);
    }

    #[test]
    fn rejects_degenerate_formats() {
        assert!(SessionConfig::new(25, 0, 2, size()).is_err());
        assert!(SessionConfig::new(25, 44_100, 0, size()).is_err());
        assert!(SessionConfig::new(25, 44_100, 2, FrameSize::new(0, 10)).is_err());
        assert!(SessionConfig::new(25, 10, 2, size()).is_err());
    }

    #[test]
    fn frame_size_is_four_bytes_per_pixel() {
        assert_eq!(FrameSize::new(3, 2).bgra_len(), 24);
    }
}
