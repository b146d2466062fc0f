use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfigRange,
};
use rtrb::{Consumer, Producer, RingBuffer};

use super::{DeviceWrite, PlaybackDevice};
use crate::{Result, VizError};

/// Seconds of audio the ring between the control thread and the stream
/// callback can hold.
const RING_SECONDS: f32 = 0.25;
/// Fraction of the ring filled with silence when (re-)priming.
const PRIME_FRACTION: usize = 4;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// [`PlaybackDevice`] on top of a CPAL output stream.
///
/// Samples go through a lock-free ring buffer. The stream callback plays
/// silence when the ring runs dry and raises the underrun flag, which the next
/// write reports so the sink can re-prime.
pub struct CpalDevice {
    name: String,
    channels: u16,
    sample_rate: u32,
    stream: Stream,
    producer: Producer<i16>,
    capacity: usize,
    armed: Arc<AtomicBool>,
    underrun: Arc<AtomicBool>,
}

impl CpalDevice {
    /// Opens the output device whose name contains `name` (`"default"` picks
    /// the host default) for interleaved playback of `channels` channels.
    pub fn open(name: &str, channels: u16, sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = if name.eq_ignore_ascii_case("default") {
            host.default_output_device()
                .ok_or_else(|| VizError::DeviceOpen("no default output device".into()))?
        } else {
            host.output_devices()
                .map_err(|e| VizError::DeviceOpen(e.to_string()))?
                .find(|device| {
                    device
                        .name()
                        .map(|candidate| candidate.contains(name))
                        .unwrap_or(false)
                })
                .ok_or_else(|| VizError::DeviceOpen(format!("no output device matching `{name}`")))?
        };
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        // Samples are never resampled, so the device must take the file's
        // rate as is or the tick budget no longer matches what it plays.
        let ranges: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| VizError::DeviceOpen(e.to_string()))?
            .collect();
        if !supports_stream(&ranges, channels, sample_rate) {
            return Err(VizError::DeviceOpen(format!(
                "`{device_name}` does not support {sample_rate} Hz / {channels} ch f32 output"
            )));
        }

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: BufferSize::Default,
        };

        let capacity = ((sample_rate as f32 * RING_SECONDS) as usize).max(1024) * channels as usize;
        let (producer, consumer) = RingBuffer::<i16>::new(capacity);
        let armed = Arc::new(AtomicBool::new(false));
        let underrun = Arc::new(AtomicBool::new(false));

        let stream = build_stream(
            &device,
            &config,
            consumer,
            Arc::clone(&armed),
            Arc::clone(&underrun),
        )?;

        tracing::info!(
            device = %device_name,
            channels,
            sample_rate,
            ring = capacity,
            "opened playback device"
        );

        Ok(Self {
            name: device_name,
            channels,
            sample_rate,
            stream,
            producer,
            capacity,
            armed,
            underrun,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn prime(&mut self) {
        let frames = self.capacity / PRIME_FRACTION / self.channels as usize;
        let silence = frames * self.channels as usize;
        for _ in 0..silence.min(self.producer.slots()) {
            if self.producer.push(0).is_err() {
                break;
            }
        }
    }
}

impl PlaybackDevice for CpalDevice {
    fn channels(&self) -> u16 {
        self.channels
    }

    fn start(&mut self) -> Result<()> {
        self.prime();
        self.armed.store(true, Ordering::Release);
        self.stream
            .play()
            .map_err(|e| VizError::DeviceOpen(e.to_string()))
    }

    fn write_frames(&mut self, samples: &[i16]) -> Result<DeviceWrite> {
        let channels = self.channels as usize;
        let free = loop {
            if self.underrun.swap(false, Ordering::AcqRel) {
                return Ok(DeviceWrite::Underrun);
            }
            let free = self.producer.slots() / channels * channels;
            if free > 0 {
                break free;
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        let count = free.min(samples.len() / channels * channels);
        for sample in &samples[..count] {
            if self.producer.push(*sample).is_err() {
                break;
            }
        }
        Ok(DeviceWrite::Written(count / channels))
    }

    fn prepare(&mut self) -> Result<()> {
        self.prime();
        self.underrun.store(false, Ordering::Release);
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.producer.slots() < self.capacity && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        self.armed.store(false, Ordering::Release);
        self.stream
            .pause()
            .map_err(|e| VizError::msg(format!("failed to pause playback: {e}")))
    }
}

impl std::fmt::Debug for CpalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalDevice")
            .field("name", &self.name)
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn supports_stream(ranges: &[SupportedStreamConfigRange], channels: u16, rate: u32) -> bool {
    ranges.iter().any(|range| {
        range.sample_format() == SampleFormat::F32
            && range.channels() == channels
            && range.min_sample_rate().0 <= rate
            && range.max_sample_rate().0 >= rate
    })
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: Consumer<i16>,
    armed: Arc<AtomicBool>,
    underrun: Arc<AtomicBool>,
) -> Result<Stream> {
    let channels = config.channels as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut starved = false;
                for frame in data.chunks_mut(channels) {
                    // Whole frames only, so channels never swap after a dry spell.
                    if consumer.slots() < channels {
                        frame.iter_mut().for_each(|out| *out = 0.0);
                        starved = true;
                        continue;
                    }
                    for out in frame.iter_mut() {
                        *out = consumer.pop().map(|s| s as f32 / 32_768.0).unwrap_or(0.0);
                    }
                }
                if starved && armed.load(Ordering::Acquire) {
                    underrun.store(true, Ordering::Release);
                }
            },
            move |err| {
                tracing::error!("playback stream error: {}", err);
            },
            None,
        )
        .map_err(|e| VizError::DeviceOpen(e.to_string()))
}

#[cfg(test)]
mod tests {
    use cpal::SupportedBufferSize;

    use super::*;

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn stream_needs_exact_rate_channels_and_f32() {
        let ranges = [
            range(2, 48_000, 48_000, SampleFormat::F32),
            range(1, 8_000, 96_000, SampleFormat::I16),
        ];
        assert!(supports_stream(&ranges, 2, 48_000));
        // A 48 kHz-only device cannot play a 44.1 kHz file untouched.
        assert!(!supports_stream(&ranges, 2, 44_100));
        assert!(!supports_stream(&ranges, 1, 44_100));
        assert!(!supports_stream(&ranges, 6, 48_000));
        assert!(!supports_stream(&[], 2, 48_000));
    }
}
