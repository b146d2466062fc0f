//! Audio sources and sinks driven by the playback loop.

#[cfg(feature = "playback")]
mod cpal_device;
mod wav;

#[cfg(feature = "playback")]
pub use cpal_device::CpalDevice;
pub use wav::WavSource;

use crate::Result;

/// Length of the zero-filled chunks fed to the engine during padding.
pub const SILENCE_FRAMES: usize = 512;

/// Interleaved sample frames read during a single tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    samples: Vec<i16>,
    channels: u16,
}

impl AudioChunk {
    /// Wraps interleaved samples. Trailing samples that do not form a whole
    /// frame are dropped.
    pub fn new(mut samples: Vec<i16>, channels: u16) -> Self {
        let channels = channels.max(1);
        let whole = samples.len() / channels as usize * channels as usize;
        samples.truncate(whole);
        Self { samples, channels }
    }

    pub fn silent(frames: usize, channels: u16) -> Self {
        Self::new(vec![0; frames * channels.max(1) as usize], channels)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Outcome of [`SampleSource::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRead {
    /// A full chunk of the requested length.
    Chunk(AudioChunk),
    /// The stream ran out. Carries the final short (possibly empty) chunk and
    /// is reported exactly once.
    EndOfStream(AudioChunk),
    /// Every read after [`SourceRead::EndOfStream`]: zero frames, no blocking.
    Exhausted,
}

impl SourceRead {
    /// Sample frames delivered by this read.
    pub fn frames(&self) -> usize {
        match self {
            Self::Chunk(chunk) | Self::EndOfStream(chunk) => chunk.frames(),
            Self::Exhausted => 0,
        }
    }
}

/// Pull side of the pipeline: decoded audio in fixed-size chunks.
pub trait SampleSource {
    fn channels(&self) -> u16;

    fn sample_rate(&self) -> u32;

    /// Total length in sample frames when known up front.
    fn total_frames(&self) -> Option<u64>;

    /// Reads up to `frames` sample frames.
    fn read(&mut self, frames: usize) -> Result<SourceRead>;
}

/// Turns the samples of one read into a [`SourceRead`], tracking the single
/// end-of-stream report through `exhausted`.
pub(crate) fn classify_read(
    samples: Vec<i16>,
    channels: u16,
    requested: usize,
    exhausted: &mut bool,
) -> SourceRead {
    if *exhausted {
        return SourceRead::Exhausted;
    }
    let chunk = AudioChunk::new(samples, channels);
    if chunk.frames() < requested {
        *exhausted = true;
        SourceRead::EndOfStream(chunk)
    } else {
        SourceRead::Chunk(chunk)
    }
}

/// In-memory source, used for synthetic input and tests.
#[derive(Debug, Clone)]
pub struct MemorySource {
    samples: Vec<i16>,
    channels: u16,
    sample_rate: u32,
    position: usize,
    exhausted: bool,
}

impl MemorySource {
    pub fn new(samples: Vec<i16>, channels: u16, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: channels.max(1),
            sample_rate,
            position: 0,
            exhausted: false,
        }
    }

    /// A source of `frames` sample frames of silence.
    pub fn silence(frames: usize, channels: u16, sample_rate: u32) -> Self {
        Self::new(vec![0; frames * channels.max(1) as usize], channels, sample_rate)
    }
}

impl SampleSource for MemorySource {
    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> Option<u64> {
        Some((self.samples.len() / self.channels as usize) as u64)
    }

    fn read(&mut self, frames: usize) -> Result<SourceRead> {
        let wanted = frames * self.channels as usize;
        let end = (self.position + wanted).min(self.samples.len());
        let samples = self.samples[self.position..end].to_vec();
        self.position = end;
        Ok(classify_read(samples, self.channels, frames, &mut self.exhausted))
    }
}

/// Supplies the zero-filled chunks fed to the engine during lead-in and
/// lead-out. The chunk length is fixed and independent of the tick size.
#[derive(Debug, Clone)]
pub struct SilenceGenerator {
    chunk: AudioChunk,
}

impl SilenceGenerator {
    pub fn new(channels: u16) -> Self {
        Self {
            chunk: AudioChunk::silent(SILENCE_FRAMES, channels),
        }
    }

    pub fn chunk(&self) -> &AudioChunk {
        &self.chunk
    }
}

/// Push side of the pipeline: live playback.
pub trait SampleSink {
    /// Opens or primes the device. Called when the real audio starts, not
    /// during lead-in.
    fn start(&mut self) -> Result<()>;

    /// Plays one chunk. Underruns are recovered internally.
    fn write(&mut self, chunk: &AudioChunk) -> Result<()>;

    /// Lets queued audio play out and releases the device.
    fn close(&mut self) -> Result<()>;

    /// Underruns recovered since the sink was created.
    fn underruns(&self) -> u64 {
        0
    }
}

/// Result of a single device write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceWrite {
    /// This many sample frames were accepted.
    Written(usize),
    /// The device starved before the write; it must be re-primed.
    Underrun,
}

/// Low-level playback device, modelled after blocking PCM write APIs.
pub trait PlaybackDevice {
    fn channels(&self) -> u16;

    fn start(&mut self) -> Result<()>;

    /// Writes interleaved samples, blocking while the device buffer is full.
    fn write_frames(&mut self, samples: &[i16]) -> Result<DeviceWrite>;

    /// Resets the device after an underrun so writes can resume.
    fn prepare(&mut self) -> Result<()>;

    fn drain(&mut self) -> Result<()>;
}

/// [`SampleSink`] over a [`PlaybackDevice`] that retries writes in place
/// after re-priming the device on underrun.
#[derive(Debug)]
pub struct DevicePlayback<D> {
    device: D,
    underruns: u64,
    started: bool,
}

impl<D: PlaybackDevice> DevicePlayback<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            underruns: 0,
            started: false,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: PlaybackDevice> SampleSink for DevicePlayback<D> {
    fn start(&mut self) -> Result<()> {
        if !self.started {
            self.device.start()?;
            self.started = true;
            tracing::info!(channels = self.device.channels(), "playback device started");
        }
        Ok(())
    }

    fn write(&mut self, chunk: &AudioChunk) -> Result<()> {
        let channels = chunk.channels() as usize;
        let samples = chunk.samples();
        let mut offset = 0;

        while offset < samples.len() {
            match self.device.write_frames(&samples[offset..])? {
                DeviceWrite::Written(frames) => offset += frames * channels,
                DeviceWrite::Underrun => {
                    self.underruns += 1;
                    tracing::warn!(underruns = self.underruns, "playback underrun, re-priming device");
                    self.device.prepare()?;
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.started {
            self.device.drain()?;
            self.started = false;
        }
        Ok(())
    }

    fn underruns(&self) -> u64 {
        self.underruns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_read_reports_end_of_stream_once() {
        let mut source = MemorySource::new((0..20).collect(), 2, 8_000);

        assert_eq!(source.read(4).unwrap().frames(), 4);
        assert_eq!(source.read(4).unwrap().frames(), 4);
        match source.read(4).unwrap() {
            SourceRead::EndOfStream(chunk) => assert_eq!(chunk.samples(), &[16, 17, 18, 19]),
            other => panic!("expected end of stream, got {other:?}"),
        }
        assert_eq!(source.read(4).unwrap(), SourceRead::Exhausted);
        assert_eq!(source.read(4).unwrap(), SourceRead::Exhausted);
    }

    #[test]
    fn exact_multiple_ends_with_empty_chunk() {
        let mut source = MemorySource::silence(100, 1, 100);
        let mut full = 0;
        loop {
            match source.read(4).unwrap() {
                SourceRead::Chunk(_) => full += 1,
                SourceRead::EndOfStream(chunk) => {
                    assert!(chunk.is_empty());
                    break;
                }
                SourceRead::Exhausted => panic!("end of stream was never reported"),
            }
        }
        assert_eq!(full, 25);
    }

    #[test]
    fn chunk_drops_partial_frames() {
        let chunk = AudioChunk::new(vec![1, 2, 3, 4, 5], 2);
        assert_eq!(chunk.frames(), 2);
        assert_eq!(chunk.samples(), &[1, 2, 3, 4]);
    }

    #[test]
    fn silence_is_independent_of_tick_size() {
        let silence = SilenceGenerator::new(2);
        assert_eq!(silence.chunk().frames(), SILENCE_FRAMES);
        assert!(silence.chunk().samples().iter().all(|s| *s == 0));
    }

    #[derive(Debug, Default)]
    struct FlakyDevice {
        underrun_on_calls: Vec<usize>,
        calls: usize,
        prepares: usize,
        played: Vec<i16>,
        max_frames: usize,
    }

    impl PlaybackDevice for FlakyDevice {
        fn channels(&self) -> u16 {
            2
        }

        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn write_frames(&mut self, samples: &[i16]) -> Result<DeviceWrite> {
            self.calls += 1;
            if self.underrun_on_calls.contains(&self.calls) {
                return Ok(DeviceWrite::Underrun);
            }
            let frames = (samples.len() / 2).min(self.max_frames);
            self.played.extend_from_slice(&samples[..frames * 2]);
            Ok(DeviceWrite::Written(frames))
        }

        fn prepare(&mut self) -> Result<()> {
            self.prepares += 1;
            Ok(())
        }

        fn drain(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn underrun_is_recovered_in_place() {
        let device = FlakyDevice {
            underrun_on_calls: vec![2],
            max_frames: 3,
            ..Default::default()
        };
        let mut sink = DevicePlayback::new(device);
        sink.start().unwrap();

        let chunk = AudioChunk::new((0..16).collect(), 2);
        sink.write(&chunk).unwrap();

        assert_eq!(sink.underruns(), 1);
        assert_eq!(sink.device().prepares, 1);
        assert_eq!(sink.device().played, (0..16).collect::<Vec<i16>>());
    }
}
