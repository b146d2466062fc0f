use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader, WavSpec};

use super::{classify_read, SampleSource, SourceRead};
use crate::{Result, VizError};

/// File-backed [`SampleSource`] for WAV input. Integer samples of any width
/// and 32-bit float samples are converted to signed 16-bit.
pub struct WavSource {
    path: PathBuf,
    reader: WavReader<BufReader<File>>,
    spec: WavSpec,
    exhausted: bool,
}

impl WavSource {
    /// Opens `path` read-only. A missing file is a configuration error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(VizError::config(format!(
                "audio file `{}` does not exist",
                path.display()
            )));
        }

        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        if spec.channels == 0 {
            return Err(VizError::config(format!(
                "audio file `{}` has no channels",
                path.display()
            )));
        }

        tracing::info!(
            path = %path.display(),
            frames = reader.duration(),
            channels = spec.channels,
            sample_rate = spec.sample_rate,
            bits = spec.bits_per_sample,
            "opened audio file"
        );

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            spec,
            exhausted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads up to `wanted` interleaved samples. A decode error ends the
    /// read early with whatever was gathered, so a truncated file plays out
    /// as a short final chunk.
    fn read_samples(&mut self, wanted: usize) -> Vec<i16> {
        match (self.spec.sample_format, self.spec.bits_per_sample) {
            (SampleFormat::Float, _) => {
                take_samples(&mut self.reader, &self.path, wanted, float_to_i16)
            }
            (SampleFormat::Int, 16) => {
                take_samples(&mut self.reader, &self.path, wanted, |s: i16| s)
            }
            (SampleFormat::Int, bits) => take_samples(&mut self.reader, &self.path, wanted, |s| {
                rescale_int(s, bits)
            }),
        }
    }
}

fn take_samples<S: hound::Sample>(
    reader: &mut WavReader<BufReader<File>>,
    path: &Path,
    wanted: usize,
    convert: impl Fn(S) -> i16,
) -> Vec<i16> {
    let mut samples = Vec::with_capacity(wanted);
    for sample in reader.samples::<S>().take(wanted) {
        match sample {
            Ok(sample) => samples.push(convert(sample)),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    read = samples.len(),
                    error = %err,
                    "audio file ends early"
                );
                break;
            }
        }
    }
    samples
}

impl SampleSource for WavSource {
    fn channels(&self) -> u16 {
        self.spec.channels
    }

    fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    fn total_frames(&self) -> Option<u64> {
        Some(self.reader.duration() as u64)
    }

    fn read(&mut self, frames: usize) -> Result<SourceRead> {
        if self.exhausted {
            return Ok(SourceRead::Exhausted);
        }
        let samples = self.read_samples(frames * self.spec.channels as usize);
        Ok(classify_read(
            samples,
            self.spec.channels,
            frames,
            &mut self.exhausted,
        ))
    }
}

impl std::fmt::Debug for WavSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavSource")
            .field("path", &self.path)
            .field("spec", &self.spec)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

fn float_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn rescale_int(sample: i32, bits: u16) -> i16 {
    if bits > 16 {
        (sample >> (bits - 16)) as i16
    } else {
        (sample << (16 - bits)) as i16
    }
}
