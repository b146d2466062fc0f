use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{Result, VizError};

/// Number of log-spaced spectrum bands reported per frame.
pub const BAND_COUNT: usize = 32;

const BEAT_GAIN: f32 = 12.0;
const BEAT_THRESHOLD: f32 = 0.6;
const MIN_BEAT_INTERVAL: f32 = 0.2;
const LOWEST_BAND_HZ: f32 = 30.0;
const BASS_LIMIT_HZ: f32 = 250.0;
const MID_LIMIT_HZ: f32 = 4_000.0;

/// Features for one analysed window of PCM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisFrame {
    pub time: f32,
    pub rms: f32,
    pub bass: f32,
    pub mid: f32,
    pub treble: f32,
    /// Normalised [0, 1] spectral centroid where 1.0 corresponds to the
    /// Nyquist frequency of the analysed block.
    pub spectral_centroid: f32,
    pub beat_confidence: f32,
    /// True when this frame registered as a new beat.
    pub beat: bool,
    /// Log-spaced band magnitudes, roughly in [0, 1].
    pub bands: Vec<f32>,
}

/// PCM feature extractor used by the software visualiser. Synchronous so it
/// can be driven straight from the render loop and from tests.
pub struct AnalysisEngine {
    sample_rate: u32,
    beat_sensitivity: f32,
    last_rms: f32,
    last_beat: Option<f32>,
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl AnalysisEngine {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            beat_sensitivity: 1.0,
            last_rms: 0.0,
            last_beat: None,
            fft_planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn beat_sensitivity(&self) -> f32 {
        self.beat_sensitivity
    }

    /// Scales how easily loudness jumps register as beats.
    pub fn set_beat_sensitivity(&mut self, sensitivity: f32) {
        self.beat_sensitivity = sensitivity.max(0.0);
    }

    /// Analyses a mono window ending at `time` seconds.
    pub fn process_window(&mut self, samples: &[f32], time: f32) -> Result<AnalysisFrame> {
        if samples.len() < 2 {
            return Err(VizError::msg(
                "analysis requires blocks with at least two samples",
            ));
        }

        let rms = compute_rms(samples);
        let (beat_confidence, beat) = self.update_beats(time, rms);
        let spectrum = self.compute_spectrum(samples)?;

        let bin_hz = self.sample_rate as f32 / samples.len() as f32;
        let nyquist = self.sample_rate as f32 * 0.5;

        let mut magnitude_sum = 0.0_f32;
        let mut weighted_sum = 0.0_f32;
        let (mut bass, mut mid, mut treble) = (0.0_f32, 0.0_f32, 0.0_f32);
        for (i, &magnitude) in spectrum.iter().enumerate() {
            let hz = i as f32 * bin_hz;
            magnitude_sum += magnitude;
            weighted_sum += magnitude * hz;
            if hz < BASS_LIMIT_HZ {
                bass += magnitude;
            } else if hz < MID_LIMIT_HZ {
                mid += magnitude;
            } else {
                treble += magnitude;
            }
        }

        let spectral_centroid = if magnitude_sum <= f32::EPSILON {
            0.0
        } else {
            (weighted_sum / magnitude_sum / nyquist).clamp(0.0, 1.0)
        };
        let norm = |energy: f32| (energy / samples.len() as f32 * 4.0).min(1.0);

        Ok(AnalysisFrame {
            time,
            rms,
            bass: norm(bass),
            mid: norm(mid),
            treble: norm(treble),
            spectral_centroid,
            beat_confidence,
            beat,
            bands: log_bands(&spectrum, bin_hz, nyquist),
        })
    }

    fn update_beats(&mut self, timestamp: f32, rms: f32) -> (f32, bool) {
        let delta = (rms - self.last_rms).max(0.0);
        self.last_rms = rms;
        let confidence = (delta * BEAT_GAIN * self.beat_sensitivity).clamp(0.0, 1.0);

        let spaced = self
            .last_beat
            .map(|last| timestamp - last >= MIN_BEAT_INTERVAL)
            .unwrap_or(true);
        let beat = confidence >= BEAT_THRESHOLD && spaced;
        if beat {
            self.last_beat = Some(timestamp);
        }
        (confidence, beat)
    }

    fn compute_spectrum(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let len = samples.len();
        let fft = self.prepare_fft(len);

        for (index, value) in samples.iter().enumerate() {
            fft.input[index] = *value * hann_value(index, len);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        Ok(fft.spectrum.iter().map(|bin| bin.norm()).collect())
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        let stale = self
            .fft
            .as_ref()
            .map(|fft| fft.size != size)
            .unwrap_or(false);
        if stale {
            self.fft = None;
        }

        let planner = &mut self.fft_planner;
        self.fft.get_or_insert_with(|| {
            let plan = planner.plan_fft_forward(size);
            let scratch = plan.make_scratch_vec();
            let spectrum = plan.make_output_vec();
            let input = plan.make_input_vec();
            FftResources {
                size,
                plan,
                scratch,
                spectrum,
                input,
            }
        })
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for AnalysisEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisEngine")
            .field("sample_rate", &self.sample_rate)
            .field("beat_sensitivity", &self.beat_sensitivity)
            .field("last_rms", &self.last_rms)
            .field("last_beat", &self.last_beat)
            .field("fft_size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

fn compute_rms(samples: &[f32]) -> f32 {
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

/// Folds FFT magnitudes into [`BAND_COUNT`] log-spaced bands between
/// [`LOWEST_BAND_HZ`] and Nyquist.
fn log_bands(spectrum: &[f32], bin_hz: f32, nyquist: f32) -> Vec<f32> {
    let mut bands = vec![0.0; BAND_COUNT];
    if spectrum.is_empty() || nyquist <= LOWEST_BAND_HZ {
        return bands;
    }

    let ratio = (nyquist / LOWEST_BAND_HZ).ln();
    let edge = |band: usize| LOWEST_BAND_HZ * (ratio * band as f32 / BAND_COUNT as f32).exp();

    for (band, value) in bands.iter_mut().enumerate() {
        let lo = (edge(band) / bin_hz) as usize;
        let hi = ((edge(band + 1) / bin_hz) as usize).max(lo + 1).min(spectrum.len());
        if lo >= hi {
            continue;
        }
        let peak = spectrum[lo..hi].iter().cloned().fold(0.0_f32, f32::max);
        // Compress the dynamic range so quiet bands remain visible.
        *value = (peak / spectrum.len() as f32 * 8.0).sqrt().min(1.0);
    }
    bands
}
